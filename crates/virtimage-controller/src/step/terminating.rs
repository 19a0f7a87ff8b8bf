//! Guard step for helpers still being deleted

use async_trait::async_trait;
use tracing::info;

use virtimage_common::conditions::ConditionBuilder;
use virtimage_common::crd::{ImagePhase, VirtualImage};
use virtimage_common::Result;

use super::Step;
use crate::requeue::Requeue;
use crate::status::StatusFragment;

/// Wait while a helper from a previous attempt is still being deleted
pub struct TerminatingStep {
    terminating: bool,
}

impl TerminatingStep {
    /// `terminating` tells whether any helper has a deletion timestamp
    pub fn new(terminating: bool) -> Self {
        Self { terminating }
    }
}

#[async_trait]
impl Step for TerminatingStep {
    fn name(&self) -> &'static str {
        "terminating"
    }

    async fn take(
        &self,
        _vi: &VirtualImage,
        _cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        if !self.terminating {
            return Ok(None);
        }
        info!("cleanup of a previous attempt is in progress, waiting");
        out.phase = Some(ImagePhase::Pending);
        Ok(Some(Requeue::Immediate))
    }
}
