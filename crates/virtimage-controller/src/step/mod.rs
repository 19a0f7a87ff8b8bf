//! Provisioning steps and the pipeline that runs them
//!
//! A step is built with the objects it needs already fetched and makes one
//! decision. Returning `Some(requeue)` stops the pipeline; `None` hands over
//! to the next step. Pipelines put the finished-image step first, then the
//! terminating guard, then the create steps, then the wait steps, so a
//! re-run always resumes at the first step with unmet work.

mod pod;
mod ready;
mod snapshot;
mod terminating;
mod volume;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::debug;

use virtimage_common::conditions::ConditionBuilder;
use virtimage_common::crd::VirtualImage;
use virtimage_common::events::{actions, reasons};
use virtimage_common::{Error, Result};

use crate::phases::{set_quota_exceeded, set_unexpected};
use crate::requeue::Requeue;
use crate::services::Services;
use crate::status::StatusFragment;

pub use pod::{CreatePodStep, WaitForPodStep};
pub use ready::{ReadyRegistryStep, ReadyVolumeStep};
pub use snapshot::{BounderStep, CreatePvcFromSnapshotStep, WaitForPvcStep};
pub use terminating::TerminatingStep;
pub use volume::{CreateDataVolumeStep, WaitForDataVolumeStep};

/// One decision of a provisioning pipeline
#[async_trait]
pub trait Step: Send + Sync {
    /// Step name for logs
    fn name(&self) -> &'static str;

    /// Act on the image
    ///
    /// `cb` is the Ready condition of the pass; `out` collects every other
    /// status field.
    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>>;
}

/// Ordered list of steps
#[derive(Default)]
pub struct Pipeline<'a> {
    steps: Vec<Box<dyn Step + 'a>>,
}

impl<'a> Pipeline<'a> {
    /// Empty pipeline
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append a step
    pub fn then(mut self, step: impl Step + 'a) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Run the steps in order until one of them decides
    ///
    /// A pipeline where no step decides asks for no requeue.
    pub async fn run(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Requeue> {
        for step in &self.steps {
            match step.take(vi, cb, out).await {
                Ok(Some(requeue)) => {
                    debug!(step = step.name(), ?requeue, "pipeline stopped");
                    return Ok(requeue);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(step = step.name(), error = %e, "pipeline step failed");
                    return Err(e);
                }
            }
        }
        Ok(Requeue::None)
    }
}

/// Report a failure to create a helper object
///
/// Quota rejections are absorbed into the Ready condition; anything else is
/// reported as unexpected and returned.
pub(crate) async fn on_start_error(
    services: &Services,
    vi: &VirtualImage,
    cb: &mut ConditionBuilder,
    out: &mut StatusFragment,
    err: Error,
) -> Result<Option<Requeue>> {
    if err.is_quota_exceeded() {
        services
            .publish(vi, EventType::Warning, reasons::QUOTA_EXCEEDED, actions::PROVISION, err.to_string())
            .await;
        return Ok(Some(set_quota_exceeded(cb, out, &err, vi)));
    }
    set_unexpected(cb, out, &err);
    Err(err)
}
