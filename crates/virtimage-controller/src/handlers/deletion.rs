//! Deletion: tear down helpers, then release the image

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use virtimage_common::conditions::ConditionType;
use virtimage_common::crd::{ImagePhase, VirtualImage};
use virtimage_common::events::{actions, reasons};
use virtimage_common::{Result, IMAGE_CLEANUP_FINALIZER};

use super::Handler;
use crate::requeue::Requeue;
use crate::services::Services;
use crate::sources::StrategyRegistry;
use crate::status::StatusFragment;

/// How often a deletion blocked by consumers is retried
pub const IN_USE_RECHECK: Duration = Duration::from_secs(10);

/// Removes the cleanup finalizer once the helpers are gone
pub struct DeletionHandler {
    services: Services,
    strategies: Arc<StrategyRegistry>,
}

impl DeletionHandler {
    /// Create the handler
    pub fn new(services: Services, strategies: Arc<StrategyRegistry>) -> Self {
        Self { services, strategies }
    }
}

#[async_trait]
impl Handler for DeletionHandler {
    fn name(&self) -> &'static str {
        "DeletionHandler"
    }

    async fn handle(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        if !vi.is_terminating() {
            return Ok(Requeue::None);
        }
        out.phase = Some(ImagePhase::Terminating);

        if vi.condition(ConditionType::InUse).is_some_and(|c| c.is_true()) {
            info!("image is in use, deletion postponed");
            return Ok(Requeue::after(IN_USE_RECHECK));
        }
        if !vi.finalizers().iter().any(|f| f == IMAGE_CLEANUP_FINALIZER) {
            return Ok(Requeue::None);
        }

        match self.strategies.for_image(vi) {
            Ok(strategy) => {
                if strategy.clean_up(vi).await? {
                    self.services
                        .publish(
                            vi,
                            EventType::Normal,
                            reasons::CLEANUP_STARTED,
                            actions::DELETE,
                            "Helper objects of the image are being deleted",
                        )
                        .await;
                    return Ok(Requeue::Immediate);
                }
            }
            Err(e) => warn!(error = %e, "no strategy to clean up with, releasing the image"),
        }

        self.services.store.remove_image_finalizer(vi).await?;
        info!("cleanup finalizer removed");
        Ok(Requeue::None)
    }
}
