//! LifeCycle: drives the import through the matched source strategy
//!
//! The handler gates the import on `DatasourceReady` (and `StorageClassReady`
//! for volume-backed images), restarts an unfinished import when the spec
//! changed, and otherwise hands the pass to the strategy.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use virtimage_common::conditions::{self, ConditionStatus, ConditionType, ReadyReason};
use virtimage_common::crd::{ImagePhase, VirtualImage};
use virtimage_common::events::{actions, reasons};
use virtimage_common::Result;

use super::Handler;
use crate::requeue::Requeue;
use crate::services::Services;
use crate::sources::{self, StrategyRegistry};
use crate::status::{ConditionScope, StatusFragment};

/// Whether `type_` is True and was computed for the current generation
fn is_fresh_true(vi: &VirtualImage, type_: ConditionType) -> bool {
    vi.condition(type_)
        .is_some_and(|c| c.is_true() && conditions::is_last_updated(c, vi.generation()))
}

/// Orchestrates the import of an image
pub struct LifeCycleHandler {
    services: Services,
    strategies: Arc<StrategyRegistry>,
}

impl LifeCycleHandler {
    /// Create the handler
    pub fn new(services: Services, strategies: Arc<StrategyRegistry>) -> Self {
        Self { services, strategies }
    }
}

#[async_trait]
impl Handler for LifeCycleHandler {
    fn name(&self) -> &'static str {
        "LifeCycleHandler"
    }

    async fn handle(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        if vi.is_terminating() {
            out.phase = Some(ImagePhase::Terminating);
            return Ok(Requeue::None);
        }

        let strategy = self.strategies.for_image(vi)?;
        let ready = is_fresh_true(vi, ConditionType::Ready);

        if !ready && vi.is_spec_changed() {
            out.reset = true;
            if vi.condition(ConditionType::Ready).is_some() {
                info!(strategy = strategy.name(), "spec changed, restarting import");
                self.services
                    .publish(
                        vi,
                        EventType::Normal,
                        reasons::SPEC_CHANGED,
                        actions::RECONCILE,
                        "Spec changes are detected: import process is restarted by controller",
                    )
                    .await;
                ConditionScope::new(ConditionType::Ready, vi, out)
                    .builder()
                    .status(ConditionStatus::False)
                    .reason(ReadyReason::Provisioning)
                    .message("Spec changes are detected: the import process is restarted.");
            }
            strategy.clean_up(vi).await?;
            return Ok(Requeue::Immediate);
        }

        if !ready {
            let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
            let (cb, out) = scope.split();

            if !is_fresh_true(vi, ConditionType::DatasourceReady) {
                debug!("waiting for the data source");
                out.phase = Some(ImagePhase::Pending);
                cb.status(ConditionStatus::False)
                    .reason(ReadyReason::ProvisioningNotStarted)
                    .message("Datasource is not ready for provisioning.");
                return Ok(Requeue::None);
            }

            if vi.spec.storage.is_volume() && !is_fresh_true(vi, ConditionType::StorageClassReady) {
                debug!("waiting for the storage class");
                out.phase = Some(ImagePhase::Pending);
                cb.status(ConditionStatus::False)
                    .reason(ReadyReason::StorageClassNotReady)
                    .message("Storage class is not ready, please read the StorageClassReady condition state.");
                return Ok(Requeue::None);
            }
        }

        sources::sync(strategy.as_ref(), vi, out).await
    }
}
