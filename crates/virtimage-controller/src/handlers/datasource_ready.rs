//! DatasourceReady: whether the data source can be read

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use virtimage_common::conditions::{ConditionStatus, ConditionType, DatasourceReadyReason};
use virtimage_common::crd::VirtualImage;
use virtimage_common::format::capitalize_first_letter;
use virtimage_common::{DataSourceError, Error, Result};

use super::Handler;
use crate::requeue::Requeue;
use crate::sources::StrategyRegistry;
use crate::status::{ConditionScope, StatusFragment};

fn reason_for(err: &DataSourceError) -> DatasourceReadyReason {
    match err {
        DataSourceError::SecretNotFound(_) => DatasourceReadyReason::ContainerRegistrySecretNotFound,
        DataSourceError::ImageNotReady(_) => DatasourceReadyReason::ImageNotReady,
        DataSourceError::ClusterImageNotReady(_) => DatasourceReadyReason::ClusterImageNotReady,
        DataSourceError::VirtualDiskNotReady(_) => DatasourceReadyReason::VirtualDiskNotReady,
        DataSourceError::VirtualDiskNotReadyForUse(_) => DatasourceReadyReason::VirtualDiskNotReadyForUse,
        DataSourceError::VirtualDiskAttachedToVirtualMachine(_) => {
            DatasourceReadyReason::VirtualDiskAttachedToVirtualMachine
        }
        DataSourceError::VirtualDiskSnapshotNotReady(_) => DatasourceReadyReason::VirtualDiskSnapshotNotReady,
    }
}

/// Validates the data source through its strategy
pub struct DatasourceReadyHandler {
    strategies: Arc<StrategyRegistry>,
}

impl DatasourceReadyHandler {
    /// Create the handler
    pub fn new(strategies: Arc<StrategyRegistry>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl Handler for DatasourceReadyHandler {
    fn name(&self) -> &'static str {
        "DatasourceReadyHandler"
    }

    async fn handle(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        if vi.is_terminating() {
            out.remove_condition(ConditionType::DatasourceReady);
            return Ok(Requeue::None);
        }

        let strategy = self.strategies.for_image(vi)?;
        let mut scope = ConditionScope::new(ConditionType::DatasourceReady, vi, out);

        match strategy.validate(vi).await {
            Ok(()) => {
                scope
                    .builder()
                    .status(ConditionStatus::True)
                    .reason(DatasourceReadyReason::DatasourceReady)
                    .message("");
            }
            Err(Error::DataSource(e)) => {
                debug!(strategy = strategy.name(), error = %e, "data source is not ready");
                scope
                    .builder()
                    .status(ConditionStatus::False)
                    .reason(reason_for(&e))
                    .message(capitalize_first_letter(&format!("{e}.")));
            }
            Err(e) => return Err(e),
        }

        Ok(Requeue::None)
    }
}
