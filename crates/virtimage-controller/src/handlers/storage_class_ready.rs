//! StorageClassReady: the class a volume-backed image is stored in

use async_trait::async_trait;
use tracing::debug;

use virtimage_common::conditions::{ConditionStatus, ConditionType, StorageClassReadyReason};
use virtimage_common::crd::VirtualImage;
use virtimage_common::supplements::SupplementNames;
use virtimage_common::{Result, StorageError};

use super::Handler;
use crate::requeue::Requeue;
use crate::services::Services;
use crate::status::{ConditionScope, StatusFragment};

/// Resolves and checks the storage class of volume-backed images
pub struct StorageClassReadyHandler {
    services: Services,
}

impl StorageClassReadyHandler {
    /// Create the handler
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Class the image should use, before checking it exists
    ///
    /// An existing claim fixes the class. Otherwise the class resolved by an
    /// earlier pass is kept until the spec changes, then the module policy
    /// decides, falling back to the cluster default.
    async fn requested_class(&self, vi: &VirtualImage) -> Result<std::result::Result<Option<String>, StorageError>> {
        let names = SupplementNames::for_image(vi);
        let claimed = self
            .services
            .disk
            .get_pvc(&names)
            .await?
            .and_then(|pvc| pvc.spec)
            .and_then(|spec| spec.storage_class_name)
            .filter(|class| !class.is_empty());
        if let Some(class) = claimed {
            return Ok(Ok(Some(class)));
        }

        if let Some(class) = vi.status_storage_class().filter(|_| !vi.is_spec_changed()) {
            return Ok(Ok(Some(class.to_string())));
        }

        match self.services.storage_class.resolve(vi.spec_storage_class()) {
            Ok(None) => Ok(Ok(self.services.cluster_default_class().await?)),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Handler for StorageClassReadyHandler {
    fn name(&self) -> &'static str {
        "StorageClassReadyHandler"
    }

    async fn handle(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        if !vi.spec.storage.is_volume() {
            out.remove_condition(ConditionType::StorageClassReady);
            return Ok(Requeue::None);
        }

        let requested = self.requested_class(vi).await?;
        let mut scope = ConditionScope::new(ConditionType::StorageClassReady, vi, out);
        let (cb, out) = scope.split();
        cb.status(ConditionStatus::False);

        let name = match requested {
            Ok(Some(name)) => name,
            Ok(None) => {
                cb.reason(StorageClassReadyReason::StorageClassNotFound).message(
                    "The default StorageClass was not found in the cluster: please specify a StorageClass name or set a default StorageClass.",
                );
                return Ok(Requeue::None);
            }
            Err(StorageError::StorageClassNotAllowed(name)) => {
                debug!(storage_class = %name, "storage class rejected by the module settings");
                cb.reason(StorageClassReadyReason::StorageClassNotAllowed).message(format!(
                    "The specified StorageClass {name:?} is not allowed: please change the StorageClass name or check the module settings."
                ));
                return Ok(Requeue::None);
            }
            Err(e) => return Err(e.into()),
        };

        if self.services.store.get_storage_class(&name).await?.is_none() {
            cb.reason(StorageClassReadyReason::StorageClassNotFound)
                .message(format!("StorageClass {name:?} not found."));
            return Ok(Requeue::None);
        }
        out.storage_class_name = Some(name.clone());

        match self.services.store.get_storage_profile(&name).await? {
            None => {
                cb.reason(StorageClassReadyReason::StorageClassNotReady)
                    .message(format!("StorageProfile of the StorageClass {name:?} not found."));
            }
            Some(profile) if !profile.supports_block_rwx() => {
                cb.reason(StorageClassReadyReason::StorageClassNotReady).message(format!(
                    "the storage class {name:?} lacks of capabilities to support 'Virtual Images on PVC' function; use StorageClass that supports volume mode 'Block' and access mode 'ReadWriteMany'"
                ));
            }
            Some(_) => {
                cb.status(ConditionStatus::True)
                    .reason(StorageClassReadyReason::StorageClassReady)
                    .message("");
            }
        }

        Ok(Requeue::None)
    }
}
