//! Service seams between the reconciler and the cluster
//!
//! Every side effect goes through a trait here so handlers, steps and
//! strategies can be tested against mocks. The `*Impl` types talk to the
//! API server.

pub mod bounder;
pub mod disk;
pub mod importer;
pub mod object_store;
pub mod objects;
pub mod registry;
pub mod stat;
pub mod storage_class;
pub mod uploader;

use std::sync::Arc;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};

use virtimage_common::crd::VirtualImage;
use virtimage_common::events::EventPublisher;
use virtimage_common::{Result, StorageError};

pub use bounder::{Bounder, BounderImpl};
pub use disk::{DiskService, DiskServiceImpl, VolumeRequest};
pub use importer::{ImportRequest, ImportSource, Importer, ImporterImpl};
pub use object_store::{ObjectStore, ObjectStoreImpl};
pub use registry::{RegistryProbe, RegistryProbeImpl};
pub use storage_class::StorageClassPolicy;
pub use uploader::{UploadRequest, Uploader, UploaderImpl, UploaderObjects};

use crate::settings::ControllerSettings;

/// Everything strategies and handlers talk to
#[derive(Clone)]
pub struct Services {
    /// Cluster reads and image writes
    pub store: Arc<dyn ObjectStore>,
    /// Importer pods
    pub importer: Arc<dyn Importer>,
    /// Uploader pods
    pub uploader: Arc<dyn Uploader>,
    /// Bounder pods
    pub bounder: Arc<dyn Bounder>,
    /// DataVolumes and claims
    pub disk: Arc<dyn DiskService>,
    /// DVCR presence checks
    pub registry: Arc<dyn RegistryProbe>,
    /// Kubernetes events
    pub events: Arc<dyn EventPublisher>,
    /// Storage class policy
    pub storage_class: StorageClassPolicy,
    /// Controller settings
    pub settings: ControllerSettings,
}

impl Services {
    /// The cluster default StorageClass name
    ///
    /// A class carrying the default annotation wins over the configured one.
    pub async fn cluster_default_class(&self) -> Result<Option<String>> {
        let annotated = self.store.get_default_storage_class().await?;
        Ok(annotated
            .map(|sc| sc.name_any())
            .or_else(|| self.settings.storage_class.cluster_default.clone()))
    }

    /// StorageClass a volume import of `vi` is created in
    ///
    /// Uses the class resolved into status, then the cluster default. The
    /// class must exist and have a StorageProfile.
    pub async fn volume_storage_class(&self, vi: &VirtualImage) -> Result<StorageClass> {
        let name = match vi.status_storage_class() {
            Some(name) => name.to_string(),
            None => self
                .cluster_default_class()
                .await?
                .ok_or(StorageError::DefaultStorageClassNotFound)?,
        };

        let class = self
            .store
            .get_storage_class(&name)
            .await?
            .ok_or_else(|| StorageError::StorageClassNotFound(name.clone()))?;
        if self.store.get_storage_profile(&name).await?.is_none() {
            return Err(StorageError::StorageProfileNotFound.into());
        }
        Ok(class)
    }

    /// Publish an event on an image
    pub async fn publish(
        &self,
        vi: &VirtualImage,
        type_: EventType,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        let reference = vi.object_ref(&());
        self.events
            .publish(&reference, type_, reason, action, Some(note.into()))
            .await;
    }
}
