//! Reads of the objects an image depends on, and writes to the image itself

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use virtimage_common::crd::{
    ClusterVirtualImage, StorageProfile, VirtualDisk, VirtualDiskSnapshot, VirtualImage,
    VirtualMachine, VolumeSnapshot,
};
use virtimage_common::{Result, FIELD_MANAGER, IMAGE_CLEANUP_FINALIZER};

use super::objects::{add_finalizer, remove_finalizer};

/// Annotation marking the cluster default StorageClass
pub const ANN_DEFAULT_STORAGE_CLASS: &str = "storageclass.kubernetes.io/is-default-class";

/// Cluster object access used by handlers and strategies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get a VirtualImage
    async fn get_image(&self, name: &str, namespace: &str) -> Result<Option<VirtualImage>>;

    /// Get a ClusterVirtualImage
    async fn get_cluster_image(&self, name: &str) -> Result<Option<ClusterVirtualImage>>;

    /// Get a VirtualDisk
    async fn get_disk(&self, name: &str, namespace: &str) -> Result<Option<VirtualDisk>>;

    /// Get a VirtualDiskSnapshot
    async fn get_disk_snapshot(&self, name: &str, namespace: &str) -> Result<Option<VirtualDiskSnapshot>>;

    /// Get a VolumeSnapshot
    async fn get_volume_snapshot(&self, name: &str, namespace: &str) -> Result<Option<VolumeSnapshot>>;

    /// Get a claim by name
    async fn get_pvc(&self, name: &str, namespace: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Get a secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>>;

    /// Get a StorageClass
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    /// The StorageClass annotated as cluster default
    async fn get_default_storage_class(&self) -> Result<Option<StorageClass>>;

    /// Get the StorageProfile of a class
    async fn get_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>>;

    /// VirtualMachines in a namespace
    async fn list_machines(&self, namespace: &str) -> Result<Vec<VirtualMachine>>;

    /// VirtualDisks in a namespace
    async fn list_disks(&self, namespace: &str) -> Result<Vec<VirtualDisk>>;

    /// VirtualImages in a namespace
    async fn list_images(&self, namespace: &str) -> Result<Vec<VirtualImage>>;

    /// Every ClusterVirtualImage
    async fn list_cluster_images(&self) -> Result<Vec<ClusterVirtualImage>>;

    /// Persist the status of an image
    ///
    /// The patch carries the resource version the status was computed from,
    /// so a write racing another change is rejected with a conflict.
    async fn patch_image_status(&self, image: &VirtualImage) -> Result<()>;

    /// Add the cleanup finalizer
    async fn add_image_finalizer(&self, image: &VirtualImage) -> Result<()>;

    /// Remove the cleanup finalizer
    async fn remove_image_finalizer(&self, image: &VirtualImage) -> Result<()>;
}

/// Kubernetes-backed object store
pub struct ObjectStoreImpl {
    client: Client,
}

impl ObjectStoreImpl {
    /// Create a new object store
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ObjectStore for ObjectStoreImpl {
    async fn get_image(&self, name: &str, namespace: &str) -> Result<Option<VirtualImage>> {
        Ok(self.namespaced::<VirtualImage>(namespace).get_opt(name).await?)
    }

    async fn get_cluster_image(&self, name: &str) -> Result<Option<ClusterVirtualImage>> {
        Ok(self.cluster::<ClusterVirtualImage>().get_opt(name).await?)
    }

    async fn get_disk(&self, name: &str, namespace: &str) -> Result<Option<VirtualDisk>> {
        Ok(self.namespaced::<VirtualDisk>(namespace).get_opt(name).await?)
    }

    async fn get_disk_snapshot(&self, name: &str, namespace: &str) -> Result<Option<VirtualDiskSnapshot>> {
        Ok(self.namespaced::<VirtualDiskSnapshot>(namespace).get_opt(name).await?)
    }

    async fn get_volume_snapshot(&self, name: &str, namespace: &str) -> Result<Option<VolumeSnapshot>> {
        Ok(self.namespaced::<VolumeSnapshot>(namespace).get_opt(name).await?)
    }

    async fn get_pvc(&self, name: &str, namespace: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.namespaced::<PersistentVolumeClaim>(namespace).get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        Ok(self.namespaced::<Secret>(namespace).get_opt(name).await?)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.cluster::<StorageClass>().get_opt(name).await?)
    }

    async fn get_default_storage_class(&self) -> Result<Option<StorageClass>> {
        let classes = self.cluster::<StorageClass>().list(&ListParams::default()).await?;
        Ok(classes.items.into_iter().find(|sc| {
            sc.annotations()
                .get(ANN_DEFAULT_STORAGE_CLASS)
                .is_some_and(|v| v == "true")
        }))
    }

    async fn get_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>> {
        Ok(self.cluster::<StorageProfile>().get_opt(name).await?)
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<VirtualMachine>> {
        Ok(self
            .namespaced::<VirtualMachine>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn list_disks(&self, namespace: &str) -> Result<Vec<VirtualDisk>> {
        Ok(self
            .namespaced::<VirtualDisk>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn list_images(&self, namespace: &str) -> Result<Vec<VirtualImage>> {
        Ok(self
            .namespaced::<VirtualImage>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn list_cluster_images(&self) -> Result<Vec<ClusterVirtualImage>> {
        Ok(self
            .cluster::<ClusterVirtualImage>()
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn patch_image_status(&self, image: &VirtualImage) -> Result<()> {
        let name = image.name_any();
        let api = self.namespaced::<VirtualImage>(&image.namespace_or_default());
        let status = image.status.clone().unwrap_or_default();
        let status_patch = serde_json::json!({
            "metadata": { "resourceVersion": image.resource_version() },
            "status": status,
        });
        api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&status_patch))
            .await?;
        debug!(image = %name, phase = %status.phase, "patched image status");
        Ok(())
    }

    async fn add_image_finalizer(&self, image: &VirtualImage) -> Result<()> {
        let api = self.namespaced::<VirtualImage>(&image.namespace_or_default());
        add_finalizer(&api, image, IMAGE_CLEANUP_FINALIZER).await
    }

    async fn remove_image_finalizer(&self, image: &VirtualImage) -> Result<()> {
        let api = self.namespaced::<VirtualImage>(&image.namespace_or_default());
        remove_finalizer(&api, image, IMAGE_CLEANUP_FINALIZER).await
    }
}
