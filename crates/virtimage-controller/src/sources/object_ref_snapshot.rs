//! Import of a VirtualDiskSnapshot
//!
//! The snapshot is restored into a claim named after the image. For a
//! volume-backed image that claim is the result; for a registry-backed one
//! the importer reads it and the claim is dropped with the other helpers.

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use virtimage_common::conditions::ConditionType;
use virtimage_common::crd::{ObjectRefKind, VirtualImage, VolumeSnapshot};
use virtimage_common::supplements::SupplementNames;
use virtimage_common::{DataSourceError, Error, Result};

use super::{import, SourceStrategy};
use crate::requeue::Requeue;
use crate::services::importer::ImportSource;
use crate::services::objects::is_terminating;
use crate::services::Services;
use crate::status::{ConditionScope, StatusFragment};
use crate::step::{
    BounderStep, CreatePodStep, CreatePvcFromSnapshotStep, Pipeline, ReadyRegistryStep, ReadyVolumeStep,
    TerminatingStep, WaitForPodStep, WaitForPvcStep,
};

/// Strategy for `ObjectRef` sources of kind VirtualDiskSnapshot
pub struct ObjectRefSnapshotStrategy {
    services: Services,
}

impl ObjectRefSnapshotStrategy {
    /// Create the strategy
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn snapshot_name<'a>(&self, vi: &'a VirtualImage) -> Result<&'a str> {
        match vi.spec.data_source.object_ref.as_ref() {
            Some(r) if r.kind == ObjectRefKind::VirtualDiskSnapshot => Ok(&r.name),
            _ => Err(Error::validation_for_field(
                vi.name_any(),
                "spec.dataSource.objectRef",
                "not a VirtualDiskSnapshot data source",
            )),
        }
    }

    /// VolumeSnapshot behind the referenced disk snapshot, once both are ready
    async fn volume_snapshot(&self, vi: &VirtualImage) -> Result<VolumeSnapshot> {
        let name = self.snapshot_name(vi)?;
        let namespace = vi.namespace_or_default();
        let not_ready = || Error::from(DataSourceError::VirtualDiskSnapshotNotReady(name.to_string()));

        let snapshot = self
            .services
            .store
            .get_disk_snapshot(name, &namespace)
            .await?
            .filter(|s| s.is_ready())
            .ok_or_else(not_ready)?;
        let Some(vs_name) = snapshot.volume_snapshot_name() else {
            debug!(snapshot = name, "disk snapshot has no VolumeSnapshot yet");
            return Err(not_ready());
        };
        self.services
            .store
            .get_volume_snapshot(vs_name, &namespace)
            .await?
            .filter(VolumeSnapshot::is_ready_to_use)
            .ok_or_else(not_ready)
    }

    /// Snapshot to restore from, unless the image is finished
    async fn pending_snapshot(&self, vi: &VirtualImage) -> Result<Option<VolumeSnapshot>> {
        if vi.is_provisioning_finished() {
            return Ok(None);
        }
        self.volume_snapshot(vi).await.map(Some)
    }
}

#[async_trait]
impl SourceStrategy for ObjectRefSnapshotStrategy {
    fn name(&self) -> &'static str {
        "objectref-vdsnapshot"
    }

    async fn store_to_registry(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let pod = self.services.importer.get_pod(&names).await?;
        let pvc = self.services.disk.get_pvc(&names).await?;
        let vs = self.pending_snapshot(vi).await?;

        let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
        let (cb, out) = scope.split();

        let mut pipeline = Pipeline::new()
            .then(ReadyRegistryStep::new(&self.services, self, pod.as_ref()))
            .then(TerminatingStep::new(
                is_terminating(pod.as_ref()) || is_terminating(pvc.as_ref()),
            ));
        if let Some(vs) = vs.as_ref() {
            pipeline = pipeline
                .then(CreatePvcFromSnapshotStep::new(&self.services, pvc.as_ref(), vs))
                .then(
                    CreatePodStep::new(&self.services, pod.as_ref(), ImportSource::BlockDevice)
                        .source_pvc(names.persistent_volume_claim())
                        .source_uid(vs.uid()),
                );
        }
        let requeue = pipeline
            .then(WaitForPodStep::new(&self.services, pod.as_ref()))
            .run(vi, cb, out)
            .await;
        requeue
    }

    async fn store_to_volume(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let pvc = self.services.disk.get_pvc(&names).await?;
        let bounder = self.services.bounder.get_pod(&names).await?;
        let vs = self.pending_snapshot(vi).await?;

        let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
        let (cb, out) = scope.split();

        let mut pipeline = Pipeline::new()
            .then(ReadyVolumeStep::new(&self.services, self, pvc.as_ref()).bounder(bounder.as_ref()))
            .then(TerminatingStep::new(is_terminating(pvc.as_ref())));
        if let Some(vs) = vs.as_ref() {
            pipeline = pipeline
                .then(CreatePvcFromSnapshotStep::new(&self.services, pvc.as_ref(), vs).as_target())
                .then(BounderStep::new(&self.services, pvc.as_ref(), bounder.as_ref()))
                .then(WaitForPvcStep::new(&self.services, pvc.as_ref(), vs));
        }
        let requeue = pipeline.run(vi, cb, out).await;
        requeue
    }

    async fn clean_up(&self, vi: &VirtualImage) -> Result<bool> {
        let names = SupplementNames::for_image(vi);
        let imported = import::clean_up(&self.services, vi).await?;
        let bounder = self.services.bounder.clean_up_supplements(&names).await?;
        Ok(imported || bounder)
    }

    async fn clean_up_supplements(&self, vi: &VirtualImage) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let importer = self.services.importer.clean_up_supplements(&names).await?;
        let bounder = self.services.bounder.clean_up_supplements(&names).await?;
        let mut disk = self.services.disk.clean_up_supplements(&names).await?;
        if !vi.spec.storage.is_volume() {
            // The restored claim only fed the importer.
            disk |= self.services.disk.clean_up(&names).await?;
        }
        Ok(Requeue::from(importer || bounder || disk))
    }

    async fn validate(&self, vi: &VirtualImage) -> Result<()> {
        self.volume_snapshot(vi).await.map(drop)
    }
}
