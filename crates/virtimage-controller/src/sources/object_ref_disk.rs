//! Import of a VirtualDisk
//!
//! The disk's claim is mounted into the importer for a registry-backed
//! image and cloned by a DataVolume for a volume-backed one. A disk can
//! only be read while its InUse condition says it is reserved for image
//! creation.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::debug;

use virtimage_common::conditions::{self, ConditionType};
use virtimage_common::crd::{
    DataVolumePvcSource, DataVolumeSource, ImagePhase, ObjectRefKind, VirtualDisk, VirtualImage,
};
use virtimage_common::supplements::{SupplementName, SupplementNames};
use virtimage_common::{DataSourceError, Error, Result};

use super::{import, SourceStrategy};
use crate::requeue::Requeue;
use crate::services::importer::ImportSource;
use crate::services::objects::is_terminating;
use crate::services::Services;
use crate::status::{ConditionScope, StatusFragment};
use crate::step::{
    CreateDataVolumeStep, CreatePodStep, Pipeline, ReadyRegistryStep, ReadyVolumeStep, TerminatingStep,
    WaitForDataVolumeStep, WaitForPodStep,
};

/// InUse reason of a disk reserved for image creation
const USED_FOR_IMAGE_CREATION: &str = "UsedForImageCreation";

/// InUse reason of a disk attached to a virtual machine
const ATTACHED_TO_VIRTUAL_MACHINE: &str = "AttachedToVirtualMachine";

/// Whether an image in `phase` may read `vd`
fn check_disk(vd: &VirtualDisk, phase: ImagePhase) -> Result<()> {
    let name = vd.name_any();
    if !vd.is_ready() {
        return Err(DataSourceError::VirtualDiskNotReady(name).into());
    }
    if phase == ImagePhase::Ready {
        return Ok(());
    }

    let generation = vd.metadata.generation.unwrap_or_default();
    let in_use = vd
        .status
        .as_ref()
        .and_then(|s| conditions::get(ConditionType::InUse, &s.conditions))
        .filter(|c| c.is_true() && conditions::is_last_updated(c, generation));
    match in_use.map(|c| c.reason.as_str()) {
        Some(USED_FOR_IMAGE_CREATION) => Ok(()),
        Some(ATTACHED_TO_VIRTUAL_MACHINE) => Err(DataSourceError::VirtualDiskAttachedToVirtualMachine(name).into()),
        _ => Err(DataSourceError::VirtualDiskNotReadyForUse(name).into()),
    }
}

/// Strategy for `ObjectRef` sources of kind VirtualDisk
pub struct ObjectRefDiskStrategy {
    services: Services,
}

impl ObjectRefDiskStrategy {
    /// Create the strategy
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn disk_name<'a>(&self, vi: &'a VirtualImage) -> Result<&'a str> {
        match vi.spec.data_source.object_ref.as_ref() {
            Some(r) if r.kind == ObjectRefKind::VirtualDisk => Ok(&r.name),
            _ => Err(Error::validation_for_field(
                vi.name_any(),
                "spec.dataSource.objectRef",
                "not a VirtualDisk data source",
            )),
        }
    }

    async fn disk(&self, vi: &VirtualImage) -> Result<Option<VirtualDisk>> {
        let name = self.disk_name(vi)?;
        self.services.store.get_disk(name, &vi.namespace_or_default()).await
    }

    /// Disk whose claim can be read now
    async fn readable_disk(&self, vi: &VirtualImage) -> Result<VirtualDisk> {
        match self.disk(vi).await? {
            Some(vd) => {
                check_disk(&vd, vi.phase())?;
                Ok(vd)
            }
            None => Err(DataSourceError::VirtualDiskNotReady(self.disk_name(vi)?.to_string()).into()),
        }
    }

    fn disk_claim(vd: &VirtualDisk) -> Result<SupplementName> {
        let name = vd.pvc_name().ok_or_else(|| {
            Error::internal_with_context("objectref-vd", format!("VirtualDisk {} has no claim", vd.name_any()))
        })?;
        Ok(SupplementName {
            name: name.to_string(),
            namespace: vd.namespace().unwrap_or_default(),
        })
    }

    /// Block device unless the disk's claim is in filesystem mode
    async fn import_source(&self, claim: &SupplementName) -> Result<ImportSource> {
        let pvc = self.services.store.get_pvc(&claim.name, &claim.namespace).await?;
        let filesystem = pvc
            .as_ref()
            .and_then(|p| p.spec.as_ref())
            .and_then(|s| s.volume_mode.as_deref())
            == Some("Filesystem");
        Ok(if filesystem {
            ImportSource::Filesystem
        } else {
            ImportSource::BlockDevice
        })
    }
}

#[async_trait]
impl SourceStrategy for ObjectRefDiskStrategy {
    fn name(&self) -> &'static str {
        "objectref-vd"
    }

    async fn store_to_registry(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let pod = self.services.importer.get_pod(&names).await?;

        let mut create = None;
        if pod.is_none() && !vi.is_provisioning_finished() {
            let vd = self.readable_disk(vi).await?;
            let claim = Self::disk_claim(&vd)?;
            let source = self.import_source(&claim).await?;
            create = Some(
                CreatePodStep::new(&self.services, None, source)
                    .source_pvc(claim)
                    .source_uid(vd.uid()),
            );
        }

        let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
        let (cb, out) = scope.split();

        let mut pipeline = Pipeline::new()
            .then(ReadyRegistryStep::new(&self.services, self, pod.as_ref()))
            .then(TerminatingStep::new(is_terminating(pod.as_ref())));
        if let Some(create) = create {
            pipeline = pipeline.then(create);
        }
        let requeue = pipeline
            .then(WaitForPodStep::new(&self.services, pod.as_ref()))
            .run(vi, cb, out)
            .await;
        requeue
    }

    async fn store_to_volume(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let dv = self.services.disk.get_data_volume(&names).await?;
        let pvc = self.services.disk.get_pvc(&names).await?;

        let mut create = None;
        if dv.is_none() && !vi.is_provisioning_finished() {
            let vd = self.readable_disk(vi).await?;
            let claim = Self::disk_claim(&vd)?;
            let capacity = vd
                .status
                .as_ref()
                .and_then(|s| s.capacity.clone())
                .ok_or_else(|| {
                    Error::internal_with_context(
                        "objectref-vd",
                        format!("VirtualDisk {} has no capacity", vd.name_any()),
                    )
                })?;
            let source = DataVolumeSource {
                registry: None,
                pvc: Some(DataVolumePvcSource {
                    namespace: claim.namespace,
                    name: claim.name,
                }),
            };
            create = Some(
                CreateDataVolumeStep::new(&self.services, None, source, Quantity(capacity)).source_uid(vd.uid()),
            );
        }

        let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
        let (cb, out) = scope.split();

        let mut pipeline = Pipeline::new()
            .then(ReadyVolumeStep::new(&self.services, self, pvc.as_ref()).data_volume(dv.as_ref()))
            .then(TerminatingStep::new(
                is_terminating(dv.as_ref()) || is_terminating(pvc.as_ref()),
            ));
        if let Some(create) = create {
            pipeline = pipeline.then(create);
        }
        let requeue = pipeline
            .then(WaitForDataVolumeStep::new(&self.services, dv.as_ref(), pvc.as_ref()))
            .run(vi, cb, out)
            .await;
        requeue
    }

    async fn clean_up(&self, vi: &VirtualImage) -> Result<bool> {
        import::clean_up(&self.services, vi).await
    }

    async fn clean_up_supplements(&self, vi: &VirtualImage) -> Result<Requeue> {
        import::clean_up_supplements(&self.services, vi).await
    }

    async fn validate(&self, vi: &VirtualImage) -> Result<()> {
        let result = self.readable_disk(vi).await.map(drop);
        if let Err(e) = &result {
            debug!(error = %e, "referenced disk can't be read");
        }
        result
    }
}
