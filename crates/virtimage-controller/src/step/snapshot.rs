//! Steps restoring a VolumeSnapshot into the image's claim

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, TypedLocalObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::info;

use virtimage_common::conditions::{ConditionBuilder, ConditionStatus, ReadyReason};
use virtimage_common::crd::{
    ImagePhase, VirtualImage, VolumeSnapshot, VOLUME_SNAPSHOT_API_GROUP, VOLUME_SNAPSHOT_KIND,
};
use virtimage_common::events::{actions, reasons};
use virtimage_common::supplements::SupplementNames;
use virtimage_common::{Error, Result, ANN_ACCESS_MODES, ANN_STORAGE_CLASS_NAME, ANN_VOLUME_MODE};

use super::volume::claim_size;
use super::{on_start_error, Step};
use crate::phases::set_failed;
use crate::requeue::{Requeue, POLL_INTERVAL};
use crate::services::disk;
use crate::services::objects::{helper_meta, owner_reference};
use crate::services::Services;
use crate::status::StatusFragment;

const WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

/// Claim restoring `vs`, named after the image's claim
///
/// Storage class, volume mode and access modes are copied from the
/// annotations the snapshot controller leaves on the VolumeSnapshot.
pub fn build_claim_from_snapshot(vi: &VirtualImage, vs: &VolumeSnapshot) -> Result<PersistentVolumeClaim> {
    let restore_size = vs.restore_size().ok_or_else(|| {
        Error::internal_with_context(
            "snapshot",
            format!("VolumeSnapshot {} has no restore size", vs.name_any()),
        )
    })?;

    let annotations = vs.annotations();
    let access_modes = annotations
        .get(ANN_ACCESS_MODES)
        .map(|modes| {
            modes
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|modes| !modes.is_empty());

    let name = SupplementNames::for_image(vi).persistent_volume_claim();
    Ok(PersistentVolumeClaim {
        metadata: helper_meta(&name.name, &name.namespace, &owner_reference(vi)),
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: annotations.get(ANN_STORAGE_CLASS_NAME).cloned(),
            volume_mode: annotations.get(ANN_VOLUME_MODE).cloned(),
            access_modes,
            data_source: Some(TypedLocalObjectReference {
                api_group: Some(VOLUME_SNAPSHOT_API_GROUP.to_string()),
                kind: VOLUME_SNAPSHOT_KIND.to_string(),
                name: vs.name_any(),
            }),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(restore_size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Create the image's claim from the snapshot
pub struct CreatePvcFromSnapshotStep<'a> {
    services: &'a Services,
    pvc: Option<&'a PersistentVolumeClaim>,
    snapshot: &'a VolumeSnapshot,
    as_target: bool,
}

impl<'a> CreatePvcFromSnapshotStep<'a> {
    /// Step creating the claim unless `pvc` exists
    pub fn new(services: &'a Services, pvc: Option<&'a PersistentVolumeClaim>, snapshot: &'a VolumeSnapshot) -> Self {
        Self {
            services,
            pvc,
            snapshot,
            as_target: false,
        }
    }

    /// Record the claim as the image's storage target
    pub fn as_target(mut self) -> Self {
        self.as_target = true;
        self
    }
}

#[async_trait]
impl Step for CreatePvcFromSnapshotStep<'_> {
    fn name(&self) -> &'static str {
        "create-pvc-from-snapshot"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        if self.pvc.is_some() {
            return Ok(None);
        }

        self.services
            .publish(vi, EventType::Normal, reasons::SYNC_STARTED, actions::PROVISION, "The snapshot restore has started")
            .await;

        let pvc = build_claim_from_snapshot(vi, self.snapshot)?;
        let claim_name = pvc.name_any();
        let storage_class = pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone());

        if let Err(e) = self.services.disk.create_pvc(pvc).await {
            if e.is_quota_exceeded() {
                return on_start_error(self.services, vi, cb, out, e).await;
            }
            set_failed(cb, out, &e);
            return Err(e);
        }
        info!(claim = %claim_name, snapshot = %self.snapshot.name_any(), "claim restored from snapshot");

        out.phase = Some(ImagePhase::Provisioning);
        out.progress = Some("0%".to_string());
        out.source_uid = self.snapshot.uid();
        if storage_class.is_some() {
            out.storage_class_name = storage_class;
        }
        if self.as_target {
            out.pvc_name = Some(claim_name);
        }
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("PVC has created: waiting to be Bound.");
        Ok(Some(Requeue::Immediate))
    }
}

/// Bind a WaitForFirstConsumer claim with a bounder pod
pub struct BounderStep<'a> {
    services: &'a Services,
    pvc: Option<&'a PersistentVolumeClaim>,
    bounder: Option<&'a Pod>,
}

impl<'a> BounderStep<'a> {
    /// Step over the image's claim and its bounder pod
    pub fn new(services: &'a Services, pvc: Option<&'a PersistentVolumeClaim>, bounder: Option<&'a Pod>) -> Self {
        Self {
            services,
            pvc,
            bounder,
        }
    }

    async fn waits_for_consumer(&self, pvc: &PersistentVolumeClaim) -> Result<bool> {
        let Some(class) = pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()) else {
            return Ok(false);
        };
        let class = self.services.store.get_storage_class(class).await?;
        Ok(class
            .and_then(|sc| sc.volume_binding_mode)
            .is_some_and(|mode| mode == WAIT_FOR_FIRST_CONSUMER))
    }
}

#[async_trait]
impl Step for BounderStep<'_> {
    fn name(&self) -> &'static str {
        "bounder"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        let Some(pvc) = self.pvc else {
            return Ok(None);
        };
        if pvc.status.as_ref().and_then(|s| s.phase.as_deref()) != Some("Pending") {
            return Ok(None);
        }
        if !self.waits_for_consumer(pvc).await? {
            return Ok(Some(Requeue::after(POLL_INTERVAL)));
        }

        if self.bounder.is_none() {
            let names = SupplementNames::for_image(vi);
            let start = self
                .services
                .bounder
                .start(owner_reference(vi), names, pvc.name_any())
                .await;
            if let Err(e) = start {
                return on_start_error(self.services, vi, cb, out, e).await;
            }
        }

        out.phase = Some(ImagePhase::Provisioning);
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("Bounder pod has created: waiting to be Bound.");
        Ok(Some(Requeue::after(POLL_INTERVAL)))
    }
}

/// Wait for the restored claim to be bound
pub struct WaitForPvcStep<'a> {
    services: &'a Services,
    pvc: Option<&'a PersistentVolumeClaim>,
    snapshot: &'a VolumeSnapshot,
}

impl<'a> WaitForPvcStep<'a> {
    /// Step over the restored claim
    pub fn new(services: &'a Services, pvc: Option<&'a PersistentVolumeClaim>, snapshot: &'a VolumeSnapshot) -> Self {
        Self {
            services,
            pvc,
            snapshot,
        }
    }
}

#[async_trait]
impl Step for WaitForPvcStep<'_> {
    fn name(&self) -> &'static str {
        "wait-for-pvc"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        let Some(pvc) = self.pvc else {
            return Ok(None);
        };

        if disk::is_bound(pvc) {
            self.services
                .publish(vi, EventType::Normal, reasons::SYNC_COMPLETED, actions::PROVISION, "The snapshot restore has completed")
                .await;
            out.phase = Some(ImagePhase::Ready);
            out.size = self.snapshot.restore_size().map(claim_size);
            out.format = Some("raw".to_string());
            out.cdrom = Some(false);
            out.progress = Some("100%".to_string());
            out.pvc_name = Some(pvc.name_any());
            cb.status(ConditionStatus::True)
                .reason(ReadyReason::Ready)
                .message("");
            return Ok(Some(Requeue::Immediate));
        }

        out.phase = Some(ImagePhase::Provisioning);
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("Import is in the process of provisioning to PVC.");
        Ok(Some(Requeue::None))
    }
}
