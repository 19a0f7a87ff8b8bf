//! DataVolume steps of a volume import

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::runtime::events::EventType;
use kube::ResourceExt;

use virtimage_common::conditions::{ConditionBuilder, ConditionStatus, ReadyReason};
use virtimage_common::crd::{DataVolume, DataVolumeSource, ImagePhase, ImageSize, VirtualImage};
use virtimage_common::events::{actions, reasons};
use virtimage_common::format::{humanize_bytes, parse_quantity};
use virtimage_common::supplements::SupplementNames;
use virtimage_common::Result;

use super::{on_start_error, Step};
use crate::phases::{set_from_data_volume_conditions, set_from_storage_error, set_volume_provisioning};
use crate::requeue::{Requeue, POLL_INTERVAL};
use crate::services::disk::{self, VolumeRequest};
use crate::services::objects::owner_reference;
use crate::services::stat::ProgressWindow;
use crate::services::Services;
use crate::status::StatusFragment;

/// Sizes of a raw image occupying a whole claim
pub(crate) fn claim_size(capacity: &str) -> ImageSize {
    let bytes = parse_quantity(capacity).unwrap_or_default().max(0);
    let human = humanize_bytes(bytes as u64);
    ImageSize {
        stored: human.clone(),
        stored_bytes: bytes.to_string(),
        unpacked: human,
        unpacked_bytes: bytes.to_string(),
    }
}

/// Create the DataVolume importing into the image's claim
pub struct CreateDataVolumeStep<'a> {
    services: &'a Services,
    dv: Option<&'a DataVolume>,
    source: DataVolumeSource,
    size: Quantity,
    source_uid: Option<String>,
}

impl<'a> CreateDataVolumeStep<'a> {
    /// Step creating a claim of `size` from `source` unless `dv` exists
    pub fn new(services: &'a Services, dv: Option<&'a DataVolume>, source: DataVolumeSource, size: Quantity) -> Self {
        Self {
            services,
            dv,
            source,
            size,
            source_uid: None,
        }
    }

    /// UID of the upstream object recorded in status
    pub fn source_uid(mut self, uid: Option<String>) -> Self {
        self.source_uid = uid;
        self
    }
}

#[async_trait]
impl Step for CreateDataVolumeStep<'_> {
    fn name(&self) -> &'static str {
        "create-data-volume"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        if self.dv.is_some() {
            return Ok(None);
        }

        self.services
            .publish(vi, EventType::Normal, reasons::SYNC_STARTED, actions::PROVISION, "The volume import has started")
            .await;
        out.progress = Some("0%".to_string());
        if self.source_uid.is_some() {
            out.source_uid = self.source_uid.clone();
        }

        let class = match self.services.volume_storage_class(vi).await {
            Ok(class) => class,
            Err(e) => {
                set_from_storage_error(cb, out, e)?;
                return Ok(Some(Requeue::None));
            }
        };

        let request = VolumeRequest {
            size: self.size.clone(),
            storage_class: Some(class.name_any()),
            source: self.source.clone(),
            owner: owner_reference(vi),
            names: SupplementNames::for_image(vi),
        };
        if let Err(e) = self.services.disk.start_immediate(request).await {
            return on_start_error(self.services, vi, cb, out, e).await;
        }

        out.phase = Some(ImagePhase::Provisioning);
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("PVC Provisioner not found: create the new one.");
        Ok(Some(Requeue::after(POLL_INTERVAL)))
    }
}

/// Follow the DataVolume until its claim is bound
pub struct WaitForDataVolumeStep<'a> {
    services: &'a Services,
    dv: Option<&'a DataVolume>,
    pvc: Option<&'a PersistentVolumeClaim>,
}

impl<'a> WaitForDataVolumeStep<'a> {
    /// Step over the DataVolume and the claim it fills
    pub fn new(services: &'a Services, dv: Option<&'a DataVolume>, pvc: Option<&'a PersistentVolumeClaim>) -> Self {
        Self { services, dv, pvc }
    }
}

#[async_trait]
impl Step for WaitForDataVolumeStep<'_> {
    fn name(&self) -> &'static str {
        "wait-for-data-volume"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        let Some(dv) = self.dv else {
            return Ok(None);
        };

        if set_from_data_volume_conditions(cb, out, Some(dv)) {
            return Ok(Some(Requeue::None));
        }

        let names = SupplementNames::for_image(vi);
        let Some(pvc) = self.pvc else {
            out.phase = Some(ImagePhase::Provisioning);
            cb.status(ConditionStatus::False)
                .reason(ReadyReason::Provisioning)
                .message("PVC not found: waiting for creation.");
            return Ok(Some(Requeue::after(POLL_INTERVAL)));
        };

        let claim = dv
            .claim_name()
            .map(str::to_string)
            .unwrap_or_else(|| names.persistent_volume_claim().name);

        if disk::is_import_done(Some(dv), Some(pvc)) {
            self.services
                .publish(vi, EventType::Normal, reasons::SYNC_COMPLETED, actions::PROVISION, "The volume import has completed")
                .await;
            out.phase = Some(ImagePhase::Ready);
            out.size = disk::capacity(pvc).map(|c| claim_size(&c));
            out.format = Some("raw".to_string());
            out.cdrom = Some(false);
            out.progress = Some("100%".to_string());
            out.pvc_name = Some(claim);
            cb.status(ConditionStatus::True)
                .reason(ReadyReason::Ready)
                .message("");
            return Ok(Some(Requeue::Immediate));
        }

        out.progress = disk::dv_progress(Some(dv), vi.progress(), ProgressWindow::FULL);
        out.pvc_name = Some(claim);
        self.services
            .disk
            .protect(owner_reference(vi), Some(dv.clone()), Some(pvc.clone()))
            .await?;
        set_volume_provisioning(cb, out, Some(dv))?;
        Ok(Some(Requeue::None))
    }
}
