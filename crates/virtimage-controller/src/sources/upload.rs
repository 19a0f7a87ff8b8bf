//! Import of a file uploaded by the user
//!
//! The uploader is a pod behind a Service and an Ingress. The image waits in
//! `WaitForUserUpload` until the pod reports that data is arriving.

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use virtimage_common::conditions::{ConditionBuilder, ConditionStatus, ConditionType, ReadyReason};
use virtimage_common::crd::{ImagePhase, ImageUploadUrls, VirtualImage};
use virtimage_common::events::{actions, reasons};
use virtimage_common::supplements::SupplementNames;
use virtimage_common::Result;

use super::import::{self, DVCR_STAGE};
use super::{clean_up_finished, SourceStrategy};
use crate::phases::{set_finished_in_registry, set_finished_on_volume, set_from_pod_error};
use crate::requeue::{Requeue, POLL_INTERVAL};
use crate::services::objects::{is_terminating, owner_reference};
use crate::services::stat::{self, ProgressWindow};
use crate::services::uploader::{external_url, in_cluster_url, UploadRequest, UploaderObjects};
use crate::services::Services;
use crate::status::{ConditionScope, StatusFragment};
use crate::step::on_start_error;

fn any_terminating(objects: &UploaderObjects) -> bool {
    is_terminating(objects.pod.as_ref())
        || is_terminating(objects.service.as_ref())
        || is_terminating(objects.ingress.as_ref())
}

fn is_complete(objects: &UploaderObjects) -> bool {
    objects.pod.is_some() && objects.service.is_some() && objects.ingress.is_some()
}

/// Strategy for `Upload` data sources
pub struct UploadStrategy {
    services: Services,
}

impl UploadStrategy {
    /// Create the strategy
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn start(&self, vi: &VirtualImage, cb: &mut ConditionBuilder, out: &mut StatusFragment) -> Result<Requeue> {
        let request = UploadRequest {
            destination: self.services.settings.dvcr.image_for(vi),
            owner: owner_reference(vi),
            names: SupplementNames::for_image(vi),
            path: self.services.settings.uploader.upload_path(vi),
        };
        if let Err(e) = self.services.uploader.start(request).await {
            return on_start_error(&self.services, vi, cb, out, e)
                .await
                .map(Option::unwrap_or_default);
        }
        info!("uploader created");
        self.services
            .publish(
                vi,
                EventType::Normal,
                reasons::SYNC_STARTED,
                actions::PROVISION,
                "The upload to DVCR has started",
            )
            .await;

        out.phase = Some(ImagePhase::Provisioning);
        out.progress = Some("0%".to_string());
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("DVCR Provisioner not found: create the new one.");
        Ok(Requeue::after(POLL_INTERVAL))
    }

    /// Uploader is up: wait for the user, or follow the running upload
    async fn follow(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
        objects: &UploaderObjects,
        window: ProgressWindow,
    ) -> Result<Requeue> {
        let Some(pod) = objects.pod.as_ref() else {
            return Ok(Requeue::after(POLL_INTERVAL));
        };

        if !stat::is_upload_started(pod) {
            if stat::is_uploader_ready(Some(pod), objects.service.as_ref(), objects.ingress.as_ref()) {
                out.phase = Some(ImagePhase::WaitForUserUpload);
                out.upload_urls = Some(ImageUploadUrls {
                    external: objects.ingress.as_ref().and_then(external_url),
                    in_cluster: objects.service.as_ref().map(in_cluster_url),
                });
                cb.status(ConditionStatus::False)
                    .reason(ReadyReason::WaitForUserUpload)
                    .message("Waiting for the user upload.");
            } else {
                out.phase = Some(ImagePhase::Pending);
                cb.status(ConditionStatus::False)
                    .reason(ReadyReason::ProvisioningNotStarted)
                    .message(format!(
                        "Waiting for the uploader {:?} to be ready to process the user's upload.",
                        pod.name_any()
                    ));
            }
            return Ok(Requeue::after(POLL_INTERVAL));
        }

        if let Err(e) = stat::check_pod(pod) {
            set_from_pod_error(cb, out, e)?;
            return Ok(Requeue::None);
        }

        out.phase = Some(ImagePhase::Provisioning);
        out.progress = stat::progress(Some(pod), vi.progress(), window);
        out.download_speed = stat::download_speed(pod);
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("Import is in the process of provisioning to DVCR.");
        self.services.uploader.protect(objects.clone()).await?;
        Ok(Requeue::Immediate)
    }
}

#[async_trait]
impl SourceStrategy for UploadStrategy {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn store_to_registry(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let objects = self.services.uploader.get(&names).await?;

        let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
        let (cb, out) = scope.split();

        match objects.pod.as_ref() {
            _ if vi.is_provisioning_finished() => {
                set_finished_in_registry(cb, out, vi);
                self.services.uploader.unprotect(objects.clone()).await?;
                clean_up_finished(self, vi).await
            }
            _ if any_terminating(&objects) => {
                debug!("uploader of a previous attempt is terminating");
                out.phase = Some(ImagePhase::Pending);
                Ok(Requeue::Immediate)
            }
            _ if !is_complete(&objects) => self.start(vi, cb, out).await,
            Some(pod) if stat::is_pod_complete(pod) => {
                if let Err(e) = stat::check_pod(pod) {
                    self.services
                        .publish(
                            vi,
                            EventType::Warning,
                            reasons::PROVISIONING_FAILED,
                            actions::PROVISION,
                            e.to_string(),
                        )
                        .await;
                    set_from_pod_error(cb, out, e)?;
                    return Ok(Requeue::None);
                }
                self.services
                    .publish(
                        vi,
                        EventType::Normal,
                        reasons::SYNC_COMPLETED,
                        actions::PROVISION,
                        "The upload to DVCR has completed",
                    )
                    .await;

                out.phase = Some(ImagePhase::Ready);
                out.size = Some(stat::size(pod));
                out.cdrom = Some(stat::cdrom(pod));
                out.format = Some(stat::format(pod));
                out.progress = Some("100%".to_string());
                out.download_speed = stat::download_speed(pod);
                out.registry_url = Some(self.services.settings.dvcr.image_for(vi));
                cb.status(ConditionStatus::True)
                    .reason(ReadyReason::Ready)
                    .message("");
                Ok(Requeue::Immediate)
            }
            _ => self.follow(vi, cb, out, &objects, ProgressWindow::FULL).await,
        }
    }

    async fn store_to_volume(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let objects = self.services.uploader.get(&names).await?;
        let dv = self.services.disk.get_data_volume(&names).await?;
        let pvc = self.services.disk.get_pvc(&names).await?;

        let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
        let (cb, out) = scope.split();

        match objects.pod.as_ref() {
            _ if vi.is_provisioning_finished() => {
                set_finished_on_volume(cb, out, pvc.as_ref(), &names);
                self.services
                    .disk
                    .protect(owner_reference(vi), None, pvc.clone())
                    .await?;
                self.services.uploader.unprotect(objects.clone()).await?;
                self.services.disk.unprotect(dv).await?;
                clean_up_finished(self, vi).await
            }
            _ if any_terminating(&objects) || is_terminating(dv.as_ref()) || is_terminating(pvc.as_ref()) => {
                debug!("helpers of a previous attempt are terminating");
                out.phase = Some(ImagePhase::Pending);
                Ok(Requeue::Immediate)
            }
            _ if !is_complete(&objects) => self.start(vi, cb, out).await,
            Some(pod) if stat::is_pod_complete(pod) => {
                import::import_from_dvcr(&self.services, vi, cb, out, pod, dv.as_ref(), pvc.as_ref()).await
            }
            _ => self.follow(vi, cb, out, &objects, DVCR_STAGE).await,
        }
    }

    async fn clean_up(&self, vi: &VirtualImage) -> Result<bool> {
        let names = SupplementNames::for_image(vi);
        let uploader = self.services.uploader.clean_up(&names).await?;
        let disk = self.services.disk.clean_up(&names).await?;
        Ok(uploader || disk)
    }

    async fn clean_up_supplements(&self, vi: &VirtualImage) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let uploader = self.services.uploader.clean_up_supplements(&names).await?;
        let disk = self.services.disk.clean_up_supplements(&names).await?;
        Ok(Requeue::from(uploader || disk))
    }

    async fn validate(&self, _vi: &VirtualImage) -> Result<()> {
        Ok(())
    }
}
