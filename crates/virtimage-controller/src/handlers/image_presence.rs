//! ImagePresence: a Ready image still has its data
//!
//! Registry-backed images are re-checked against DVCR on a fixed interval;
//! volume-backed images are checked against their claim on every pass.

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, warn};

use virtimage_common::conditions::{ConditionStatus, ConditionType, ReadyReason};
use virtimage_common::crd::{ImagePhase, ImageTarget, VirtualImage};
use virtimage_common::events::{actions, reasons};
use virtimage_common::Result;

use super::Handler;
use crate::requeue::Requeue;
use crate::services::{disk, Services};
use crate::status::{ConditionScope, StatusFragment};

fn target(vi: &VirtualImage) -> Option<&ImageTarget> {
    vi.status.as_ref().and_then(|s| s.target.as_ref())
}

/// Demotes Ready images whose data disappeared
pub struct ImagePresenceHandler {
    services: Services,
}

impl ImagePresenceHandler {
    /// Create the handler
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn check_registry(&self, vi: &VirtualImage, image: &str, out: &mut StatusFragment) -> Result<Requeue> {
        let recheck = Requeue::after(self.services.settings.presence_check_interval);
        match self.services.registry.image_exists(image).await {
            Ok(true) => {
                debug!(image, "image is present in DVCR");
                Ok(recheck)
            }
            Ok(false) => {
                warn!(image, "image disappeared from DVCR");
                out.phase = Some(ImagePhase::ImageLost);
                ConditionScope::new(ConditionType::Ready, vi, out)
                    .builder()
                    .status(ConditionStatus::False)
                    .reason(ReadyReason::ImageLost)
                    .message("The image was not found in DVCR");
                self.services
                    .publish(
                        vi,
                        EventType::Warning,
                        reasons::IMAGE_LOST,
                        actions::RECONCILE,
                        format!("Image {image} was not found in DVCR"),
                    )
                    .await;
                Ok(Requeue::None)
            }
            Err(e) => {
                warn!(image, error = %e, "failed to check the image in DVCR");
                Ok(recheck)
            }
        }
    }

    async fn check_claim(&self, vi: &VirtualImage, claim: &str, out: &mut StatusFragment) -> Result<Requeue> {
        let pvc = self
            .services
            .store
            .get_pvc(claim, &vi.namespace_or_default())
            .await?;
        let message = match pvc {
            None => format!("PVC {claim} not found."),
            Some(pvc) if disk::is_lost(&pvc) => format!("PVC {claim} is lost."),
            Some(_) => return Ok(Requeue::None),
        };

        warn!(pvc = claim, "claim of a ready image is gone");
        out.phase = Some(ImagePhase::PvcLost);
        ConditionScope::new(ConditionType::Ready, vi, out)
            .builder()
            .status(ConditionStatus::False)
            .reason(ReadyReason::Lost)
            .message(message.clone());
        self.services
            .publish(vi, EventType::Warning, reasons::IMAGE_LOST, actions::RECONCILE, message)
            .await;
        Ok(Requeue::None)
    }
}

#[async_trait]
impl Handler for ImagePresenceHandler {
    fn name(&self) -> &'static str {
        "ImagePresenceHandler"
    }

    async fn handle(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        if vi.is_terminating() || vi.phase() != ImagePhase::Ready {
            return Ok(Requeue::None);
        }
        let Some(target) = target(vi) else {
            return Ok(Requeue::None);
        };

        if vi.spec.storage.is_volume() {
            match target.persistent_volume_claim_name.as_deref() {
                Some(claim) => self.check_claim(vi, claim, out).await,
                None => Ok(Requeue::None),
            }
        } else {
            match target.registry_url.as_deref() {
                Some(image) => self.check_registry(vi, image, out).await,
                None => Ok(Requeue::None),
            }
        }
    }
}
