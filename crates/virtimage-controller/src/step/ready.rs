//! Finished-image steps: keep the outcome and release helpers

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use tracing::debug;

use virtimage_common::conditions::ConditionBuilder;
use virtimage_common::crd::{DataVolume, VirtualImage};
use virtimage_common::supplements::SupplementNames;
use virtimage_common::Result;

use super::Step;
use crate::phases::{set_finished_in_registry, set_finished_on_volume};
use crate::requeue::Requeue;
use crate::services::objects::owner_reference;
use crate::services::Services;
use crate::sources::{clean_up_finished, SourceStrategy};
use crate::status::StatusFragment;

/// Finished registry import
///
/// Keeps Ready (or a reported image loss), drops the importer protection
/// and deletes the helpers unless they are retained.
pub struct ReadyRegistryStep<'a> {
    services: &'a Services,
    strategy: &'a dyn SourceStrategy,
    pod: Option<&'a Pod>,
}

impl<'a> ReadyRegistryStep<'a> {
    /// Step over the importer pod of the image, if any
    pub fn new(services: &'a Services, strategy: &'a dyn SourceStrategy, pod: Option<&'a Pod>) -> Self {
        Self {
            services,
            strategy,
            pod,
        }
    }
}

#[async_trait]
impl Step for ReadyRegistryStep<'_> {
    fn name(&self) -> &'static str {
        "ready-registry"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        if !vi.is_provisioning_finished() {
            return Ok(None);
        }

        set_finished_in_registry(cb, out, vi);

        if let Some(pod) = self.pod {
            self.services.importer.unprotect(pod).await?;
        }
        clean_up_finished(self.strategy, vi).await.map(Some)
    }
}

/// Finished volume import
///
/// Reports Ready or a lost claim, keeps the claim protected and releases
/// every other helper.
pub struct ReadyVolumeStep<'a> {
    services: &'a Services,
    strategy: &'a dyn SourceStrategy,
    pvc: Option<&'a PersistentVolumeClaim>,
    dv: Option<&'a DataVolume>,
    pod: Option<&'a Pod>,
    bounder: Option<&'a Pod>,
}

impl<'a> ReadyVolumeStep<'a> {
    /// Step over the claim of the image
    pub fn new(services: &'a Services, strategy: &'a dyn SourceStrategy, pvc: Option<&'a PersistentVolumeClaim>) -> Self {
        Self {
            services,
            strategy,
            pvc,
            dv: None,
            pod: None,
            bounder: None,
        }
    }

    /// DataVolume to unprotect
    pub fn data_volume(mut self, dv: Option<&'a DataVolume>) -> Self {
        self.dv = dv;
        self
    }

    /// Importer pod to unprotect
    pub fn importer(mut self, pod: Option<&'a Pod>) -> Self {
        self.pod = pod;
        self
    }

    /// Bounder pod to unprotect
    pub fn bounder(mut self, pod: Option<&'a Pod>) -> Self {
        self.bounder = pod;
        self
    }
}

#[async_trait]
impl Step for ReadyVolumeStep<'_> {
    fn name(&self) -> &'static str {
        "ready-volume"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        if !vi.is_provisioning_finished() {
            return Ok(None);
        }

        let names = SupplementNames::for_image(vi);
        set_finished_on_volume(cb, out, self.pvc, &names);
        if self.pvc.is_none() {
            debug!(image = %names.persistent_volume_claim(), "claim of a finished image is gone");
        }

        self.services
            .disk
            .protect(owner_reference(vi), None, self.pvc.cloned())
            .await?;
        self.services.disk.unprotect(self.dv.cloned()).await?;
        if let Some(pod) = self.pod {
            self.services.importer.unprotect(pod).await?;
        }
        if let Some(pod) = self.bounder {
            self.services.bounder.unprotect(pod).await?;
        }
        clean_up_finished(self.strategy, vi).await.map(Some)
    }
}
