//! Importer pod steps of a registry import

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use tracing::info;

use virtimage_common::conditions::{ConditionBuilder, ConditionStatus, ReadyReason};
use virtimage_common::crd::{ImagePhase, VirtualImage};
use virtimage_common::events::{actions, reasons};
use virtimage_common::supplements::{SupplementName, SupplementNames};
use virtimage_common::{Error, Result};

use super::{on_start_error, Step};
use crate::phases::set_from_pod_error;
use crate::requeue::{Requeue, POLL_INTERVAL};
use crate::services::importer::{ImportRequest, ImportSource};
use crate::services::objects::owner_reference;
use crate::services::stat::{self, ProgressWindow};
use crate::services::Services;
use crate::status::StatusFragment;

/// Pod scheduling message of a claim that is still being provisioned
const UNBOUND_IMMEDIATE_CLAIMS: &str = "pod has unbound immediate PersistentVolumeClaims";

/// Start the importer pod
pub struct CreatePodStep<'a> {
    services: &'a Services,
    pod: Option<&'a Pod>,
    source: ImportSource,
    source_pvc: Option<SupplementName>,
    source_uid: Option<String>,
}

impl<'a> CreatePodStep<'a> {
    /// Step importing from `source` unless `pod` already exists
    pub fn new(services: &'a Services, pod: Option<&'a Pod>, source: ImportSource) -> Self {
        Self {
            services,
            pod,
            source,
            source_pvc: None,
            source_uid: None,
        }
    }

    /// Claim mounted into the pod as the data source
    pub fn source_pvc(mut self, pvc: SupplementName) -> Self {
        self.source_pvc = Some(pvc);
        self
    }

    /// UID of the upstream object recorded in status
    pub fn source_uid(mut self, uid: Option<String>) -> Self {
        self.source_uid = uid;
        self
    }
}

#[async_trait]
impl Step for CreatePodStep<'_> {
    fn name(&self) -> &'static str {
        "create-pod"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        if self.pod.is_some() {
            return Ok(None);
        }

        let destination = self.services.settings.dvcr.image_for(vi);
        let request = ImportRequest {
            source: self.source.clone(),
            destination: destination.clone(),
            owner: owner_reference(vi),
            names: SupplementNames::for_image(vi),
            ca_bundle: None,
            source_pvc: self.source_pvc.clone(),
        };
        if let Err(e) = self.services.importer.start(request).await {
            return on_start_error(self.services, vi, cb, out, e).await;
        }
        info!(destination = %destination, "importer pod created");

        out.phase = Some(ImagePhase::Provisioning);
        out.progress = Some("0%".to_string());
        out.registry_url = Some(destination);
        if self.source_uid.is_some() {
            out.source_uid = self.source_uid.clone();
        }
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("DVCR Provisioner not found: create the new one.");
        // The owned-Pod watch brings the image back once the pod moves.
        Ok(Some(Requeue::None))
    }
}

/// Follow the importer pod until it completes
pub struct WaitForPodStep<'a> {
    services: &'a Services,
    pod: Option<&'a Pod>,
}

impl<'a> WaitForPodStep<'a> {
    /// Step over the importer pod
    pub fn new(services: &'a Services, pod: Option<&'a Pod>) -> Self {
        Self { services, pod }
    }

    async fn finish(
        &self,
        pod: &Pod,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        if let Err(e) = stat::check_pod(pod) {
            if let Error::Pod(pod_err) = &e {
                self.services
                    .publish(vi, EventType::Warning, reasons::PROVISIONING_FAILED, actions::PROVISION, pod_err.to_string())
                    .await;
            }
            set_from_pod_error(cb, out, e)?;
            return Ok(Some(Requeue::None));
        }

        self.services
            .publish(vi, EventType::Normal, reasons::SYNC_COMPLETED, actions::PROVISION, "Import has completed")
            .await;
        out.phase = Some(ImagePhase::Ready);
        out.size = Some(stat::size(pod));
        out.cdrom = Some(stat::cdrom(pod));
        out.format = Some(stat::format(pod));
        out.progress = Some("100%".to_string());
        out.download_speed = stat::download_speed(pod);
        out.registry_url = Some(
            stat::dvcr_image_name(pod).unwrap_or_else(|| self.services.settings.dvcr.image_for(vi)),
        );
        cb.status(ConditionStatus::True)
            .reason(ReadyReason::Ready)
            .message("");
        Ok(Some(Requeue::Immediate))
    }
}

#[async_trait]
impl Step for WaitForPodStep<'_> {
    fn name(&self) -> &'static str {
        "wait-for-pod"
    }

    async fn take(
        &self,
        vi: &VirtualImage,
        cb: &mut ConditionBuilder,
        out: &mut StatusFragment,
    ) -> Result<Option<Requeue>> {
        let Some(pod) = self.pod else {
            return Ok(None);
        };

        if stat::is_pod_complete(pod) {
            return self.finish(pod, vi, cb, out).await;
        }

        match stat::check_pod(pod) {
            Err(Error::Pod(e)) if e.is_not_started() && e.message().contains(UNBOUND_IMMEDIATE_CLAIMS) => {
                out.phase = Some(ImagePhase::Provisioning);
                cb.status(ConditionStatus::False)
                    .reason(ReadyReason::Provisioning)
                    .message("Waiting for PVC to be bound");
                return Ok(Some(Requeue::after(POLL_INTERVAL)));
            }
            Err(e) => {
                set_from_pod_error(cb, out, e)?;
                return Ok(Some(Requeue::None));
            }
            Ok(()) => {}
        }

        self.services.importer.protect(pod).await?;

        out.phase = Some(ImagePhase::Provisioning);
        out.progress = stat::progress(Some(pod), vi.progress(), ProgressWindow::FULL);
        out.download_speed = stat::download_speed(pod);
        out.registry_url = Some(
            stat::dvcr_image_name(pod).unwrap_or_else(|| self.services.settings.dvcr.image_for(vi)),
        );
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("Import is in the process of provisioning to DVCR.");
        Ok(Some(Requeue::after(POLL_INTERVAL)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        failed_pod, http_image, pod_with_progress, running_pod, succeeded_pod, unscheduled_pod, Mocks,
    };
    use virtimage_common::conditions::ConditionType;
    use virtimage_common::error::api_error;

    fn ready() -> ConditionBuilder {
        ConditionBuilder::new(ConditionType::Ready).generation(1)
    }

    fn source() -> ImportSource {
        ImportSource::Http {
            url: "https://example.com/ubuntu.img".to_string(),
            md5: None,
            sha256: None,
        }
    }

    // =========================================================================
    // Create Stories
    // =========================================================================

    mod create {
        use super::*;

        /// Story: an existing pod is left to the wait step
        #[tokio::test]
        async fn existing_pod_is_passed_on() {
            let services = Mocks::new().build();
            let pod = running_pod();
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = CreatePodStep::new(&services, Some(&pod), source());
            assert_eq!(step.take(&vi, &mut cb, &mut out).await.expect("take"), None);
        }

        /// Story: a fresh import writes into the image's DVCR location
        #[tokio::test]
        async fn new_pod_targets_the_image_in_dvcr() {
            let mut mocks = Mocks::new();
            mocks
                .importer
                .expect_start()
                .withf(|r| r.destination.starts_with("dvcr.local/vi/vms/ubuntu:") && r.source_pvc.is_none())
                .times(1)
                .returning(|_| Ok(()));
            let services = mocks.build();
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = CreatePodStep::new(&services, None, source());
            let requeue = step.take(&vi, &mut cb, &mut out).await.expect("take");

            assert_eq!(requeue, Some(Requeue::None));
            assert_eq!(out.phase, Some(ImagePhase::Provisioning));
            assert_eq!(out.progress.as_deref(), Some("0%"));
            assert_eq!(cb.current_message(), "DVCR Provisioner not found: create the new one.");
        }

        /// Story: a quota rejection on a young image waits for the user
        #[tokio::test]
        async fn quota_rejection_is_reported() {
            let mut mocks = Mocks::new();
            mocks
                .importer
                .expect_start()
                .returning(|_| Err(api_error(403, "Forbidden", "exceeded quota: compute")));
            let events = mocks.events.clone();
            let services = mocks.build();
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = CreatePodStep::new(&services, None, source());
            let requeue = step.take(&vi, &mut cb, &mut out).await.expect("take");

            assert_eq!(requeue, Some(Requeue::None));
            assert_eq!(out.phase, Some(ImagePhase::Failed));
            assert!(cb.current_message().starts_with("Quota exceeded: exceeded quota: compute"));
            assert_eq!(events.reasons(), vec![reasons::QUOTA_EXCEEDED.to_string()]);
        }

        /// Story: any other create failure is returned and reported
        #[tokio::test]
        async fn unexpected_failure_is_returned() {
            let mut mocks = Mocks::new();
            mocks
                .importer
                .expect_start()
                .returning(|_| Err(Error::internal("boom")));
            let services = mocks.build();
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = CreatePodStep::new(&services, None, source());
            assert!(step.take(&vi, &mut cb, &mut out).await.is_err());
            assert_eq!(out.phase, Some(ImagePhase::Failed));
            assert!(cb.current_message().starts_with("Unexpected error: "));
        }
    }

    // =========================================================================
    // Wait Stories
    // =========================================================================

    mod wait {
        use super::*;

        /// Story: a running import reports its progress and keeps its pod
        #[tokio::test]
        async fn running_import_reports_progress() {
            let mut mocks = Mocks::new();
            mocks.importer.expect_protect().times(1).returning(|_| Ok(()));
            let services = mocks.build();
            let pod = pod_with_progress("42.5%");
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = WaitForPodStep::new(&services, Some(&pod));
            step.take(&vi, &mut cb, &mut out).await.expect("take");

            assert_eq!(out.phase, Some(ImagePhase::Provisioning));
            assert_eq!(out.progress.as_deref(), Some("42.5%"));
            assert_eq!(cb.current_message(), "Import is in the process of provisioning to DVCR.");
        }

        /// Story: a completed import fills in the results
        #[tokio::test]
        async fn completed_import_is_ready() {
            let mocks = Mocks::new();
            let events = mocks.events.clone();
            let services = mocks.build();
            let pod = succeeded_pod();
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = WaitForPodStep::new(&services, Some(&pod));
            let requeue = step.take(&vi, &mut cb, &mut out).await.expect("take");

            assert_eq!(requeue, Some(Requeue::Immediate));
            assert_eq!(out.phase, Some(ImagePhase::Ready));
            assert_eq!(out.format.as_deref(), Some("qcow2"));
            assert_eq!(out.progress.as_deref(), Some("100%"));
            assert_eq!(out.size.as_ref().map(|s| s.stored_bytes.as_str()), Some("104857600"));
            assert_eq!(cb.current_reason(), Some("Ready"));
            assert_eq!(events.reasons(), vec![reasons::SYNC_COMPLETED.to_string()]);
        }

        /// Story: a failed import is reported with the pod's message
        #[tokio::test]
        async fn failed_import_is_reported() {
            let mocks = Mocks::new();
            let events = mocks.events.clone();
            let services = mocks.build();
            let pod = failed_pod(r#"{"error-message":"404 not found"}"#);
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = WaitForPodStep::new(&services, Some(&pod));
            step.take(&vi, &mut cb, &mut out).await.expect("take");

            assert_eq!(out.phase, Some(ImagePhase::Failed));
            assert_eq!(cb.current_reason(), Some("ProvisioningFailed"));
            assert!(cb.current_message().contains("404 not found"));
            assert_eq!(events.reasons(), vec![reasons::PROVISIONING_FAILED.to_string()]);
        }

        /// Story: a pod waiting for its source claim is not a failure
        #[tokio::test]
        async fn unbound_source_claim_is_waited_for() {
            let services = Mocks::new().build();
            let pod = unscheduled_pod("0/3 nodes are available: pod has unbound immediate PersistentVolumeClaims.");
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = WaitForPodStep::new(&services, Some(&pod));
            step.take(&vi, &mut cb, &mut out).await.expect("take");

            assert_eq!(out.phase, Some(ImagePhase::Provisioning));
            assert_eq!(cb.current_message(), "Waiting for PVC to be bound");
        }

        /// Story: an unschedulable pod is reported as not started
        #[tokio::test]
        async fn unschedulable_pod_is_not_started() {
            let services = Mocks::new().build();
            let pod = unscheduled_pod("0/3 nodes are available: insufficient memory.");
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let step = WaitForPodStep::new(&services, Some(&pod));
            step.take(&vi, &mut cb, &mut out).await.expect("take");

            assert_eq!(cb.current_reason(), Some("ProvisioningNotStarted"));
        }
    }
}
