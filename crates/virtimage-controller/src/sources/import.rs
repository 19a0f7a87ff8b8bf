//! Importer-pod state machines
//!
//! HTTP, container-registry and image-reference sources all run one importer
//! pod that writes into DVCR. A volume-backed image then imports that DVCR
//! image into its claim through a DataVolume. The functions here walk the
//! helper objects of an image and decide the next move from what exists.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use virtimage_common::conditions::{ConditionBuilder, ConditionStatus, ConditionType, ReadyReason};
use virtimage_common::crd::{
    DataVolume, DataVolumeRegistrySource, DataVolumeSource, ImagePhase, VirtualImage,
};
use virtimage_common::events::{actions, reasons};
use virtimage_common::supplements::{Supplement, SupplementName, SupplementNames};
use virtimage_common::{Error, Result};

use super::{clean_up_finished, SourceStrategy};
use crate::phases::{
    set_failed, set_finished_in_registry, set_finished_on_volume, set_from_data_volume_conditions,
    set_from_pod_error, set_from_storage_error, set_volume_provisioning,
};
use crate::requeue::Requeue;
use crate::services::disk::{self, VolumeRequest};
use crate::services::importer::{ImportRequest, ImportSource};
use crate::services::objects::{is_terminating, owner_reference};
use crate::services::stat::{self, ProgressWindow};
use crate::services::Services;
use crate::status::{ConditionScope, StatusFragment};
use crate::step::on_start_error;

/// Progress window of the DVCR stage of a volume import
pub(crate) const DVCR_STAGE: ProgressWindow = ProgressWindow::new(0.0, 50.0);

/// Progress window of the DataVolume stage of a volume import
pub(crate) const VOLUME_STAGE: ProgressWindow = ProgressWindow::new(50.0, 100.0);

/// How to start the importer pod of an image
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Launch {
    pub source: ImportSource,
    pub ca_bundle: Option<String>,
    pub source_uid: Option<String>,
    pub source_pvc: Option<SupplementName>,
}

impl Launch {
    pub(crate) fn new(source: ImportSource) -> Self {
        Self {
            source,
            ca_bundle: None,
            source_uid: None,
            source_pvc: None,
        }
    }
}

/// DataVolume source reading a DVCR image
pub(crate) fn dvcr_volume_source(services: &Services, names: &SupplementNames, image: &str) -> DataVolumeSource {
    let dvcr = &services.settings.dvcr;
    DataVolumeSource {
        registry: Some(DataVolumeRegistrySource {
            url: format!("docker://{image}"),
            secret_ref: dvcr
                .auth_secret
                .as_ref()
                .map(|_| names.get(Supplement::DvcrAuthSecretForDv).name),
            cert_config_map: dvcr
                .cert_secret
                .as_ref()
                .map(|_| names.get(Supplement::DvcrCaBundleForDv).name),
        }),
        pvc: None,
    }
}

async fn start_importer(
    services: &Services,
    vi: &VirtualImage,
    cb: &mut ConditionBuilder,
    out: &mut StatusFragment,
    launch: Launch,
) -> Result<Requeue> {
    let destination = services.settings.dvcr.image_for(vi);
    let request = ImportRequest {
        source: launch.source,
        destination: destination.clone(),
        owner: owner_reference(vi),
        names: SupplementNames::for_image(vi),
        ca_bundle: launch.ca_bundle,
        source_pvc: launch.source_pvc,
    };
    if let Err(e) = services.importer.start(request).await {
        return on_start_error(services, vi, cb, out, e)
            .await
            .map(Option::unwrap_or_default);
    }
    info!(destination = %destination, "importer pod created");
    services
        .publish(
            vi,
            EventType::Normal,
            reasons::SYNC_STARTED,
            actions::PROVISION,
            "The import to DVCR has started",
        )
        .await;

    out.phase = Some(ImagePhase::Provisioning);
    out.progress = Some("0%".to_string());
    if launch.source_uid.is_some() {
        out.source_uid = launch.source_uid;
    }
    cb.status(ConditionStatus::False)
        .reason(ReadyReason::Provisioning)
        .message("DVCR Provisioner not found: create the new one.");
    Ok(Requeue::Immediate)
}

/// Pod failure during a pass: absorbed into Ready or returned
async fn fail_from_pod(
    services: &Services,
    vi: &VirtualImage,
    cb: &mut ConditionBuilder,
    out: &mut StatusFragment,
    err: Error,
) -> Result<Requeue> {
    if matches!(err, Error::Pod(_)) {
        services
            .publish(
                vi,
                EventType::Warning,
                reasons::PROVISIONING_FAILED,
                actions::PROVISION,
                err.to_string(),
            )
            .await;
    }
    set_from_pod_error(cb, out, err)?;
    Ok(Requeue::None)
}

/// Import into DVCR with an importer pod
///
/// `launch` is only needed to create the pod; its error surfaces only then.
pub(crate) async fn store_to_registry(
    services: &Services,
    strategy: &dyn SourceStrategy,
    vi: &VirtualImage,
    out: &mut StatusFragment,
    launch: Result<Launch>,
) -> Result<Requeue> {
    let names = SupplementNames::for_image(vi);
    let pod = services.importer.get_pod(&names).await?;

    let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
    let (cb, out) = scope.split();

    match pod.as_ref() {
        _ if vi.is_provisioning_finished() => {
            set_finished_in_registry(cb, out, vi);
            if let Some(pod) = &pod {
                services.importer.unprotect(pod).await?;
            }
            clean_up_finished(strategy, vi).await
        }
        Some(pod) if is_terminating(Some(pod)) => {
            debug!(pod = %names.importer_pod(), "importer of a previous attempt is terminating");
            out.phase = Some(ImagePhase::Pending);
            Ok(Requeue::Immediate)
        }
        None => start_importer(services, vi, cb, out, launch?).await,
        Some(pod) if stat::is_pod_complete(pod) => {
            if let Err(e) = stat::check_pod(pod) {
                return fail_from_pod(services, vi, cb, out, e).await;
            }
            services
                .publish(
                    vi,
                    EventType::Normal,
                    reasons::SYNC_COMPLETED,
                    actions::PROVISION,
                    "The import to DVCR has completed",
                )
                .await;

            out.phase = Some(ImagePhase::Ready);
            out.size = Some(stat::size(pod));
            out.cdrom = Some(stat::cdrom(pod));
            out.format = Some(stat::format(pod));
            out.progress = Some("100%".to_string());
            out.download_speed = stat::download_speed(pod);
            out.registry_url =
                Some(stat::dvcr_image_name(pod).unwrap_or_else(|| services.settings.dvcr.image_for(vi)));
            cb.status(ConditionStatus::True)
                .reason(ReadyReason::Ready)
                .message("");
            info!(format = ?out.format, "import to DVCR finished");
            Ok(Requeue::Immediate)
        }
        Some(pod) => {
            if let Err(e) = stat::check_pod(pod) {
                return fail_from_pod(services, vi, cb, out, e).await;
            }
            services.importer.protect(pod).await?;

            out.phase = Some(ImagePhase::Provisioning);
            out.progress = stat::progress(Some(pod), vi.progress(), ProgressWindow::FULL);
            out.download_speed = stat::download_speed(pod);
            out.registry_url = Some(services.settings.dvcr.image_for(vi));
            cb.status(ConditionStatus::False)
                .reason(ReadyReason::Provisioning)
                .message("Import is in the process of provisioning to DVCR.");
            Ok(Requeue::Immediate)
        }
    }
}

/// Import into a claim: first into DVCR with an importer pod, then from
/// DVCR with a DataVolume
pub(crate) async fn store_to_volume(
    services: &Services,
    strategy: &dyn SourceStrategy,
    vi: &VirtualImage,
    out: &mut StatusFragment,
    launch: Result<Launch>,
) -> Result<Requeue> {
    let names = SupplementNames::for_image(vi);
    let pod = services.importer.get_pod(&names).await?;
    let dv = services.disk.get_data_volume(&names).await?;
    let pvc = services.disk.get_pvc(&names).await?;

    let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
    let (cb, out) = scope.split();

    match pod.as_ref() {
        _ if vi.is_provisioning_finished() => {
            set_finished_on_volume(cb, out, pvc.as_ref(), &names);
            services.disk.protect(owner_reference(vi), None, pvc.clone()).await?;
            if let Some(pod) = &pod {
                services.importer.unprotect(pod).await?;
            }
            services.disk.unprotect(dv).await?;
            clean_up_finished(strategy, vi).await
        }
        _ if is_terminating(pod.as_ref()) || is_terminating(dv.as_ref()) || is_terminating(pvc.as_ref()) => {
            debug!("helpers of a previous attempt are terminating");
            out.phase = Some(ImagePhase::Pending);
            Ok(Requeue::Immediate)
        }
        None => start_importer(services, vi, cb, out, launch?).await,
        Some(pod) if !stat::is_pod_complete(pod) => {
            if let Err(e) = stat::check_pod(pod) {
                return fail_from_pod(services, vi, cb, out, e).await;
            }
            services.importer.protect(pod).await?;

            out.phase = Some(ImagePhase::Provisioning);
            out.progress = stat::progress(Some(pod), vi.progress(), DVCR_STAGE);
            out.download_speed = stat::download_speed(pod);
            cb.status(ConditionStatus::False)
                .reason(ReadyReason::Provisioning)
                .message("Import is in the process of provisioning to DVCR.");
            Ok(Requeue::Immediate)
        }
        Some(pod) => import_from_dvcr(services, vi, cb, out, pod, dv.as_ref(), pvc.as_ref()).await,
    }
}

/// DataVolume stage of a volume import, once the DVCR stage is complete
///
/// `pod` is the completed pod that wrote the DVCR image.
pub(crate) async fn import_from_dvcr(
    services: &Services,
    vi: &VirtualImage,
    cb: &mut ConditionBuilder,
    out: &mut StatusFragment,
    pod: &Pod,
    dv: Option<&DataVolume>,
    pvc: Option<&PersistentVolumeClaim>,
) -> Result<Requeue> {
    let names = SupplementNames::for_image(vi);

    let Some(dv) = dv else {
        if let Err(e) = stat::check_pod(pod) {
            return fail_from_pod(services, vi, cb, out, e).await;
        }
        out.progress = Some("50.0%".to_string());
        out.download_speed = stat::download_speed(pod);

        let unpacked = stat::size(pod).unpacked_bytes;
        let required = unpacked.parse::<i64>().map_err(|e| {
            Error::internal_with_context("import", format!("unpacked size {unpacked:?} of the DVCR image: {e}"))
        })?;
        let size = match disk::get_validated_pvc_size(None, required) {
            Ok(size) => size,
            Err(e @ Error::InsufficientPvcSize { .. }) => {
                set_failed(cb, out, &e);
                return Ok(Requeue::None);
            }
            Err(e) => {
                set_failed(cb, out, &e);
                return Err(e);
            }
        };

        let class = match services.volume_storage_class(vi).await {
            Ok(class) => class,
            Err(e) => {
                set_from_storage_error(cb, out, e)?;
                return Ok(Requeue::None);
            }
        };
        let image = stat::dvcr_image_name(pod).unwrap_or_else(|| services.settings.dvcr.image_for(vi));
        let request = VolumeRequest {
            size,
            storage_class: Some(class.name_any()),
            source: dvcr_volume_source(services, &names, &image),
            owner: owner_reference(vi),
            names: names.clone(),
        };
        if let Err(e) = services.disk.start_immediate(request).await {
            return on_start_error(services, vi, cb, out, e)
                .await
                .map(Option::unwrap_or_default);
        }
        info!(dv = %names.data_volume(), source = %image, "data volume created");

        out.phase = Some(ImagePhase::Provisioning);
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("PVC Provisioner not found: create the new one.");
        return Ok(Requeue::Immediate);
    };

    if set_from_data_volume_conditions(cb, out, Some(dv)) {
        return Ok(Requeue::None);
    }

    let Some(pvc) = pvc else {
        out.phase = Some(ImagePhase::Provisioning);
        cb.status(ConditionStatus::False)
            .reason(ReadyReason::Provisioning)
            .message("PVC not found: waiting for creation.");
        return Ok(Requeue::Immediate);
    };

    let claim = dv
        .claim_name()
        .map(str::to_string)
        .unwrap_or_else(|| names.persistent_volume_claim().name);

    if disk::is_import_done(Some(dv), Some(pvc)) {
        services
            .publish(
                vi,
                EventType::Normal,
                reasons::SYNC_COMPLETED,
                actions::PROVISION,
                "The import to PVC has completed",
            )
            .await;
        out.phase = Some(ImagePhase::Ready);
        out.progress = Some("100%".to_string());
        out.size = Some(stat::size(pod));
        out.format = Some(stat::format(pod));
        out.cdrom = Some(stat::cdrom(pod));
        out.download_speed = stat::download_speed(pod);
        out.pvc_name = Some(claim);
        cb.status(ConditionStatus::True)
            .reason(ReadyReason::Ready)
            .message("");
        return Ok(Requeue::Immediate);
    }

    out.progress = disk::dv_progress(Some(dv), vi.progress(), VOLUME_STAGE);
    out.pvc_name = Some(claim);
    services
        .disk
        .protect(owner_reference(vi), Some(dv.clone()), Some(pvc.clone()))
        .await?;
    set_volume_provisioning(cb, out, Some(dv))?;
    Ok(Requeue::None)
}

/// Delete the importer pod, the DataVolume and the claim
pub(crate) async fn clean_up(services: &Services, vi: &VirtualImage) -> Result<bool> {
    let names = SupplementNames::for_image(vi);
    let importer = services.importer.clean_up(&names).await?;
    let disk = services.disk.clean_up(&names).await?;
    Ok(importer || disk)
}

/// Delete the importer pod and the DataVolume of a finished import
pub(crate) async fn clean_up_supplements(services: &Services, vi: &VirtualImage) -> Result<Requeue> {
    let names = SupplementNames::for_image(vi);
    let importer = services.importer.clean_up_supplements(&names).await?;
    let disk = services.disk.clean_up_supplements(&names).await?;
    Ok(Requeue::from(importer || disk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MockSourceStrategy;
    use crate::testing::{
        data_volume, failed_pod, http_image, on_pvc, pod_with_progress, pvc, running_pod, succeeded_pod,
        terminating, with_condition, Mocks,
    };
    use k8s_openapi::api::storage::v1::StorageClass;
    use kube::api::ObjectMeta;
    use virtimage_common::crd::DataVolumeCondition;
    use virtimage_common::error::api_error;

    fn launch() -> Result<Launch> {
        Ok(Launch::new(ImportSource::Http {
            url: "https://example.com/ubuntu.img".to_string(),
            md5: None,
            sha256: None,
        }))
    }

    fn idle_strategy() -> MockSourceStrategy {
        let mut strategy = MockSourceStrategy::new();
        strategy
            .expect_clean_up_supplements()
            .returning(|_| Ok(Requeue::None));
        strategy
    }

    fn ready_of(out: &StatusFragment) -> &ConditionBuilder {
        out.condition(ConditionType::Ready).expect("Ready written")
    }

    // =========================================================================
    // Registry Stories
    // =========================================================================

    /// Story: a new image gets its importer pod and reports Provisioning
    #[tokio::test]
    async fn new_image_starts_importer() {
        let mut mocks = Mocks::new();
        mocks.importer.expect_get_pod().returning(|_| Ok(None));
        mocks
            .importer
            .expect_start()
            .withf(|r| r.destination == format!("dvcr.local/vi/vms/ubuntu:{}", crate::testing::UID))
            .times(1)
            .returning(|_| Ok(()));
        let events = mocks.events.clone();
        let services = mocks.build();
        let vi = http_image();
        let mut out = StatusFragment::new();

        let requeue = store_to_registry(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(requeue, Requeue::Immediate);
        assert_eq!(out.phase, Some(ImagePhase::Provisioning));
        assert_eq!(out.progress.as_deref(), Some("0%"));
        assert_eq!(ready_of(&out).current_reason(), Some("Provisioning"));
        assert_eq!(events.reasons(), vec![reasons::SYNC_STARTED.to_string()]);
    }

    /// Story: a young image hitting a quota fails without retry
    #[tokio::test]
    async fn quota_on_start_fails_without_retry() {
        let mut mocks = Mocks::new();
        mocks.importer.expect_get_pod().returning(|_| Ok(None));
        mocks.importer.expect_start().returning(|_| {
            Err(api_error(403, "Forbidden", "pods \"importer\" is forbidden: exceeded quota: compute"))
        });
        let services = mocks.build();
        let vi = http_image();
        let mut out = StatusFragment::new();

        let requeue = store_to_registry(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("quota is absorbed");

        assert_eq!(requeue, Requeue::None);
        assert_eq!(out.phase, Some(ImagePhase::Failed));
        assert!(ready_of(&out)
            .current_message()
            .contains("Please configure quotas or try recreating the resource later."));
    }

    /// Story: an unclassified start failure is reported and returned
    #[tokio::test]
    async fn unexpected_start_error_is_returned() {
        let mut mocks = Mocks::new();
        mocks.importer.expect_get_pod().returning(|_| Ok(None));
        mocks
            .importer
            .expect_start()
            .returning(|_| Err(Error::internal("boom")));
        let services = mocks.build();
        let vi = http_image();
        let mut out = StatusFragment::new();

        let result = store_to_registry(&services, &idle_strategy(), &vi, &mut out, launch()).await;

        assert!(result.is_err());
        assert!(ready_of(&out).current_message().starts_with("Unexpected error"));
    }

    /// Story: a running pod is protected and reports its progress
    #[tokio::test]
    async fn running_pod_reports_progress() {
        let mut mocks = Mocks::new();
        mocks
            .importer
            .expect_get_pod()
            .returning(|_| Ok(Some(pod_with_progress("42.0%"))));
        mocks.importer.expect_protect().times(1).returning(|_| Ok(()));
        let services = mocks.build();
        let vi = http_image();
        let mut out = StatusFragment::new();

        store_to_registry(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(out.phase, Some(ImagePhase::Provisioning));
        assert_eq!(out.progress.as_deref(), Some("42.0%"));
        assert_eq!(
            ready_of(&out).current_message(),
            "Import is in the process of provisioning to DVCR."
        );
    }

    /// Story: a completed pod makes the image Ready with its statistics
    #[tokio::test]
    async fn completed_pod_makes_image_ready() {
        let mut mocks = Mocks::new();
        mocks
            .importer
            .expect_get_pod()
            .returning(|_| Ok(Some(succeeded_pod())));
        let services = mocks.build();
        let vi = http_image();
        let mut out = StatusFragment::new();

        let requeue = store_to_registry(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(requeue, Requeue::Immediate);
        assert_eq!(out.phase, Some(ImagePhase::Ready));
        assert_eq!(out.progress.as_deref(), Some("100%"));
        assert_eq!(out.format.as_deref(), Some("qcow2"));
        assert!(out.registry_url.is_some());
        assert_eq!(ready_of(&out).current_status(), ConditionStatus::True);
    }

    /// Story: a failed pod is a terminal failure of the attempt
    #[tokio::test]
    async fn failed_pod_fails_the_import() {
        let mut mocks = Mocks::new();
        mocks.importer.expect_get_pod().returning(|_| {
            Ok(Some(failed_pod(r#"{"error-message":"404 not found"}"#)))
        });
        let events = mocks.events.clone();
        let services = mocks.build();
        let vi = http_image();
        let mut out = StatusFragment::new();

        let requeue = store_to_registry(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("pod failure is absorbed");

        assert_eq!(requeue, Requeue::None);
        assert_eq!(out.phase, Some(ImagePhase::Failed));
        assert_eq!(ready_of(&out).current_reason(), Some("ProvisioningFailed"));
        assert!(ready_of(&out).current_message().ends_with('.'));
        assert_eq!(events.reasons(), vec![reasons::PROVISIONING_FAILED.to_string()]);
    }

    /// Story: a pod from a previous attempt must go away first
    #[tokio::test]
    async fn terminating_pod_waits() {
        let mut mocks = Mocks::new();
        mocks
            .importer
            .expect_get_pod()
            .returning(|_| Ok(Some(terminating(running_pod()))));
        mocks.importer.expect_start().never();
        let services = mocks.build();
        let vi = http_image();
        let mut out = StatusFragment::new();

        let requeue = store_to_registry(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(requeue, Requeue::Immediate);
        assert_eq!(out.phase, Some(ImagePhase::Pending));
    }

    /// Story: a finished image releases the pod and cleans up
    #[tokio::test]
    async fn finished_image_cleans_up() {
        let mut mocks = Mocks::new();
        mocks
            .importer
            .expect_get_pod()
            .returning(|_| Ok(Some(succeeded_pod())));
        mocks.importer.expect_unprotect().times(1).returning(|_| Ok(()));
        let services = mocks.build();
        let mut strategy = MockSourceStrategy::new();
        strategy
            .expect_clean_up_supplements()
            .times(1)
            .returning(|_| Ok(Requeue::Immediate));
        let vi = with_condition(http_image(), ConditionStatus::True, ReadyReason::Ready);
        let mut out = StatusFragment::new();

        let requeue = store_to_registry(&services, &strategy, &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(requeue, Requeue::Immediate);
        assert_eq!(out.phase, Some(ImagePhase::Ready));
    }

    // =========================================================================
    // Volume Stories
    // =========================================================================

    fn volume_mocks(pod: Option<Pod>, dv: Option<DataVolume>, claim: Option<PersistentVolumeClaim>) -> Mocks {
        let mut mocks = Mocks::new();
        mocks.importer.expect_get_pod().returning(move |_| Ok(pod.clone()));
        mocks.disk.expect_get_data_volume().returning(move |_| Ok(dv.clone()));
        mocks.disk.expect_get_pvc().returning(move |_| Ok(claim.clone()));
        mocks
    }

    /// Story: the DVCR stage reports half of the progress window
    #[tokio::test]
    async fn dvcr_stage_is_scaled_into_first_half() {
        let mut mocks = volume_mocks(Some(pod_with_progress("50.0%")), None, None);
        mocks.importer.expect_protect().returning(|_| Ok(()));
        let services = mocks.build();
        let vi = on_pvc(http_image());
        let mut out = StatusFragment::new();

        store_to_volume(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(out.progress.as_deref(), Some("25.0%"));
        assert_eq!(out.registry_url, None);
    }

    /// Story: a completed DVCR stage starts the DataVolume in the resolved class
    #[tokio::test]
    async fn completed_dvcr_stage_starts_data_volume() {
        let mut mocks = volume_mocks(Some(succeeded_pod()), None, None);
        mocks.with_class();
        mocks
            .disk
            .expect_start_immediate()
            .withf(|r| {
                r.storage_class.as_deref() == Some("linstor")
                    && r.size.0 == "2147483648"
                    && r.source
                        .registry
                        .as_ref()
                        .is_some_and(|s| s.url.starts_with("docker://dvcr.local/vi/vms/ubuntu"))
            })
            .times(1)
            .returning(|_| Ok(()));
        let services = mocks.build();
        let vi = on_pvc(http_image());
        let mut out = StatusFragment::new();

        let requeue = store_to_volume(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(requeue, Requeue::Immediate);
        assert_eq!(out.progress.as_deref(), Some("50.0%"));
        assert_eq!(
            ready_of(&out).current_message(),
            "PVC Provisioner not found: create the new one."
        );
    }

    /// Story: a missing storage profile fails the volume stage
    #[tokio::test]
    async fn missing_storage_profile_fails_volume_stage() {
        let mut mocks = volume_mocks(Some(succeeded_pod()), None, None);
        mocks.store.expect_get_storage_class().returning(|name| {
            Ok(Some(StorageClass {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }))
        });
        mocks.store.expect_get_storage_profile().returning(|_| Ok(None));
        mocks.disk.expect_start_immediate().never();
        let services = mocks.build();
        let vi = on_pvc(http_image());
        let mut out = StatusFragment::new();

        let requeue = store_to_volume(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("storage error is absorbed");

        assert_eq!(requeue, Requeue::None);
        assert_eq!(out.phase, Some(ImagePhase::Failed));
        assert!(ready_of(&out).current_message().starts_with("StorageProfile not found"));
    }

    /// Story: a quota condition on the DataVolume parks the image in Pending
    #[tokio::test]
    async fn data_volume_quota_condition_is_reported() {
        let mut dv = data_volume("ImportScheduled");
        if let Some(status) = dv.status.as_mut() {
            status.conditions.push(DataVolumeCondition {
                type_: "QuotaNotExceeded".to_string(),
                status: "False".to_string(),
                reason: "QuotaExceeded".to_string(),
                message: "exceeded quota: storage".to_string(),
            });
        }
        let services = volume_mocks(Some(succeeded_pod()), Some(dv), Some(pvc("Pending"))).build();
        let vi = on_pvc(http_image());
        let mut out = StatusFragment::new();

        let requeue = store_to_volume(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(requeue, Requeue::None);
        assert_eq!(out.phase, Some(ImagePhase::Pending));
        assert_eq!(ready_of(&out).current_reason(), Some("QuotaExceeded"));
        assert_eq!(ready_of(&out).current_message(), "exceeded quota: storage");
    }

    /// Story: a running DataVolume reports the second half of the window
    #[tokio::test]
    async fn running_data_volume_is_protected() {
        let mut mocks = volume_mocks(Some(succeeded_pod()), Some(data_volume("ImportInProgress")), Some(pvc("Bound")));
        mocks
            .disk
            .expect_protect()
            .withf(|_, dv, pvc| dv.is_some() && pvc.is_some())
            .times(1)
            .returning(|_, _, _| Ok(()));
        let services = mocks.build();
        let vi = on_pvc(http_image());
        let mut out = StatusFragment::new();

        store_to_volume(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(out.phase, Some(ImagePhase::Provisioning));
        assert_eq!(out.progress.as_deref(), Some("70.0%"));
        assert!(out.pvc_name.is_some());
    }

    /// Story: a succeeded DataVolume with a bound claim finishes the import
    #[tokio::test]
    async fn finished_data_volume_makes_image_ready() {
        let services =
            volume_mocks(Some(succeeded_pod()), Some(data_volume("Succeeded")), Some(pvc("Bound"))).build();
        let vi = on_pvc(http_image());
        let mut out = StatusFragment::new();

        let requeue = store_to_volume(&services, &idle_strategy(), &vi, &mut out, launch())
            .await
            .expect("sync");

        assert_eq!(requeue, Requeue::Immediate);
        assert_eq!(out.phase, Some(ImagePhase::Ready));
        assert_eq!(out.progress.as_deref(), Some("100%"));
        assert_eq!(
            out.pvc_name,
            Some(SupplementNames::for_image(&vi).persistent_volume_claim().name)
        );
    }

    #[test]
    fn dvcr_source_references_copied_credentials_only_when_configured() {
        let mut mocks = Mocks::new();
        mocks.settings.dvcr.auth_secret = Some("dvcr-auth".to_string());
        let services = mocks.build();
        let names = SupplementNames::for_image(&http_image());

        let source = dvcr_volume_source(&services, &names, "dvcr.local/vi/vms/ubuntu:1");
        let registry = source.registry.expect("registry source");
        assert_eq!(registry.url, "docker://dvcr.local/vi/vms/ubuntu:1");
        assert_eq!(registry.secret_ref, Some(names.get(Supplement::DvcrAuthSecretForDv).name));
        assert_eq!(registry.cert_config_map, None);
    }
}
