//! Ready condition and phase writers shared by steps and strategies
//!
//! Every classified failure ends up here so pipeline steps and hand-written
//! strategies report the same reasons and messages.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use virtimage_common::conditions::{ConditionBuilder, ConditionReason, ConditionStatus, ConditionType, ReadyReason};
use virtimage_common::crd::{
    DataVolume, ImagePhase, VirtualImage, DATA_VOLUME_QUOTA_NOT_EXCEEDED, DATA_VOLUME_RUNNING,
    IMAGE_PULL_FAILED_REASON,
};
use virtimage_common::format::capitalize_first_letter;
use virtimage_common::supplements::SupplementNames;
use virtimage_common::{Error, Result, StorageError};

use crate::requeue::Requeue;
use crate::services::disk;
use crate::status::StatusFragment;

/// How long after creation a quota failure is reported without retrying
pub const QUOTA_GRACE: Duration = Duration::from_secs(30 * 60);

/// Retry delay of a quota failure after the grace window
pub const QUOTA_RETRY: Duration = Duration::from_secs(60);

fn with_period(err: &impl std::fmt::Display) -> String {
    capitalize_first_letter(&format!("{err}."))
}

fn api_message(err: &Error) -> String {
    match err {
        Error::Kube {
            source: kube::Error::Api(ae),
        } => ae.message.clone(),
        other => other.to_string(),
    }
}

/// Report a quota rejection
///
/// Young images get a hint to fix quotas and no retry; older ones retry
/// every minute.
pub fn set_quota_exceeded(cb: &mut ConditionBuilder, out: &mut StatusFragment, err: &Error, vi: &VirtualImage) -> Requeue {
    let age = vi
        .creation_timestamp()
        .and_then(|created| (Utc::now() - created.0).to_std().ok())
        .unwrap_or_default();

    out.phase = Some(ImagePhase::Failed);
    cb.status(ConditionStatus::False)
        .reason(ReadyReason::ProvisioningFailed);

    let message = api_message(err);
    if age < QUOTA_GRACE {
        cb.message(format!(
            "Quota exceeded: {message}; Please configure quotas or try recreating the resource later."
        ));
        Requeue::None
    } else {
        cb.message(format!("Quota exceeded: {message}; Retry in 1 minute."));
        Requeue::after(QUOTA_RETRY)
    }
}

/// Report a failure that needs a spec change
pub fn set_failed(cb: &mut ConditionBuilder, out: &mut StatusFragment, err: impl std::fmt::Display) {
    out.phase = Some(ImagePhase::Failed);
    cb.status(ConditionStatus::False)
        .reason(ReadyReason::ProvisioningFailed)
        .message(capitalize_first_letter(&err.to_string()));
}

/// Report a failure nothing classified
pub fn set_unexpected(cb: &mut ConditionBuilder, out: &mut StatusFragment, err: &Error) {
    set_failed(cb, out, format_args!("unexpected error: {err}"));
}

/// Report a classified pod failure, returning any other error
pub fn set_from_pod_error(cb: &mut ConditionBuilder, out: &mut StatusFragment, err: Error) -> Result<()> {
    let Error::Pod(pod_err) = &err else {
        return Err(err);
    };

    out.phase = Some(ImagePhase::Failed);
    let reason = if pod_err.is_not_started() {
        ReadyReason::ProvisioningNotStarted
    } else {
        ReadyReason::ProvisioningFailed
    };
    cb.status(ConditionStatus::False)
        .reason(reason)
        .message(with_period(pod_err));
    Ok(())
}

/// Report a storage class or profile failure, returning any other error
pub fn set_from_storage_error(cb: &mut ConditionBuilder, out: &mut StatusFragment, err: Error) -> Result<()> {
    let Error::Storage(storage_err) = &err else {
        return Err(err);
    };

    let (phase, message) = match storage_err {
        StorageError::StorageProfileNotFound => (
            ImagePhase::Failed,
            "StorageProfile not found in the cluster: Please check a StorageClass name in the cluster or set a default StorageClass.",
        ),
        StorageError::DefaultStorageClassNotFound => (
            ImagePhase::Pending,
            "Default StorageClass not found in the cluster: please provide a StorageClass name or set a default StorageClass.",
        ),
        StorageError::StorageClassNotFound(_) => {
            (ImagePhase::Pending, "Provided StorageClass not found in the cluster.")
        }
        StorageError::StorageClassNotAllowed(_) => (
            ImagePhase::Pending,
            "Specified StorageClass is not allowed: please change provided StorageClass name or check the module settings.",
        ),
        StorageError::DataVolumeNotRunning(_) => return Err(err),
    };

    out.phase = Some(phase);
    cb.status(ConditionStatus::False)
        .reason(ReadyReason::ProvisioningFailed)
        .message(message);
    Ok(())
}

/// Report a finished registry import
///
/// A reported image loss is kept: only the presence check clears it.
pub fn set_finished_in_registry(cb: &mut ConditionBuilder, out: &mut StatusFragment, vi: &VirtualImage) {
    let lost = vi
        .condition(ConditionType::Ready)
        .is_some_and(|c| c.reason == ReadyReason::ImageLost.as_str());
    if lost {
        return;
    }
    out.phase = Some(ImagePhase::Ready);
    cb.status(ConditionStatus::True)
        .reason(ReadyReason::Ready)
        .message("");
}

/// Report a finished volume import from the state of its claim
pub fn set_finished_on_volume(
    cb: &mut ConditionBuilder,
    out: &mut StatusFragment,
    pvc: Option<&PersistentVolumeClaim>,
    names: &SupplementNames,
) {
    let claim = names.persistent_volume_claim();
    match pvc {
        None => {
            out.phase = Some(ImagePhase::PvcLost);
            cb.status(ConditionStatus::False)
                .reason(ReadyReason::Lost)
                .message(format!("PVC {claim} not found."));
        }
        Some(pvc) if disk::is_lost(pvc) => {
            out.phase = Some(ImagePhase::PvcLost);
            cb.status(ConditionStatus::False)
                .reason(ReadyReason::Lost)
                .message(format!("PVC {claim} is lost."));
        }
        Some(_) => {
            out.phase = Some(ImagePhase::Ready);
            cb.status(ConditionStatus::True)
                .reason(ReadyReason::Ready)
                .message("");
        }
    }
}

/// Report a running volume import, absorbing an erroring import pod
pub fn set_volume_provisioning(cb: &mut ConditionBuilder, out: &mut StatusFragment, dv: Option<&DataVolume>) -> Result<()> {
    out.phase = Some(ImagePhase::Provisioning);
    cb.status(ConditionStatus::False)
        .reason(ReadyReason::Provisioning);

    let Some(dv) = dv else {
        cb.message("Waiting for the pvc importer to be created");
        return Ok(());
    };

    match disk::check_import_process(Some(dv)) {
        Ok(()) => {
            cb.message("Import is in the process of provisioning to PVC.");
            Ok(())
        }
        Err(Error::Storage(e @ StorageError::DataVolumeNotRunning(_))) => {
            cb.reason(ReadyReason::ProvisioningFailed)
                .message(with_period(&e));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Absorb DataVolume conditions that block the import
///
/// Returns true when the Ready condition was written.
pub fn set_from_data_volume_conditions(cb: &mut ConditionBuilder, out: &mut StatusFragment, dv: Option<&DataVolume>) -> bool {
    let Some(dv) = dv else {
        return false;
    };

    if let Some(quota) = dv.condition(DATA_VOLUME_QUOTA_NOT_EXCEEDED) {
        if quota.status == "False" {
            out.phase = Some(ImagePhase::Pending);
            cb.status(ConditionStatus::False)
                .reason(ReadyReason::QuotaExceeded)
                .message(quota.message.clone());
            return true;
        }
    }

    if let Some(running) = dv.condition(DATA_VOLUME_RUNNING) {
        if running.status != "True" && running.reason == IMAGE_PULL_FAILED_REASON {
            out.phase = Some(ImagePhase::Pending);
            cb.status(ConditionStatus::False)
                .reason(ReadyReason::ImagePullFailed)
                .message(running.message.clone());
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{http_image, pvc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use virtimage_common::conditions::ConditionType;
    use virtimage_common::crd::{DataVolumeCondition, DataVolumeSpec, DataVolumeStatus};
    use virtimage_common::error::api_error;
    use virtimage_common::PodError;

    fn ready() -> ConditionBuilder {
        ConditionBuilder::new(ConditionType::Ready).generation(1)
    }

    fn quota_error() -> Error {
        api_error(
            403,
            "Forbidden",
            "pods \"importer\" is forbidden: exceeded quota: compute, requested: cpu=1",
        )
    }

    fn data_volume(conditions: Vec<DataVolumeCondition>) -> DataVolume {
        let mut dv = DataVolume::new("d8v-vi-ubuntu", DataVolumeSpec::default());
        dv.status = Some(DataVolumeStatus {
            phase: "ImportInProgress".to_string(),
            conditions,
            ..Default::default()
        });
        dv
    }

    fn dv_condition(type_: &str, status: &str, reason: &str, message: &str) -> DataVolumeCondition {
        DataVolumeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    // =========================================================================
    // Quota backoff
    // =========================================================================

    mod quota {
        use super::*;

        /// Story: a fresh image hitting a quota waits for the operator
        ///
        /// Retrying right after creation only spams the API server, so the
        /// first 30 minutes report the failure without a requeue.
        #[test]
        fn story_young_image_does_not_retry() {
            let vi = http_image();
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let requeue = set_quota_exceeded(&mut cb, &mut out, &quota_error(), &vi);

            assert_eq!(requeue, Requeue::None);
            assert_eq!(out.phase, Some(ImagePhase::Failed));
            assert_eq!(cb.current_reason(), Some("ProvisioningFailed"));
            assert!(cb.current_message().starts_with("Quota exceeded: pods"));
            assert!(cb.current_message().ends_with("Please configure quotas or try recreating the resource later."));
        }

        #[test]
        fn old_image_retries_every_minute() {
            let mut vi = http_image();
            vi.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::hours(1)));
            let mut cb = ready();
            let mut out = StatusFragment::new();

            let requeue = set_quota_exceeded(&mut cb, &mut out, &quota_error(), &vi);

            assert_eq!(requeue, Requeue::after(QUOTA_RETRY));
            assert!(cb.current_message().ends_with("; Retry in 1 minute."));
        }
    }

    // =========================================================================
    // Error classification
    // =========================================================================

    #[test]
    fn unscheduled_pod_is_not_started() {
        let mut cb = ready();
        let mut out = StatusFragment::new();
        let err = PodError::NotScheduled {
            pod: "vms/importer".to_string(),
            message: "0/3 nodes are available".to_string(),
        };

        set_from_pod_error(&mut cb, &mut out, err.into()).expect("classified");

        assert_eq!(out.phase, Some(ImagePhase::Failed));
        assert_eq!(cb.current_reason(), Some("ProvisioningNotStarted"));
        assert_eq!(
            cb.current_message(),
            "Provisioning Pod vms/importer is not scheduled: 0/3 nodes are available."
        );
    }

    #[test]
    fn failed_pod_is_provisioning_failed() {
        let mut cb = ready();
        let mut out = StatusFragment::new();
        let err = PodError::ProvisioningFailed {
            pod: "vms/importer".to_string(),
            detail: "failed".to_string(),
        };

        set_from_pod_error(&mut cb, &mut out, err.into()).expect("classified");
        assert_eq!(cb.current_reason(), Some("ProvisioningFailed"));
        assert_eq!(cb.current_message(), "Provisioning failed: Pod vms/importer failed.");
    }

    #[test]
    fn unclassified_errors_are_returned() {
        let mut cb = ready();
        let mut out = StatusFragment::new();
        assert!(set_from_pod_error(&mut cb, &mut out, Error::internal("boom")).is_err());
        assert!(set_from_storage_error(&mut cb, &mut out, Error::internal("boom")).is_err());
        assert!(!cb.is_set());
        assert_eq!(out.phase, None);
    }

    #[rstest::rstest]
    #[case(StorageError::StorageProfileNotFound, ImagePhase::Failed, "StorageProfile not found")]
    #[case(StorageError::DefaultStorageClassNotFound, ImagePhase::Pending, "Default StorageClass not found")]
    #[case(StorageError::StorageClassNotFound("fast".into()), ImagePhase::Pending, "Provided StorageClass not found")]
    #[case(StorageError::StorageClassNotAllowed("fast".into()), ImagePhase::Pending, "Specified StorageClass is not allowed")]
    fn storage_errors_have_distinct_messages(
        #[case] err: StorageError,
        #[case] phase: ImagePhase,
        #[case] prefix: &str,
    ) {
        let mut cb = ready();
        let mut out = StatusFragment::new();
        set_from_storage_error(&mut cb, &mut out, err.into()).expect("classified");
        assert_eq!(out.phase, Some(phase));
        assert!(cb.current_message().starts_with(prefix), "{}", cb.current_message());
    }

    // =========================================================================
    // Volume outcomes
    // =========================================================================

    #[rstest::rstest]
    #[case(None, ImagePhase::PvcLost, "not found.")]
    #[case(Some(pvc("Lost")), ImagePhase::PvcLost, "is lost.")]
    #[case(Some(pvc("Bound")), ImagePhase::Ready, "")]
    fn finished_volume_follows_claim(
        #[case] claim: Option<PersistentVolumeClaim>,
        #[case] phase: ImagePhase,
        #[case] suffix: &str,
    ) {
        let names = SupplementNames::for_image(&http_image());
        let mut cb = ready();
        let mut out = StatusFragment::new();
        set_finished_on_volume(&mut cb, &mut out, claim.as_ref(), &names);
        assert_eq!(out.phase, Some(phase));
        assert!(cb.current_message().ends_with(suffix));
    }

    #[test]
    fn erroring_import_pod_is_reported_as_failed_provisioning() {
        let dv = data_volume(vec![dv_condition(
            DATA_VOLUME_RUNNING,
            "False",
            "Error",
            "Unable to connect to http data source",
        )]);
        let mut cb = ready();
        let mut out = StatusFragment::new();

        set_volume_provisioning(&mut cb, &mut out, Some(&dv)).expect("absorbed");

        assert_eq!(out.phase, Some(ImagePhase::Provisioning));
        assert_eq!(cb.current_reason(), Some("ProvisioningFailed"));
        assert_eq!(
            cb.current_message(),
            "Pvc importer is not running: Unable to connect to http data source."
        );
    }

    #[test]
    fn missing_data_volume_waits_for_importer() {
        let mut cb = ready();
        let mut out = StatusFragment::new();
        set_volume_provisioning(&mut cb, &mut out, None).expect("ok");
        assert_eq!(cb.current_message(), "Waiting for the pvc importer to be created");
    }

    /// Story: a volume import blocked by a quota goes back to Pending
    ///
    /// The DataVolume keeps retrying on its own, so the image only mirrors
    /// the DataVolume's message.
    #[test]
    fn story_data_volume_quota_is_copied() {
        let dv = data_volume(vec![dv_condition(
            DATA_VOLUME_QUOTA_NOT_EXCEEDED,
            "False",
            "QuotaExceeded",
            "exceeded quota: storage",
        )]);
        let mut cb = ready();
        let mut out = StatusFragment::new();

        assert!(set_from_data_volume_conditions(&mut cb, &mut out, Some(&dv)));
        assert_eq!(out.phase, Some(ImagePhase::Pending));
        assert_eq!(cb.current_reason(), Some("QuotaExceeded"));
        assert_eq!(cb.current_message(), "exceeded quota: storage");
    }

    #[test]
    fn image_pull_failure_goes_back_to_pending() {
        let dv = data_volume(vec![dv_condition(
            DATA_VOLUME_RUNNING,
            "False",
            IMAGE_PULL_FAILED_REASON,
            "back-off pulling image",
        )]);
        let mut cb = ready();
        let mut out = StatusFragment::new();

        assert!(set_from_data_volume_conditions(&mut cb, &mut out, Some(&dv)));
        assert_eq!(out.phase, Some(ImagePhase::Pending));
        assert_eq!(cb.current_reason(), Some("ImagePullFailed"));
    }

    #[test]
    fn healthy_data_volume_writes_nothing() {
        let dv = data_volume(vec![dv_condition(DATA_VOLUME_RUNNING, "True", "", "")]);
        let mut cb = ready();
        let mut out = StatusFragment::new();
        assert!(!set_from_data_volume_conditions(&mut cb, &mut out, Some(&dv)));
        assert!(!cb.is_set());
    }
}
