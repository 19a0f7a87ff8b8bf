//! Read-only facts derived from importer and uploader pods
//!
//! Helper pods report progress through an annotation while running and
//! write a JSON final report into their termination message when done.

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::warn;

use virtimage_common::crd::{DownloadSpeed, ImageSize};
use virtimage_common::format::{humanize_bytes, parse_percent, scale_percentage};
use virtimage_common::{Error, PodError, Result, ANN_PROGRESS, ANN_UPLOAD_URL};

/// Env var holding the DVCR image an importer writes to
pub const IMPORTER_DESTINATION_ENV: &str = "IMPORTER_DESTINATION_ENDPOINT";

/// Env var holding the DVCR image an uploader writes to
pub const UPLOADER_DESTINATION_ENV: &str = "UPLOADER_DESTINATION_ENDPOINT";

/// Format reported for CD-ROM images
const ISO_FORMAT: &str = "iso";

/// Final report an importer or uploader writes into its termination message
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FinalReport {
    /// Bytes stored in DVCR
    #[serde(rename = "source-image-size", default)]
    pub stored_size_bytes: u64,
    /// Bytes of the unpacked image
    #[serde(rename = "source-image-virtual-size", default)]
    pub unpacked_size_bytes: u64,
    /// Detected image format
    #[serde(rename = "source-image-format", default)]
    pub format: String,
    /// Error of a failed import
    #[serde(rename = "error-message", default)]
    pub error_message: String,
    /// Average transfer speed in bytes per second
    #[serde(rename = "average-speed", default)]
    pub average_speed: u64,
    /// Last transfer speed in bytes per second
    #[serde(rename = "current-speed", default)]
    pub current_speed: u64,
}

/// Window a 0-100% progress is scaled into
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressWindow {
    low: f64,
    high: f64,
}

impl ProgressWindow {
    /// The whole 0-100% range
    pub const FULL: ProgressWindow = ProgressWindow::new(0.0, 100.0);

    /// Window from `low` to `high` percent
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Scale a 0-100% progress into this window
    pub fn scale(&self, progress: &str) -> String {
        scale_percentage(progress, self.low, self.high)
    }

    fn end(&self) -> String {
        self.scale("100%")
    }
}

fn pod_ref(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Parse the final report from the first terminated container
pub fn final_report(pod: &Pod) -> Result<Option<FinalReport>> {
    let message = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses.iter().find_map(|cs| {
                cs.state
                    .as_ref()
                    .and_then(|st| st.terminated.as_ref())
                    .and_then(|t| t.message.as_deref())
            })
        })
        .filter(|m| !m.trim().is_empty());

    let Some(message) = message else {
        return Ok(None);
    };

    serde_json::from_str(message)
        .map(Some)
        .map_err(|e| Error::serialization_for_kind("Pod", format!("final report of {}: {e}", pod_ref(pod))))
}

fn report_or_log(pod: &Pod) -> Option<FinalReport> {
    match final_report(pod) {
        Ok(report) => report,
        Err(e) => {
            warn!(pod = %pod_ref(pod), error = %e, "cannot read final report");
            None
        }
    }
}

/// Classify pod failures
///
/// Checks run in order: initialization, scheduling, the final report
/// error, then the Failed phase.
pub fn check_pod(pod: &Pod) -> Result<()> {
    let false_condition = |type_: &str| {
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.type_ == type_ && c.status == "False"))
            .map(|c| c.message.clone().unwrap_or_default())
    };

    if let Some(message) = false_condition("Initialized") {
        return Err(PodError::NotInitialized {
            pod: pod_ref(pod),
            message,
        }
        .into());
    }
    if let Some(message) = false_condition("PodScheduled") {
        return Err(PodError::NotScheduled {
            pod: pod_ref(pod),
            message,
        }
        .into());
    }

    if let Some(report) = final_report(pod)? {
        if !report.error_message.is_empty() {
            return Err(PodError::ProvisioningFailed {
                pod: pod_ref(pod),
                detail: format!("termination message: {}", report.error_message),
            }
            .into());
        }
    }

    if phase(pod) == Some("Failed") {
        return Err(PodError::ProvisioningFailed {
            pod: pod_ref(pod),
            detail: "failed".to_string(),
        }
        .into());
    }

    Ok(())
}

/// Whether the pod ran to completion, successfully or not
pub fn is_pod_complete(pod: &Pod) -> bool {
    matches!(phase(pod), Some("Succeeded") | Some("Failed"))
}

/// Whether the pod is running
pub fn is_pod_running(pod: &Pod) -> bool {
    phase(pod) == Some("Running")
}

/// Current progress, scaled into `window`
///
/// A missing pod keeps the previous value; a Succeeded pod without an
/// error report is at the end of the window.
pub fn progress(pod: Option<&Pod>, previous: Option<&str>, window: ProgressWindow) -> Option<String> {
    let Some(pod) = pod else {
        return previous.map(str::to_string);
    };

    if phase(pod) == Some("Succeeded") {
        let failed = report_or_log(pod).is_some_and(|r| !r.error_message.is_empty());
        if !failed {
            return Some(window.end());
        }
    }

    match pod.annotations().get(ANN_PROGRESS) {
        Some(progress) if parse_percent(progress).is_some() => Some(window.scale(progress)),
        _ => previous.map(str::to_string),
    }
}

/// Stored and unpacked sizes from the final report
pub fn size(pod: &Pod) -> ImageSize {
    match report_or_log(pod) {
        Some(report) => ImageSize {
            stored: humanize_bytes(report.stored_size_bytes),
            stored_bytes: report.stored_size_bytes.to_string(),
            unpacked: humanize_bytes(report.unpacked_size_bytes),
            unpacked_bytes: report.unpacked_size_bytes.to_string(),
        },
        None => ImageSize::default(),
    }
}

/// Image format from the final report
pub fn format(pod: &Pod) -> String {
    report_or_log(pod).map(|r| r.format).unwrap_or_default()
}

/// Whether the image is a CD-ROM image
pub fn cdrom(pod: &Pod) -> bool {
    format(pod) == ISO_FORMAT
}

/// Transfer speeds from the final report
pub fn download_speed(pod: &Pod) -> Option<DownloadSpeed> {
    let report = report_or_log(pod)?;
    Some(DownloadSpeed {
        avg: Some(format!("{}/s", humanize_bytes(report.average_speed))),
        avg_bytes: Some(report.average_speed.to_string()),
        current: Some(format!("{}/s", humanize_bytes(report.current_speed))),
        current_bytes: Some(report.current_speed.to_string()),
    })
}

/// DVCR image the importer or uploader writes to
pub fn dvcr_image_name(pod: &Pod) -> Option<String> {
    pod.spec.as_ref()?.containers.iter().find_map(|c| {
        c.env.as_ref()?.iter().find_map(|e| {
            (e.name == IMPORTER_DESTINATION_ENV || e.name == UPLOADER_DESTINATION_ENV)
                .then(|| e.value.clone())
                .flatten()
        })
    })
}

/// Whether the user started uploading
pub fn is_upload_started(pod: &Pod) -> bool {
    pod.annotations()
        .get(ANN_PROGRESS)
        .and_then(|p| parse_percent(p))
        .is_some_and(|p| p > 0.0)
}

/// Whether the uploader can accept data
pub fn is_uploader_ready(pod: Option<&Pod>, svc: Option<&Service>, ing: Option<&Ingress>) -> bool {
    let (Some(pod), Some(_), Some(ing)) = (pod, svc, ing) else {
        return false;
    };
    is_pod_running(pod) && ing.annotations().contains_key(ANN_UPLOAD_URL)
}
