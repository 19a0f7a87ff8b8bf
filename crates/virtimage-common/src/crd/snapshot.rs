//! CSI VolumeSnapshot (subset)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of VolumeSnapshot, used as a claim dataSource
pub const VOLUME_SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

/// Kind of VolumeSnapshot, used as a claim dataSource
pub const VOLUME_SNAPSHOT_KIND: &str = "VolumeSnapshot";

/// VolumeSnapshot spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    namespaced,
    status = "VolumeSnapshotStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// What was snapshotted
    #[serde(default)]
    pub source: VolumeSnapshotSource,
    /// Snapshot class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Snapshot source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    /// Claim that was snapshotted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

/// VolumeSnapshot status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Whether the snapshot can be restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Minimum size of a restored claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
}

impl VolumeSnapshot {
    /// Whether the snapshot reports readyToUse
    pub fn is_ready_to_use(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Restore size, if reported
    pub fn restore_size(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.restore_size.as_deref())
    }
}
