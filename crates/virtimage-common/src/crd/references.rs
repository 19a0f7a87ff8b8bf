//! Read-only views of the virtualization kinds a VirtualImage depends on
//!
//! Only the fields the image reconciler reads are modeled; everything else
//! in these objects is ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::virtual_image::{DataSourceType, ImageSize, ImageTarget, ObjectRefKind};
use crate::conditions::Condition;

/// Phase string every referenced kind uses once its data is usable
pub const REF_PHASE_READY: &str = "Ready";

// =============================================================================
// VirtualDisk
// =============================================================================

/// VirtualDisk spec (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualDisk",
    plural = "virtualdisks",
    shortname = "vd",
    namespaced,
    status = "VirtualDiskStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSpec {
    /// Origin of the disk data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<DiskDataSource>,

    /// Volume settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<VirtualDiskPersistentVolumeClaim>,
}

/// Data source of a disk or of an image being provisioned from this image
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskDataSource {
    /// Data source kind
    #[serde(rename = "type")]
    pub type_: DataSourceType,

    /// Referenced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<DiskObjectRef>,
}

/// Object reference of a disk data source
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DiskObjectRef {
    /// Referenced kind
    pub kind: String,
    /// Referenced name
    pub name: String,
}

/// Volume settings of a disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskPersistentVolumeClaim {
    /// Requested size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Requested storage class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// VirtualDisk status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskStatus {
    /// Disk phase
    #[serde(default)]
    pub phase: String,
    /// Provisioned capacity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    /// Backing claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<VirtualDiskTarget>,
    /// Conditions, including InUse
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Backing claim of a disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskTarget {
    /// Claim name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

impl VirtualDisk {
    /// Whether the disk reports phase Ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == REF_PHASE_READY)
    }

    /// Name of the backing claim
    pub fn pvc_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.target.as_ref())
            .and_then(|t| t.persistent_volume_claim_name.as_deref())
    }

    /// Whether the disk is being provisioned from the given image
    pub fn provisions_from_image(&self, image: &str) -> bool {
        !self.is_ready() && references_image(self.spec.data_source.as_ref(), image)
    }
}

fn references_image(source: Option<&DiskDataSource>, image: &str) -> bool {
    source.is_some_and(|ds| {
        ds.type_ == DataSourceType::ObjectRef
            && ds
                .object_ref
                .as_ref()
                .is_some_and(|r| r.kind == ObjectRefKind::VirtualImage.as_str() && r.name == image)
    })
}

// =============================================================================
// VirtualDiskSnapshot
// =============================================================================

/// VirtualDiskSnapshot spec (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualDiskSnapshot",
    plural = "virtualdisksnapshots",
    shortname = "vdsnapshot",
    namespaced,
    status = "VirtualDiskSnapshotStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSnapshotSpec {
    /// Disk the snapshot was taken of
    #[serde(default)]
    pub virtual_disk_name: String,
}

/// VirtualDiskSnapshot status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSnapshotStatus {
    /// Snapshot phase
    #[serde(default)]
    pub phase: String,
    /// Backing VolumeSnapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

impl VirtualDiskSnapshot {
    /// Whether the snapshot reports phase Ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == REF_PHASE_READY)
    }

    /// Name of the backing VolumeSnapshot
    pub fn volume_snapshot_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.volume_snapshot_name.as_deref())
            .filter(|s| !s.is_empty())
    }
}

// =============================================================================
// ClusterVirtualImage
// =============================================================================

/// ClusterVirtualImage spec (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "ClusterVirtualImage",
    plural = "clustervirtualimages",
    shortname = "cvi",
    status = "ClusterVirtualImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVirtualImageSpec {
    /// Origin of the image data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<ClusterVirtualImageDataSource>,
}

/// Data source of a cluster image
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVirtualImageDataSource {
    /// Data source kind
    #[serde(rename = "type")]
    pub type_: DataSourceType,
    /// Referenced object, with an explicit namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ClusterImageObjectRef>,
}

/// Namespaced object reference of a cluster image
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ClusterImageObjectRef {
    /// Referenced kind
    pub kind: String,
    /// Referenced name
    pub name: String,
    /// Referenced namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

/// ClusterVirtualImage status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVirtualImageStatus {
    /// Image phase
    #[serde(default)]
    pub phase: String,
    /// Stored and unpacked sizes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<ImageSize>,
    /// Image format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// CD-ROM flag
    #[serde(default)]
    pub cdrom: bool,
    /// Registry location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ImageTarget>,
}

impl ClusterVirtualImage {
    /// Whether the image reports phase Ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == REF_PHASE_READY)
    }

    /// Whether this cluster image is being provisioned from `namespace/image`
    pub fn provisions_from_image(&self, namespace: &str, image: &str) -> bool {
        if self.is_ready() {
            return false;
        }
        self.spec
            .data_source
            .as_ref()
            .filter(|ds| ds.type_ == DataSourceType::ObjectRef)
            .and_then(|ds| ds.object_ref.as_ref())
            .is_some_and(|r| {
                r.kind == ObjectRefKind::VirtualImage.as_str()
                    && r.name == image
                    && r.namespace.as_deref() == Some(namespace)
            })
    }
}

// =============================================================================
// VirtualMachine
// =============================================================================

/// VirtualMachine spec; not read by the image reconciler
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus"
)]
pub struct VirtualMachineSpec {}

/// VirtualMachine status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Block devices attached to the machine
    #[serde(default)]
    pub block_device_refs: Vec<BlockDeviceRef>,
}

/// Block device attached to a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BlockDeviceRef {
    /// Kind of the device source
    pub kind: String,
    /// Name of the device source
    pub name: String,
}

impl VirtualMachine {
    /// Whether the machine has the given image attached
    pub fn uses_image(&self, image: &str) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.block_device_refs
                .iter()
                .any(|bd| bd.kind == ObjectRefKind::VirtualImage.as_str() && bd.name == image)
        })
    }
}
