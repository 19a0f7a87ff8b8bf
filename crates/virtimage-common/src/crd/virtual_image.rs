//! VirtualImage Custom Resource Definition
//!
//! A VirtualImage describes a disk image to import from an HTTP URL, a
//! container registry, a user upload or another cluster object, and where to
//! keep it: in the DVCR registry or on a block-mode volume claim.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{self, Condition, ConditionType};

/// Kind name used in owner and block-device references
pub const VIRTUAL_IMAGE_KIND: &str = "VirtualImage";

/// Specification for a VirtualImage
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualImage",
    plural = "virtualimages",
    shortname = "vi",
    namespaced,
    status = "VirtualImageStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"CDROM","type":"boolean","jsonPath":".status.cdrom"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.progress"}"#,
    printcolumn = r#"{"name":"StoredSize","type":"string","jsonPath":".status.size.stored","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualImageSpec {
    /// Where the imported data is kept
    pub storage: StorageKind,

    /// Volume settings for `PersistentVolumeClaim` storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<VirtualImagePersistentVolumeClaim>,

    /// Origin of the image data
    pub data_source: ImageDataSource,
}

/// Storage destination of an image
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Image is kept as a blob in the DVCR registry
    #[default]
    ContainerRegistry,
    /// Image is kept on a block-mode volume claim
    PersistentVolumeClaim,
    /// Deprecated alias of `PersistentVolumeClaim`
    Kubernetes,
}

impl StorageKind {
    /// Whether the image lives on a volume claim
    pub fn is_volume(&self) -> bool {
        matches!(self, Self::PersistentVolumeClaim | Self::Kubernetes)
    }
}

/// Volume settings of a volume-backed image
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualImagePersistentVolumeClaim {
    /// StorageClass requested by the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Data source descriptor
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageDataSource {
    /// Which of the locators below applies
    #[serde(rename = "type")]
    pub type_: DataSourceType,

    /// HTTP locator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSource>,

    /// Container registry locator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<ContainerImageSource>,

    /// Reference to another cluster object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ImageObjectRef>,
}

/// Data source kinds
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DataSourceType {
    /// Download from a URL
    #[serde(rename = "HTTP")]
    Http,
    /// Pull from a container registry
    ContainerImage,
    /// Copy from another image, disk or disk snapshot
    ObjectRef,
    /// Wait for the user to upload the data
    Upload,
}

/// HTTP data source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpSource {
    /// URL of the image file
    pub url: String,

    /// Expected checksums of the downloaded file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,

    /// Base64-encoded CA bundle for the server certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// File checksums
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Checksum {
    /// MD5 hex digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// SHA-256 hex digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Container registry data source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImageSource {
    /// Image reference, e.g. `registry.example.com/images/alpine:3.20`
    pub image: String,

    /// Pull secret in the image's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<ImagePullSecretName>,

    /// Base64-encoded CA bundle for the registry certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// Name of an image pull secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ImagePullSecretName {
    /// Secret name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Reference to the object an image is copied from
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ImageObjectRef {
    /// Kind of the referenced object
    pub kind: ObjectRefKind,
    /// Name of the referenced object; namespaced kinds live in the image's namespace
    pub name: String,
}

/// Kinds an image can be copied from
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ObjectRefKind {
    /// Another VirtualImage in the same namespace
    VirtualImage,
    /// A cluster-wide image
    ClusterVirtualImage,
    /// A VirtualDisk in the same namespace
    VirtualDisk,
    /// A VirtualDiskSnapshot in the same namespace
    VirtualDiskSnapshot,
}

impl ObjectRefKind {
    /// Kind name as written in the spec
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VirtualImage => "VirtualImage",
            Self::ClusterVirtualImage => "ClusterVirtualImage",
            Self::VirtualDisk => "VirtualDisk",
            Self::VirtualDiskSnapshot => "VirtualDiskSnapshot",
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle phase of a VirtualImage
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImagePhase {
    /// Waiting for the data source or storage class
    #[default]
    Pending,
    /// Uploader is ready and waits for user data
    WaitForUserUpload,
    /// Import is running
    Provisioning,
    /// Import finished
    Ready,
    /// Import failed
    Failed,
    /// Deletion requested
    Terminating,
    /// Registry blob vanished after import
    #[serde(rename = "Lost")]
    ImageLost,
    /// Volume claim vanished after import
    #[serde(rename = "PVCLost")]
    PvcLost,
}

impl std::fmt::Display for ImagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::WaitForUserUpload => write!(f, "WaitForUserUpload"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
            Self::ImageLost => write!(f, "Lost"),
            Self::PvcLost => write!(f, "PVCLost"),
        }
    }
}

/// Status of a VirtualImage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualImageStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ImagePhase,

    /// One record per condition axis
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Import progress, e.g. `45.5%`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,

    /// Download speed reported by the importer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<DownloadSpeed>,

    /// Stored and unpacked sizes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<ImageSize>,

    /// Detected image format (qcow2, raw, iso, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Whether the image is a CD-ROM image
    #[serde(default)]
    pub cdrom: bool,

    /// Resolved storage class of a volume-backed image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// UID of the upstream object the data was copied from
    #[serde(
        default,
        rename = "sourceUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_uid: Option<String>,

    /// Where the imported data lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ImageTarget>,

    /// Upload endpoints for the Upload data source
    #[serde(
        default,
        rename = "imageUploadURLs",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_upload_urls: Option<ImageUploadUrls>,

    /// Generation the status was last computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Download speed of the importer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSpeed {
    /// Humanized average speed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg: Option<String>,
    /// Average speed in bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_bytes: Option<String>,
    /// Humanized current speed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    /// Current speed in bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_bytes: Option<String>,
}

/// Sizes of an imported image
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSize {
    /// Humanized stored size
    #[serde(default)]
    pub stored: String,
    /// Stored size in bytes
    #[serde(default)]
    pub stored_bytes: String,
    /// Humanized unpacked size
    #[serde(default)]
    pub unpacked: String,
    /// Unpacked size in bytes
    #[serde(default)]
    pub unpacked_bytes: String,
}

/// Location of the imported data: a registry URL or a claim name, never both
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageTarget {
    /// Registry image of a registry-backed image
    #[serde(
        default,
        rename = "registryURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub registry_url: Option<String>,

    /// Claim name of a volume-backed image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

/// Upload endpoints
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageUploadUrls {
    /// URL reachable from outside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    /// URL reachable from inside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_cluster: Option<String>,
}

// =============================================================================
// Convenience accessors
// =============================================================================

impl VirtualImage {
    /// Generation of the object, zero when unset
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// UID of the object, empty when unset
    pub fn uid_or_default(&self) -> String {
        self.uid().unwrap_or_default()
    }

    /// Namespace of the object, empty when unset
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    /// Status conditions, empty when there is no status
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Condition record of an axis
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        conditions::get(type_, self.conditions())
    }

    /// Current phase, Pending when there is no status
    pub fn phase(&self) -> ImagePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Previously reported progress
    pub fn progress(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.progress.as_deref())
    }

    /// Resolved storage class from status
    pub fn status_storage_class(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Whether the image is being deleted
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the Ready condition reports a finished import
    ///
    /// A lost image counts as finished: its helpers are gone and the import
    /// is never restarted without a spec change.
    pub fn is_provisioning_finished(&self) -> bool {
        use crate::conditions::{ConditionReason, ReadyReason};

        self.condition(ConditionType::Ready).is_some_and(|c| {
            [ReadyReason::Ready, ReadyReason::Lost, ReadyReason::ImageLost]
                .iter()
                .any(|r| c.reason == r.as_str())
        })
    }

    /// Whether helper objects are kept after the import finished
    pub fn retains_supplements(&self) -> bool {
        self.annotations()
            .get(crate::ANN_RETAIN_AFTER_COMPLETION)
            .is_some_and(|v| v == "true")
    }

    /// Requested storage class from the spec
    pub fn spec_storage_class(&self) -> Option<&str> {
        self.spec
            .persistent_volume_claim
            .as_ref()
            .and_then(|p| p.storage_class_name.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Whether the spec changed since the status was last computed
    pub fn is_spec_changed(&self) -> bool {
        self.status.as_ref().and_then(|s| s.observed_generation) != Some(self.generation())
    }

    /// Whether this image is still being provisioned from the named image
    pub fn provisions_from_image(&self, image: &str) -> bool {
        self.phase() != ImagePhase::Ready
            && self.spec.data_source.type_ == DataSourceType::ObjectRef
            && self
                .spec
                .data_source
                .object_ref
                .as_ref()
                .is_some_and(|r| r.kind == ObjectRefKind::VirtualImage && r.name == image)
    }

    /// DVCR image reference for this image in the given registry
    pub fn registry_image(&self, registry: &str) -> String {
        format!(
            "{}/vi/{}/{}:{}",
            registry.trim_end_matches('/'),
            self.namespace_or_default(),
            self.name_any(),
            self.uid_or_default()
        )
    }
}
