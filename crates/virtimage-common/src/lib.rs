//! Common types for the VirtualImage operator: CRDs, conditions, helper naming and errors

#![warn(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod events;
pub mod format;
pub mod supplements;
pub mod telemetry;

pub use error::{DataSourceError, Error, PodError, StorageError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the virtualization resources
pub const API_GROUP: &str = "virtualization.deckhouse.io";

/// Full apiVersion of the VirtualImage resource
pub const API_VERSION: &str = "virtualization.deckhouse.io/v1alpha2";

/// Field manager name used for server-side patches
pub const FIELD_MANAGER: &str = "virtimage-controller";

/// Value of `app.kubernetes.io/managed-by` on every helper object
pub const MANAGED_BY: &str = "virtimage-controller";

/// Finalizer gating deletion of a VirtualImage until helpers are cleaned up
pub const IMAGE_CLEANUP_FINALIZER: &str = "virtualization.deckhouse.io/vi-cleanup";

/// Finalizer protecting helper pods while an import is in flight
pub const POD_PROTECTION_FINALIZER: &str = "virtualization.deckhouse.io/pod-protection";

/// Finalizer protecting volume claims and volume-import objects
pub const PVC_PROTECTION_FINALIZER: &str = "virtualization.deckhouse.io/pvc-protection";

/// Annotation that keeps helper objects after a successful import
pub const ANN_RETAIN_AFTER_COMPLETION: &str = "virtualization.deckhouse.io/retain-pod-after-completion";

/// Annotation carrying importer/uploader progress as a percentage
pub const ANN_PROGRESS: &str = "virtualization.deckhouse.io/progress";

/// Annotation on the uploader Ingress with the externally reachable upload URL
pub const ANN_UPLOAD_URL: &str = "virtualization.deckhouse.io/upload.url";

/// Annotation on the uploader Ingress with the upload path
pub const ANN_UPLOAD_PATH: &str = "virtualization.deckhouse.io/upload.path";

/// Annotation on a VolumeSnapshot with the original claim's storage class
pub const ANN_STORAGE_CLASS_NAME: &str = "virtualization.deckhouse.io/storage-class-name";

/// Annotation on a VolumeSnapshot with the original claim's volume mode
pub const ANN_VOLUME_MODE: &str = "virtualization.deckhouse.io/volume-mode";

/// Annotation on a VolumeSnapshot with the original claim's access modes
pub const ANN_ACCESS_MODES: &str = "virtualization.deckhouse.io/access-modes";

/// Label set on helper objects with the owning image name
pub const IMAGE_NAME_LABEL: &str = "virtualization.deckhouse.io/virtual-image";
