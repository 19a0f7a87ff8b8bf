//! Error types for the VirtualImage operator
//!
//! Errors are split into the classified families the reconciler absorbs into
//! status conditions (pod, storage and data-source errors) and the
//! unclassified ones that escape a handler and trigger a framework retry.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Substring the API server puts into ResourceQuota admission failures
const QUOTA_EXCEEDED_MARKER: &str = "exceeded quota:";

/// Main error type for VirtualImage operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a VirtualImage spec
    #[error("validation error for {image}: {message}")]
    Validation {
        /// Name of the image with invalid configuration
        image: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.dataSource.http")
        field: Option<String>,
    },

    /// Helper pod failure classified from its conditions or termination report
    #[error(transparent)]
    Pod(#[from] PodError),

    /// Storage class, storage profile or volume-import failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The referenced data source is not consumable yet
    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    /// Requested volume is smaller than the unpacked image
    #[error("the specified pvc size is insufficient: {requested} < {required}")]
    InsufficientPvcSize {
        /// Requested size as written in the spec
        requested: String,
        /// Unpacked image size in bytes
        required: i64,
    },

    /// Registry probe failure
    #[error("registry error for {image}: {message}")]
    Registry {
        /// Registry image reference
        image: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "importer", "reconciler")
        context: String,
    },
}

/// Failure classes of an importer, uploader or bounder pod
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PodError {
    /// PodInitialized is False
    #[error("provisioning Pod {pod} is not initialized: {message}")]
    NotInitialized {
        /// `namespace/name` of the pod
        pod: String,
        /// Message of the PodInitialized condition
        message: String,
    },

    /// PodScheduled is False
    #[error("provisioning Pod {pod} is not scheduled: {message}")]
    NotScheduled {
        /// `namespace/name` of the pod
        pod: String,
        /// Message of the PodScheduled condition
        message: String,
    },

    /// The pod reported an error or ended in the Failed phase
    #[error("provisioning failed: Pod {pod} {detail}")]
    ProvisioningFailed {
        /// `namespace/name` of the pod
        pod: String,
        /// Either `failed` or `termination message: <msg>`
        detail: String,
    },
}

impl PodError {
    /// Whether the pod has not started yet and may still recover
    pub fn is_not_started(&self) -> bool {
        matches!(self, Self::NotInitialized { .. } | Self::NotScheduled { .. })
    }

    /// Condition message of a pod that has not started
    pub fn message(&self) -> &str {
        match self {
            Self::NotInitialized { message, .. } | Self::NotScheduled { message, .. } => message,
            Self::ProvisioningFailed { detail, .. } => detail,
        }
    }
}

/// Storage resolution and volume-import failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No StorageProfile exists for the resolved class
    #[error("storage profile not found")]
    StorageProfileNotFound,

    /// The named StorageClass does not exist
    #[error("storage class {0:?} not found")]
    StorageClassNotFound(String),

    /// No class was requested and the cluster has no default
    #[error("default storage class not found")]
    DefaultStorageClassNotFound,

    /// The class is rejected by the module storage-class policy
    #[error("storage class {0:?} is not allowed")]
    StorageClassNotAllowed(String),

    /// The volume-import object reports a failing Running condition
    #[error("pvc importer is not running: {0}")]
    DataVolumeNotRunning(String),
}

/// Named precondition failures of a data source
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataSourceError {
    /// The image pull secret of a container-registry source is missing
    #[error("container registry secret {0:?} not found")]
    SecretNotFound(String),

    /// Referenced VirtualImage is not Ready
    #[error("VirtualImage {0:?} not ready")]
    ImageNotReady(String),

    /// Referenced ClusterVirtualImage is not Ready
    #[error("ClusterVirtualImage {0:?} not ready")]
    ClusterImageNotReady(String),

    /// Referenced VirtualDisk is not Ready
    #[error("VirtualDisk {0:?} not ready")]
    VirtualDiskNotReady(String),

    /// Referenced VirtualDisk is Ready but its InUse condition forbids reading it
    #[error("the VirtualDisk {0:?} not ready for use")]
    VirtualDiskNotReadyForUse(String),

    /// Referenced VirtualDisk is attached to a running VirtualMachine
    #[error("the VirtualDisk {0:?} attached to VirtualMachine")]
    VirtualDiskAttachedToVirtualMachine(String),

    /// Referenced VirtualDiskSnapshot or its VolumeSnapshot is not ready
    #[error("VirtualDiskSnapshot {0:?} not ready")]
    VirtualDiskSnapshotNotReady(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            image: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with image context
    pub fn validation_for(image: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            image: image.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with image context and field path
    pub fn validation_for_field(
        image: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            image: image.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a registry error
    pub fn registry(image: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registry {
            image: image.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the API server rejected a create because a ResourceQuota is exhausted
    pub fn is_quota_exceeded(&self) -> bool {
        self.to_string().contains(QUOTA_EXCEEDED_MARKER)
    }

    /// Whether this is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Whether this is a 409 AlreadyExists from the API server
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// Whether this is a 409 Conflict on a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason == "Conflict"
        )
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and classified data-source errors need a
    /// spec or dependency change; Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Pod(e) => e.is_not_started(),
            Error::Storage(_) => true,
            Error::DataSource(_) => true,
            Error::InsufficientPvcSize { .. } => false,
            Error::Registry { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the image name if this error is associated with a specific image
    pub fn image(&self) -> Option<&str> {
        match self {
            Error::Validation { image, .. } => Some(image),
            Error::Registry { image, .. } => Some(image),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Kubernetes API error with the given code, reason and message
///
/// Used by callers that need to classify API failures the same way the API
/// server reports them.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.to_string(),
            code,
        }),
    }
}
