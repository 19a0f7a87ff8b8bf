//! Condition model for VirtualImage status
//!
//! Every condition axis has exactly one record in `status.conditions`. Records
//! are never edited in place: a [`ConditionBuilder`] describes the complete
//! record, stamped with the generation it was computed for, and [`set`]
//! replaces whatever was there before.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition record
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition axis (e.g. Ready, DatasourceReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the resource this condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Whether the condition is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

// =============================================================================
// Condition axes and reasons
// =============================================================================

/// Named condition axes on a VirtualImage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionType {
    /// Overall import readiness, mirrors the phase
    Ready,
    /// The chosen data source can be consumed
    DatasourceReady,
    /// The storage class for volume-backed images is resolved and usable
    StorageClassReady,
    /// The image is referenced by machines or by images/disks provisioning from it
    InUse,
}

impl ConditionType {
    /// Wire name of the axis
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::DatasourceReady => "DatasourceReady",
            Self::StorageClassReady => "StorageClassReady",
            Self::InUse => "InUse",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reason drawn from the closed enumeration of one condition axis
pub trait ConditionReason: Copy + fmt::Debug {
    /// Axis this reason belongs to
    const TYPE: ConditionType;

    /// Wire value of the reason
    fn as_str(&self) -> &'static str;
}

macro_rules! condition_reasons {
    ($(#[$meta:meta])* $name:ident for $axis:ident { $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every reason of this axis
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl ConditionReason for $name {
            const TYPE: ConditionType = ConditionType::$axis;

            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

condition_reasons! {
    /// Reasons of the Ready condition
    ReadyReason for Ready {
        /// Helper objects are being created or are running
        Provisioning => "Provisioning",
        /// The helper pod could not start
        ProvisioningNotStarted => "ProvisioningNotStarted",
        /// The import failed within this attempt
        ProvisioningFailed => "ProvisioningFailed",
        /// Uploader is ready and waits for the user
        WaitForUserUpload => "WaitForUserUpload",
        /// Import finished
        Ready => "Ready",
        /// Backing volume claim disappeared after import
        Lost => "Lost",
        /// Backing registry blob disappeared after import
        ImageLost => "ImageLost",
        /// Volume-import object reports an exhausted quota
        QuotaExceeded => "QuotaExceeded",
        /// Volume-import object failed to pull its image
        ImagePullFailed => "ImagePullFailed",
        /// Storage class is not resolved yet
        StorageClassNotReady => "StorageClassNotReady",
    }
}

condition_reasons! {
    /// Reasons of the DatasourceReady condition
    DatasourceReadyReason for DatasourceReady {
        /// Source is consumable
        DatasourceReady => "DatasourceReady",
        /// Pull secret of a registry source is missing
        ContainerRegistrySecretNotFound => "ContainerRegistrySecretNotFound",
        /// Referenced VirtualImage is not Ready
        ImageNotReady => "ImageNotReady",
        /// Referenced ClusterVirtualImage is not Ready
        ClusterImageNotReady => "ClusterImageNotReady",
        /// Referenced VirtualDisk is not Ready
        VirtualDiskNotReady => "VirtualDiskNotReady",
        /// Referenced VirtualDisk can't be read right now
        VirtualDiskNotReadyForUse => "VirtualDiskNotReadyForUse",
        /// Referenced VirtualDisk is attached to a running machine
        VirtualDiskAttachedToVirtualMachine => "VirtualDiskAttachedToVirtualMachine",
        /// Referenced VirtualDiskSnapshot is not ready
        VirtualDiskSnapshotNotReady => "VirtualDiskSnapshotNotReady",
    }
}

condition_reasons! {
    /// Reasons of the StorageClassReady condition
    StorageClassReadyReason for StorageClassReady {
        /// Storage class exists and supports images on volumes
        StorageClassReady => "StorageClassReady",
        /// Storage class (or a default one) does not exist
        StorageClassNotFound => "StorageClassNotFound",
        /// Storage class lacks block/RWX support
        StorageClassNotReady => "StorageClassNotReady",
        /// Storage class is rejected by the module policy
        StorageClassNotAllowed => "StorageClassNotAllowed",
    }
}

condition_reasons! {
    /// Reasons of the InUse condition
    InUseReason for InUse {
        /// Image has consumers
        InUse => "InUse",
        /// Ready was computed for an older generation
        ReadyConditionStale => "ReadyConditionStale",
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Complete description of one condition record
///
/// A builder that never received a reason is not written by [`set`]; callers
/// always describe status, reason and message together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionBuilder {
    type_: ConditionType,
    status: ConditionStatus,
    reason: Option<&'static str>,
    message: String,
    generation: i64,
}

impl ConditionBuilder {
    /// Start a builder for the given axis
    pub fn new(type_: ConditionType) -> Self {
        Self {
            type_,
            status: ConditionStatus::Unknown,
            reason: None,
            message: String::new(),
            generation: 0,
        }
    }

    /// Stamp the generation the condition is computed for
    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    /// Set the status
    pub fn status(&mut self, status: ConditionStatus) -> &mut Self {
        self.status = status;
        self
    }

    /// Set the reason; it must belong to this builder's axis
    pub fn reason<R: ConditionReason>(&mut self, reason: R) -> &mut Self {
        debug_assert_eq!(R::TYPE, self.type_, "reason {reason:?} used on {}", self.type_);
        self.reason = Some(reason.as_str());
        self
    }

    /// Set the message
    pub fn message(&mut self, message: impl Into<String>) -> &mut Self {
        self.message = message.into();
        self
    }

    /// Axis of this builder
    pub fn condition_type(&self) -> ConditionType {
        self.type_
    }

    /// Current status
    pub fn current_status(&self) -> ConditionStatus {
        self.status
    }

    /// Current reason, if any was set
    pub fn current_reason(&self) -> Option<&'static str> {
        self.reason
    }

    /// Current message
    pub fn current_message(&self) -> &str {
        &self.message
    }

    /// Stamped generation
    pub fn current_generation(&self) -> i64 {
        self.generation
    }

    /// Whether a reason was set and the builder will be written
    pub fn is_set(&self) -> bool {
        self.reason.is_some()
    }

    /// Render the record, keeping the transition time when the status didn't change
    pub fn build(&self, previous: Option<&Condition>) -> Option<Condition> {
        let reason = self.reason?;
        let last_transition_time = previous
            .filter(|p| p.status == self.status)
            .map(|p| p.last_transition_time)
            .unwrap_or_else(Utc::now);

        Some(Condition {
            type_: self.type_.as_str().to_string(),
            status: self.status,
            reason: reason.to_string(),
            message: self.message.clone(),
            observed_generation: Some(self.generation),
            last_transition_time,
        })
    }
}

// =============================================================================
// Operations on a condition list
// =============================================================================

/// Find the record of an axis
pub fn get(type_: ConditionType, conditions: &[Condition]) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

/// Apply a builder, replacing any record of the same axis
pub fn set(cb: &ConditionBuilder, conditions: &mut Vec<Condition>) {
    let type_ = cb.condition_type().as_str();
    let position = conditions.iter().position(|c| c.type_ == type_);
    let Some(condition) = cb.build(position.map(|i| &conditions[i])) else {
        return;
    };

    match position {
        Some(i) => conditions[i] = condition,
        None => conditions.push(condition),
    }
}

/// Drop the record of an axis
pub fn remove(type_: ConditionType, conditions: &mut Vec<Condition>) {
    conditions.retain(|c| c.type_ != type_.as_str());
}

/// Whether the condition was computed for the given generation
pub fn is_last_updated(condition: &Condition, generation: i64) -> bool {
    condition.observed_generation == Some(generation)
}
