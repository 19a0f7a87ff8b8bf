//! Volume-import subsystem objects: DataVolume and StorageProfile

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DataVolume condition reporting whether the import pod runs
pub const DATA_VOLUME_RUNNING: &str = "Running";

/// DataVolume condition reporting whether the namespace quota allows the import
pub const DATA_VOLUME_QUOTA_NOT_EXCEEDED: &str = "QuotaNotExceeded";

/// Reason of the Running condition when the import image can't be pulled
pub const IMAGE_PULL_FAILED_REASON: &str = "ImagePullFailed";

/// DataVolume spec: what to import and into which claim
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    plural = "datavolumes",
    shortname = "dv",
    namespaced,
    status = "DataVolumeStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    /// Import source
    pub source: DataVolumeSource,
    /// Claim to create
    pub storage: DataVolumeStorage,
}

/// Import source of a DataVolume; exactly one field is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    /// Registry import (DVCR)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<DataVolumeRegistrySource>,
    /// Clone of an existing claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<DataVolumePvcSource>,
}

/// Registry import source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeRegistrySource {
    /// `docker://` image URL
    pub url: String,
    /// Secret with registry auth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    /// ConfigMap with the registry CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

/// Claim clone source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumePvcSource {
    /// Source claim namespace
    pub namespace: String,
    /// Source claim name
    pub name: String,
}

/// Claim parameters of a DataVolume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStorage {
    /// Storage class; the cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Access modes; resolved from the StorageProfile when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,
    /// Volume mode; resolved from the StorageProfile when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    /// Resource requests, `storage` in particular
    #[serde(default)]
    pub resources: DataVolumeResources,
}

/// Resource requests of a DataVolume claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeResources {
    /// Requested quantities
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
}

/// DataVolume status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    /// Import phase, `Succeeded` once done
    #[serde(default)]
    pub phase: String,
    /// Import progress, e.g. `37.50%`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    /// Name of the created claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
    /// DataVolume conditions
    #[serde(default)]
    pub conditions: Vec<DataVolumeCondition>,
}

/// DataVolume condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl DataVolume {
    /// Condition of the given type
    pub fn condition(&self, type_: &str) -> Option<&DataVolumeCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
    }

    /// Whether the import reported success
    pub fn is_succeeded(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.phase == "Succeeded")
    }

    /// Name of the claim backing this DataVolume
    pub fn claim_name(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.claim_name.as_deref())
    }
}

// =============================================================================
// StorageProfile
// =============================================================================

/// StorageProfile spec; the profile is named after its StorageClass
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "StorageProfile",
    plural = "storageprofiles",
    status = "StorageProfileStatus"
)]
pub struct StorageProfileSpec {}

/// StorageProfile status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageProfileStatus {
    /// Storage class the profile describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Supported access/volume mode combinations
    #[serde(default)]
    pub claim_property_sets: Vec<ClaimPropertySet>,
}

/// Supported access/volume mode combination
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimPropertySet {
    /// Access modes
    #[serde(default)]
    pub access_modes: Vec<String>,
    /// Volume mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
}

impl StorageProfile {
    /// Whether the class supports Block volumes with ReadWriteMany access
    pub fn supports_block_rwx(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.claim_property_sets.iter().any(|set| {
                set.volume_mode.as_deref() == Some("Block")
                    && set.access_modes.iter().any(|m| m == "ReadWriteMany")
            })
        })
    }

    /// First claim property set, used when a claim leaves modes unset
    pub fn default_modes(&self) -> Option<&ClaimPropertySet> {
        self.status
            .as_ref()
            .and_then(|s| s.claim_property_sets.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(sets: Vec<ClaimPropertySet>) -> StorageProfile {
        let mut sp = StorageProfile::new("linstor", StorageProfileSpec {});
        sp.status = Some(StorageProfileStatus {
            storage_class: Some("linstor".to_string()),
            claim_property_sets: sets,
        });
        sp
    }

    #[test]
    fn block_rwx_support_requires_both_modes_in_one_set() {
        let sp = profile(vec![
            ClaimPropertySet {
                access_modes: vec!["ReadWriteOnce".to_string()],
                volume_mode: Some("Block".to_string()),
            },
            ClaimPropertySet {
                access_modes: vec!["ReadWriteMany".to_string()],
                volume_mode: Some("Filesystem".to_string()),
            },
        ]);
        assert!(!sp.supports_block_rwx());

        let sp = profile(vec![ClaimPropertySet {
            access_modes: vec!["ReadWriteMany".to_string()],
            volume_mode: Some("Block".to_string()),
        }]);
        assert!(sp.supports_block_rwx());
    }

    #[test]
    fn data_volume_status_accessors() {
        let mut dv = DataVolume::new("d8v-vi-img-uid", DataVolumeSpec::default());
        assert!(!dv.is_succeeded());
        dv.status = Some(DataVolumeStatus {
            phase: "Succeeded".to_string(),
            claim_name: Some("d8v-vi-img-uid".to_string()),
            conditions: vec![DataVolumeCondition {
                type_: DATA_VOLUME_RUNNING.to_string(),
                status: "False".to_string(),
                reason: "Completed".to_string(),
                message: String::new(),
            }],
            ..Default::default()
        });
        assert!(dv.is_succeeded());
        assert_eq!(dv.claim_name(), Some("d8v-vi-img-uid"));
        assert_eq!(
            dv.condition(DATA_VOLUME_RUNNING).map(|c| c.reason.as_str()),
            Some("Completed")
        );
    }
}
