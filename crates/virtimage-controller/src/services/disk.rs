//! Volume side of an import: DataVolumes and the claims they fill
//!
//! A volume-backed image is written by a DataVolume that imports from DVCR
//! (or clones another claim) into a block-mode, ReadWriteMany claim. The
//! claim outlives the DataVolume: once the import is done the DataVolume is
//! deleted and the claim is re-owned by the image.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use virtimage_common::crd::{
    DataVolume, DataVolumeResources, DataVolumeSource, DataVolumeSpec, DataVolumeStorage,
    DATA_VOLUME_RUNNING,
};
use virtimage_common::format::parse_quantity;
use virtimage_common::supplements::{Supplement, SupplementNames};
use virtimage_common::{Error, Result, StorageError, FIELD_MANAGER, PVC_PROTECTION_FINALIZER};

use super::importer::copy_secret;
use super::objects::{
    add_finalizer, create_if_missing, delete_if_exists, get_supplement, helper_meta,
    release_and_delete, remove_finalizer,
};
use super::stat::ProgressWindow;
use crate::settings::ControllerSettings;

/// Annotation asking the volume-import subsystem to bind the claim immediately
pub const ANN_BIND_IMMEDIATE: &str = "cdi.kubevirt.io/storage.bind.immediate.requested";

const CA_BUNDLE_KEY: &str = "ca.crt";

/// Everything needed to start a DataVolume
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeRequest {
    /// Claim size
    pub size: Quantity,
    /// Storage class; the cluster default when unset
    pub storage_class: Option<String>,
    /// Import source
    pub source: DataVolumeSource,
    /// Owner of the DataVolume
    pub owner: OwnerReference,
    /// Helper names of the owner
    pub names: SupplementNames,
}

/// Build the DataVolume of a request
pub fn build_data_volume(request: &VolumeRequest) -> DataVolume {
    let name = request.names.data_volume();
    let mut dv = DataVolume::new(
        &name.name,
        DataVolumeSpec {
            source: request.source.clone(),
            storage: DataVolumeStorage {
                storage_class_name: request.storage_class.clone(),
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                volume_mode: Some("Block".to_string()),
                resources: DataVolumeResources {
                    requests: [("storage".to_string(), request.size.clone())].into_iter().collect(),
                },
            },
        },
    );
    dv.metadata = helper_meta(&name.name, &name.namespace, &request.owner);
    dv.metadata.annotations = Some(
        [(ANN_BIND_IMMEDIATE.to_string(), "true".to_string())]
            .into_iter()
            .collect(),
    );
    dv
}

/// Fail when the DataVolume reports an erroring import pod
pub fn check_import_process(dv: Option<&DataVolume>) -> Result<()> {
    let Some(running) = dv.and_then(|dv| dv.condition(DATA_VOLUME_RUNNING)) else {
        return Ok(());
    };
    if running.status == "False" && running.reason.contains("Error") {
        return Err(StorageError::DataVolumeNotRunning(running.message.clone()).into());
    }
    Ok(())
}

/// Whether the DataVolume succeeded and its claim is bound
pub fn is_import_done(dv: Option<&DataVolume>, pvc: Option<&PersistentVolumeClaim>) -> bool {
    dv.is_some_and(|dv| dv.is_succeeded()) && pvc.is_some_and(is_bound)
}

/// Whether the claim is bound
pub fn is_bound(pvc: &PersistentVolumeClaim) -> bool {
    claim_phase(pvc) == Some("Bound")
}

/// Whether the claim lost its volume
pub fn is_lost(pvc: &PersistentVolumeClaim) -> bool {
    claim_phase(pvc) == Some("Lost")
}

fn claim_phase(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// DataVolume progress scaled into `window`, or the previous value
pub fn dv_progress(dv: Option<&DataVolume>, previous: Option<&str>, window: ProgressWindow) -> Option<String> {
    let progress = dv
        .and_then(|dv| dv.status.as_ref())
        .and_then(|s| s.progress.as_deref())
        .filter(|p| !p.is_empty() && *p != "N/A");
    match progress {
        Some(p) => Some(window.scale(p)),
        None => previous.map(str::to_string),
    }
}

/// Capacity of a claim
pub fn capacity(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .map(|q| q.0.clone())
}

/// Claim size covering `required` bytes, honoring an explicit request
///
/// An explicit request smaller than `required` is rejected.
pub fn get_validated_pvc_size(requested: Option<&Quantity>, required: i64) -> Result<Quantity> {
    if required <= 0 {
        return Err(Error::internal_with_context(
            "disk",
            "got zero size from data source, please report a bug",
        ));
    }

    let Some(requested) = requested else {
        return Ok(Quantity(required.to_string()));
    };
    let requested_bytes = parse_quantity(&requested.0)
        .ok_or_else(|| Error::validation(format!("invalid pvc size {:?}", requested.0)))?;
    if requested_bytes == 0 {
        return Err(Error::validation("cannot create disk with zero pvc size"));
    }

    if requested_bytes < required {
        let mut shown = requested_bytes.to_string();
        if shown != requested.0 {
            shown.push_str(&format!(" ({})", requested.0));
        }
        return Err(Error::InsufficientPvcSize {
            requested: shown,
            required,
        });
    }
    if requested_bytes > required {
        return Ok(requested.clone());
    }
    Ok(Quantity(required.to_string()))
}

/// DataVolume and claim lifecycle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiskService: Send + Sync {
    /// Create the DataVolume with immediate binding, plus the DVCR secrets it reads with
    async fn start_immediate(&self, request: VolumeRequest) -> Result<()>;

    /// Fetch the DataVolume
    async fn get_data_volume(&self, names: &SupplementNames) -> Result<Option<DataVolume>>;

    /// Fetch the claim
    async fn get_pvc(&self, names: &SupplementNames) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a claim; an existing one is kept
    async fn create_pvc(&self, pvc: PersistentVolumeClaim) -> Result<()>;

    /// Own the claim and protect both objects while the import runs
    async fn protect(
        &self,
        owner: OwnerReference,
        dv: Option<DataVolume>,
        pvc: Option<PersistentVolumeClaim>,
    ) -> Result<()>;

    /// Release the DataVolume
    async fn unprotect(&self, dv: Option<DataVolume>) -> Result<()>;

    /// Delete the DataVolume, its helpers and the claim
    async fn clean_up(&self, names: &SupplementNames) -> Result<bool>;

    /// Delete the DataVolume and its helpers, keeping the claim
    async fn clean_up_supplements(&self, names: &SupplementNames) -> Result<bool>;
}

/// Kubernetes-backed disk service
pub struct DiskServiceImpl {
    client: Client,
    settings: ControllerSettings,
}

impl DiskServiceImpl {
    /// Create a new disk service
    pub fn new(client: Client, settings: ControllerSettings) -> Self {
        Self { client, settings }
    }

    fn dvs(&self, namespace: &str) -> Api<DataVolume> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// DVCR credentials and CA next to the DataVolume
    async fn ensure_dvcr_supplements(&self, request: &VolumeRequest) -> Result<()> {
        let dvcr = &self.settings.dvcr;
        if let Some(auth) = &dvcr.auth_secret {
            copy_secret(
                &self.client,
                auth,
                dvcr.auth_namespace(&self.settings.namespace),
                &request.names.get(Supplement::DvcrAuthSecretForDv),
                &request.owner,
            )
            .await?;
        }

        if let Some(cert) = &dvcr.cert_secret {
            let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.settings.namespace);
            let ca = secrets
                .get_opt(cert)
                .await?
                .and_then(|s| s.data)
                .and_then(|d| d.get(CA_BUNDLE_KEY).cloned())
                .map(|b| String::from_utf8_lossy(&b.0).into_owned());
            if let Some(ca) = ca {
                let name = request.names.get(Supplement::DvcrCaBundleForDv);
                let cm = ConfigMap {
                    metadata: helper_meta(&name.name, &name.namespace, &request.owner),
                    data: Some(BTreeMap::from([(CA_BUNDLE_KEY.to_string(), ca)])),
                    ..Default::default()
                };
                create_if_missing(&Api::namespaced(self.client.clone(), &name.namespace), &cm).await?;
            }
        }
        Ok(())
    }

    async fn patch_owner_references(&self, pvc: &PersistentVolumeClaim, refs: Vec<OwnerReference>) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "ownerReferences": refs } });
        self.pvcs(&pvc.namespace().unwrap_or_default())
            .patch(&pvc.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DiskService for DiskServiceImpl {
    async fn start_immediate(&self, request: VolumeRequest) -> Result<()> {
        let dv = build_data_volume(&request);
        info!(dv = %request.names.data_volume(), size = %request.size.0, "creating data volume");
        create_if_missing(&self.dvs(request.names.namespace()), &dv).await?;

        if request.source.registry.is_some() {
            self.ensure_dvcr_supplements(&request).await?;
        }
        Ok(())
    }

    async fn get_data_volume(&self, names: &SupplementNames) -> Result<Option<DataVolume>> {
        get_supplement(|ns| self.dvs(ns), names, Supplement::DataVolume).await
    }

    async fn get_pvc(&self, names: &SupplementNames) -> Result<Option<PersistentVolumeClaim>> {
        get_supplement(|ns| self.pvcs(ns), names, Supplement::PersistentVolumeClaim).await
    }

    async fn create_pvc(&self, pvc: PersistentVolumeClaim) -> Result<()> {
        create_if_missing(&self.pvcs(&pvc.namespace().unwrap_or_default()), &pvc).await
    }

    async fn protect(
        &self,
        owner: OwnerReference,
        dv: Option<DataVolume>,
        pvc: Option<PersistentVolumeClaim>,
    ) -> Result<()> {
        if let Some(pvc) = &pvc {
            let mut refs = pvc.owner_references().to_vec();
            if !refs.iter().any(|r| r.uid == owner.uid) {
                refs.push(OwnerReference {
                    controller: None,
                    ..owner
                });
                self.patch_owner_references(pvc, refs).await?;
            }
            add_finalizer(
                &self.pvcs(&pvc.namespace().unwrap_or_default()),
                pvc,
                PVC_PROTECTION_FINALIZER,
            )
            .await?;
        }
        if let Some(dv) = &dv {
            add_finalizer(
                &self.dvs(&dv.namespace().unwrap_or_default()),
                dv,
                PVC_PROTECTION_FINALIZER,
            )
            .await?;
        }
        Ok(())
    }

    async fn unprotect(&self, dv: Option<DataVolume>) -> Result<()> {
        if let Some(dv) = &dv {
            remove_finalizer(
                &self.dvs(&dv.namespace().unwrap_or_default()),
                dv,
                PVC_PROTECTION_FINALIZER,
            )
            .await?;
        }
        Ok(())
    }

    async fn clean_up(&self, names: &SupplementNames) -> Result<bool> {
        let mut deleted = self.clean_up_supplements(names).await?;
        let pvc = self.get_pvc(names).await?;
        deleted |= release_and_delete(&self.pvcs(names.namespace()), pvc, PVC_PROTECTION_FINALIZER).await?;
        Ok(deleted)
    }

    async fn clean_up_supplements(&self, names: &SupplementNames) -> Result<bool> {
        let dv = self.get_data_volume(names).await?;
        let had_dv = dv.is_some();
        let mut deleted =
            release_and_delete(&self.dvs(names.namespace()), dv, PVC_PROTECTION_FINALIZER).await?;

        if had_dv {
            // the claim must survive the DataVolume garbage collection
            if let Some(pvc) = self.get_pvc(names).await? {
                let refs: Vec<OwnerReference> = pvc
                    .owner_references()
                    .iter()
                    .filter(|r| r.kind != "DataVolume")
                    .cloned()
                    .collect();
                if refs.len() != pvc.owner_references().len() {
                    self.patch_owner_references(&pvc, refs).await?;
                }
            }
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), names.namespace());
        deleted |= delete_if_exists(&secrets, &names.get(Supplement::DvcrAuthSecretForDv).name).await?;
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), names.namespace());
        deleted |= delete_if_exists(&config_maps, &names.get(Supplement::DvcrCaBundleForDv).name).await?;

        if deleted {
            debug!(namespace = names.namespace(), "data volume helpers deleted");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::objects::owner_reference;
    use crate::testing::http_image;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use rstest::rstest;
    use virtimage_common::crd::{DataVolumeCondition, DataVolumeRegistrySource, DataVolumeStatus};

    fn dv_with(phase: &str, progress: Option<&str>, running: Option<(&str, &str, &str)>) -> DataVolume {
        let mut dv = DataVolume::new("dv", DataVolumeSpec::default());
        dv.status = Some(DataVolumeStatus {
            phase: phase.to_string(),
            progress: progress.map(str::to_string),
            claim_name: None,
            conditions: running
                .map(|(status, reason, message)| DataVolumeCondition {
                    type_: DATA_VOLUME_RUNNING.to_string(),
                    status: status.to_string(),
                    reason: reason.to_string(),
                    message: message.to_string(),
                })
                .into_iter()
                .collect(),
        });
        dv
    }

    fn pvc_in(phase: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    mod size {
        use super::*;

        #[test]
        fn no_request_uses_required_size() {
            let size = get_validated_pvc_size(None, 2_147_483_648).expect("size");
            assert_eq!(size.0, "2147483648");
        }

        #[test]
        fn larger_request_is_kept() {
            let requested = Quantity("10Gi".to_string());
            let size = get_validated_pvc_size(Some(&requested), 1024).expect("size");
            assert_eq!(size, requested);
        }

        #[test]
        fn smaller_request_is_rejected_with_both_sizes() {
            let requested = Quantity("1Ki".to_string());
            let err = get_validated_pvc_size(Some(&requested), 4096).unwrap_err();
            assert_eq!(
                err.to_string(),
                "the specified pvc size is insufficient: 1024 (1Ki) < 4096"
            );
        }

        #[test]
        fn zero_required_size_is_a_bug() {
            assert!(get_validated_pvc_size(None, 0).is_err());
        }
    }

    mod import_state {
        use super::*;

        #[rstest]
        #[case(Some(("False", "Error", "pull failed")), true)]
        #[case(Some(("False", "ImportInProgress", "")), false)]
        #[case(Some(("True", "Pending", "")), false)]
        #[case(None, false)]
        fn running_condition_with_error_reason_fails(
            #[case] running: Option<(&str, &str, &str)>,
            #[case] fails: bool,
        ) {
            let dv = dv_with("ImportInProgress", None, running);
            assert_eq!(check_import_process(Some(&dv)).is_err(), fails);
        }

        #[test]
        fn import_done_needs_succeeded_dv_and_bound_claim() {
            let dv = dv_with("Succeeded", None, None);
            assert!(is_import_done(Some(&dv), Some(&pvc_in("Bound"))));
            assert!(!is_import_done(Some(&dv), Some(&pvc_in("Pending"))));
            assert!(!is_import_done(None, Some(&pvc_in("Bound"))));
        }

        #[rstest]
        #[case(Some("45.0%"), Some("72.5%"))]
        #[case(Some("N/A"), Some("60.0%"))]
        #[case(None, Some("60.0%"))]
        fn progress_is_scaled_or_kept(#[case] dv_progress_value: Option<&str>, #[case] expected: Option<&str>) {
            let dv = dv_with("ImportInProgress", dv_progress_value, None);
            let got = dv_progress(Some(&dv), Some("60.0%"), ProgressWindow::new(50.0, 100.0));
            assert_eq!(got.as_deref(), expected);
        }
    }

    #[test]
    fn data_volume_requests_block_rwx_and_immediate_binding() {
        let vi = http_image();
        let request = VolumeRequest {
            size: Quantity("2Gi".to_string()),
            storage_class: Some("linstor".to_string()),
            source: DataVolumeSource {
                registry: Some(DataVolumeRegistrySource {
                    url: "docker://dvcr.local/vi/vms/ubuntu:uid".to_string(),
                    ..Default::default()
                }),
                pvc: None,
            },
            owner: owner_reference(&vi),
            names: SupplementNames::for_image(&vi),
        };
        let dv = build_data_volume(&request);

        assert_eq!(dv.name_any(), request.names.data_volume().name);
        assert_eq!(dv.annotations().get(ANN_BIND_IMMEDIATE).map(String::as_str), Some("true"));
        assert_eq!(dv.spec.storage.volume_mode.as_deref(), Some("Block"));
        assert_eq!(dv.spec.storage.storage_class_name.as_deref(), Some("linstor"));
        assert_eq!(
            dv.spec.storage.resources.requests.get("storage"),
            Some(&Quantity("2Gi".to_string()))
        );
    }
}
