//! Bounder pod: a no-op consumer that binds a WaitForFirstConsumer claim

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeDevice,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Api;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use virtimage_common::supplements::{Supplement, SupplementNames};
use virtimage_common::{Result, POD_PROTECTION_FINALIZER};

use super::objects::{create_if_missing, get_supplement, helper_meta, release_and_delete, remove_finalizer};
use crate::settings::ControllerSettings;

/// Build the bounder pod for `pvc_name`
pub fn build_bounder_pod(
    owner: &OwnerReference,
    names: &SupplementNames,
    pvc_name: &str,
    settings: &ControllerSettings,
) -> Pod {
    let name = names.get(Supplement::BounderPod);
    Pod {
        metadata: helper_meta(&name.name, &name.namespace, owner),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "bounder".to_string(),
                image: Some(settings.bounder_image.clone()),
                image_pull_policy: Some(settings.pull_policy.clone()),
                volume_devices: Some(vec![VolumeDevice {
                    name: "volume".to_string(),
                    device_path: "/dev/xvda".to_string(),
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "volume".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Bounder pod lifecycle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Bounder: Send + Sync {
    /// Create the bounder pod mounting `pvc_name`
    async fn start(&self, owner: OwnerReference, names: SupplementNames, pvc_name: String) -> Result<()>;

    /// Fetch the bounder pod
    async fn get_pod(&self, names: &SupplementNames) -> Result<Option<Pod>>;

    /// Release the pod
    async fn unprotect(&self, pod: &Pod) -> Result<()>;

    /// Delete the bounder pod; returns whether it existed
    async fn clean_up_supplements(&self, names: &SupplementNames) -> Result<bool>;
}

/// Kubernetes-backed bounder
pub struct BounderImpl {
    client: Client,
    settings: ControllerSettings,
}

impl BounderImpl {
    /// Create a new bounder service
    pub fn new(client: Client, settings: ControllerSettings) -> Self {
        Self { client, settings }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Bounder for BounderImpl {
    async fn start(&self, owner: OwnerReference, names: SupplementNames, pvc_name: String) -> Result<()> {
        let pod = build_bounder_pod(&owner, &names, &pvc_name, &self.settings);
        info!(pod = %names.get(Supplement::BounderPod), pvc = %pvc_name, "creating bounder pod");
        create_if_missing(&self.pods(names.namespace()), &pod).await
    }

    async fn get_pod(&self, names: &SupplementNames) -> Result<Option<Pod>> {
        get_supplement(|ns| self.pods(ns), names, Supplement::BounderPod).await
    }

    async fn unprotect(&self, pod: &Pod) -> Result<()> {
        let api = self.pods(&pod.namespace().unwrap_or_default());
        remove_finalizer(&api, pod, POD_PROTECTION_FINALIZER).await
    }

    async fn clean_up_supplements(&self, names: &SupplementNames) -> Result<bool> {
        let pod = self.get_pod(names).await?;
        release_and_delete(&self.pods(names.namespace()), pod, POD_PROTECTION_FINALIZER).await
    }
}
