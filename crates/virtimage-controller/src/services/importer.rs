//! Importer pod: downloads or copies image data into DVCR
//!
//! The importer reads from an HTTP URL, a container registry, another DVCR
//! image or a mounted volume claim, and pushes the result to the image's
//! DVCR repository. Its progress and final report are read through
//! [`super::stat`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, Secret, SecretVolumeSource, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Api;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use virtimage_common::supplements::{Supplement, SupplementName, SupplementNames};
use virtimage_common::{Result, POD_PROTECTION_FINALIZER};

use super::objects::{
    add_finalizer, create_if_missing, delete_if_exists, get_supplement, helper_meta,
    release_and_delete, remove_finalizer,
};
use super::stat::IMPORTER_DESTINATION_ENV;
use crate::settings::ControllerSettings;

const CONTAINER_NAME: &str = "importer";
const DVCR_AUTH_MOUNT: &str = "/dvcr-auth";
const SOURCE_AUTH_MOUNT: &str = "/source-auth";
const CA_BUNDLE_MOUNT: &str = "/certs";
const BLOCK_DEVICE_PATH: &str = "/dev/xvda";
const FILESYSTEM_MOUNT: &str = "/data";

/// Where the importer reads data from
#[derive(Clone, Debug, PartialEq)]
pub enum ImportSource {
    /// Download a file
    Http {
        /// File URL
        url: String,
        /// Expected MD5
        md5: Option<String>,
        /// Expected SHA-256
        sha256: Option<String>,
    },
    /// Pull an image from a container registry
    Registry {
        /// Image reference
        image: String,
        /// Pull secret in the image namespace
        pull_secret: Option<String>,
    },
    /// Copy another DVCR image
    Dvcr {
        /// Source DVCR image
        image: String,
    },
    /// Read a block-mode claim mounted into the pod
    BlockDevice,
    /// Read a filesystem-mode claim mounted into the pod
    Filesystem,
}

impl ImportSource {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Registry { .. } => "registry",
            Self::Dvcr { .. } => "dvcr",
            Self::BlockDevice => "blockDevice",
            Self::Filesystem => "filesystem",
        }
    }
}

/// Everything needed to start an importer pod
#[derive(Clone, Debug, PartialEq)]
pub struct ImportRequest {
    /// Data origin
    pub source: ImportSource,
    /// DVCR image to write
    pub destination: String,
    /// Owner of every created object
    pub owner: OwnerReference,
    /// Helper names of the owner
    pub names: SupplementNames,
    /// Base64 CA bundle of the source server
    pub ca_bundle: Option<String>,
    /// Claim mounted as the data source
    pub source_pvc: Option<SupplementName>,
}

/// Environment of the importer container
pub fn importer_env(request: &ImportRequest, settings: &ControllerSettings) -> Vec<EnvVar> {
    let mut env = BTreeMap::new();
    env.insert("IMPORTER_SOURCE_TYPE", request.source.type_name().to_string());
    env.insert(IMPORTER_DESTINATION_ENV, request.destination.clone());

    match &request.source {
        ImportSource::Http { url, md5, sha256 } => {
            env.insert("IMPORTER_ENDPOINT", url.clone());
            if let Some(md5) = md5 {
                env.insert("IMPORTER_MD5", md5.clone());
            }
            if let Some(sha256) = sha256 {
                env.insert("IMPORTER_SHA256", sha256.clone());
            }
        }
        ImportSource::Registry { image, pull_secret } => {
            env.insert("IMPORTER_ENDPOINT", format!("docker://{image}"));
            if pull_secret.is_some() {
                env.insert("IMPORTER_AUTH_CONFIG", format!("{SOURCE_AUTH_MOUNT}/.dockerconfigjson"));
            }
        }
        ImportSource::Dvcr { image } => {
            env.insert("IMPORTER_ENDPOINT", format!("docker://{image}"));
            if settings.dvcr.auth_secret.is_some() {
                env.insert("IMPORTER_AUTH_CONFIG", format!("{DVCR_AUTH_MOUNT}/.dockerconfigjson"));
            }
        }
        ImportSource::BlockDevice => {
            env.insert("IMPORTER_ENDPOINT", BLOCK_DEVICE_PATH.to_string());
        }
        ImportSource::Filesystem => {
            env.insert("IMPORTER_ENDPOINT", FILESYSTEM_MOUNT.to_string());
        }
    }

    if settings.dvcr.auth_secret.is_some() {
        env.insert(
            "IMPORTER_DESTINATION_AUTH_CONFIG",
            format!("{DVCR_AUTH_MOUNT}/.dockerconfigjson"),
        );
    }
    if settings.dvcr.insecure_tls {
        env.insert("IMPORTER_DESTINATION_INSECURE_TLS", "true".to_string());
    }
    if request.ca_bundle.is_some() {
        env.insert("IMPORTER_CERT_DIR", CA_BUNDLE_MOUNT.to_string());
    }

    env.into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

/// Build the importer pod for a request
pub fn build_importer_pod(request: &ImportRequest, settings: &ControllerSettings) -> Pod {
    let pod_name = request.names.importer_pod();
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let mut devices = Vec::new();

    if settings.dvcr.auth_secret.is_some() {
        volumes.push(secret_volume("dvcr-auth", &request.names.get(Supplement::DvcrAuthSecret).name));
        mounts.push(mount("dvcr-auth", DVCR_AUTH_MOUNT, true));
    }
    if let ImportSource::Registry {
        pull_secret: Some(_), ..
    } = &request.source
    {
        volumes.push(secret_volume("source-auth", &request.names.get(Supplement::ImagePullSecret).name));
        mounts.push(mount("source-auth", SOURCE_AUTH_MOUNT, true));
    }
    if request.ca_bundle.is_some() {
        volumes.push(Volume {
            name: "ca-bundle".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: request.names.get(Supplement::CaBundleConfigMap).name,
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(mount("ca-bundle", CA_BUNDLE_MOUNT, true));
    }
    if let Some(pvc) = &request.source_pvc {
        volumes.push(Volume {
            name: "source".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc.name.clone(),
                read_only: Some(true),
            }),
            ..Default::default()
        });
        match request.source {
            ImportSource::Filesystem => mounts.push(mount("source", FILESYSTEM_MOUNT, true)),
            _ => devices.push(VolumeDevice {
                name: "source".to_string(),
                device_path: BLOCK_DEVICE_PATH.to_string(),
            }),
        }
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(settings.importer_image.clone()),
        image_pull_policy: Some(settings.pull_policy.clone()),
        env: Some(importer_env(request, settings)),
        volume_mounts: Some(mounts).filter(|m| !m.is_empty()),
        volume_devices: Some(devices).filter(|d| !d.is_empty()),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..Default::default()
    };

    Pod {
        metadata: helper_meta(&pod_name.name, &pod_name.namespace, &request.owner),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes).filter(|v| !v.is_empty()),
            restart_policy: Some("OnFailure".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Importer pod lifecycle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Importer: Send + Sync {
    /// Create the importer pod and its secrets; existing objects are kept
    async fn start(&self, request: ImportRequest) -> Result<()>;

    /// Fetch the importer pod
    async fn get_pod(&self, names: &SupplementNames) -> Result<Option<Pod>>;

    /// Keep the pod from being deleted while the import runs
    async fn protect(&self, pod: &Pod) -> Result<()>;

    /// Release the pod
    async fn unprotect(&self, pod: &Pod) -> Result<()>;

    /// Delete the pod and its secrets; returns whether anything was deleted
    async fn clean_up(&self, names: &SupplementNames) -> Result<bool>;

    /// Delete the import-time helpers after success
    async fn clean_up_supplements(&self, names: &SupplementNames) -> Result<bool>;
}

/// Kubernetes-backed importer
pub struct ImporterImpl {
    client: Client,
    settings: ControllerSettings,
}

impl ImporterImpl {
    /// Create a new importer service
    pub fn new(client: Client, settings: ControllerSettings) -> Self {
        Self { client, settings }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Importer for ImporterImpl {
    async fn start(&self, request: ImportRequest) -> Result<()> {
        let namespace = request.names.namespace().to_string();

        if let Some(auth) = &self.settings.dvcr.auth_secret {
            let from_namespace = self.settings.dvcr.auth_namespace(&self.settings.namespace);
            copy_secret(
                &self.client,
                auth,
                from_namespace,
                &request.names.get(Supplement::DvcrAuthSecret),
                &request.owner,
            )
            .await?;
        }

        if let ImportSource::Registry {
            pull_secret: Some(secret),
            ..
        } = &request.source
        {
            copy_secret(
                &self.client,
                secret,
                &namespace,
                &request.names.get(Supplement::ImagePullSecret),
                &request.owner,
            )
            .await?;
        }

        if let Some(ca_bundle) = &request.ca_bundle {
            let name = request.names.get(Supplement::CaBundleConfigMap);
            let cm = ConfigMap {
                metadata: helper_meta(&name.name, &name.namespace, &request.owner),
                data: Some([("ca.crt".to_string(), ca_bundle.clone())].into_iter().collect()),
                ..Default::default()
            };
            create_if_missing(&Api::namespaced(self.client.clone(), &namespace), &cm).await?;
        }

        let pod = build_importer_pod(&request, &self.settings);
        info!(pod = %request.names.importer_pod(), source = request.source.type_name(), "creating importer pod");
        create_if_missing(&self.pods(&namespace), &pod).await
    }

    async fn get_pod(&self, names: &SupplementNames) -> Result<Option<Pod>> {
        get_supplement(|ns| self.pods(ns), names, Supplement::ImporterPod).await
    }

    async fn protect(&self, pod: &Pod) -> Result<()> {
        let api = self.pods(&kube::ResourceExt::namespace(pod).unwrap_or_default());
        add_finalizer(&api, pod, POD_PROTECTION_FINALIZER).await
    }

    async fn unprotect(&self, pod: &Pod) -> Result<()> {
        let api = self.pods(&kube::ResourceExt::namespace(pod).unwrap_or_default());
        remove_finalizer(&api, pod, POD_PROTECTION_FINALIZER).await
    }

    async fn clean_up(&self, names: &SupplementNames) -> Result<bool> {
        self.clean_up_supplements(names).await
    }

    async fn clean_up_supplements(&self, names: &SupplementNames) -> Result<bool> {
        let pod = self.get_pod(names).await?;
        let mut deleted =
            release_and_delete(&self.pods(names.namespace()), pod, POD_PROTECTION_FINALIZER).await?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), names.namespace());
        for supplement in [Supplement::DvcrAuthSecret, Supplement::ImagePullSecret] {
            deleted |= delete_if_exists(&secrets, &names.get(supplement).name).await?;
        }
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), names.namespace());
        deleted |= delete_if_exists(&config_maps, &names.get(Supplement::CaBundleConfigMap).name).await?;

        if deleted {
            debug!(namespace = names.namespace(), "importer helpers deleted");
        }
        Ok(deleted)
    }
}

/// Copy a secret next to a helper pod, owned by the image
pub(crate) async fn copy_secret(
    client: &Client,
    name: &str,
    namespace: &str,
    to: &SupplementName,
    owner: &OwnerReference,
) -> Result<()> {
    let source: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = source.get_opt(name).await? else {
        return Err(virtimage_common::DataSourceError::SecretNotFound(name.to_string()).into());
    };

    let copy = Secret {
        metadata: helper_meta(&to.name, &to.namespace, owner),
        data: secret.data,
        type_: secret.type_,
        ..Default::default()
    };
    create_if_missing(&Api::namespaced(client.clone(), &to.namespace), &copy).await
}
