//! Uploader pod, service and ingress: receive user data into DVCR

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, Secret, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use virtimage_common::supplements::{Supplement, SupplementNames};
use virtimage_common::{Result, ANN_UPLOAD_PATH, ANN_UPLOAD_URL, POD_PROTECTION_FINALIZER};

use super::importer::copy_secret;
use super::objects::{
    add_finalizer, create_if_missing, delete_if_exists, get_supplement, helper_meta,
    release_and_delete, remove_finalizer,
};
use super::stat::UPLOADER_DESTINATION_ENV;
use crate::settings::ControllerSettings;

const CONTAINER_NAME: &str = "uploader";
const UPLOADER_PORT: i32 = 8080;
const SERVICE_PORT: i32 = 80;
const DVCR_AUTH_MOUNT: &str = "/dvcr-auth";
const SELECTOR_LABEL: &str = "virtualization.deckhouse.io/uploader";

/// Everything needed to start an uploader
#[derive(Clone, Debug, PartialEq)]
pub struct UploadRequest {
    /// DVCR image to write
    pub destination: String,
    /// Owner of every created object
    pub owner: OwnerReference,
    /// Helper names of the owner
    pub names: SupplementNames,
    /// Ingress path, `/upload/<uid>`
    pub path: String,
}

/// Uploader objects of one image
#[derive(Clone, Debug, Default)]
pub struct UploaderObjects {
    /// Uploader pod
    pub pod: Option<Pod>,
    /// Service in front of the pod
    pub service: Option<Service>,
    /// Ingress exposing the service
    pub ingress: Option<Ingress>,
}

/// External upload URL recorded on the ingress
pub fn external_url(ingress: &Ingress) -> Option<String> {
    ingress.annotations().get(ANN_UPLOAD_URL).cloned()
}

/// Upload URL reachable from inside the cluster
pub fn in_cluster_url(service: &Service) -> String {
    format!(
        "http://{}.{}.svc/upload",
        service.name_any(),
        service.namespace().unwrap_or_default()
    )
}

fn selector(request: &UploadRequest) -> BTreeMap<String, String> {
    [(SELECTOR_LABEL.to_string(), request.names.get(Supplement::UploaderPod).name)]
        .into_iter()
        .collect()
}

/// Build the uploader pod
pub fn build_uploader_pod(request: &UploadRequest, settings: &ControllerSettings) -> Pod {
    let name = request.names.get(Supplement::UploaderPod);
    let mut meta = helper_meta(&name.name, &name.namespace, &request.owner);
    meta.labels.get_or_insert_with(Default::default).extend(selector(request));

    let mut env = vec![EnvVar {
        name: UPLOADER_DESTINATION_ENV.to_string(),
        value: Some(request.destination.clone()),
        ..Default::default()
    }];
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    if settings.dvcr.auth_secret.is_some() {
        env.push(EnvVar {
            name: "UPLOADER_DESTINATION_AUTH_CONFIG".to_string(),
            value: Some(format!("{DVCR_AUTH_MOUNT}/.dockerconfigjson")),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "dvcr-auth".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(request.names.get(Supplement::DvcrAuthSecret).name),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "dvcr-auth".to_string(),
            mount_path: DVCR_AUTH_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    if settings.dvcr.insecure_tls {
        env.push(EnvVar {
            name: "UPLOADER_DESTINATION_INSECURE_TLS".to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        });
    }

    Pod {
        metadata: meta,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(settings.uploader_image.clone()),
                image_pull_policy: Some(settings.pull_policy.clone()),
                env: Some(env),
                ports: Some(vec![ContainerPort {
                    name: Some("uploader".to_string()),
                    container_port: UPLOADER_PORT,
                    ..Default::default()
                }]),
                volume_mounts: Some(mounts).filter(|m| !m.is_empty()),
                termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                ..Default::default()
            }],
            volumes: Some(volumes).filter(|v| !v.is_empty()),
            restart_policy: Some("OnFailure".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the service in front of the uploader
pub fn build_uploader_service(request: &UploadRequest) -> Service {
    let name = request.names.get(Supplement::UploaderService);
    Service {
        metadata: helper_meta(&name.name, &name.namespace, &request.owner),
        spec: Some(ServiceSpec {
            selector: Some(selector(request)),
            ports: Some(vec![ServicePort {
                name: Some("uploader".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(UPLOADER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the ingress exposing the uploader at `https://<host><path>`
pub fn build_uploader_ingress(request: &UploadRequest, settings: &ControllerSettings) -> Ingress {
    let name = request.names.get(Supplement::UploaderIngress);
    let host = &settings.uploader.ingress_host;
    let mut meta = helper_meta(&name.name, &name.namespace, &request.owner);
    meta.annotations = Some(
        [
            (ANN_UPLOAD_URL.to_string(), format!("https://{host}{}", request.path)),
            (ANN_UPLOAD_PATH.to_string(), request.path.clone()),
        ]
        .into_iter()
        .collect(),
    );

    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: request.names.get(Supplement::UploaderService).name,
            port: Some(ServiceBackendPort {
                number: Some(SERVICE_PORT),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };

    Ingress {
        metadata: meta,
        spec: Some(IngressSpec {
            ingress_class_name: settings.uploader.ingress_class.clone(),
            rules: Some(vec![IngressRule {
                host: Some(host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(request.path.clone()),
                        path_type: "Exact".to_string(),
                        backend,
                    }],
                }),
            }]),
            tls: settings.uploader.tls_secret.as_ref().map(|_| {
                vec![IngressTLS {
                    hosts: Some(vec![host.clone()]),
                    secret_name: Some(request.names.get(Supplement::UploaderTlsSecret).name),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Uploader lifecycle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Create pod, service and ingress; existing objects are kept
    async fn start(&self, request: UploadRequest) -> Result<()>;

    /// Fetch the uploader objects
    async fn get(&self, names: &SupplementNames) -> Result<UploaderObjects>;

    /// Keep the pod from being deleted while the upload runs
    async fn protect(&self, objects: UploaderObjects) -> Result<()>;

    /// Release the pod
    async fn unprotect(&self, objects: UploaderObjects) -> Result<()>;

    /// Delete every uploader object; returns whether anything was deleted
    async fn clean_up(&self, names: &SupplementNames) -> Result<bool>;

    /// Delete the upload-time helpers after success
    async fn clean_up_supplements(&self, names: &SupplementNames) -> Result<bool>;
}

/// Kubernetes-backed uploader
pub struct UploaderImpl {
    client: Client,
    settings: ControllerSettings,
}

impl UploaderImpl {
    /// Create a new uploader service
    pub fn new(client: Client, settings: ControllerSettings) -> Self {
        Self { client, settings }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Uploader for UploaderImpl {
    async fn start(&self, request: UploadRequest) -> Result<()> {
        let namespace = request.names.namespace().to_string();

        if let Some(auth) = &self.settings.dvcr.auth_secret {
            copy_secret(
                &self.client,
                auth,
                self.settings.dvcr.auth_namespace(&self.settings.namespace),
                &request.names.get(Supplement::DvcrAuthSecret),
                &request.owner,
            )
            .await?;
        }
        if let Some(tls) = &self.settings.uploader.tls_secret {
            copy_secret(
                &self.client,
                tls,
                &self.settings.namespace,
                &request.names.get(Supplement::UploaderTlsSecret),
                &request.owner,
            )
            .await?;
        }

        info!(pod = %request.names.get(Supplement::UploaderPod), "creating uploader");
        create_if_missing(&self.api(&namespace), &build_uploader_pod(&request, &self.settings)).await?;
        create_if_missing(&self.api(&namespace), &build_uploader_service(&request)).await?;
        create_if_missing(
            &self.api(&namespace),
            &build_uploader_ingress(&request, &self.settings),
        )
        .await
    }

    async fn get(&self, names: &SupplementNames) -> Result<UploaderObjects> {
        Ok(UploaderObjects {
            pod: get_supplement(|ns| self.api(ns), names, Supplement::UploaderPod).await?,
            service: get_supplement(|ns| self.api(ns), names, Supplement::UploaderService).await?,
            ingress: get_supplement(|ns| self.api(ns), names, Supplement::UploaderIngress).await?,
        })
    }

    async fn protect(&self, objects: UploaderObjects) -> Result<()> {
        if let Some(pod) = &objects.pod {
            let api = self.api::<Pod>(&pod.namespace().unwrap_or_default());
            add_finalizer(&api, pod, POD_PROTECTION_FINALIZER).await?;
        }
        Ok(())
    }

    async fn unprotect(&self, objects: UploaderObjects) -> Result<()> {
        if let Some(pod) = &objects.pod {
            let api = self.api::<Pod>(&pod.namespace().unwrap_or_default());
            remove_finalizer(&api, pod, POD_PROTECTION_FINALIZER).await?;
        }
        Ok(())
    }

    async fn clean_up(&self, names: &SupplementNames) -> Result<bool> {
        self.clean_up_supplements(names).await
    }

    async fn clean_up_supplements(&self, names: &SupplementNames) -> Result<bool> {
        let objects = self.get(names).await?;
        let namespace = names.namespace();

        let mut deleted =
            release_and_delete(&self.api::<Pod>(namespace), objects.pod, POD_PROTECTION_FINALIZER).await?;
        if let Some(svc) = objects.service {
            deleted |= delete_if_exists(&self.api::<Service>(namespace), &svc.name_any()).await?;
        }
        if let Some(ing) = objects.ingress {
            deleted |= delete_if_exists(&self.api::<Ingress>(namespace), &ing.name_any()).await?;
        }
        for supplement in [Supplement::DvcrAuthSecret, Supplement::UploaderTlsSecret] {
            deleted |= delete_if_exists(&self.api::<Secret>(namespace), &names.get(supplement).name).await?;
        }
        Ok(deleted)
    }
}
