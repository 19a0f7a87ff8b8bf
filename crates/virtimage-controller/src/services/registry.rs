//! DVCR presence checks
//!
//! A Ready registry-backed image is re-checked periodically with a manifest
//! HEAD request so a blob deleted behind the controller's back is noticed.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use virtimage_common::{Error, Result};

use crate::settings::ControllerSettings;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Parts of an image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host with optional port
    pub host: String,
    /// Repository path
    pub repository: String,
    /// Tag
    pub tag: String,
}

impl ImageReference {
    /// Split `host/repo/path:tag`; the tag defaults to `latest`
    pub fn parse(image: &str) -> Result<Self> {
        let image = image.trim_start_matches("docker://");
        let (host, rest) = image
            .split_once('/')
            .ok_or_else(|| Error::registry(image, "image reference has no repository"))?;

        // a colon after the last slash separates the tag
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (rest, "latest"),
        };
        if repository.is_empty() || tag.is_empty() {
            return Err(Error::registry(image, "malformed image reference"));
        }

        Ok(Self {
            host: host.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Manifest URL of the reference
    pub fn manifest_url(&self) -> String {
        format!("https://{}/v2/{}/manifests/{}", self.host, self.repository, self.tag)
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Username and password for `host` from a dockerconfigjson document
pub fn credentials_for(config: &[u8], host: &str) -> Result<Option<(String, Option<String>)>> {
    let config: DockerConfig = serde_json::from_slice(config)
        .map_err(|e| Error::serialization_for_kind("Secret", format!("dockerconfigjson: {e}")))?;
    Ok(config
        .auths
        .into_iter()
        .find(|(registry, _)| registry.trim_start_matches("https://").trim_end_matches('/') == host)
        .and_then(|(_, auth)| auth.username.map(|u| (u, auth.password))))
}

/// Registry queries
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryProbe: Send + Sync {
    /// Whether the image manifest exists
    async fn image_exists(&self, image: &str) -> Result<bool>;
}

/// HTTP registry probe
pub struct RegistryProbeImpl {
    client: Client,
    http: reqwest::Client,
    settings: ControllerSettings,
}

impl RegistryProbeImpl {
    /// Create a probe honoring the DVCR TLS settings
    pub fn new(client: Client, settings: ControllerSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.dvcr.insecure_tls)
            .build()
            .map_err(|e| Error::internal_with_context("registry", e.to_string()))?;
        Ok(Self {
            client,
            http,
            settings,
        })
    }

    async fn credentials(&self, host: &str) -> Result<Option<(String, Option<String>)>> {
        let Some(name) = &self.settings.dvcr.auth_secret else {
            return Ok(None);
        };
        let namespace = self.settings.dvcr.auth_namespace(&self.settings.namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let config = secrets
            .get_opt(name)
            .await?
            .and_then(|s| s.data)
            .and_then(|mut d| d.remove(".dockerconfigjson"));
        match config {
            Some(bytes) => credentials_for(&bytes.0, host),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RegistryProbe for RegistryProbeImpl {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let reference = ImageReference::parse(image)?;
        let mut request = self
            .http
            .head(reference.manifest_url())
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT);
        if let Some((username, password)) = self.credentials(&reference.host).await? {
            request = request.basic_auth(username, password);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::registry(image, e.to_string()))?;
        debug!(image, status = %response.status(), "registry manifest probe");

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Error::registry(image, format!("unexpected status {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("dvcr.local/vi/vms/ubuntu:uid", "dvcr.local", "vi/vms/ubuntu", "uid")]
    #[case("docker://dvcr.local:5000/cvi/base:abc", "dvcr.local:5000", "cvi/base", "abc")]
    #[case("registry.example.com/ubuntu", "registry.example.com", "ubuntu", "latest")]
    fn parses_references(#[case] image: &str, #[case] host: &str, #[case] repo: &str, #[case] tag: &str) {
        let reference = ImageReference::parse(image).expect("parse");
        assert_eq!(reference.host, host);
        assert_eq!(reference.repository, repo);
        assert_eq!(reference.tag, tag);
    }

    #[test]
    fn manifest_url_targets_v2_api() {
        let reference = ImageReference::parse("dvcr.local/vi/vms/ubuntu:uid").expect("parse");
        assert_eq!(reference.manifest_url(), "https://dvcr.local/v2/vi/vms/ubuntu/manifests/uid");
    }

    #[test]
    fn reference_without_repository_is_rejected() {
        assert!(ImageReference::parse("ubuntu").is_err());
    }

    #[test]
    fn credentials_are_matched_by_host() {
        let config = br#"{"auths":{"dvcr.local":{"username":"admin","password":"secret"},"other":{"username":"x"}}}"#;
        assert_eq!(
            credentials_for(config, "dvcr.local").expect("parse"),
            Some(("admin".to_string(), Some("secret".to_string())))
        );
        assert_eq!(credentials_for(config, "missing").expect("parse"), None);
        assert!(credentials_for(b"not json", "dvcr.local").is_err());
    }
}
