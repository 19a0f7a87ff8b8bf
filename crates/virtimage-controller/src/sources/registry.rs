//! Import of an image pulled from a container registry

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use virtimage_common::crd::{ContainerImageSource, VirtualImage};
use virtimage_common::{DataSourceError, Error, Result};

use super::import::{self, Launch};
use super::SourceStrategy;
use crate::requeue::Requeue;
use crate::services::importer::ImportSource;
use crate::services::Services;
use crate::status::StatusFragment;

fn pull_secret(source: &ContainerImageSource) -> Option<&str> {
    source
        .image_pull_secret
        .as_ref()
        .and_then(|s| s.name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Strategy for `ContainerImage` data sources
pub struct RegistryStrategy {
    services: Services,
}

impl RegistryStrategy {
    /// Create the strategy
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn source<'a>(&self, vi: &'a VirtualImage) -> Result<&'a ContainerImageSource> {
        vi.spec.data_source.container_image.as_ref().ok_or_else(|| {
            Error::validation_for_field(
                vi.name_any(),
                "spec.dataSource.containerImage",
                "container image source is not set",
            )
        })
    }

    fn launch(&self, vi: &VirtualImage) -> Result<Launch> {
        let source = self.source(vi)?;
        let mut launch = Launch::new(ImportSource::Registry {
            image: source.image.clone(),
            pull_secret: pull_secret(source).map(str::to_string),
        });
        launch.ca_bundle = source.ca_bundle.clone();
        Ok(launch)
    }
}

#[async_trait]
impl SourceStrategy for RegistryStrategy {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn store_to_registry(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        import::store_to_registry(&self.services, self, vi, out, self.launch(vi)).await
    }

    async fn store_to_volume(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        import::store_to_volume(&self.services, self, vi, out, self.launch(vi)).await
    }

    async fn clean_up(&self, vi: &VirtualImage) -> Result<bool> {
        import::clean_up(&self.services, vi).await
    }

    async fn clean_up_supplements(&self, vi: &VirtualImage) -> Result<Requeue> {
        import::clean_up_supplements(&self.services, vi).await
    }

    /// The pull secret, when named, must exist next to the image
    async fn validate(&self, vi: &VirtualImage) -> Result<()> {
        let Some(secret) = pull_secret(self.source(vi)?) else {
            return Ok(());
        };
        let namespace = vi.namespace_or_default();
        if self.services.store.get_secret(secret, &namespace).await?.is_none() {
            debug!(secret, namespace = %namespace, "image pull secret not found");
            return Err(DataSourceError::SecretNotFound(secret.to_string()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{container_image, Mocks};
    use k8s_openapi::api::core::v1::Secret;

    /// Story: a missing pull secret blocks the import
    #[tokio::test]
    async fn missing_pull_secret_is_reported() {
        let mut mocks = Mocks::new();
        mocks
            .store
            .expect_get_secret()
            .withf(|name, ns| name == "regcred" && ns == "vms")
            .returning(|_, _| Ok(None));
        let strategy = RegistryStrategy::new(mocks.build());

        let err = strategy
            .validate(&container_image(Some("regcred")))
            .await
            .expect_err("secret is missing");
        assert_eq!(err.to_string(), "container registry secret \"regcred\" not found");
    }

    #[tokio::test]
    async fn present_pull_secret_passes() {
        let mut mocks = Mocks::new();
        mocks
            .store
            .expect_get_secret()
            .returning(|_, _| Ok(Some(Secret::default())));
        let strategy = RegistryStrategy::new(mocks.build());

        strategy
            .validate(&container_image(Some("regcred")))
            .await
            .expect("secret exists");
    }

    #[tokio::test]
    async fn no_pull_secret_needs_no_lookup() {
        let mut mocks = Mocks::new();
        mocks.store.expect_get_secret().never();
        let strategy = RegistryStrategy::new(mocks.build());

        strategy
            .validate(&container_image(None))
            .await
            .expect("nothing to check");
    }

    #[test]
    fn pull_secret_is_passed_to_the_importer() {
        let strategy = RegistryStrategy::new(Mocks::new().build());
        let launch = strategy.launch(&container_image(Some("regcred"))).expect("launch");
        assert_eq!(
            launch.source,
            ImportSource::Registry {
                image: "registry.example.com/ubuntu:22.04".to_string(),
                pull_secret: Some("regcred".to_string()),
            }
        );
    }
}
