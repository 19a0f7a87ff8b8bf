//! Import of a file downloaded over HTTP

use async_trait::async_trait;
use kube::ResourceExt;

use virtimage_common::crd::VirtualImage;
use virtimage_common::{Error, Result};

use super::import::{self, Launch};
use super::SourceStrategy;
use crate::requeue::Requeue;
use crate::services::importer::ImportSource;
use crate::services::Services;
use crate::status::StatusFragment;

/// Strategy for `HTTP` data sources
pub struct HttpStrategy {
    services: Services,
}

impl HttpStrategy {
    /// Create the strategy
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn launch(&self, vi: &VirtualImage) -> Result<Launch> {
        let http = vi.spec.data_source.http.as_ref().ok_or_else(|| {
            Error::validation_for_field(vi.name_any(), "spec.dataSource.http", "HTTP source is not set")
        })?;
        let checksum = http.checksum.clone().unwrap_or_default();
        let mut launch = Launch::new(ImportSource::Http {
            url: http.url.clone(),
            md5: checksum.md5,
            sha256: checksum.sha256,
        });
        launch.ca_bundle = http.ca_bundle.clone();
        Ok(launch)
    }
}

#[async_trait]
impl SourceStrategy for HttpStrategy {
    fn name(&self) -> &'static str {
        "http"
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

    async fn validate(&self, _vi: &VirtualImage) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{http_image, Mocks};
    use virtimage_common::crd::Checksum;

    #[test]
    fn checksum_and_ca_bundle_reach_the_importer() {
        let strategy = HttpStrategy::new(Mocks::new().build());
        let mut vi = http_image();
        if let Some(http) = vi.spec.data_source.http.as_mut() {
            http.checksum = Some(Checksum {
                md5: None,
                sha256: Some("abc".to_string()),
            });
            http.ca_bundle = Some("Y2E=".to_string());
        }

        let launch = strategy.launch(&vi).expect("launch");
        assert_eq!(
            launch.source,
            ImportSource::Http {
                url: "https://example.com/ubuntu.img".to_string(),
                md5: None,
                sha256: Some("abc".to_string()),
            }
        );
        assert_eq!(launch.ca_bundle.as_deref(), Some("Y2E="));
    }

    #[test]
    fn missing_http_block_is_a_validation_error() {
        let strategy = HttpStrategy::new(Mocks::new().build());
        let mut vi = http_image();
        vi.spec.data_source.http = None;
        assert!(matches!(strategy.launch(&vi), Err(Error::Validation { .. })));
    }

    /// Story: cleanup reports whether any helper was deleted
    #[tokio::test]
    async fn clean_up_covers_pod_and_volume() {
        let mut mocks = Mocks::new();
        mocks.importer.expect_clean_up().times(1).returning(|_| Ok(false));
        mocks.disk.expect_clean_up().times(1).returning(|_| Ok(true));
        let strategy = HttpStrategy::new(mocks.build());

        assert!(strategy.clean_up(&http_image()).await.expect("clean up"));
    }
}
