//! Source strategies
//!
//! A strategy imports the data of one kind of source into DVCR or into a
//! claim. HTTP, container-registry, upload and image references are
//! hand-written state machines over the helper objects; disk and disk
//! snapshot references run a step pipeline. Both look the same to the
//! lifecycle handler.
//!
//! [`StrategyRegistry`] maps the source kind of an image to its strategy
//! once per pass; [`sync`] then picks the registry or volume entry point
//! from the storage kind.

mod http;
mod import;
mod object_ref;
mod object_ref_disk;
mod object_ref_snapshot;
mod registry;
mod upload;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use virtimage_common::crd::{DataSourceType, ObjectRefKind, VirtualImage};
use virtimage_common::{Error, Result};

use crate::requeue::Requeue;
use crate::services::Services;
use crate::status::StatusFragment;

pub use http::HttpStrategy;
pub use object_ref::ObjectRefImageStrategy;
pub use object_ref_disk::ObjectRefDiskStrategy;
pub use object_ref_snapshot::ObjectRefSnapshotStrategy;
pub use registry::RegistryStrategy;
pub use upload::UploadStrategy;

/// Import of one kind of data source
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceStrategy: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Import into DVCR
    async fn store_to_registry(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue>;

    /// Import into the image's claim
    async fn store_to_volume(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue>;

    /// Delete every helper of the image, the claim included
    ///
    /// Returns whether anything was deleted.
    async fn clean_up(&self, vi: &VirtualImage) -> Result<bool>;

    /// Delete the import-time helpers of a finished image
    async fn clean_up_supplements(&self, vi: &VirtualImage) -> Result<Requeue>;

    /// Check that the source can be read
    ///
    /// Classified failures are [`Error::DataSource`].
    async fn validate(&self, vi: &VirtualImage) -> Result<()>;
}

/// Run the entry point matching the storage kind of the image
pub async fn sync(strategy: &dyn SourceStrategy, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
    debug!(strategy = strategy.name(), storage = ?vi.spec.storage, "syncing data source");
    if vi.spec.storage.is_volume() {
        strategy.store_to_volume(vi, out).await
    } else {
        strategy.store_to_registry(vi, out).await
    }
}

/// Release the import-time helpers of a finished image
///
/// Images annotated to retain their helpers keep them.
pub async fn clean_up_finished(strategy: &dyn SourceStrategy, vi: &VirtualImage) -> Result<Requeue> {
    if vi.retains_supplements() {
        debug!("helpers are retained after completion");
        return Ok(Requeue::None);
    }
    strategy.clean_up_supplements(vi).await
}

/// Kind of data an image is imported from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// File download
    Http,
    /// Container registry pull
    ContainerImage,
    /// User upload
    Upload,
    /// Another VirtualImage
    VirtualImage,
    /// A ClusterVirtualImage
    ClusterVirtualImage,
    /// A VirtualDisk
    VirtualDisk,
    /// A VirtualDiskSnapshot
    VirtualDiskSnapshot,
}

impl SourceKind {
    /// Source kind of an image
    pub fn of(vi: &VirtualImage) -> Result<Self> {
        let ds = &vi.spec.data_source;
        Ok(match ds.type_ {
            DataSourceType::Http => Self::Http,
            DataSourceType::ContainerImage => Self::ContainerImage,
            DataSourceType::Upload => Self::Upload,
            DataSourceType::ObjectRef => {
                let object_ref = ds.object_ref.as_ref().ok_or_else(|| {
                    Error::validation_for_field(
                        vi.name_any(),
                        "spec.dataSource.objectRef",
                        "nil object ref: ObjectRef",
                    )
                })?;
                match object_ref.kind {
                    ObjectRefKind::VirtualImage => Self::VirtualImage,
                    ObjectRefKind::ClusterVirtualImage => Self::ClusterVirtualImage,
                    ObjectRefKind::VirtualDisk => Self::VirtualDisk,
                    ObjectRefKind::VirtualDiskSnapshot => Self::VirtualDiskSnapshot,
                }
            }
        })
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Strategy per source kind
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<SourceKind, Arc<dyn SourceStrategy>>,
}

impl StrategyRegistry {
    /// Registry with every built-in strategy
    pub fn new(services: &Services) -> Self {
        let object_ref: Arc<dyn SourceStrategy> = Arc::new(ObjectRefImageStrategy::new(services.clone()));
        Self::default()
            .with(SourceKind::Http, Arc::new(HttpStrategy::new(services.clone())))
            .with(SourceKind::ContainerImage, Arc::new(RegistryStrategy::new(services.clone())))
            .with(SourceKind::Upload, Arc::new(UploadStrategy::new(services.clone())))
            .with(SourceKind::VirtualImage, object_ref.clone())
            .with(SourceKind::ClusterVirtualImage, object_ref)
            .with(SourceKind::VirtualDisk, Arc::new(ObjectRefDiskStrategy::new(services.clone())))
            .with(
                SourceKind::VirtualDiskSnapshot,
                Arc::new(ObjectRefSnapshotStrategy::new(services.clone())),
            )
    }

    /// Register `strategy` for `kind`, replacing any earlier one
    pub fn with(mut self, kind: SourceKind, strategy: Arc<dyn SourceStrategy>) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    /// Strategy of the image's source kind
    pub fn for_image(&self, vi: &VirtualImage) -> Result<Arc<dyn SourceStrategy>> {
        let kind = SourceKind::of(vi)?;
        self.strategies
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::internal_with_context("sources", format!("no strategy for data source {kind}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{http_image, object_ref_image, on_pvc, upload_image, Mocks};
    use rstest::rstest;

    // =========================================================================
    // Dispatch Stories
    // =========================================================================

    #[rstest]
    #[case(ObjectRefKind::VirtualImage, SourceKind::VirtualImage)]
    #[case(ObjectRefKind::ClusterVirtualImage, SourceKind::ClusterVirtualImage)]
    #[case(ObjectRefKind::VirtualDisk, SourceKind::VirtualDisk)]
    #[case(ObjectRefKind::VirtualDiskSnapshot, SourceKind::VirtualDiskSnapshot)]
    fn object_refs_are_keyed_by_referenced_kind(#[case] kind: ObjectRefKind, #[case] expected: SourceKind) {
        let vi = object_ref_image(kind, "base");
        assert_eq!(SourceKind::of(&vi).expect("kind"), expected);
    }

    #[test]
    fn object_ref_without_reference_is_rejected() {
        let mut vi = object_ref_image(ObjectRefKind::VirtualImage, "base");
        vi.spec.data_source.object_ref = None;
        assert!(SourceKind::of(&vi).is_err());
    }

    /// Story: every source kind has a built-in strategy
    #[test]
    fn registry_covers_every_source_kind() {
        let services = Mocks::new().build_silent();
        let registry = StrategyRegistry::new(&services);

        assert_eq!(registry.for_image(&http_image()).expect("http").name(), "http");
        assert_eq!(registry.for_image(&upload_image()).expect("upload").name(), "upload");
        for (kind, name) in [
            (ObjectRefKind::VirtualImage, "objectref"),
            (ObjectRefKind::ClusterVirtualImage, "objectref"),
            (ObjectRefKind::VirtualDisk, "objectref-vd"),
            (ObjectRefKind::VirtualDiskSnapshot, "objectref-vdsnapshot"),
        ] {
            let vi = object_ref_image(kind, "base");
            assert_eq!(registry.for_image(&vi).expect("strategy").name(), name);
        }
    }

    #[test]
    fn missing_strategy_is_an_internal_error() {
        let registry = StrategyRegistry::default();
        let err = registry.for_image(&http_image()).err().expect("error");
        assert!(matches!(err, Error::Internal { .. }));
    }

    /// Story: the storage kind picks the entry point
    #[tokio::test]
    async fn sync_dispatches_on_storage_kind() {
        let mut strategy = MockSourceStrategy::new();
        strategy.expect_name().return_const("mock");
        strategy
            .expect_store_to_registry()
            .times(1)
            .returning(|_, _| Ok(Requeue::Immediate));
        strategy
            .expect_store_to_volume()
            .times(1)
            .returning(|_, _| Ok(Requeue::None));

        let mut out = StatusFragment::new();
        assert_eq!(sync(&strategy, &http_image(), &mut out).await.expect("sync"), Requeue::Immediate);
        assert_eq!(sync(&strategy, &on_pvc(http_image()), &mut out).await.expect("sync"), Requeue::None);
    }

    #[tokio::test]
    async fn retained_helpers_skip_cleanup() {
        let mut strategy = MockSourceStrategy::new();
        strategy.expect_clean_up_supplements().never();

        let mut vi = http_image();
        vi.metadata.annotations = Some(
            [(virtimage_common::ANN_RETAIN_AFTER_COMPLETION.to_string(), "true".to_string())].into(),
        );
        assert_eq!(clean_up_finished(&strategy, &vi).await.expect("clean up"), Requeue::None);
    }
}
