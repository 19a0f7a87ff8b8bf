//! Import of another VirtualImage or a ClusterVirtualImage
//!
//! A registry-backed upstream is copied DVCR to DVCR by the importer. An
//! upstream VirtualImage on a claim is read as a block device when the
//! destination is DVCR, and cloned by a DataVolume when the destination is
//! a claim.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::debug;

use virtimage_common::conditions::ConditionType;
use virtimage_common::crd::{
    ClusterVirtualImage, DataVolumePvcSource, DataVolumeSource, ImageObjectRef, ImagePhase, ObjectRefKind,
    VirtualImage,
};
use virtimage_common::supplements::{SupplementName, SupplementNames};
use virtimage_common::{DataSourceError, Error, Result};

use super::import::{self, dvcr_volume_source, Launch};
use super::SourceStrategy;
use crate::requeue::Requeue;
use crate::services::importer::ImportSource;
use crate::services::objects::is_terminating;
use crate::services::Services;
use crate::status::{ConditionScope, StatusFragment};
use crate::step::{CreateDataVolumeStep, Pipeline, ReadyVolumeStep, TerminatingStep, WaitForDataVolumeStep};

/// What an image needs to know about the image it copies
#[derive(Clone, Debug, Default, PartialEq)]
struct Upstream {
    uid: Option<String>,
    ready: bool,
    registry_url: Option<String>,
    claim: Option<SupplementName>,
    unpacked_bytes: Option<String>,
}

impl From<&VirtualImage> for Upstream {
    fn from(image: &VirtualImage) -> Self {
        let status = image.status.as_ref();
        let target = status.and_then(|s| s.target.as_ref());
        let claim = target
            .and_then(|t| t.persistent_volume_claim_name.clone())
            .filter(|_| image.spec.storage.is_volume())
            .map(|name| SupplementName {
                name,
                namespace: image.namespace_or_default(),
            });
        Self {
            uid: image.uid(),
            ready: image.phase() == ImagePhase::Ready,
            registry_url: target.and_then(|t| t.registry_url.clone()),
            claim,
            unpacked_bytes: status
                .and_then(|s| s.size.as_ref())
                .map(|s| s.unpacked_bytes.clone()),
        }
    }
}

impl From<&ClusterVirtualImage> for Upstream {
    fn from(image: &ClusterVirtualImage) -> Self {
        let status = image.status.as_ref();
        Self {
            uid: image.uid(),
            ready: image.is_ready(),
            registry_url: status
                .and_then(|s| s.target.as_ref())
                .and_then(|t| t.registry_url.clone()),
            claim: None,
            unpacked_bytes: status
                .and_then(|s| s.size.as_ref())
                .map(|s| s.unpacked_bytes.clone()),
        }
    }
}

fn not_ready(object_ref: &ImageObjectRef) -> Error {
    match object_ref.kind {
        ObjectRefKind::ClusterVirtualImage => DataSourceError::ClusterImageNotReady(object_ref.name.clone()).into(),
        _ => DataSourceError::ImageNotReady(object_ref.name.clone()).into(),
    }
}

/// Strategy for `ObjectRef` sources of kind VirtualImage and ClusterVirtualImage
pub struct ObjectRefImageStrategy {
    services: Services,
}

impl ObjectRefImageStrategy {
    /// Create the strategy
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn object_ref<'a>(&self, vi: &'a VirtualImage) -> Result<&'a ImageObjectRef> {
        vi.spec.data_source.object_ref.as_ref().ok_or_else(|| {
            Error::validation_for_field(vi.name_any(), "spec.dataSource.objectRef", "nil object ref: ObjectRef")
        })
    }

    async fn upstream(&self, vi: &VirtualImage) -> Result<Option<Upstream>> {
        let object_ref = self.object_ref(vi)?;
        let upstream = match object_ref.kind {
            ObjectRefKind::VirtualImage => self
                .services
                .store
                .get_image(&object_ref.name, &vi.namespace_or_default())
                .await?
                .as_ref()
                .map(Upstream::from),
            ObjectRefKind::ClusterVirtualImage => self
                .services
                .store
                .get_cluster_image(&object_ref.name)
                .await?
                .as_ref()
                .map(Upstream::from),
            kind => {
                return Err(Error::internal_with_context(
                    "objectref",
                    format!("unexpected object ref kind {}", kind.as_str()),
                ))
            }
        };
        Ok(upstream)
    }

    /// Upstream that can be read right now
    async fn ready_upstream(&self, vi: &VirtualImage) -> Result<Upstream> {
        match self.upstream(vi).await? {
            Some(upstream) if upstream.ready => Ok(upstream),
            _ => Err(not_ready(self.object_ref(vi)?)),
        }
    }

    fn launch(&self, upstream: Result<Upstream>) -> Result<Launch> {
        let upstream = upstream?;
        let mut launch = match upstream.claim {
            Some(claim) => {
                let mut launch = Launch::new(ImportSource::BlockDevice);
                launch.source_pvc = Some(claim);
                launch
            }
            None => {
                let image = upstream
                    .registry_url
                    .ok_or_else(|| Error::internal_with_context("objectref", "upstream image has no registry URL"))?;
                Launch::new(ImportSource::Dvcr { image })
            }
        };
        launch.source_uid = upstream.uid;
        Ok(launch)
    }

    /// Clone the upstream into the image's claim with a DataVolume
    async fn clone_to_volume(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let names = SupplementNames::for_image(vi);
        let dv = self.services.disk.get_data_volume(&names).await?;
        let pvc = self.services.disk.get_pvc(&names).await?;

        // The upstream is only read while the DataVolume does not exist.
        let upstream = if vi.is_provisioning_finished() || dv.is_some() {
            Upstream::default()
        } else {
            self.ready_upstream(vi).await?
        };
        let source = match &upstream.claim {
            Some(claim) => DataVolumeSource {
                registry: None,
                pvc: Some(DataVolumePvcSource {
                    namespace: claim.namespace.clone(),
                    name: claim.name.clone(),
                }),
            },
            None => dvcr_volume_source(&self.services, &names, upstream.registry_url.as_deref().unwrap_or_default()),
        };
        let size = Quantity(upstream.unpacked_bytes.clone().unwrap_or_default());

        let mut scope = ConditionScope::new(ConditionType::Ready, vi, out);
        let (cb, out) = scope.split();

        // Bound so the pipeline drops before the objects its steps borrow.
        let requeue = Pipeline::new()
            .then(ReadyVolumeStep::new(&self.services, self, pvc.as_ref()).data_volume(dv.as_ref()))
            .then(TerminatingStep::new(
                is_terminating(dv.as_ref()) || is_terminating(pvc.as_ref()),
            ))
            .then(CreateDataVolumeStep::new(&self.services, dv.as_ref(), source, size).source_uid(upstream.uid.clone()))
            .then(WaitForDataVolumeStep::new(&self.services, dv.as_ref(), pvc.as_ref()))
            .run(vi, cb, out)
            .await;
        requeue
    }
}

#[async_trait]
impl SourceStrategy for ObjectRefImageStrategy {
    fn name(&self) -> &'static str {
        "objectref"
    }

    async fn store_to_registry(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let upstream = self.ready_upstream(vi).await;
        import::store_to_registry(&self.services, self, vi, out, self.launch(upstream)).await
    }

    async fn store_to_volume(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        self.clone_to_volume(vi, out).await
    }

    async fn clean_up(&self, vi: &VirtualImage) -> Result<bool> {
        import::clean_up(&self.services, vi).await
    }

    async fn clean_up_supplements(&self, vi: &VirtualImage) -> Result<Requeue> {
        import::clean_up_supplements(&self.services, vi).await
    }

    async fn validate(&self, vi: &VirtualImage) -> Result<()> {
        let object_ref = self.object_ref(vi)?;
        match self.upstream(vi).await? {
            Some(upstream) if upstream.ready => Ok(()),
            _ => {
                debug!(kind = object_ref.kind.as_str(), name = %object_ref.name, "referenced image is not ready");
                Err(not_ready(object_ref))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{data_volume, http_image, object_ref_image, on_pvc, pvc, with_condition, with_phase, Mocks};
    use virtimage_common::conditions::{ConditionStatus, ReadyReason};
    use virtimage_common::crd::{
        ClusterVirtualImageSpec, ClusterVirtualImageStatus, ImageSize, ImageTarget, VirtualImageStatus,
    };

    fn upstream_in_registry() -> VirtualImage {
        let mut base = with_phase(http_image(), ImagePhase::Ready);
        base.metadata.name = Some("base".to_string());
        base.metadata.uid = Some("base-uid".to_string());
        if let Some(status) = base.status.as_mut() {
            status.target = Some(ImageTarget {
                registry_url: Some("dvcr.local/vi/vms/base:base-uid".to_string()),
                persistent_volume_claim_name: None,
            });
            status.size = Some(ImageSize {
                unpacked_bytes: "2147483648".to_string(),
                ..Default::default()
            });
        }
        base
    }

    fn upstream_on_claim() -> VirtualImage {
        let mut base = on_pvc(upstream_in_registry());
        if let Some(target) = base.status.as_mut().and_then(|s| s.target.as_mut()) {
            target.registry_url = None;
            target.persistent_volume_claim_name = Some("d8v-vi-base-base-uid".to_string());
        }
        base
    }

    fn cluster_image(phase: &str) -> ClusterVirtualImage {
        let mut cvi = ClusterVirtualImage::new("debian", ClusterVirtualImageSpec::default());
        cvi.metadata.uid = Some("cvi-uid".to_string());
        cvi.status = Some(ClusterVirtualImageStatus {
            phase: phase.to_string(),
            target: Some(ImageTarget {
                registry_url: Some("dvcr.local/cvi/debian:cvi-uid".to_string()),
                persistent_volume_claim_name: None,
            }),
            ..Default::default()
        });
        cvi
    }

    // =========================================================================
    // Validation Stories
    // =========================================================================

    /// Story: the image waits until the referenced image is Ready
    #[tokio::test]
    async fn pending_upstream_image_is_not_ready() {
        let mut mocks = Mocks::new();
        mocks.store.expect_get_image().returning(|_, _| {
            let mut base = upstream_in_registry();
            base.status = Some(VirtualImageStatus {
                phase: ImagePhase::Provisioning,
                ..Default::default()
            });
            Ok(Some(base))
        });
        let strategy = ObjectRefImageStrategy::new(mocks.build());

        let err = strategy
            .validate(&object_ref_image(ObjectRefKind::VirtualImage, "base"))
            .await
            .expect_err("not ready");
        assert_eq!(err.to_string(), "VirtualImage \"base\" not ready");
    }

    #[tokio::test]
    async fn missing_cluster_image_is_not_ready() {
        let mut mocks = Mocks::new();
        mocks.store.expect_get_cluster_image().returning(|_| Ok(None));
        let strategy = ObjectRefImageStrategy::new(mocks.build());

        let err = strategy
            .validate(&object_ref_image(ObjectRefKind::ClusterVirtualImage, "debian"))
            .await
            .expect_err("missing");
        assert!(matches!(err, Error::DataSource(DataSourceError::ClusterImageNotReady(ref n)) if n == "debian"));
    }

    #[tokio::test]
    async fn ready_cluster_image_passes() {
        let mut mocks = Mocks::new();
        mocks
            .store
            .expect_get_cluster_image()
            .returning(|_| Ok(Some(cluster_image("Ready"))));
        let strategy = ObjectRefImageStrategy::new(mocks.build());

        strategy
            .validate(&object_ref_image(ObjectRefKind::ClusterVirtualImage, "debian"))
            .await
            .expect("ready");
    }

    // =========================================================================
    // Registry Stories
    // =========================================================================

    /// Story: a registry upstream is copied DVCR to DVCR
    #[tokio::test]
    async fn registry_upstream_is_copied_from_dvcr() {
        let mut mocks = Mocks::new();
        mocks
            .store
            .expect_get_image()
            .withf(|name, ns| name == "base" && ns == "vms")
            .returning(|_, _| Ok(Some(upstream_in_registry())));
        mocks.importer.expect_get_pod().returning(|_| Ok(None));
        mocks
            .importer
            .expect_start()
            .withf(|r| {
                r.source
                    == ImportSource::Dvcr {
                        image: "dvcr.local/vi/vms/base:base-uid".to_string(),
                    }
            })
            .times(1)
            .returning(|_| Ok(()));
        let strategy = ObjectRefImageStrategy::new(mocks.build());
        let mut out = StatusFragment::new();

        strategy
            .store_to_registry(&object_ref_image(ObjectRefKind::VirtualImage, "base"), &mut out)
            .await
            .expect("sync");

        assert_eq!(out.phase, Some(ImagePhase::Provisioning));
        assert_eq!(out.source_uid.as_deref(), Some("base-uid"));
    }

    /// Story: an upstream on a claim is read as a block device
    #[tokio::test]
    async fn claim_upstream_is_mounted_into_the_importer() {
        let mut mocks = Mocks::new();
        mocks
            .store
            .expect_get_image()
            .returning(|_, _| Ok(Some(upstream_on_claim())));
        mocks.importer.expect_get_pod().returning(|_| Ok(None));
        mocks
            .importer
            .expect_start()
            .withf(|r| {
                r.source == ImportSource::BlockDevice
                    && r.source_pvc.as_ref().is_some_and(|p| p.name == "d8v-vi-base-base-uid" && p.namespace == "vms")
            })
            .times(1)
            .returning(|_| Ok(()));
        let strategy = ObjectRefImageStrategy::new(mocks.build());
        let mut out = StatusFragment::new();

        strategy
            .store_to_registry(&object_ref_image(ObjectRefKind::VirtualImage, "base"), &mut out)
            .await
            .expect("sync");
    }

    /// Story: a finished copy does not need the upstream anymore
    #[tokio::test]
    async fn finished_copy_survives_upstream_deletion() {
        let mut mocks = Mocks::new();
        mocks.allow_clean_up();
        mocks.store.expect_get_image().returning(|_, _| Ok(None));
        mocks.importer.expect_get_pod().returning(|_| Ok(None));
        mocks.importer.expect_start().never();
        let strategy = ObjectRefImageStrategy::new(mocks.build());
        let mut out = StatusFragment::new();

        let vi = with_condition(
            with_phase(object_ref_image(ObjectRefKind::VirtualImage, "base"), ImagePhase::Ready),
            ConditionStatus::True,
            ReadyReason::Ready,
        );
        strategy.store_to_registry(&vi, &mut out).await.expect("sync");

        assert_eq!(out.phase, Some(ImagePhase::Ready));
    }

    // =========================================================================
    // Volume Stories
    // =========================================================================

    /// Story: a cluster image in DVCR is imported into the claim by a DataVolume
    #[tokio::test]
    async fn cluster_image_is_imported_into_the_claim() {
        let mut mocks = Mocks::new();
        mocks.store.expect_get_cluster_image().returning(|_| {
            let mut cvi = cluster_image("Ready");
            if let Some(status) = cvi.status.as_mut() {
                status.size = Some(ImageSize {
                    unpacked_bytes: "1073741824".to_string(),
                    ..Default::default()
                });
            }
            Ok(Some(cvi))
        });
        mocks.disk.expect_get_data_volume().returning(|_| Ok(None));
        mocks.disk.expect_get_pvc().returning(|_| Ok(None));
        mocks.with_class();
        mocks
            .disk
            .expect_start_immediate()
            .withf(|r| {
                r.size.0 == "1073741824"
                    && r.source
                        .registry
                        .as_ref()
                        .is_some_and(|s| s.url == "docker://dvcr.local/cvi/debian:cvi-uid")
            })
            .times(1)
            .returning(|_| Ok(()));
        let strategy = ObjectRefImageStrategy::new(mocks.build());
        let mut out = StatusFragment::new();

        let vi = on_pvc(object_ref_image(ObjectRefKind::ClusterVirtualImage, "debian"));
        strategy.store_to_volume(&vi, &mut out).await.expect("sync");

        assert_eq!(out.phase, Some(ImagePhase::Provisioning));
        assert_eq!(out.source_uid.as_deref(), Some("cvi-uid"));
    }

    /// Story: a running clone reports DataVolume progress
    #[tokio::test]
    async fn running_clone_waits_for_the_claim() {
        let mut mocks = Mocks::new();
        mocks.store.expect_get_image().never();
        mocks
            .disk
            .expect_get_data_volume()
            .returning(|_| Ok(Some(data_volume("CloneInProgress"))));
        mocks.disk.expect_get_pvc().returning(|_| Ok(Some(pvc("Bound"))));
        mocks.disk.expect_protect().times(1).returning(|_, _, _| Ok(()));
        let strategy = ObjectRefImageStrategy::new(mocks.build());
        let mut out = StatusFragment::new();

        let vi = on_pvc(object_ref_image(ObjectRefKind::VirtualImage, "base"));
        strategy.store_to_volume(&vi, &mut out).await.expect("sync");

        assert_eq!(out.progress.as_deref(), Some("40.0%"));
    }
}
