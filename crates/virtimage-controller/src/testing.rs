//! Test fixtures shared by the unit tests of this crate

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateTerminated, ContainerStatus, EnvVar, ObjectReference,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Pod, PodCondition,
    PodSpec, PodStatus,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::events::EventType;

use virtimage_common::conditions::{self, ConditionBuilder, ConditionReason, ConditionStatus};
use virtimage_common::crd::{
    ContainerImageSource, DataSourceType, DataVolume, DataVolumeSpec, DataVolumeStatus, HttpSource,
    ImageDataSource, ImageObjectRef, ImagePhase, ObjectRefKind, StorageKind, StorageProfile,
    StorageProfileSpec, VirtualImage, VirtualImageSpec,
};
use virtimage_common::events::{EventPublisher, NoopEventPublisher};
use virtimage_common::supplements::SupplementNames;
use virtimage_common::{ANN_PROGRESS, IMAGE_CLEANUP_FINALIZER};

use crate::services::bounder::MockBounder;
use crate::services::disk::MockDiskService;
use crate::services::importer::MockImporter;
use crate::services::object_store::MockObjectStore;
use crate::services::registry::MockRegistryProbe;
use crate::services::stat::IMPORTER_DESTINATION_ENV;
use crate::services::uploader::MockUploader;
use crate::services::{Services, StorageClassPolicy};
use crate::settings::{ControllerSettings, DvcrSettings};
use crate::status::StatusFragment;

/// UID of every fixture image
pub(crate) const UID: &str = "11111111-2222-3333-4444-555555555555";

/// Final report of a successful qcow2 import
pub(crate) const REPORT: &str = r#"{"source-image-size":104857600,"source-image-virtual-size":2147483648,"source-image-format":"qcow2","average-speed":10485760,"current-speed":5242880}"#;

pub(crate) fn test_settings() -> ControllerSettings {
    ControllerSettings {
        dvcr: DvcrSettings {
            registry_url: "dvcr.local".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

// =============================================================================
// Images
// =============================================================================

/// Image "ubuntu" in namespace "vms" at generation 1
pub(crate) fn image(storage: StorageKind, data_source: ImageDataSource) -> VirtualImage {
    let mut vi = VirtualImage::new(
        "ubuntu",
        VirtualImageSpec {
            storage,
            persistent_volume_claim: None,
            data_source,
        },
    );
    vi.metadata = ObjectMeta {
        name: Some("ubuntu".to_string()),
        namespace: Some("vms".to_string()),
        uid: Some(UID.to_string()),
        generation: Some(1),
        resource_version: Some("1".to_string()),
        creation_timestamp: Some(Time(Utc::now())),
        ..Default::default()
    };
    vi
}

fn source(type_: DataSourceType) -> ImageDataSource {
    ImageDataSource {
        type_,
        http: None,
        container_image: None,
        object_ref: None,
    }
}

pub(crate) fn http_image() -> VirtualImage {
    let mut ds = source(DataSourceType::Http);
    ds.http = Some(HttpSource {
        url: "https://example.com/ubuntu.img".to_string(),
        ..Default::default()
    });
    image(StorageKind::ContainerRegistry, ds)
}

pub(crate) fn container_image(pull_secret: Option<&str>) -> VirtualImage {
    let mut ds = source(DataSourceType::ContainerImage);
    ds.container_image = Some(ContainerImageSource {
        image: "registry.example.com/ubuntu:22.04".to_string(),
        image_pull_secret: pull_secret.map(|name| virtimage_common::crd::ImagePullSecretName {
            name: Some(name.to_string()),
        }),
        ca_bundle: None,
    });
    image(StorageKind::ContainerRegistry, ds)
}

pub(crate) fn upload_image() -> VirtualImage {
    image(StorageKind::ContainerRegistry, source(DataSourceType::Upload))
}

pub(crate) fn object_ref_image(kind: ObjectRefKind, name: &str) -> VirtualImage {
    let mut ds = source(DataSourceType::ObjectRef);
    ds.object_ref = Some(ImageObjectRef {
        kind,
        name: name.to_string(),
    });
    image(StorageKind::ContainerRegistry, ds)
}

/// Move the image to volume-backed storage
pub(crate) fn on_pvc(mut vi: VirtualImage) -> VirtualImage {
    vi.spec.storage = StorageKind::PersistentVolumeClaim;
    let status = vi.status.get_or_insert_with(Default::default);
    status.storage_class_name = Some("linstor".to_string());
    vi
}

/// Write a condition stamped with the current generation
pub(crate) fn with_condition<R: ConditionReason>(
    mut vi: VirtualImage,
    status: ConditionStatus,
    reason: R,
) -> VirtualImage {
    let mut cb = ConditionBuilder::new(R::TYPE).generation(vi.generation());
    cb.status(status).reason(reason);
    let st = vi.status.get_or_insert_with(Default::default);
    conditions::set(&cb, &mut st.conditions);
    vi
}

pub(crate) fn with_phase(mut vi: VirtualImage, phase: ImagePhase) -> VirtualImage {
    vi.status.get_or_insert_with(Default::default).phase = phase;
    vi
}

/// Image with a deletion request and the cleanup finalizer
pub(crate) fn terminating_image(mut vi: VirtualImage) -> VirtualImage {
    vi.metadata.deletion_timestamp = Some(Time(Utc::now()));
    vi.metadata.finalizers = Some(vec![IMAGE_CLEANUP_FINALIZER.to_string()]);
    vi
}

/// Mark the current generation as already reconciled
pub(crate) fn observed(mut vi: VirtualImage) -> VirtualImage {
    let generation = vi.generation();
    vi.status.get_or_insert_with(Default::default).observed_generation = Some(generation);
    vi
}

/// Image after a fragment is applied
pub(crate) fn applied(vi: &VirtualImage, out: &StatusFragment) -> VirtualImage {
    let mut vi = vi.clone();
    out.apply_to(&mut vi);
    vi
}

// =============================================================================
// Pods and claims
// =============================================================================

pub(crate) fn running_pod() -> Pod {
    let names = SupplementNames::for_image(&http_image());
    let pod_name = names.importer_pod();
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.name),
            namespace: Some(pod_name.namespace),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "importer".to_string(),
                env: Some(vec![EnvVar {
                    name: IMPORTER_DESTINATION_ENV.to_string(),
                    value: Some(format!("dvcr.local/vi/vms/ubuntu:{UID}")),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

fn terminated_pod(phase: &str, message: &str) -> Pod {
    let mut pod = running_pod();
    pod.status = Some(PodStatus {
        phase: Some(phase.to_string()),
        container_statuses: Some(vec![ContainerStatus {
            name: "importer".to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: if phase == "Succeeded" { 0 } else { 1 },
                    message: Some(message.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

pub(crate) fn unscheduled_pod(message: &str) -> Pod {
    let mut pod = running_pod();
    pod.status = Some(PodStatus {
        phase: Some("Pending".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "PodScheduled".to_string(),
            status: "False".to_string(),
            message: Some(message.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

pub(crate) fn succeeded_pod() -> Pod {
    terminated_pod("Succeeded", REPORT)
}

pub(crate) fn failed_pod(message: &str) -> Pod {
    terminated_pod("Failed", message)
}

pub(crate) fn pod_with_progress(progress: &str) -> Pod {
    let mut pod = running_pod();
    pod.metadata.annotations = Some(BTreeMap::from([(
        ANN_PROGRESS.to_string(),
        progress.to_string(),
    )]));
    pod
}

pub(crate) fn terminating(mut pod: Pod) -> Pod {
    pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    pod
}

/// Claim in the given phase, named after the image's claim
pub(crate) fn pvc(phase: &str) -> PersistentVolumeClaim {
    let name = SupplementNames::for_image(&http_image()).persistent_volume_claim();
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.name),
            namespace: Some(name.namespace),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some("linstor".to_string()),
            volume_mode: Some("Block".to_string()),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some(phase.to_string()),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity("2Gi".to_string()),
            )])),
            ..Default::default()
        }),
    }
}

/// DataVolume of the fixture image in the given phase, 40% done
pub(crate) fn data_volume(phase: &str) -> DataVolume {
    let names = SupplementNames::for_image(&http_image());
    let mut dv = DataVolume::new(&names.data_volume().name, DataVolumeSpec::default());
    dv.metadata.namespace = Some(names.namespace().to_string());
    dv.status = Some(DataVolumeStatus {
        phase: phase.to_string(),
        progress: Some("40.0%".to_string()),
        claim_name: Some(names.persistent_volume_claim().name),
        conditions: Vec::new(),
    });
    dv
}

// =============================================================================
// Services
// =============================================================================

/// Event publisher remembering the reasons it was asked to publish
#[derive(Clone, Default)]
pub(crate) struct RecordingEvents {
    reasons: Arc<Mutex<Vec<String>>>,
}

impl RecordingEvents {
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

/// One mock per service seam
pub(crate) struct Mocks {
    pub store: MockObjectStore,
    pub importer: MockImporter,
    pub uploader: MockUploader,
    pub bounder: MockBounder,
    pub disk: MockDiskService,
    pub registry: MockRegistryProbe,
    pub events: RecordingEvents,
    pub settings: ControllerSettings,
}

impl Mocks {
    pub(crate) fn new() -> Self {
        Self {
            store: MockObjectStore::new(),
            importer: MockImporter::new(),
            uploader: MockUploader::new(),
            bounder: MockBounder::new(),
            disk: MockDiskService::new(),
            registry: MockRegistryProbe::new(),
            events: RecordingEvents::default(),
            settings: test_settings(),
        }
    }

    /// Accept every cleanup call without deleting anything
    pub(crate) fn allow_clean_up(&mut self) {
        self.importer.expect_clean_up().returning(|_| Ok(false));
        self.importer.expect_clean_up_supplements().returning(|_| Ok(false));
        self.importer.expect_unprotect().returning(|_| Ok(()));
        self.uploader.expect_clean_up().returning(|_| Ok(false));
        self.uploader.expect_clean_up_supplements().returning(|_| Ok(false));
        self.uploader.expect_unprotect().returning(|_| Ok(()));
        self.bounder.expect_clean_up_supplements().returning(|_| Ok(false));
        self.bounder.expect_unprotect().returning(|_| Ok(()));
        self.disk.expect_clean_up().returning(|_| Ok(false));
        self.disk.expect_clean_up_supplements().returning(|_| Ok(false));
        self.disk.expect_unprotect().returning(|_| Ok(()));
    }

    /// Every storage class exists and has a storage profile
    pub(crate) fn with_class(&mut self) {
        self.store.expect_get_storage_class().returning(|name| {
            Ok(Some(StorageClass {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                provisioner: "linstor".to_string(),
                ..Default::default()
            }))
        });
        self.store
            .expect_get_storage_profile()
            .returning(|name| Ok(Some(StorageProfile::new(name, StorageProfileSpec::default()))));
    }

    pub(crate) fn build(self) -> Services {
        let events = Arc::new(self.events.clone());
        self.build_with(events)
    }

    /// Services for code paths that publish no events
    pub(crate) fn build_silent(self) -> Services {
        self.build_with(Arc::new(NoopEventPublisher))
    }

    fn build_with(self, events: Arc<dyn EventPublisher>) -> Services {
        Services {
            store: Arc::new(self.store),
            importer: Arc::new(self.importer),
            uploader: Arc::new(self.uploader),
            bounder: Arc::new(self.bounder),
            disk: Arc::new(self.disk),
            registry: Arc::new(self.registry),
            events,
            storage_class: StorageClassPolicy::new(self.settings.storage_class.clone()),
            settings: self.settings,
        }
    }
}
