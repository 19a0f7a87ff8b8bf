//! Custom Resource Definitions
//!
//! `VirtualImage` is the resource reconciled here. The other kinds are owned
//! by sibling controllers or storage subsystems and are only read.

mod cdi;
mod references;
mod snapshot;
mod virtual_image;

pub use cdi::{
    ClaimPropertySet, DataVolume, DataVolumeCondition, DataVolumePvcSource,
    DataVolumeRegistrySource, DataVolumeResources, DataVolumeSource, DataVolumeSpec, DataVolumeStatus,
    DataVolumeStorage, StorageProfile, StorageProfileSpec, StorageProfileStatus,
    DATA_VOLUME_QUOTA_NOT_EXCEEDED, DATA_VOLUME_RUNNING, IMAGE_PULL_FAILED_REASON,
};
pub use references::{
    BlockDeviceRef, ClusterImageObjectRef, ClusterVirtualImage, ClusterVirtualImageDataSource,
    ClusterVirtualImageSpec, ClusterVirtualImageStatus, DiskDataSource, DiskObjectRef,
    VirtualDisk, VirtualDiskPersistentVolumeClaim, VirtualDiskSnapshot, VirtualDiskSnapshotSpec,
    VirtualDiskSnapshotStatus, VirtualDiskSpec, VirtualDiskStatus, VirtualDiskTarget,
    VirtualMachine, VirtualMachineSpec, VirtualMachineStatus, REF_PHASE_READY,
};
pub use snapshot::{
    VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec, VolumeSnapshotStatus,
    VOLUME_SNAPSHOT_API_GROUP, VOLUME_SNAPSHOT_KIND,
};
pub use virtual_image::{
    Checksum, ContainerImageSource, DataSourceType, DownloadSpeed, HttpSource, ImageDataSource,
    ImageObjectRef, ImagePhase, ImagePullSecretName, ImageSize, ImageTarget, ImageUploadUrls,
    ObjectRefKind, StorageKind, VirtualImage, VirtualImagePersistentVolumeClaim, VirtualImageSpec,
    VirtualImageStatus, VIRTUAL_IMAGE_KIND,
};
