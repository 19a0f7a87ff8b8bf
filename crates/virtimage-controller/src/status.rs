//! Status fragments and scoped condition writes
//!
//! Handlers never mutate the image they are given. Each one fills a
//! [`StatusFragment`] with the fields it owns; the reconciler applies the
//! fragments in handler order and persists the result with a single patch.
//!
//! A [`ConditionScope`] owns the builder of one condition axis and pushes it
//! into the fragment when dropped, so a condition set before an early return
//! or an error is still written.

use virtimage_common::conditions::{self, ConditionBuilder, ConditionType};
use virtimage_common::crd::{
    DownloadSpeed, ImagePhase, ImageSize, ImageTarget, ImageUploadUrls, VirtualImage,
    VirtualImageStatus,
};

/// Status fields written by one handler; `None` leaves a field untouched
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusFragment {
    /// Clear import results before applying anything else
    pub reset: bool,
    /// New phase
    pub phase: Option<ImagePhase>,
    /// New progress
    pub progress: Option<String>,
    /// New download speed
    pub download_speed: Option<DownloadSpeed>,
    /// New sizes
    pub size: Option<ImageSize>,
    /// New format
    pub format: Option<String>,
    /// New CD-ROM flag
    pub cdrom: Option<bool>,
    /// Resolved storage class
    pub storage_class_name: Option<String>,
    /// UID of the upstream object
    pub source_uid: Option<String>,
    /// Registry target; clears the claim target
    pub registry_url: Option<String>,
    /// Claim target; clears the registry target
    pub pvc_name: Option<String>,
    /// Upload endpoints
    pub upload_urls: Option<ImageUploadUrls>,
    conditions: Vec<ConditionBuilder>,
    removed: Vec<ConditionType>,
}

impl StatusFragment {
    /// Empty fragment
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a complete condition record, replacing an earlier one of the same axis
    pub fn set_condition(&mut self, cb: ConditionBuilder) {
        let type_ = cb.condition_type();
        self.removed.retain(|t| *t != type_);
        self.conditions.retain(|c| c.condition_type() != type_);
        self.conditions.push(cb);
    }

    /// Drop a condition axis from the status
    pub fn remove_condition(&mut self, type_: ConditionType) {
        self.conditions.retain(|c| c.condition_type() != type_);
        if !self.removed.contains(&type_) {
            self.removed.push(type_);
        }
    }

    /// Builder written for an axis, if any
    pub fn condition(&self, type_: ConditionType) -> Option<&ConditionBuilder> {
        self.conditions.iter().find(|c| c.condition_type() == type_)
    }

    /// Whether the fragment removes an axis
    pub fn removes(&self, type_: ConditionType) -> bool {
        self.removed.contains(&type_)
    }

    /// Layer `later` on top of this fragment; fields set in `later` win
    pub fn merge(&mut self, later: StatusFragment) {
        if later.reset {
            *self = StatusFragment {
                conditions: std::mem::take(&mut self.conditions),
                removed: std::mem::take(&mut self.removed),
                storage_class_name: self.storage_class_name.take(),
                reset: true,
                ..Default::default()
            };
        }

        macro_rules! take {
            ($($field:ident),+) => {
                $(if later.$field.is_some() { self.$field = later.$field; })+
            };
        }
        take!(
            phase,
            progress,
            download_speed,
            size,
            format,
            cdrom,
            storage_class_name,
            source_uid,
            upload_urls
        );

        if later.registry_url.is_some() {
            self.registry_url = later.registry_url;
            self.pvc_name = None;
        }
        if later.pvc_name.is_some() {
            self.pvc_name = later.pvc_name;
            self.registry_url = None;
        }

        for type_ in later.removed {
            self.remove_condition(type_);
        }
        for cb in later.conditions {
            self.set_condition(cb);
        }
    }

    /// Apply the fragment to a status
    ///
    /// A reset keeps the conditions and the resolved storage class and
    /// clears every import result.
    pub fn apply(&self, status: &mut VirtualImageStatus) {
        if self.reset {
            *status = VirtualImageStatus {
                phase: ImagePhase::Pending,
                conditions: std::mem::take(&mut status.conditions),
                storage_class_name: status.storage_class_name.take(),
                observed_generation: status.observed_generation,
                ..Default::default()
            };
        }

        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        if let Some(progress) = &self.progress {
            status.progress = Some(progress.clone());
        }
        if let Some(speed) = &self.download_speed {
            status.download_speed = Some(speed.clone());
        }
        if let Some(size) = &self.size {
            status.size = Some(size.clone());
        }
        if let Some(format) = &self.format {
            status.format = Some(format.clone()).filter(|f| !f.is_empty());
        }
        if let Some(cdrom) = self.cdrom {
            status.cdrom = cdrom;
        }
        if let Some(class) = &self.storage_class_name {
            status.storage_class_name = Some(class.clone());
        }
        if let Some(uid) = &self.source_uid {
            status.source_uid = Some(uid.clone());
        }
        if let Some(url) = &self.registry_url {
            status.target = Some(ImageTarget {
                registry_url: Some(url.clone()),
                persistent_volume_claim_name: None,
            });
        }
        if let Some(pvc) = &self.pvc_name {
            status.target = Some(ImageTarget {
                registry_url: None,
                persistent_volume_claim_name: Some(pvc.clone()),
            });
        }
        if let Some(urls) = &self.upload_urls {
            status.image_upload_urls = Some(urls.clone());
        }

        for type_ in &self.removed {
            conditions::remove(*type_, &mut status.conditions);
        }
        for cb in &self.conditions {
            conditions::set(cb, &mut status.conditions);
        }
    }

    /// Apply the fragment to an in-memory image
    pub fn apply_to(&self, vi: &mut VirtualImage) {
        let status = vi.status.get_or_insert_with(Default::default);
        self.apply(status);
    }
}

/// Builder of one condition axis, written into a fragment when dropped
///
/// The builder is written only if a reason was set; an untouched scope
/// leaves the existing record alone.
pub struct ConditionScope<'a> {
    cb: ConditionBuilder,
    out: &'a mut StatusFragment,
}

impl<'a> ConditionScope<'a> {
    /// Open a scope for `type_` stamped with the image generation
    pub fn new(type_: ConditionType, vi: &VirtualImage, out: &'a mut StatusFragment) -> Self {
        Self {
            cb: ConditionBuilder::new(type_).generation(vi.generation()),
            out,
        }
    }

    /// Builder and fragment, borrowed together
    pub fn split(&mut self) -> (&mut ConditionBuilder, &mut StatusFragment) {
        (&mut self.cb, &mut *self.out)
    }

    /// Builder of the scoped axis
    pub fn builder(&mut self) -> &mut ConditionBuilder {
        &mut self.cb
    }

    /// Fragment the condition is written into
    pub fn fragment(&mut self) -> &mut StatusFragment {
        &mut *self.out
    }
}

impl Drop for ConditionScope<'_> {
    fn drop(&mut self) {
        if self.cb.is_set() {
            let fresh = ConditionBuilder::new(self.cb.condition_type());
            self.out.set_condition(std::mem::replace(&mut self.cb, fresh));
        }
    }
}
