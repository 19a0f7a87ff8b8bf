//! InUse: who consumes the image

use async_trait::async_trait;
use kube::ResourceExt;

use virtimage_common::conditions::{self, ConditionStatus, ConditionType, InUseReason};
use virtimage_common::crd::VirtualImage;
use virtimage_common::format::capitalize_first_letter;
use virtimage_common::Result;

use super::Handler;
use crate::requeue::Requeue;
use crate::services::Services;
use crate::status::{ConditionScope, StatusFragment};

fn describe_machines(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("The VirtualImage is currently attached to the VirtualMachine {one}")),
        [_, _] | [_, _, _] => Some(format!(
            "The VirtualImage is currently attached to the VirtualMachines: {}",
            names.join(", ")
        )),
        _ => Some(format!("{} VirtualMachines are using the VirtualImage", names.len())),
    }
}

fn describe_created(kind: &str, names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("VirtualImage is currently being used to create the {kind} {one}")),
        [_, _] | [_, _, _] => Some(format!(
            "VirtualImage is currently being used to create the {kind}s: {}",
            names.join(", ")
        )),
        _ => Some(format!("VirtualImage is used to create {} {kind}s", names.len())),
    }
}

/// Message of the InUse condition, `None` without consumers
pub fn in_use_message(
    machines: &[String],
    disks: &[String],
    images: &[String],
    cluster_images: &[String],
) -> Option<String> {
    let parts: Vec<String> = [
        describe_machines(machines),
        describe_created("VirtualDisk", disks),
        describe_created("VirtualImage", images),
        describe_created("ClusterVirtualImage", cluster_images),
    ]
    .into_iter()
    .flatten()
    .collect();

    if parts.is_empty() {
        return None;
    }
    Some(capitalize_first_letter(&format!("{}.", parts.join(", "))))
}

/// Reports machines and objects consuming the image
pub struct InUseHandler {
    services: Services,
}

impl InUseHandler {
    /// Create the handler
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn message(&self, vi: &VirtualImage) -> Result<Option<String>> {
        let store = &self.services.store;
        let name = vi.name_any();
        let namespace = vi.namespace_or_default();

        let machines: Vec<String> = store
            .list_machines(&namespace)
            .await?
            .iter()
            .filter(|vm| vm.uses_image(&name))
            .map(|vm| vm.name_any())
            .collect();
        let disks: Vec<String> = store
            .list_disks(&namespace)
            .await?
            .iter()
            .filter(|vd| vd.provisions_from_image(&name))
            .map(|vd| vd.name_any())
            .collect();
        let images: Vec<String> = store
            .list_images(&namespace)
            .await?
            .iter()
            .filter(|other| other.provisions_from_image(&name))
            .map(|other| other.name_any())
            .collect();
        let cluster_images: Vec<String> = store
            .list_cluster_images()
            .await?
            .iter()
            .filter(|cvi| cvi.provisions_from_image(&namespace, &name))
            .map(|cvi| cvi.name_any())
            .collect();

        Ok(in_use_message(&machines, &disks, &images, &cluster_images))
    }
}

#[async_trait]
impl Handler for InUseHandler {
    fn name(&self) -> &'static str {
        "InUseHandler"
    }

    async fn handle(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue> {
        let Some(ready) = vi.condition(ConditionType::Ready) else {
            out.remove_condition(ConditionType::InUse);
            return Ok(Requeue::None);
        };

        if !conditions::is_last_updated(ready, vi.generation()) {
            ConditionScope::new(ConditionType::InUse, vi, out)
                .builder()
                .status(ConditionStatus::Unknown)
                .reason(InUseReason::ReadyConditionStale)
                .message("The Ready condition was computed for an older generation.");
            return Ok(Requeue::None);
        }

        if !ready.is_true() {
            out.remove_condition(ConditionType::InUse);
            return Ok(Requeue::None);
        }

        match self.message(vi).await? {
            Some(message) => {
                ConditionScope::new(ConditionType::InUse, vi, out)
                    .builder()
                    .status(ConditionStatus::True)
                    .reason(InUseReason::InUse)
                    .message(message);
            }
            None => out.remove_condition(ConditionType::InUse),
        }
        Ok(Requeue::None)
    }
}
