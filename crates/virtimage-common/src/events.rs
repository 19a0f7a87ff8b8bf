//! Kubernetes Event recording for the image reconciler
//!
//! Events are fire-and-forget: a failed publish is logged at `warn` and never
//! fails a reconcile pass. Status conditions stay the source of truth.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about a VirtualImage
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    ///
    /// `reason` shows up in the REASON column of `kubectl get events`,
    /// `action` in ACTION, and `note` as the message.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons
pub mod reasons {
    /// First helper object of an import was created
    pub const SYNC_STARTED: &str = "SyncStarted";
    /// Import finished and the image is Ready
    pub const SYNC_COMPLETED: &str = "SyncCompleted";
    /// Import failed within the current attempt
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
    /// A ResourceQuota blocked a helper object
    pub const QUOTA_EXCEEDED: &str = "QuotaExceeded";
    /// Backing blob or claim disappeared
    pub const IMAGE_LOST: &str = "ImageLost";
    /// Deletion started and helpers are being removed
    pub const CLEANUP_STARTED: &str = "CleanupStarted";
    /// Spec changed and the import restarts
    pub const SPEC_CHANGED: &str = "SpecChanged";
}

/// Event actions
pub mod actions {
    /// Regular reconcile pass
    pub const RECONCILE: &str = "Reconcile";
    /// Creating helper objects
    pub const PROVISION: &str = "Provision";
    /// Removing helper objects
    pub const DELETE: &str = "Delete";
}
