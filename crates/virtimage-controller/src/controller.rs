//! VirtualImage controller
//!
//! A pass ensures the cleanup finalizer, runs the handler chain over a
//! working copy of the image and writes the merged status back with one
//! patch. The requeue is the soonest one any handler asked for.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use virtimage_common::crd::{DataVolume, VirtualImage};
use virtimage_common::events::{EventPublisher, KubeEventPublisher};
use virtimage_common::{Error, Result, IMAGE_CLEANUP_FINALIZER, IMAGE_NAME_LABEL, MANAGED_BY};

use crate::handlers::{self, Handler, Pass};
use crate::requeue::Requeue;
use crate::services::{
    BounderImpl, DiskServiceImpl, ImporterImpl, ObjectStore, ObjectStoreImpl, RegistryProbe, RegistryProbeImpl,
    Services, StorageClassPolicy, UploaderImpl,
};
use crate::settings::ControllerSettings;
use crate::sources::StrategyRegistry;

/// Requeue delay after a retryable failure
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Watch timeout, below the client read timeout so idle watches are
/// closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Shared state of the controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, settings).build()?;
/// ```
pub struct Context {
    /// Cluster seams
    pub services: Services,
    /// Strategy per source kind
    pub strategies: Arc<StrategyRegistry>,
    /// Handler chain run on every pass
    pub handlers: Vec<Arc<dyn Handler>>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, settings: ControllerSettings) -> ContextBuilder {
        ContextBuilder::new(client, settings)
    }

    /// Context over already built services
    pub fn from_services(services: Services) -> Self {
        let strategies = Arc::new(StrategyRegistry::new(&services));
        let handlers = handlers::chain(&services, &strategies);
        Self {
            services,
            strategies,
            handlers,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    settings: ControllerSettings,
    store: Option<Arc<dyn ObjectStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    registry: Option<Arc<dyn RegistryProbe>>,
}

impl ContextBuilder {
    fn new(client: Client, settings: ControllerSettings) -> Self {
        Self {
            client,
            settings,
            store: None,
            events: None,
            registry: None,
        }
    }

    /// Override the object store
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the DVCR presence probe
    pub fn registry_probe(mut self, registry: Arc<dyn RegistryProbe>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the Context
    ///
    /// Fails when the DVCR HTTP client can't be built from the settings.
    pub fn build(self) -> Result<Context> {
        let client = self.client;
        let settings = self.settings;

        let registry: Arc<dyn RegistryProbe> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(RegistryProbeImpl::new(client.clone(), settings.clone())?),
        };
        let services = Services {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(ObjectStoreImpl::new(client.clone()))),
            importer: Arc::new(ImporterImpl::new(client.clone(), settings.clone())),
            uploader: Arc::new(UploaderImpl::new(client.clone(), settings.clone())),
            bounder: Arc::new(BounderImpl::new(client.clone(), settings.clone())),
            disk: Arc::new(DiskServiceImpl::new(client.clone(), settings.clone())),
            registry,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(client, MANAGED_BY))),
            storage_class: StorageClassPolicy::new(settings.storage_class.clone()),
            settings,
        };
        Ok(Context::from_services(services))
    }
}

fn has_cleanup_finalizer(vi: &VirtualImage) -> bool {
    vi.finalizers().iter().any(|f| f == IMAGE_CLEANUP_FINALIZER)
}

/// Reconcile a VirtualImage
///
/// Handler failures don't stop the pass: the status computed by every
/// handler is still written, then the first failure is returned so the
/// controller retries.
#[instrument(skip(vi, ctx), fields(image = %vi.name_any(), namespace = %vi.namespace_or_default()))]
pub async fn reconcile(vi: Arc<VirtualImage>, ctx: Arc<Context>) -> Result<Action> {
    debug!("reconciling image");
    let store = &ctx.services.store;

    // The finalizer patch bumps the resourceVersion; a status patch in the
    // same pass would conflict.
    if !vi.is_terminating() && !has_cleanup_finalizer(&vi) {
        info!("adding cleanup finalizer");
        store.add_image_finalizer(&vi).await?;
        return Ok(Requeue::Immediate.into_action());
    }

    let Pass {
        mut image,
        requeue,
        error,
        ..
    } = handlers::run_chain(&ctx.handlers, &vi).await;
    image.status.get_or_insert_with(Default::default).observed_generation = Some(vi.generation());

    if image.status != vi.status {
        match store.patch_image_status(&image).await {
            Ok(()) => {}
            Err(e) if vi.is_terminating() && (e.is_not_found() || e.is_conflict()) => {
                debug!(error = %e, "image released before its status was written");
            }
            Err(e) => {
                if let Some(failure) = &error {
                    warn!(error = %failure, "handler failure is superseded by the status write failure");
                }
                return Err(e);
            }
        }
    }

    if let Some(e) = error {
        return Err(e);
    }
    debug!(?requeue, phase = %image.phase(), "reconciliation finished");
    Ok(requeue.into_action())
}

/// Error policy for the controller
///
/// Retryable failures are retried after a short delay; the rest wait for
/// the image or its dependencies to change.
pub fn error_policy(vi: Arc<VirtualImage>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        image = %vi.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

/// Run the controller until a shutdown signal arrives
///
/// Helper pods, claims and DataVolumes carry the image label and an owner
/// reference to their image, so changes to them requeue the image.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let images: Api<VirtualImage> = Api::all(client.clone());
    let helpers = || WatcherConfig::default().labels(IMAGE_NAME_LABEL).timeout(WATCH_TIMEOUT_SECS);
    let concurrency = ctx.services.settings.concurrency;

    info!(concurrency, "starting VirtualImage controller");
    Controller::new(images, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(Api::<Pod>::all(client.clone()), helpers())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), helpers())
        .owns(Api::<DataVolume>::all(client), helpers())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((image, action)) => debug!(image = %image.name, ?action, "reconciliation completed"),
                Err(e) => error!(error = ?e, "reconciliation error"),
            }
            std::future::ready(())
        })
        .await;
    info!("VirtualImage controller stopped");
}
