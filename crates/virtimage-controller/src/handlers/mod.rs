//! Condition-axis handlers
//!
//! Each handler owns part of the image status. A pass runs them in a fixed
//! order over a working snapshot of the image: a handler reads the snapshot,
//! writes a [`StatusFragment`], and the fragment is applied to the snapshot
//! before the next handler runs. `DatasourceReady` and `StorageClassReady`
//! therefore always precede the lifecycle handler that reads them.

mod datasource_ready;
mod deletion;
mod image_presence;
mod in_use;
mod lifecycle;
mod storage_class_ready;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use virtimage_common::crd::VirtualImage;
use virtimage_common::Result;

use crate::requeue::Requeue;
use crate::services::Services;
use crate::sources::StrategyRegistry;
use crate::status::StatusFragment;

pub use datasource_ready::DatasourceReadyHandler;
pub use deletion::{DeletionHandler, IN_USE_RECHECK};
pub use image_presence::ImagePresenceHandler;
pub use in_use::{in_use_message, InUseHandler};
pub use lifecycle::LifeCycleHandler;
pub use storage_class_ready::StorageClassReadyHandler;

/// One step of a reconcile pass
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handler name for logs
    fn name(&self) -> &'static str;

    /// Compute the fields this handler owns
    async fn handle(&self, vi: &VirtualImage, out: &mut StatusFragment) -> Result<Requeue>;
}

/// Handlers of a pass, in the order they run
pub fn chain(services: &Services, strategies: &Arc<StrategyRegistry>) -> Vec<Arc<dyn Handler>> {
    vec![
        Arc::new(DatasourceReadyHandler::new(strategies.clone())),
        Arc::new(StorageClassReadyHandler::new(services.clone())),
        Arc::new(LifeCycleHandler::new(services.clone(), strategies.clone())),
        Arc::new(InUseHandler::new(services.clone())),
        Arc::new(ImagePresenceHandler::new(services.clone())),
        Arc::new(DeletionHandler::new(services.clone(), strategies.clone())),
    ]
}

/// Outcome of running the handler chain
#[derive(Debug)]
pub struct Pass {
    /// Image with every fragment applied
    pub image: VirtualImage,
    /// Fragments of all handlers, merged in order
    pub fragment: StatusFragment,
    /// Soonest requeue asked for
    pub requeue: Requeue,
    /// First unclassified error
    pub error: Option<virtimage_common::Error>,
}

/// Run `handlers` over `vi`
///
/// A failing handler keeps the fields it wrote before failing; the error is
/// remembered and the remaining handlers still run so every axis is
/// recomputed in the pass.
pub async fn run_chain(handlers: &[Arc<dyn Handler>], vi: &VirtualImage) -> Pass {
    let mut image = vi.clone();
    let mut fragment = StatusFragment::new();
    let mut requeue = Requeue::None;
    let mut error = None;

    for handler in handlers {
        let mut out = StatusFragment::new();
        match handler.handle(&image, &mut out).await {
            Ok(r) => {
                debug!(handler = handler.name(), requeue = ?r, "handler finished");
                requeue = requeue.merge(r);
            }
            Err(e) => {
                warn!(handler = handler.name(), error = %e, "handler failed");
                error.get_or_insert(e);
            }
        }
        out.apply_to(&mut image);
        fragment.merge(out);
    }

    Pass {
        image,
        fragment,
        requeue,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{http_image, Mocks};
    use virtimage_common::crd::ImagePhase;
    use virtimage_common::Error;

    fn handler(name: &'static str, phase: ImagePhase, requeue: Requeue) -> Arc<dyn Handler> {
        let mut h = MockHandler::new();
        h.expect_name().return_const(name);
        h.expect_handle().returning(move |_, out| {
            out.phase = Some(phase);
            Ok(requeue)
        });
        Arc::new(h)
    }

    /// Story: later handlers see what earlier handlers wrote
    #[tokio::test]
    async fn handlers_read_the_working_snapshot() {
        let first = handler("first", ImagePhase::Provisioning, Requeue::None);
        let mut second = MockHandler::new();
        second.expect_name().return_const("second");
        second
            .expect_handle()
            .withf(|vi, _| vi.phase() == ImagePhase::Provisioning)
            .times(1)
            .returning(|_, _| Ok(Requeue::None));

        let pass = run_chain(&[first, Arc::new(second)], &http_image()).await;
        assert!(pass.error.is_none());
        assert_eq!(pass.image.phase(), ImagePhase::Provisioning);
    }

    #[tokio::test]
    async fn soonest_requeue_wins() {
        let handlers = [
            handler("a", ImagePhase::Pending, Requeue::after(std::time::Duration::from_secs(60))),
            handler("b", ImagePhase::Pending, Requeue::Immediate),
            handler("c", ImagePhase::Pending, Requeue::None),
        ];
        let pass = run_chain(&handlers, &http_image()).await;
        assert_eq!(pass.requeue, Requeue::Immediate);
    }

    /// Story: a failing handler does not hide the others
    #[tokio::test]
    async fn failure_is_remembered_and_the_chain_continues() {
        let mut failing = MockHandler::new();
        failing.expect_name().return_const("failing");
        failing.expect_handle().returning(|_, out| {
            out.progress = Some("10%".to_string());
            Err(Error::internal("boom"))
        });
        let after = handler("after", ImagePhase::Failed, Requeue::None);

        let pass = run_chain(&[Arc::new(failing), after], &http_image()).await;
        assert!(matches!(pass.error, Some(Error::Internal { .. })));
        assert_eq!(pass.image.progress(), Some("10%"));
        assert_eq!(pass.image.phase(), ImagePhase::Failed);
        assert_eq!(pass.fragment.phase, Some(ImagePhase::Failed));
    }

    #[test]
    fn chain_order_is_fixed() {
        let services = Mocks::new().build();
        let strategies = Arc::new(StrategyRegistry::new(&services));
        let names: Vec<_> = chain(&services, &strategies).iter().map(|h| h.name()).collect();
        assert_eq!(
            names,
            [
                "DatasourceReadyHandler",
                "StorageClassReadyHandler",
                "LifeCycleHandler",
                "InUseHandler",
                "ImagePresenceHandler",
                "DeletionHandler",
            ]
        );
    }
}
