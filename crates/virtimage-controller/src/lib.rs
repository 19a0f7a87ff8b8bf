//! VirtualImage reconciliation engine
//!
//! The reconciler runs a fixed sequence of handlers over a VirtualImage.
//! Provisioning itself is delegated to a per-source strategy which either
//! drives the helper objects directly or runs a pipeline of steps.

#![warn(missing_docs)]

/// Reconcile entry point and controller wiring
pub mod controller;
/// Condition-axis handlers
pub mod handlers;
/// Shared Ready condition and phase writers
pub mod phases;
/// Requeue directives
pub mod requeue;
/// Service seams to the cluster
pub mod services;
/// Controller settings
pub mod settings;
/// Source strategies
pub mod sources;
/// Status fragments and scoped condition writes
pub mod status;
/// Provisioning steps and pipelines
pub mod step;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{error_policy, reconcile, run, Context, ContextBuilder};
pub use requeue::Requeue;
pub use settings::ControllerSettings;
pub use status::{ConditionScope, StatusFragment};
