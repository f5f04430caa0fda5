//! Daytona binding - injects the Daytona secret-delivery init container into
//! Kubernetes workloads
//!
//! A `DaytonaBinding` names a pod-bearing workload (its subject). A mutating
//! admission webhook rewrites the subject's pod template so that Daytona
//! authenticates to Vault and drops secrets into a shared in-memory volume
//! before the workload starts. A controller tracks each binding's subject and
//! reports on the binding's status whether the binding can be applied.
//!
//! # Modules
//!
//! - [`crd`] - the DaytonaBinding custom resource and its supporting types
//! - [`binding`] - the pure Do/Undo pod template mutations
//! - [`conditions`] - living condition set aggregation into `Ready`
//! - [`tracker`] - lease-based subject to binding dependency tracking
//! - [`controller`] - reconciler, binding informer and subject watches
//! - [`webhook`] - admission endpoints and webhook rule programming
//! - [`retry`] - exponential backoff for API calls
//! - [`telemetry`] - tracing subscriber setup
//! - [`error`] - error types for the crate

#![deny(missing_docs)]

pub mod binding;
pub mod conditions;
pub mod controller;
pub mod crd;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod tracker;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the HTTPS admission server.
///
/// Port 8443 is used instead of 443 to avoid requiring root privileges.
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Field manager for every write the controller makes
pub const FIELD_MANAGER: &str = controller::FIELD_MANAGER;
