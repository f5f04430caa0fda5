//! Admission webhooks for DaytonaBinding
//!
//! One HTTPS server carries every endpoint:
//! - `POST /daytonabindings` mutates pod-bearing subjects (see [`binding`])
//! - `POST /defaulting` and `POST /validation` admit the DaytonaBinding
//!   resource itself (see [`resource`])
//! - `GET /healthz` reports ready once the binding cache has synced
//!
//! The [`config`] module keeps the MutatingWebhookConfiguration rules in step
//! with the kinds that bindings currently reference.

pub mod binding;
pub mod config;
pub mod resource;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::{BindingInformer, ListAll};
use crate::Error;

/// Name of the MutatingWebhookConfiguration programmed by default
pub const DEFAULT_WEBHOOK_CONFIG_NAME: &str = "daytonabindings.webhook.binding.app";

/// Readiness probe for the shared cache
pub type ReadyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Snapshot of every binding in the cluster
    pub list_all: ListAll,
    /// Whether admission can be served from a complete cache
    pub ready: ReadyCheck,
}

impl WebhookState {
    /// Serve admission from the given informer through `list_all`
    pub fn new(list_all: ListAll, informer: Arc<BindingInformer>) -> Self {
        Self {
            list_all,
            ready: Arc::new(move || informer.has_synced()),
        }
    }
}

/// Listener and TLS options for the webhook server
#[derive(Clone, Debug)]
pub struct WebhookOptions {
    /// Port to listen on (all interfaces)
    pub port: u16,
    /// PEM certificate chain served to the API server
    pub tls_cert: PathBuf,
    /// PEM private key for `tls_cert`
    pub tls_key: PathBuf,
    /// MutatingWebhookConfiguration whose rules are programmed
    pub config_name: String,
    /// Time allowed for in-flight requests at shutdown
    pub shutdown_grace: Duration,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_WEBHOOK_PORT,
            tls_cert: PathBuf::from("/etc/webhook/certs/tls.crt"),
            tls_key: PathBuf::from("/etc/webhook/certs/tls.key"),
            config_name: DEFAULT_WEBHOOK_CONFIG_NAME.to_string(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl WebhookOptions {
    /// Socket address the server binds to
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

/// Create the webhook router with all admission endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/daytonabindings", post(binding::mutate_handler))
        .route("/defaulting", post(resource::defaulting_handler))
        .route("/validation", post(resource::validation_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<WebhookState>>) -> StatusCode {
    if (state.ready)() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serve `router` over TLS until `cancel` fires
pub async fn serve(
    router: Router,
    options: &WebhookOptions,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let tls = RustlsConfig::from_pem_file(&options.tls_cert, &options.tls_key)
        .await
        .map_err(|e| Error::internal_with_context("webhook", format!("TLS config failed: {e}")))?;

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    let grace = options.shutdown_grace;
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(grace));
    });

    let addr = options.addr();
    info!(addr = %addr, "Starting webhook server");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .map_err(|e| Error::internal_with_context("webhook", format!("server failed: {e}")))
}
