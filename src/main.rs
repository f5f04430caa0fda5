//! Daytona binding webhook and controller

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use daytona_binding::controller::{
    error_policy, list_all, reconcile, run_informer, BindingInformer, Context, WATCH_TIMEOUT_SECS,
};
use daytona_binding::crd::DaytonaBinding;
use daytona_binding::telemetry::{init_telemetry, TelemetryConfig};
use daytona_binding::tracker::{BindingKey, Tracker, DEFAULT_LEASE};
use daytona_binding::webhook::config::{
    change_notifier, KubeWebhookConfigClient, WebhookConfigReconciler,
};
use daytona_binding::webhook::{
    serve, webhook_router, WebhookOptions, WebhookState, DEFAULT_WEBHOOK_CONFIG_NAME,
};
use daytona_binding::{DEFAULT_WEBHOOK_PORT, FIELD_MANAGER};

/// Daytona binding - inject Vault secrets into workloads via DaytonaBinding CRDs
#[derive(Parser, Debug)]
#[command(name = "daytona-webhook", version, about, long_about = None)]
struct Cli {
    /// Print the DaytonaBinding CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the admission webhook and the binding controller (default mode)
    Run,
}

/// Options for the webhook and controller
#[derive(Args, Debug)]
struct RunArgs {
    /// HTTPS port for admission requests
    #[arg(long, env = "DAYTONA_WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// PEM certificate chain served to the API server
    #[arg(long, env = "DAYTONA_TLS_CERT", default_value = "/etc/webhook/certs/tls.crt")]
    tls_cert: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, env = "DAYTONA_TLS_KEY", default_value = "/etc/webhook/certs/tls.key")]
    tls_key: PathBuf,

    /// How long a subject reference stays tracked without renewal, in seconds
    #[arg(long, env = "DAYTONA_TRACKER_LEASE_SECS", default_value_t = DEFAULT_LEASE.as_secs())]
    tracker_lease_secs: u64,

    /// MutatingWebhookConfiguration whose rules follow the binding set
    #[arg(long, env = "DAYTONA_WEBHOOK_CONFIG_NAME", default_value = DEFAULT_WEBHOOK_CONFIG_NAME)]
    webhook_config_name: String,

    /// Emit JSON logs
    #[arg(long, env = "DAYTONA_LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS configuration is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&DaytonaBinding::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: cli.run.log_json,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Run) | None => run(cli.run).await,
    }
}

/// Install the DaytonaBinding CRD with server-side apply
///
/// The CRD version always matches the binary version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing DaytonaBinding CRD...");
    crds.patch(
        DaytonaBinding::crd_name(),
        &params,
        &Patch::Apply(&DaytonaBinding::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install DaytonaBinding CRD: {}", e))?;
    Ok(())
}

/// Run the webhook server, the binding controller and their background tasks
async fn run(args: RunArgs) -> anyhow::Result<()> {
    tracing::info!("Daytona binding starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let cancel = CancellationToken::new();

    // Tracker notifications re-trigger reconciliation of the owning binding
    let (enqueue_tx, enqueue_rx) = mpsc::unbounded_channel::<BindingKey>();
    let tracker = Arc::new(Tracker::new(
        Duration::from_secs(args.tracker_lease_secs),
        Arc::new(move |key: BindingKey| {
            if enqueue_tx.send(key).is_err() {
                tracing::debug!("Controller gone, dropping tracker notification");
            }
        }),
    ));

    // Binding cache shared by the webhook and the rule programmer
    let bindings: Api<DaytonaBinding> = Api::all(client.clone());
    let (store, writer) = reflector::store::<DaytonaBinding>();
    let informer = Arc::new(BindingInformer::new(store));
    let informer_task = tokio::spawn(run_informer(
        informer.clone(),
        writer,
        bindings.clone(),
        cancel.clone(),
    ));

    let (on_change, changes) = change_notifier();
    let list = list_all(informer.clone(), on_change);

    let rules = WebhookConfigReconciler::new(
        Arc::new(KubeWebhookConfigClient::new(client.clone())),
        list.clone(),
        &args.webhook_config_name,
    );
    let rules_task = tokio::spawn(rules.run(changes, cancel.clone()));

    let options = WebhookOptions {
        port: args.port,
        tls_cert: args.tls_cert,
        tls_key: args.tls_key,
        config_name: args.webhook_config_name,
        ..Default::default()
    };
    let router = webhook_router(Arc::new(WebhookState::new(list, informer)));
    let server_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = serve(router, &options, server_cancel).await {
            tracing::error!(error = %e, "Webhook server error");
        }
    });

    let ctx = Arc::new(
        Context::builder(client, tracker)
            .cancel(cancel.clone())
            .build(),
    );

    let triggers = UnboundedReceiverStream::new(enqueue_rx)
        .map(|key| ObjectRef::<DaytonaBinding>::new(&key.name).within(&key.namespace));

    tracing::info!("Starting DaytonaBinding controller");
    Controller::new(bindings, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .reconcile_on(triggers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((binding, action)) => {
                    tracing::debug!(binding = %binding, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Daytona binding shutting down");
    cancel.cancel();
    for task in [informer_task, rules_task, server_task] {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task failed");
        }
    }
    Ok(())
}
