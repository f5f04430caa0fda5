//! DaytonaBinding controller implementation
//!
//! The reconciler never touches subjects. Each pass validates the binding,
//! registers its subject with the tracker, checks that the subject exists and
//! records the outcome on the binding's status. The webhook does the actual
//! injection at admission time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::binding::podable::SubjectKind;
use crate::binding::{Bindable, BindableStatus};
use crate::controller::subjects::{api_resource, SubjectWatcher, SubjectWatches};
use crate::crd::{DaytonaBinding, DaytonaBindingStatus, SubjectReference};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::tracker::{BindingKey, Tracker};
use crate::Error;

/// Field manager used for status writes
pub const FIELD_MANAGER: &str = "daytona-controller";

/// Requeue delay after a failed pass
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Trait abstracting Kubernetes client operations for DaytonaBinding
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BindingClient: Send + Sync {
    /// Fetch the latest version of a binding; `None` once it is gone
    async fn get_binding(&self, namespace: &str, name: &str)
        -> Result<Option<DaytonaBinding>, Error>;

    /// Count the objects addressed by a subject reference
    async fn resolve_subject(
        &self,
        namespace: &str,
        subject: &SubjectReference,
    ) -> Result<usize, Error>;

    /// Write the status of `binding`, guarded by its resourceVersion.
    ///
    /// Returns [`Error::Conflict`] when another writer got there first.
    async fn write_status(&self, binding: &DaytonaBinding) -> Result<(), Error>;
}

/// Real [`BindingClient`] backed by a kube client
pub struct KubeBindingClient {
    client: Client,
}

impl KubeBindingClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BindingClient for KubeBindingClient {
    async fn get_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaytonaBinding>, Error> {
        let api: Api<DaytonaBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn resolve_subject(
        &self,
        namespace: &str,
        subject: &SubjectReference,
    ) -> Result<usize, Error> {
        let kind = SubjectKind::from_type(&subject.api_version, &subject.kind).ok_or_else(|| {
            Error::subject_not_found(
                format!("{namespace}/?"),
                subject.to_string(),
                "unsupported subject kind",
            )
        })?;
        let ns = subject.namespace_or(namespace);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), ns, &api_resource(kind));

        match (&subject.name, &subject.selector) {
            (Some(name), _) => Ok(usize::from(api.get_opt(name).await?.is_some())),
            (None, Some(selector)) => {
                let params = ListParams::default().labels(&selector.to_query_string());
                Ok(api.list(&params).await?.items.len())
            }
            (None, None) => Ok(0),
        }
    }

    async fn write_status(&self, binding: &DaytonaBinding) -> Result<(), Error> {
        let key = binding.binding_key();
        let namespace = binding.namespace().unwrap_or_default();
        let api: Api<DaytonaBinding> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": binding.resource_version() },
            "status": binding.status,
        });
        api.patch_status(
            &binding.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from_status_write(key, e))?;
        Ok(())
    }
}

/// Controller context shared across reconciliation passes
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub client: Arc<dyn BindingClient>,
    /// Subject → binding index
    pub tracker: Arc<Tracker>,
    /// Subject watch registry
    pub watches: Arc<dyn SubjectWatches>,
    /// Backoff for subject resolution and status writes
    pub retry: RetryConfig,
    /// Aborts in-flight passes on shutdown
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, tracker: Arc<Tracker>) -> ContextBuilder {
        ContextBuilder::new(client, tracker)
    }

    /// Requeue interval that renews tracker leases before they expire
    pub fn resync_period(&self) -> Duration {
        self.tracker.lease() / 3
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn BindingClient>,
        tracker: Arc<Tracker>,
        watches: Arc<dyn SubjectWatches>,
    ) -> Self {
        Self {
            client,
            tracker,
            watches,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
            cancel: CancellationToken::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client, tracker)
///     .cancel(shutdown.clone())
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    tracker: Arc<Tracker>,
    binding_client: Option<Arc<dyn BindingClient>>,
    watches: Option<Arc<dyn SubjectWatches>>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl ContextBuilder {
    fn new(client: Client, tracker: Arc<Tracker>) -> Self {
        Self {
            client,
            tracker,
            binding_client: None,
            watches: None,
            retry: RetryConfig::with_max_attempts(5),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the binding client (primarily for testing)
    pub fn binding_client(mut self, client: Arc<dyn BindingClient>) -> Self {
        self.binding_client = Some(client);
        self
    }

    /// Override the subject watch registry
    pub fn watches(mut self, watches: Arc<dyn SubjectWatches>) -> Self {
        self.watches = Some(watches);
        self
    }

    /// Set the retry policy for network calls
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the shutdown token
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let watches = self.watches.unwrap_or_else(|| {
            Arc::new(SubjectWatcher::new(
                self.client.clone(),
                self.tracker.clone(),
                self.cancel.clone(),
            ))
        });
        Context {
            client: self
                .binding_client
                .unwrap_or_else(|| Arc::new(KubeBindingClient::new(self.client.clone()))),
            tracker: self.tracker,
            watches,
            retry: self.retry,
            cancel: self.cancel,
        }
    }
}

/// Reconcile a DaytonaBinding
///
/// Validates the spec, tracks and resolves the subject, and writes the
/// resulting conditions. Validation failures are terminal until the spec
/// changes; resolution failures are requeued.
#[instrument(skip(binding, ctx), fields(binding = %binding.binding_key()))]
pub async fn reconcile(binding: Arc<DaytonaBinding>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = binding.binding_key();
    let namespace = binding.namespace().unwrap_or_default();
    let owner = BindingKey::new(&namespace, binding.name_any());

    if binding.is_deleting() {
        debug!("Binding is being deleted, untracking subject");
        ctx.tracker.untrack(&owner);
        return Ok(Action::await_change());
    }

    let mut status = binding.status.clone().unwrap_or_default();
    status.initialize_conditions();
    if let Some(generation) = binding.metadata.generation {
        status.set_observed_generation(generation);
    }

    if let Err(e) = binding.validate() {
        warn!(error = %e, "Binding spec is invalid");
        status.mark_parameters_invalid(e.reason(), &e.to_string());
        update_status(&ctx, &binding, &status).await?;
        return Ok(Action::await_change());
    }
    status.mark_parameters_valid();

    let subject = Bindable::subject(binding.as_ref());
    let Some(kind) = binding.spec.subject_kind() else {
        let message = format!("{} is not a pod-bearing kind", subject.kind);
        warn!(subject = %subject, "Unsupported subject kind");
        status.mark_subject_unresolved("UnsupportedSubject", &message);
        update_status(&ctx, &binding, &status).await?;
        return Ok(Action::await_change());
    };

    ctx.tracker.track(&subject, &namespace, &owner);
    ctx.watches.ensure_watched(kind);

    let client = ctx.client.clone();
    let resolved = retry_with_backoff(&ctx.retry, "resolve_subject", &ctx.cancel, || {
        let client = client.clone();
        let namespace = namespace.clone();
        let subject = subject.clone();
        async move { client.resolve_subject(&namespace, &subject).await }
    })
    .await;

    let action = match resolved {
        Ok(0) => {
            let message = format!("no {subject} found");
            info!(subject = %subject, "Subject not found");
            status.mark_subject_unresolved("SubjectNotFound", &message);
            update_status(&ctx, &binding, &status).await?;
            return Err(Error::subject_not_found(&key, subject.to_string(), message));
        }
        Ok(count) => {
            debug!(subject = %subject, count, "Subject resolved");
            status.mark_binding_available();
            Action::requeue(ctx.resync_period())
        }
        Err(e @ Error::Cancelled { .. }) => return Err(e),
        Err(e) => {
            status.mark_subject_unresolved(e.reason(), &e.to_string());
            update_status(&ctx, &binding, &status).await?;
            return Err(e);
        }
    };

    update_status(&ctx, &binding, &status).await?;
    info!(ready = status.is_ready(), "Binding reconciled");
    Ok(action)
}

/// Error policy for the controller
pub fn error_policy(binding: Arc<DaytonaBinding>, error: &Error, _ctx: Arc<Context>) -> Action {
    if matches!(error, Error::Cancelled { .. }) {
        debug!(binding = %binding.binding_key(), "Reconciliation cancelled");
        return Action::await_change();
    }
    error!(
        ?error,
        binding = %binding.binding_key(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Persist `status` onto the latest version of `binding`.
///
/// Re-reads before every attempt so a conflicting write is retried against
/// the fresh resourceVersion. Skips the write when nothing changed, and
/// writes nothing once the context is cancelled.
async fn update_status(
    ctx: &Context,
    binding: &DaytonaBinding,
    status: &DaytonaBindingStatus,
) -> Result<(), Error> {
    let namespace = binding.namespace().unwrap_or_default();
    let name = binding.name_any();
    let client = ctx.client.clone();

    retry_with_backoff(&ctx.retry, "update_status", &ctx.cancel, || {
        let client = client.clone();
        let namespace = namespace.clone();
        let name = name.clone();
        let status = status.clone();
        async move {
            let Some(mut latest) = client.get_binding(&namespace, &name).await? else {
                debug!("Binding disappeared before status write");
                return Ok(());
            };
            if latest.status.as_ref() == Some(&status) {
                debug!("Status unchanged, skipping write");
                return Ok(());
            }
            latest.status = Some(status);
            client.write_status(&latest).await
        }
    })
    .await
}
