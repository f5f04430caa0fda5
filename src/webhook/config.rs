//! MutatingWebhookConfiguration programming
//!
//! The subject webhook only needs to see kinds some binding references. Each
//! time the binding set changes, the rules of the configured webhook entry are
//! re-derived and written back, leaving `clientConfig` and every other field
//! as installed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, RuleWithOperations,
};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::binding::podable::SubjectKind;
use crate::binding::Bindable;
use crate::controller::{ChangeHandler, ListAll};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Operations intercepted on subjects
const OPERATIONS: [&str; 2] = ["CREATE", "UPDATE"];

/// Access to MutatingWebhookConfigurations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookConfigClient: Send + Sync {
    /// Fetch a configuration by name; `None` when it is not installed
    async fn get(&self, name: &str) -> Result<Option<MutatingWebhookConfiguration>, Error>;

    /// Replace a configuration, guarded by its resourceVersion
    async fn replace(&self, config: &MutatingWebhookConfiguration) -> Result<(), Error>;
}

/// Real [`WebhookConfigClient`] backed by a kube client
pub struct KubeWebhookConfigClient {
    api: Api<MutatingWebhookConfiguration>,
}

impl KubeWebhookConfigClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl WebhookConfigClient for KubeWebhookConfigClient {
    async fn get(&self, name: &str) -> Result<Option<MutatingWebhookConfiguration>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn replace(&self, config: &MutatingWebhookConfiguration) -> Result<(), Error> {
        let name = config.metadata.name.clone().unwrap_or_default();
        self.api
            .replace(&name, &PostParams::default(), config)
            .await
            .map_err(|e| Error::from_status_write(name, e))?;
        Ok(())
    }
}

/// Derive webhook rules covering every supported subject kind in `bindings`.
///
/// Rules are grouped per group/version with sorted resources, so the same
/// binding set always yields the same rules.
pub fn derive_rules(bindings: &[Arc<dyn Bindable>]) -> Vec<RuleWithOperations> {
    let mut resources: BTreeMap<(&str, &str), BTreeSet<&str>> = BTreeMap::new();
    for binding in bindings {
        let subject = binding.subject();
        if let Some(kind) = SubjectKind::from_type(&subject.api_version, &subject.kind) {
            resources
                .entry((kind.group(), kind.version()))
                .or_default()
                .insert(kind.plural());
        }
    }

    resources
        .into_iter()
        .map(|((group, version), plurals)| RuleWithOperations {
            api_groups: Some(vec![group.to_string()]),
            api_versions: Some(vec![version.to_string()]),
            operations: Some(OPERATIONS.iter().map(|op| op.to_string()).collect()),
            resources: Some(plurals.into_iter().map(str::to_string).collect()),
            scope: Some("Namespaced".to_string()),
        })
        .collect()
}

/// A change handler paired with the receiver it wakes.
///
/// Register the handler through [`crate::controller::list_all`] and hand the
/// receiver to [`WebhookConfigReconciler::run`].
pub fn change_notifier() -> (ChangeHandler, watch::Receiver<u64>) {
    let (tx, rx) = watch::channel(0u64);
    let handler: ChangeHandler = Arc::new(move || {
        tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    });
    (handler, rx)
}

/// Keeps the subject webhook's rules in step with the binding set
pub struct WebhookConfigReconciler {
    client: Arc<dyn WebhookConfigClient>,
    list_all: ListAll,
    config_name: String,
    webhook_name: String,
    retry: RetryConfig,
}

impl WebhookConfigReconciler {
    /// Program the webhook entry named `config_name` inside the configuration
    /// of the same name
    pub fn new(client: Arc<dyn WebhookConfigClient>, list_all: ListAll, config_name: &str) -> Self {
        Self {
            client,
            list_all,
            config_name: config_name.to_string(),
            webhook_name: config_name.to_string(),
            retry: RetryConfig::with_max_attempts(5),
        }
    }

    /// Target a differently named webhook entry
    pub fn with_webhook_name(mut self, name: impl Into<String>) -> Self {
        self.webhook_name = name.into();
        self
    }

    /// Re-sync on every generation bump until cancelled or the sender is gone
    pub async fn run(self, mut changes: watch::Receiver<u64>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let generation = *changes.borrow_and_update();
            match self.sync(&cancel).await {
                Ok(()) => debug!(generation, "Webhook rules in sync"),
                Err(Error::Cancelled { .. }) => break,
                Err(e) => warn!(generation, error = %e, "Failed to program webhook rules"),
            }
        }
        info!("Webhook configuration reconciler stopped");
    }

    /// Derive the rules from the current binding set and write them back
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let rules = derive_rules(&(self.list_all)()?);
        retry_with_backoff(&self.retry, "program_webhook_rules", cancel, || {
            self.apply_rules(&rules)
        })
        .await
    }

    async fn apply_rules(&self, rules: &[RuleWithOperations]) -> Result<(), Error> {
        let Some(mut config) = self.client.get(&self.config_name).await? else {
            warn!(config = %self.config_name, "MutatingWebhookConfiguration not installed, skipping");
            return Ok(());
        };
        let Some(webhook) = config
            .webhooks
            .as_mut()
            .and_then(|hooks| hooks.iter_mut().find(|h| h.name == self.webhook_name))
        else {
            warn!(
                config = %self.config_name,
                webhook = %self.webhook_name,
                "Webhook entry not found, skipping"
            );
            return Ok(());
        };

        if webhook.rules.as_deref().unwrap_or_default() == rules {
            return Ok(());
        }
        webhook.rules = Some(rules.to_vec());
        self.client.replace(&config).await?;
        info!(
            config = %self.config_name,
            rules = rules.len(),
            "Updated webhook rules"
        );
        Ok(())
    }
}
