//! Dynamic watches on subject kinds
//!
//! One watch per [`SubjectKind`] is started lazily the first time a binding
//! references that kind. Every applied or deleted object is reported to the
//! [`Tracker`], which decides whether any binding cares.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashSet;
use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::binding::podable::SubjectKind;
use crate::tracker::{ObservedObject, Tracker};

/// Watcher timeout (seconds); must stay below the client read timeout
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Starts watches for subject kinds on demand
#[cfg_attr(test, automock)]
pub trait SubjectWatches: Send + Sync {
    /// Make sure objects of `kind` are being watched. Idempotent.
    fn ensure_watched(&self, kind: SubjectKind);
}

/// Build the API resource for a subject kind without a discovery round trip
pub fn api_resource(kind: SubjectKind) -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind()),
        kind.plural(),
    )
}

/// Cluster-wide subject watches feeding a [`Tracker`]
pub struct SubjectWatcher {
    client: Client,
    tracker: Arc<Tracker>,
    cancel: CancellationToken,
    watched: DashSet<SubjectKind>,
}

impl SubjectWatcher {
    /// Create a watcher set; watches stop when `cancel` fires
    pub fn new(client: Client, tracker: Arc<Tracker>, cancel: CancellationToken) -> Self {
        Self {
            client,
            tracker,
            cancel,
            watched: DashSet::new(),
        }
    }
}

impl SubjectWatches for SubjectWatcher {
    fn ensure_watched(&self, kind: SubjectKind) {
        if !self.watched.insert(kind) {
            return;
        }
        info!(kind = %kind, "Starting subject watch");
        tokio::spawn(watch_kind(
            self.client.clone(),
            self.tracker.clone(),
            kind,
            self.cancel.clone(),
        ));
    }
}

async fn watch_kind(
    client: Client,
    tracker: Arc<Tracker>,
    kind: SubjectKind,
    cancel: CancellationToken,
) {
    let api: Api<DynamicObject> = Api::all_with(client, &api_resource(kind));
    let stream = watcher::watcher(
        api,
        watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .default_backoff();
    let mut stream = std::pin::pin!(stream);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj))) => {
                notify(&tracker, kind, &obj);
            }
            Some(Ok(Event::Init | Event::InitDone)) => {}
            Some(Err(e)) => warn!(kind = %kind, error = %e, "Subject watch error"),
            None => break,
        }
    }
    debug!(kind = %kind, "Subject watch stopped");
}

fn notify(tracker: &Tracker, kind: SubjectKind, obj: &DynamicObject) {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let labels: &BTreeMap<String, String> = obj.labels();
    tracker.on_changed(ObservedObject {
        api_version: kind.api_version(),
        kind: kind.kind(),
        namespace: &namespace,
        name: &name,
        labels,
    });
}
