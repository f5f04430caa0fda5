//! Lease-based dependency tracker
//!
//! Maps subject identities to the bindings that reference them. The
//! reconciler calls [`Tracker::track`] on every pass, which refreshes the
//! lease; subject watches call [`Tracker::on_changed`], which enqueues every
//! binding whose lease has not expired. A binding that stops referencing a
//! subject simply stops renewing, and its entry ages out.
//!
//! The tracker only notifies. It never reads or writes subjects.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::crd::{LabelSelector, SubjectReference};

/// Default lease: three times a ten minute resync period
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30 * 60);

/// Identity of the binding that owns a tracked reference
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    /// Binding namespace
    pub namespace: String,
    /// Binding name
    pub name: String,
}

impl BindingKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A changed object as seen by a subject watch
#[derive(Clone, Copy, Debug)]
pub struct ObservedObject<'a> {
    /// apiVersion of the object
    pub api_version: &'a str,
    /// Kind of the object
    pub kind: &'a str,
    /// Namespace of the object
    pub namespace: &'a str,
    /// Name of the object
    pub name: &'a str,
    /// Labels of the object
    pub labels: &'a BTreeMap<String, String>,
}

/// Callback used to enqueue a binding for reconciliation
pub type EnqueueFn = Arc<dyn Fn(BindingKey) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct KindInNamespace {
    api_version: String,
    kind: String,
    namespace: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct NamedSubject {
    scope: KindInNamespace,
    name: String,
}

/// Thread-safe subject → binding index with per-reference leases
pub struct Tracker {
    /// References addressing a single object by name
    exact: DashMap<NamedSubject, HashMap<BindingKey, Instant>>,
    /// References addressing objects by label selector
    selectors: DashMap<KindInNamespace, HashMap<BindingKey, (LabelSelector, Instant)>>,
    lease: Duration,
    enqueue: EnqueueFn,
}

impl Tracker {
    /// Create a tracker whose references expire after `lease`
    pub fn new(lease: Duration, enqueue: EnqueueFn) -> Self {
        Self {
            exact: DashMap::new(),
            selectors: DashMap::new(),
            lease,
            enqueue,
        }
    }

    /// Lease applied to new and refreshed references
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Track `subject` on behalf of `owner` under the tracker's lease.
    ///
    /// `default_namespace` is used when the reference carries none. A
    /// reference with neither name nor selector is ignored.
    pub fn track(&self, subject: &SubjectReference, default_namespace: &str, owner: &BindingKey) {
        self.track_for(subject, default_namespace, owner, self.lease);
    }

    /// Track `subject` on behalf of `owner` for `lease`, replacing any
    /// earlier expiry of the same reference.
    pub fn track_for(
        &self,
        subject: &SubjectReference,
        default_namespace: &str,
        owner: &BindingKey,
        lease: Duration,
    ) {
        let scope = KindInNamespace {
            api_version: subject.api_version.clone(),
            kind: subject.kind.clone(),
            namespace: subject.namespace_or(default_namespace).to_string(),
        };
        let expires_at = Instant::now() + lease;

        match (&subject.name, &subject.selector) {
            (Some(name), _) => {
                let key = NamedSubject {
                    scope,
                    name: name.clone(),
                };
                self.exact
                    .entry(key)
                    .or_default()
                    .insert(owner.clone(), expires_at);
            }
            (None, Some(selector)) => {
                self.selectors
                    .entry(scope)
                    .or_default()
                    .insert(owner.clone(), (selector.clone(), expires_at));
            }
            (None, None) => return,
        }
        debug!(binding = %owner, subject = %subject, "Tracking subject");
    }

    /// Drop every reference owned by `owner`
    pub fn untrack(&self, owner: &BindingKey) {
        self.exact.retain(|_, owners| {
            owners.remove(owner);
            !owners.is_empty()
        });
        self.selectors.retain(|_, owners| {
            owners.remove(owner);
            !owners.is_empty()
        });
    }

    /// Enqueue every live owner of a reference matching `object`.
    ///
    /// Expired references are pruned as they are encountered. Returns the
    /// owners that were enqueued, in key order.
    pub fn on_changed(&self, object: ObservedObject<'_>) -> Vec<BindingKey> {
        let now = Instant::now();
        let scope = KindInNamespace {
            api_version: object.api_version.to_string(),
            kind: object.kind.to_string(),
            namespace: object.namespace.to_string(),
        };
        let mut owners = Vec::new();

        let named = NamedSubject {
            scope: scope.clone(),
            name: object.name.to_string(),
        };
        if let Some(mut entry) = self.exact.get_mut(&named) {
            entry.retain(|_, expires_at| *expires_at > now);
            owners.extend(entry.keys().cloned());
        }
        self.exact.remove_if(&named, |_, o| o.is_empty());

        if let Some(mut entry) = self.selectors.get_mut(&scope) {
            entry.retain(|_, (_, expires_at)| *expires_at > now);
            owners.extend(
                entry
                    .iter()
                    .filter(|(_, (selector, _))| selector.matches(object.labels))
                    .map(|(owner, _)| owner.clone()),
            );
        }
        self.selectors.remove_if(&scope, |_, o| o.is_empty());

        owners.sort();
        owners.dedup();
        for owner in &owners {
            debug!(
                binding = %owner,
                subject = %format!("{} {} {}/{}", object.api_version, object.kind, object.namespace, object.name),
                "Subject changed, enqueueing binding"
            );
            (self.enqueue)(owner.clone());
        }
        owners
    }

    /// Number of live references, counting each owner once per subject
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let exact: usize = self
            .exact
            .iter()
            .map(|e| e.values().filter(|t| **t > now).count())
            .sum();
        let selectors: usize = self
            .selectors
            .iter()
            .map(|e| e.values().filter(|(_, t)| *t > now).count())
            .sum();
        exact + selectors
    }

    /// Whether no live references exist
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("lease", &self.lease)
            .field("exact", &self.exact.len())
            .field("selectors", &self.selectors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_tracker(lease: Duration) -> (Tracker, Arc<Mutex<Vec<BindingKey>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = Tracker::new(
            lease,
            Arc::new(move |key: BindingKey| sink.lock().unwrap().push(key)),
        );
        (tracker, seen)
    }

    fn deployment(name: &str) -> SubjectReference {
        SubjectReference {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    fn observed<'a>(name: &'a str, labels: &'a BTreeMap<String, String>) -> ObservedObject<'a> {
        ObservedObject {
            api_version: "apps/v1",
            kind: "Deployment",
            namespace: "team",
            name,
            labels,
        }
    }

    /// Story: a deployment rollout re-triggers the binding that targets it
    #[tokio::test(start_paused = true)]
    async fn story_subject_change_enqueues_owner_until_lease_expires() {
        let (tracker, seen) = recording_tracker(Duration::from_secs(60));
        let owner = BindingKey::new("team", "web-secrets");
        tracker.track(&deployment("web"), "team", &owner);

        let labels = BTreeMap::new();
        assert_eq!(tracker.on_changed(observed("web", &labels)), vec![owner.clone()]);
        assert_eq!(seen.lock().unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(tracker.on_changed(observed("web", &labels)).len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.on_changed(observed("web", &labels)).is_empty());
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retracking_refreshes_the_lease() {
        let (tracker, _) = recording_tracker(Duration::from_secs(60));
        let owner = BindingKey::new("team", "b");
        tracker.track(&deployment("web"), "team", &owner);

        tokio::time::advance(Duration::from_secs(45)).await;
        tracker.track(&deployment("web"), "team", &owner);
        tokio::time::advance(Duration::from_secs(45)).await;

        let labels = BTreeMap::new();
        assert_eq!(tracker.on_changed(observed("web", &labels)), vec![owner]);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_lease_overrides_the_default() {
        let (tracker, _) = recording_tracker(Duration::from_secs(600));
        let short = BindingKey::new("team", "short");
        let long = BindingKey::new("team", "long");
        tracker.track_for(&deployment("web"), "team", &short, Duration::from_secs(10));
        tracker.track(&deployment("web"), "team", &long);

        tokio::time::advance(Duration::from_secs(11)).await;
        let labels = BTreeMap::new();
        assert_eq!(tracker.on_changed(observed("web", &labels)), vec![long]);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tracking_and_notification_lose_no_owner() {
        let (tracker, _) = recording_tracker(DEFAULT_LEASE);
        let tracker = Arc::new(tracker);
        let owners: Vec<BindingKey> = (0..64)
            .map(|i| BindingKey::new("team", &format!("b{i:02}")))
            .collect();

        let mut tasks = Vec::new();
        for chunk in owners.chunks(8) {
            let tracker = tracker.clone();
            let chunk = chunk.to_vec();
            tasks.push(tokio::spawn(async move {
                for owner in &chunk {
                    tracker.track(&deployment("web"), "team", owner);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for _ in 0..4 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                let labels = BTreeMap::new();
                for _ in 0..32 {
                    tracker.on_changed(observed("web", &labels));
                    tracker.on_changed(observed("api", &labels));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let labels = BTreeMap::new();
        assert_eq!(tracker.len(), owners.len());
        assert_eq!(tracker.on_changed(observed("web", &labels)), owners);
    }

    #[tokio::test]
    async fn unrelated_objects_do_not_enqueue() {
        let (tracker, seen) = recording_tracker(DEFAULT_LEASE);
        tracker.track(&deployment("web"), "team", &BindingKey::new("team", "b"));

        let labels = BTreeMap::new();
        assert!(tracker.on_changed(observed("api", &labels)).is_empty());
        let other_ns = ObservedObject {
            namespace: "other",
            ..observed("web", &labels)
        };
        assert!(tracker.on_changed(other_ns).is_empty());
        let other_kind = ObservedObject {
            kind: "StatefulSet",
            ..observed("web", &labels)
        };
        assert!(tracker.on_changed(other_kind).is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn selector_references_match_labels() {
        let (tracker, _) = recording_tracker(DEFAULT_LEASE);
        let selector = LabelSelector {
            match_labels: [("vault".to_string(), "enabled".to_string())].into(),
            match_expressions: vec![],
        };
        let subject = SubjectReference {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            selector: Some(selector),
            ..Default::default()
        };
        let owner = BindingKey::new("team", "fleet");
        tracker.track(&subject, "team", &owner);

        let matching: BTreeMap<String, String> =
            [("vault".to_string(), "enabled".to_string())].into();
        assert_eq!(tracker.on_changed(observed("any", &matching)), vec![owner]);
        assert!(tracker.on_changed(observed("any", &BTreeMap::new())).is_empty());
    }

    #[tokio::test]
    async fn multiple_owners_are_each_enqueued_once() {
        let (tracker, seen) = recording_tracker(DEFAULT_LEASE);
        let a = BindingKey::new("team", "a");
        let b = BindingKey::new("team", "b");
        tracker.track(&deployment("web"), "team", &a);
        tracker.track(&deployment("web"), "team", &a);
        tracker.track(&deployment("web"), "team", &b);

        let labels = BTreeMap::new();
        assert_eq!(tracker.on_changed(observed("web", &labels)), vec![a, b]);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn untrack_removes_owner_everywhere() {
        let (tracker, _) = recording_tracker(DEFAULT_LEASE);
        let owner = BindingKey::new("team", "b");
        tracker.track(&deployment("web"), "team", &owner);
        tracker.track(&deployment("api"), "team", &owner);
        assert_eq!(tracker.len(), 2);

        tracker.untrack(&owner);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn reference_without_name_or_selector_is_ignored() {
        let (tracker, _) = recording_tracker(DEFAULT_LEASE);
        let subject = SubjectReference {
            api_version: "v1".into(),
            kind: "Pod".into(),
            ..Default::default()
        };
        tracker.track(&subject, "team", &BindingKey::new("team", "b"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn binding_key_display() {
        assert_eq!(BindingKey::new("team", "b").to_string(), "team/b");
    }
}
