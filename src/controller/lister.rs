//! Binding informer and the `list_all` contract used by the webhook
//!
//! The informer keeps a reflector cache of every DaytonaBinding in the
//! cluster. Admission requests read a snapshot of that cache through a
//! [`ListAll`] closure, and registered change handlers fire whenever the
//! binding set changes so downstream caches can be re-derived.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::Bindable;
use crate::controller::subjects::WATCH_TIMEOUT_SECS;
use crate::crd::DaytonaBinding;
use crate::Error;

/// Callback invoked when any binding is added, updated or removed
pub type ChangeHandler = Arc<dyn Fn() + Send + Sync>;

/// Snapshot query over all bindings
pub type ListAll = Arc<dyn Fn() -> Result<Vec<Arc<dyn Bindable>>, Error> + Send + Sync>;

/// Cached view of all DaytonaBindings
pub struct BindingInformer {
    store: Store<DaytonaBinding>,
    handlers: RwLock<Vec<ChangeHandler>>,
    synced: AtomicBool,
}

impl BindingInformer {
    /// Wrap a reflector store; fed by [`run_informer`]
    pub fn new(store: Store<DaytonaBinding>) -> Self {
        Self {
            store,
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        }
    }

    /// Register a handler fired on every change to the binding set
    pub fn add_change_handler(&self, handler: ChangeHandler) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    /// Whether the initial list has completed
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Current bindings, in no particular order
    pub fn snapshot(&self) -> Vec<Arc<DaytonaBinding>> {
        self.store.state()
    }

    /// Record a watch event that has already been applied to the store
    pub fn observe(&self, event: &Event<DaytonaBinding>) {
        match event {
            Event::Apply(_) | Event::Delete(_) => self.notify(),
            Event::InitDone => {
                if !self.synced.swap(true, Ordering::AcqRel) {
                    info!(count = self.store.state().len(), "Binding cache synced");
                }
                self.notify();
            }
            Event::Init | Event::InitApply(_) => {}
        }
    }

    fn notify(&self) {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        debug!(handlers = handlers.len(), "Binding set changed");
        for handler in handlers {
            handler();
        }
    }
}

/// Register `on_change` and return a closure listing every binding as [`Bindable`],
/// ordered by binding key.
///
/// The closure fails until the informer has completed its initial list, so
/// an admission request never acts on a partial view.
pub fn list_all(informer: Arc<BindingInformer>, on_change: ChangeHandler) -> ListAll {
    informer.add_change_handler(on_change);
    Arc::new(move || {
        if !informer.has_synced() {
            return Err(Error::internal_with_context(
                "lister",
                "binding cache has not synced yet",
            ));
        }
        let mut bindings = informer.snapshot();
        bindings.sort_by_cached_key(|b| b.binding_key());
        Ok(bindings
            .into_iter()
            .map(|b| b as Arc<dyn Bindable>)
            .collect())
    })
}

/// Feed the informer from a watch on all DaytonaBindings until cancelled
pub async fn run_informer(
    informer: Arc<BindingInformer>,
    writer: reflector::store::Writer<DaytonaBinding>,
    api: Api<DaytonaBinding>,
    cancel: CancellationToken,
) {
    let stream = reflector::reflector(
        writer,
        watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)),
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
            Some(Ok(event)) => informer.observe(&event),
            Some(Err(e)) => warn!(error = %e, "Binding watch error"),
            None => break,
        }
    }
    info!("Binding informer stopped");
}
