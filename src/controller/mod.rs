//! Controller implementations for DaytonaBinding
//!
//! This module contains the reconciler, the binding informer consumed by the
//! webhook, and the dynamic subject watches that feed the tracker.

mod binding;
pub mod lister;
pub mod subjects;

pub use binding::{
    error_policy, reconcile, BindingClient, Context, ContextBuilder, KubeBindingClient,
    FIELD_MANAGER,
};
pub use lister::{list_all, run_informer, BindingInformer, ChangeHandler, ListAll};
pub use subjects::{SubjectWatcher, SubjectWatches, WATCH_TIMEOUT_SECS};
