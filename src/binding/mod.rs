//! Binding capability traits and the injection engine
//!
//! The webhook and the reconciler only ever talk to bindings through
//! [`Bindable`]; the pod template of a subject is reached through
//! [`podable::SubjectKind`] so that a Deployment, a bare Pod and a CronJob are
//! all mutated the same way.

pub mod mutation;
pub mod podable;

use k8s_openapi::api::core::v1::PodSpec;

use crate::crd::SubjectReference;

/// Name of the injected init-container
pub const CONTAINER_NAME: &str = "daytona";

/// Name of the injected volume
pub const SECRET_VOLUME_NAME: &str = "vault-secrets";

/// Mount path used when a binding does not set one
pub const DEFAULT_MOUNT_PATH: &str = "/home/vault";

/// UID the init-container runs as
pub const RUN_AS_USER: i64 = 9999;

/// Medium of the in-memory secrets volume
pub const VOLUME_MEDIUM: &str = "Memory";

/// Environment variable marking the primary workload container
pub const USER_CONTAINER_MARKER: &str = "K_REVISION";

/// A resource that can project itself into the pod template of its subject.
///
/// `bind` and `unbind` are pure: they read the given template and return a
/// new one, so concurrent admission requests never share mutable state.
pub trait Bindable: Send + Sync {
    /// Namespace/name key of the binding
    fn key(&self) -> String;

    /// The subject reference, with its namespace defaulted to the binding's
    fn subject(&self) -> SubjectReference;

    /// Whether the binding is being deleted
    fn is_deleting(&self) -> bool;

    /// Inject the binding into a pod template (Do)
    fn bind(&self, pod: &PodSpec) -> PodSpec;

    /// Remove the binding from a pod template (Undo)
    fn unbind(&self, pod: &PodSpec) -> PodSpec;

    /// Whether `bind` mounts into the `K_REVISION` container only
    fn targets_user_container(&self) -> bool {
        true
    }

    /// Read access to the binding's status
    fn binding_status(&self) -> Option<&dyn BindableStatus>;
}

/// Status operations shared by every binding type
pub trait BindableStatus: Send + Sync {
    /// Set Ready and all dependent conditions to Unknown where unset
    fn initialize_conditions(&mut self);

    /// Mark the binding as fully applied
    fn mark_binding_available(&mut self);

    /// Mark the binding as not applicable, with a reason
    fn mark_binding_unavailable(&mut self, reason: &str, message: &str);

    /// Record the generation this status was computed from
    fn set_observed_generation(&mut self, generation: i64);

    /// Last generation that was reconciled
    fn observed_generation(&self) -> Option<i64>;

    /// Whether the aggregate Ready condition is True
    fn is_ready(&self) -> bool;
}
