//! Uniform access to the pod template of pod-bearing resources
//!
//! Admission requests arrive as untyped JSON. Rather than deserializing the
//! whole workload (and dropping fields the typed model does not know about),
//! only the embedded `PodSpec` is extracted, mutated, and the three lists the
//! mutation engine touches are written back.

use k8s_openapi::api::core::v1::PodSpec;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::Error;

/// A resource kind known to embed a pod template
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// `v1/Pod`
    Pod,
    /// `apps/v1/Deployment`
    Deployment,
    /// `apps/v1/StatefulSet`
    StatefulSet,
    /// `apps/v1/DaemonSet`
    DaemonSet,
    /// `apps/v1/ReplicaSet`
    ReplicaSet,
    /// `batch/v1/Job`
    Job,
    /// `batch/v1/CronJob`
    CronJob,
}

impl SubjectKind {
    /// Every supported kind
    pub const ALL: [SubjectKind; 7] = [
        Self::Pod,
        Self::Deployment,
        Self::StatefulSet,
        Self::DaemonSet,
        Self::ReplicaSet,
        Self::Job,
        Self::CronJob,
    ];

    /// Look up a kind by apiVersion and kind
    pub fn from_type(api_version: &str, kind: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.api_version() == api_version && k.kind() == kind)
    }

    /// Look up a kind by group, version and kind as found in admission requests
    pub fn from_gvk(group: &str, version: &str, kind: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.group() == group && k.version() == version && k.kind() == kind)
    }

    /// apiVersion string (`group/version`, or just `version` for core)
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Pod => "v1",
            Self::Deployment | Self::StatefulSet | Self::DaemonSet | Self::ReplicaSet => "apps/v1",
            Self::Job | Self::CronJob => "batch/v1",
        }
    }

    /// API group; empty for the core group
    pub fn group(&self) -> &'static str {
        match self {
            Self::Pod => "",
            Self::Deployment | Self::StatefulSet | Self::DaemonSet | Self::ReplicaSet => "apps",
            Self::Job | Self::CronJob => "batch",
        }
    }

    /// API version within the group
    pub fn version(&self) -> &'static str {
        "v1"
    }

    /// Kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::ReplicaSet => "ReplicaSet",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
        }
    }

    /// Lowercase plural resource name
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Pod => "pods",
            Self::Deployment => "deployments",
            Self::StatefulSet => "statefulsets",
            Self::DaemonSet => "daemonsets",
            Self::ReplicaSet => "replicasets",
            Self::Job => "jobs",
            Self::CronJob => "cronjobs",
        }
    }

    /// JSON pointer to the embedded `PodSpec`
    pub fn pod_spec_pointer(&self) -> &'static str {
        match self {
            Self::Pod => "/spec",
            Self::CronJob => "/spec/jobTemplate/spec/template/spec",
            _ => "/spec/template/spec",
        }
    }

    /// Read the pod spec out of an object.
    ///
    /// Returns `Ok(None)` when the object has no pod spec at the expected
    /// location (e.g. a half-populated object in a dry run).
    pub fn extract_pod_spec(&self, object: &Value) -> Result<Option<PodSpec>, Error> {
        match object.pointer(self.pod_spec_pointer()) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| Error::serialization(format!("{} pod spec: {e}", self.kind()))),
        }
    }

    /// Write the mutated lists of `updated` back into `object`.
    ///
    /// Only `volumes`, `initContainers` and `containers` are written, and
    /// only when they differ from `original`, so fields outside those lists
    /// are preserved byte for byte.
    pub fn inject_pod_spec(
        &self,
        object: &mut Value,
        original: &PodSpec,
        updated: &PodSpec,
    ) -> Result<(), Error> {
        let spec = object
            .pointer_mut(self.pod_spec_pointer())
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                Error::serialization(format!(
                    "{} has no pod spec at {}",
                    self.kind(),
                    self.pod_spec_pointer()
                ))
            })?;

        if original.volumes != updated.volumes {
            write_list(spec, "volumes", updated.volumes.as_ref())?;
        }
        if original.init_containers != updated.init_containers {
            write_list(spec, "initContainers", updated.init_containers.as_ref())?;
        }
        if original.containers != updated.containers {
            write_list(spec, "containers", Some(&updated.containers))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.api_version(), self.kind())
    }
}

fn write_list<T: Serialize>(
    spec: &mut Map<String, Value>,
    key: &str,
    items: Option<&Vec<T>>,
) -> Result<(), Error> {
    match items {
        None => {
            spec.remove(key);
        }
        Some(items) => {
            let value = serde_json::to_value(items)
                .map_err(|e| Error::serialization(format!("{key}: {e}")))?;
            spec.insert(key.to_string(), value);
        }
    }
    Ok(())
}
