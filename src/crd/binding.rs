//! DaytonaBinding Custom Resource Definition
//!
//! A DaytonaBinding points at a pod-bearing workload (its subject) and
//! describes how the Daytona init-container should log into Vault and where
//! the fetched secrets are written. The webhook applies it to the subject at
//! admission time; the controller only reports whether it is applicable.

use k8s_openapi::api::core::v1::PodSpec;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Condition, ConditionStatus, SecretRef, SubjectReference};
use crate::binding::podable::SubjectKind;
use crate::binding::{mutation, Bindable, BindableStatus, DEFAULT_MOUNT_PATH};
use crate::conditions::{ConditionSet, CONDITION_READY};
use crate::Error;

/// Dependent condition: the subject exists and is a supported kind
pub const CONDITION_SUBJECT_RESOLVED: &str = "SubjectResolved";

/// Dependent condition: the injection parameters are valid
pub const CONDITION_PARAMETERS_VALID: &str = "ParametersValid";

/// Spec fields accepted by the admission webhook
const KNOWN_SPEC_FIELDS: &[&str] = &[
    "subject",
    "image",
    "authMount",
    "authRole",
    "mountPath",
    "tokenPath",
    "secretPath",
    "vaultSecretsApp",
    "vaultSecretsGlobal",
    "secretRef",
];

/// Subject fields accepted by the admission webhook
const KNOWN_SUBJECT_FIELDS: &[&str] = &["apiVersion", "kind", "namespace", "name", "selector"];

/// Specification for a DaytonaBinding
///
/// Optional string parameters are forwarded verbatim into the environment of
/// the injected container and omitted when empty.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "binding.app",
    version = "v1alpha1",
    kind = "DaytonaBinding",
    plural = "daytonabindings",
    shortname = "db",
    status = "DaytonaBindingStatus",
    namespaced,
    printcolumn = r#"{"name":"Subject","type":"string","jsonPath":".spec.subject.kind"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DaytonaBindingSpec {
    /// The pod-bearing resource to inject into
    pub subject: SubjectReference,

    /// Daytona container image
    #[serde(default)]
    pub image: String,

    /// Name of the Vault Kubernetes auth backend
    #[serde(default)]
    pub auth_mount: String,

    /// Vault role; Daytona falls back to the service account name when unset
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_role: String,

    /// Where the secrets volume is mounted
    #[serde(default)]
    pub mount_path: String,

    /// Where Daytona writes the Vault token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_path: String,

    /// Where Daytona writes secrets
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_path: String,

    /// Application secret prefix in Vault
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vault_secrets_app: String,

    /// Global secret prefix in Vault
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vault_secrets_global: String,

    /// Mount an existing Secret instead of running the init-container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

impl DaytonaBindingSpec {
    /// Validate the spec of a binding living in `namespace`.
    ///
    /// Stops at the first problem; the error names the offending field.
    pub fn validate(&self, key: &str, namespace: &str) -> Result<(), Error> {
        if self.image.trim().is_empty() {
            return Err(Error::validation_for_field(
                key,
                "spec.image",
                "image must not be empty",
            ));
        }
        if self.auth_mount.trim().is_empty() && self.secret_ref.is_none() {
            return Err(Error::validation_for_field(
                key,
                "spec.authMount",
                "authMount must not be empty",
            ));
        }
        if !self.mount_path.is_empty() && !self.mount_path.starts_with('/') {
            return Err(Error::validation_for_field(
                key,
                "spec.mountPath",
                format!("mountPath must be absolute, got {:?}", self.mount_path),
            ));
        }
        if let Some(secret) = &self.secret_ref {
            if secret.name.is_empty() {
                return Err(Error::validation_for_field(
                    key,
                    "spec.secretRef.name",
                    "secret name must not be empty",
                ));
            }
        }
        self.validate_subject(key, namespace)
    }

    fn validate_subject(&self, key: &str, namespace: &str) -> Result<(), Error> {
        let subject = &self.subject;
        if subject.api_version.is_empty() {
            return Err(Error::validation_for_field(
                key,
                "spec.subject.apiVersion",
                "apiVersion must be set",
            ));
        }
        if subject.kind.is_empty() {
            return Err(Error::validation_for_field(
                key,
                "spec.subject.kind",
                "kind must be set",
            ));
        }
        match (&subject.name, &subject.selector) {
            (Some(_), Some(_)) => {
                return Err(Error::validation_for_field(
                    key,
                    "spec.subject",
                    "name and selector are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(Error::validation_for_field(
                    key,
                    "spec.subject",
                    "one of name or selector is required",
                ))
            }
            (Some(name), None) if name.is_empty() => {
                return Err(Error::validation_for_field(
                    key,
                    "spec.subject.name",
                    "name must not be empty",
                ))
            }
            _ => {}
        }
        if let Some(ns) = &subject.namespace {
            if ns != namespace {
                return Err(Error::validation_for_field(
                    key,
                    "spec.subject.namespace",
                    format!("subject must live in the binding namespace {namespace:?}, got {ns:?}"),
                ));
            }
        }
        Ok(())
    }

    /// The subject kind, when it is one the webhook knows how to mutate
    pub fn subject_kind(&self) -> Option<SubjectKind> {
        SubjectKind::from_type(&self.subject.api_version, &self.subject.kind)
    }
}

impl DaytonaBinding {
    /// Namespace/name key used in logs, errors and the tracker
    pub fn binding_key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Fill in `mountPath` and the subject namespace when unset
    pub fn set_defaults(&mut self) {
        if self.spec.mount_path.is_empty() {
            self.spec.mount_path = DEFAULT_MOUNT_PATH.to_string();
        }
        if self.spec.subject.namespace.is_none() {
            self.spec.subject.namespace = self.namespace();
        }
    }

    /// Validate the binding's spec
    pub fn validate(&self) -> Result<(), Error> {
        self.spec
            .validate(&self.binding_key(), &self.namespace().unwrap_or_default())
    }
}

/// List the spec fields of a raw object the CRD does not define.
///
/// Returned paths are relative to the object root, e.g. `spec.subject.uid`.
pub fn unknown_spec_fields(object: &Value) -> Vec<String> {
    let mut unknown = Vec::new();
    let Some(spec) = object.get("spec").and_then(Value::as_object) else {
        return unknown;
    };
    unknown.extend(
        spec.keys()
            .filter(|k| !KNOWN_SPEC_FIELDS.contains(&k.as_str()))
            .map(|k| format!("spec.{k}")),
    );
    if let Some(subject) = spec.get("subject").and_then(Value::as_object) {
        unknown.extend(
            subject
                .keys()
                .filter(|k| !KNOWN_SUBJECT_FIELDS.contains(&k.as_str()))
                .map(|k| format!("spec.subject.{k}")),
        );
    }
    unknown
}

/// Status for a DaytonaBinding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaytonaBindingStatus {
    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Ready plus its dependent conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DaytonaBindingStatus {
    /// The condition set backing `Ready`
    pub const CONDITIONS: ConditionSet =
        ConditionSet::living(&[CONDITION_SUBJECT_RESOLVED, CONDITION_PARAMETERS_VALID]);

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Record that the subject was found
    pub fn mark_subject_resolved(&mut self) {
        Self::CONDITIONS
            .manage(&mut self.conditions)
            .mark_true(CONDITION_SUBJECT_RESOLVED);
    }

    /// Record that the subject could not be found or is unsupported
    pub fn mark_subject_unresolved(&mut self, reason: &str, message: &str) {
        Self::CONDITIONS
            .manage(&mut self.conditions)
            .mark_false(CONDITION_SUBJECT_RESOLVED, reason, message);
    }

    /// Record that resolving the subject has not finished
    pub fn mark_subject_unknown(&mut self, reason: &str, message: &str) {
        Self::CONDITIONS
            .manage(&mut self.conditions)
            .mark_unknown(CONDITION_SUBJECT_RESOLVED, reason, message);
    }

    /// Record that the injection parameters are valid
    pub fn mark_parameters_valid(&mut self) {
        Self::CONDITIONS
            .manage(&mut self.conditions)
            .mark_true(CONDITION_PARAMETERS_VALID);
    }

    /// Record that the injection parameters are invalid
    pub fn mark_parameters_invalid(&mut self, reason: &str, message: &str) {
        Self::CONDITIONS
            .manage(&mut self.conditions)
            .mark_false(CONDITION_PARAMETERS_VALID, reason, message);
    }
}

impl BindableStatus for DaytonaBindingStatus {
    fn initialize_conditions(&mut self) {
        Self::CONDITIONS
            .manage(&mut self.conditions)
            .initialize_conditions();
    }

    fn mark_binding_available(&mut self) {
        let mut manager = Self::CONDITIONS.manage(&mut self.conditions);
        for dependent in Self::CONDITIONS.dependents() {
            manager.mark_true(dependent);
        }
        manager.mark_true(CONDITION_READY);
    }

    fn mark_binding_unavailable(&mut self, reason: &str, message: &str) {
        Self::CONDITIONS
            .manage(&mut self.conditions)
            .mark_false(CONDITION_READY, reason, message);
    }

    fn set_observed_generation(&mut self, generation: i64) {
        self.observed_generation = Some(generation);
    }

    fn observed_generation(&self) -> Option<i64> {
        self.observed_generation
    }

    fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

impl Bindable for DaytonaBinding {
    fn key(&self) -> String {
        self.binding_key()
    }

    fn subject(&self) -> SubjectReference {
        let mut subject = self.spec.subject.clone();
        if subject.namespace.is_none() {
            subject.namespace = self.namespace();
        }
        subject
    }

    fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    fn bind(&self, pod: &PodSpec) -> PodSpec {
        mutation::bind(&self.spec, pod)
    }

    fn unbind(&self, pod: &PodSpec) -> PodSpec {
        mutation::unbind(&self.spec, pod)
    }

    fn targets_user_container(&self) -> bool {
        self.spec.secret_ref.is_none()
    }

    fn binding_status(&self) -> Option<&dyn BindableStatus> {
        self.status.as_ref().map(|s| s as &dyn BindableStatus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    const BINDING_YAML: &str = r#"
apiVersion: binding.app/v1alpha1
kind: DaytonaBinding
metadata:
  name: web-secrets
  namespace: team
spec:
  subject:
    apiVersion: apps/v1
    kind: Deployment
    name: web
  image: daytona:v1
  authMount: k8s
  authRole: web
"#;

    fn binding() -> DaytonaBinding {
        serde_yaml::from_str(BINDING_YAML).unwrap()
    }

    /// Story: an operator applies a binding with only the required fields
    ///
    /// Defaulting fills in the mount path and pins the subject to the
    /// binding namespace, after which the binding validates cleanly.
    #[test]
    fn story_minimal_binding_is_defaulted_and_valid() {
        let mut b = binding();
        assert_eq!(b.spec.mount_path, "");
        assert_eq!(b.spec.subject_kind(), Some(SubjectKind::Deployment));

        b.set_defaults();
        assert_eq!(b.spec.mount_path, "/home/vault");
        assert_eq!(b.spec.subject.namespace.as_deref(), Some("team"));
        assert!(b.validate().is_ok());
        assert_eq!(b.binding_key(), "team/web-secrets");
    }

    #[test]
    fn defaults_do_not_override_user_values() {
        let mut b = binding();
        b.spec.mount_path = "/secrets".into();
        b.set_defaults();
        assert_eq!(b.spec.mount_path, "/secrets");
    }

    fn field_of(err: Error) -> Option<String> {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn empty_image_is_rejected() {
        let mut b = binding();
        b.spec.image = String::new();
        assert_eq!(field_of(b.validate().unwrap_err()).as_deref(), Some("spec.image"));
    }

    #[test]
    fn empty_auth_mount_is_rejected() {
        let mut b = binding();
        b.spec.auth_mount = " ".into();
        assert_eq!(
            field_of(b.validate().unwrap_err()).as_deref(),
            Some("spec.authMount")
        );
    }

    #[test]
    fn relative_mount_path_is_rejected() {
        let mut b = binding();
        b.spec.mount_path = "vault".into();
        assert_eq!(
            field_of(b.validate().unwrap_err()).as_deref(),
            Some("spec.mountPath")
        );
    }

    #[test]
    fn subject_needs_exactly_one_of_name_or_selector() {
        let mut b = binding();
        b.spec.subject.name = None;
        assert_eq!(field_of(b.validate().unwrap_err()).as_deref(), Some("spec.subject"));

        b.spec.subject.name = Some("web".into());
        b.spec.subject.selector = Some(Default::default());
        assert_eq!(field_of(b.validate().unwrap_err()).as_deref(), Some("spec.subject"));
    }

    #[test]
    fn cross_namespace_subject_is_rejected() {
        let mut b = binding();
        b.spec.subject.namespace = Some("other".into());
        assert_eq!(
            field_of(b.validate().unwrap_err()).as_deref(),
            Some("spec.subject.namespace")
        );
    }

    #[test]
    fn secret_variant_does_not_need_auth_mount() {
        let mut b = binding();
        b.spec.auth_mount = String::new();
        b.spec.secret_ref = Some(SecretRef {
            name: "vault-token".into(),
        });
        assert!(b.validate().is_ok());
    }

    #[test]
    fn unknown_fields_are_reported() {
        let object = serde_json::json!({
            "spec": {
                "subject": {"apiVersion": "v1", "kind": "Pod", "name": "p", "uid": "x"},
                "image": "daytona:v1",
                "authMount": "k8s",
                "imagePullPolicy": "Always"
            }
        });
        let mut unknown = unknown_spec_fields(&object);
        unknown.sort();
        assert_eq!(unknown, vec!["spec.imagePullPolicy", "spec.subject.uid"]);

        let clean = serde_json::to_value(binding()).unwrap();
        assert!(unknown_spec_fields(&clean).is_empty());
    }

    #[test]
    fn subject_is_namespaced_by_binding_when_unset() {
        let b = binding();
        assert_eq!(Bindable::subject(&b).namespace.as_deref(), Some("team"));
        assert!(!b.is_deleting());
        assert!(b.binding_status().is_none());
    }

    #[test]
    fn bindable_delegates_to_mutation_engine() {
        let b = binding();
        let pod = PodSpec::default();
        let bound = Bindable::bind(&b, &pod);
        assert_eq!(bound.init_containers.as_ref().map(Vec::len), Some(1));
        assert_eq!(Bindable::unbind(&b, &bound), pod);
    }

    #[test]
    fn status_lifecycle_reaches_ready() {
        let mut status = DaytonaBindingStatus::default();
        status.initialize_conditions();
        assert!(!status.is_ready());
        assert_eq!(
            status.condition(CONDITION_READY).map(|c| c.status),
            Some(ConditionStatus::Unknown)
        );

        status.mark_parameters_valid();
        status.mark_subject_resolved();
        assert!(status.is_ready());

        status.mark_subject_unresolved("SubjectNotFound", "deployment web not found");
        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "SubjectNotFound");
    }

    #[test]
    fn mark_available_and_unavailable_force_ready() {
        let mut status = DaytonaBindingStatus::default();
        status.initialize_conditions();
        status.mark_binding_available();
        assert!(status.is_ready());

        status.mark_binding_unavailable("Deleted", "binding is being deleted");
        assert!(!status.is_ready());
        status.set_observed_generation(3);
        assert_eq!(BindableStatus::observed_generation(&status), Some(3));
    }

    #[test]
    fn crd_has_status_and_printer_columns() {
        let crd = DaytonaBinding::crd();
        assert_eq!(crd.spec.group, "binding.app");
        assert_eq!(crd.spec.names.kind, "DaytonaBinding");
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().unwrap().status.is_some());
        let columns: Vec<_> = version
            .additional_printer_columns
            .iter()
            .flatten()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(columns, vec!["Subject", "Ready", "Reason", "Age"]);
    }
}
