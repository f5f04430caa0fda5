//! Defaulting and validating admission for DaytonaBinding itself

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::Resource;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::crd::{unknown_spec_fields, DaytonaBinding};
use crate::Error;

use super::WebhookState;

/// Handle the defaulting admission review
pub async fn defaulting_handler(
    State(_state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(default_binding(&req).into_review())
}

/// Handle the validating admission review
pub async fn validation_handler(
    State(_state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(validate_binding(&req).into_review())
}

fn is_binding(request: &AdmissionRequest<DynamicObject>) -> bool {
    request.kind.group == DaytonaBinding::group(&())
        && request.kind.kind == DaytonaBinding::kind(&())
}

/// Parse the admitted object as a DaytonaBinding, keeping the raw form
fn parse(request: &AdmissionRequest<DynamicObject>) -> Result<Option<(Value, DaytonaBinding)>, Error> {
    let Some(obj) = &request.object else {
        return Ok(None);
    };
    let raw = serde_json::to_value(obj).map_err(|e| Error::serialization(e.to_string()))?;
    let mut binding: DaytonaBinding = serde_json::from_value(raw.clone())
        .map_err(|e| Error::validation(format!("malformed DaytonaBinding: {e}")))?;
    if binding.metadata.namespace.is_none() {
        binding.metadata.namespace = request.namespace.clone();
    }
    Ok(Some((raw, binding)))
}

/// Fill in defaults and return them as a JSON patch
pub(crate) fn default_binding(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let allow = || AdmissionResponse::from(request);
    if !is_binding(request) || !matches!(request.operation, Operation::Create | Operation::Update) {
        return allow();
    }

    let (raw, mut binding) = match parse(request) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return allow(),
        Err(e) => return allow().deny(e.to_string()),
    };
    binding.set_defaults();

    let patch = match defaults_patch(&raw, &binding) {
        Ok(patch) => patch,
        Err(e) => return allow().deny(e.to_string()),
    };
    if patch.0.is_empty() {
        return allow();
    }

    debug!(
        binding = %binding.binding_key(),
        patch_ops = patch.0.len(),
        "Defaulting binding"
    );
    match allow().with_patch(patch) {
        Ok(response) => response,
        Err(e) => allow().deny(format!("patch serialization error: {e}")),
    }
}

/// Diff the defaulted fields of `binding` against the admitted raw object.
///
/// Only the defaulted fields are written back so values the typed spec does
/// not model survive untouched.
fn defaults_patch(raw: &Value, binding: &DaytonaBinding) -> Result<json_patch::Patch, Error> {
    let mut defaulted = raw.clone();
    let Some(spec) = defaulted.get_mut("spec").and_then(Value::as_object_mut) else {
        return Ok(json_patch::Patch(Vec::new()));
    };
    spec.insert(
        "mountPath".to_string(),
        Value::String(binding.spec.mount_path.clone()),
    );
    if let (Some(subject), Some(ns)) = (
        spec.get_mut("subject").and_then(Value::as_object_mut),
        &binding.spec.subject.namespace,
    ) {
        subject.insert("namespace".to_string(), Value::String(ns.clone()));
    }
    Ok(json_patch::diff(raw, &defaulted))
}

/// Admit or reject a DaytonaBinding
pub(crate) fn validate_binding(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let allow = || AdmissionResponse::from(request);
    if !is_binding(request) || !matches!(request.operation, Operation::Create | Operation::Update) {
        return allow();
    }

    let (raw, binding) = match parse(request) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return allow(),
        Err(e) => return allow().deny(e.to_string()),
    };

    let unknown = unknown_spec_fields(&raw);
    if !unknown.is_empty() {
        info!(binding = %binding.binding_key(), fields = ?unknown, "Rejecting unknown fields");
        return allow().deny(format!("unknown fields: {}", unknown.join(", ")));
    }

    match binding.validate() {
        Ok(()) => allow(),
        Err(e) => {
            info!(binding = %binding.binding_key(), error = %e, "Rejecting invalid binding");
            allow().deny(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(operation: &str, object: Value) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "e911857d-c318-11e8-bbad-025000000001",
                "kind": {"group": "binding.app", "version": "v1alpha1", "kind": "DaytonaBinding"},
                "resource": {"group": "binding.app", "version": "v1alpha1", "resource": "daytonabindings"},
                "name": "creds",
                "namespace": "team",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": object,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn binding_object(spec: Value) -> Value {
        json!({
            "apiVersion": "binding.app/v1alpha1",
            "kind": "DaytonaBinding",
            "metadata": {"name": "creds", "namespace": "team"},
            "spec": spec
        })
    }

    fn valid_spec() -> Value {
        json!({
            "subject": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"},
            "image": "daytona:v1",
            "authMount": "k8s"
        })
    }

    /// Story: a minimal binding is completed by defaulting, then admitted
    #[test]
    fn story_minimal_binding_is_defaulted_then_admitted() {
        let object = binding_object(valid_spec());
        let response = default_binding(&request("CREATE", object.clone()));
        assert!(response.allowed);

        let ops: Vec<Value> =
            serde_json::from_slice(response.patch.as_deref().expect("defaults patch")).unwrap();
        let mut defaulted = object.clone();
        let patch: json_patch::Patch = serde_json::from_value(Value::Array(ops)).unwrap();
        json_patch::patch(&mut defaulted, &patch).unwrap();
        assert_eq!(defaulted["spec"]["mountPath"], "/home/vault");
        assert_eq!(defaulted["spec"]["subject"]["namespace"], "team");
        assert_eq!(defaulted["spec"]["image"], "daytona:v1");

        let response = validate_binding(&request("CREATE", defaulted));
        assert!(response.allowed);
    }

    #[test]
    fn defaulted_binding_needs_no_patch() {
        let mut spec = valid_spec();
        spec["mountPath"] = json!("/secrets");
        spec["subject"]["namespace"] = json!("team");
        let response = default_binding(&request("UPDATE", binding_object(spec)));
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut spec = valid_spec();
        spec["vaultAddr"] = json!("https://vault");
        let response = validate_binding(&request("CREATE", binding_object(spec)));
        assert!(!response.allowed);
        assert!(response.result.message.contains("spec.vaultAddr"));
    }

    #[test]
    fn invalid_spec_is_rejected_with_reason() {
        let mut spec = valid_spec();
        spec["image"] = json!("");
        let response = validate_binding(&request("CREATE", binding_object(spec)));
        assert!(!response.allowed);
        assert!(response.result.message.contains("image"));
    }

    #[test]
    fn subject_in_another_namespace_is_rejected() {
        let mut spec = valid_spec();
        spec["subject"]["namespace"] = json!("prod");
        let response = validate_binding(&request("UPDATE", binding_object(spec)));
        assert!(!response.allowed);
    }

    #[test]
    fn malformed_spec_is_rejected() {
        let response = validate_binding(&request(
            "CREATE",
            binding_object(json!({"subject": "web", "image": "daytona:v1"})),
        ));
        assert!(!response.allowed);
    }

    #[test]
    fn deletes_are_always_admitted() {
        let mut spec = valid_spec();
        spec["image"] = json!("");
        let response = validate_binding(&request("DELETE", binding_object(spec)));
        assert!(response.allowed);
    }
}
