//! Subject mutation webhook
//!
//! Handles AdmissionReview requests for pod-bearing resources. Every binding
//! whose subject addresses the admitted object is applied to its pod
//! template, in list order, and the result is returned as a JSON patch.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::binding::mutation::find_user_container;
use crate::binding::podable::SubjectKind;
use crate::binding::Bindable;
use crate::Error;

use super::WebhookState;

/// Handle mutating admission review for subjects
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_subject(&state, &req);
    Json(response.into_review())
}

/// Process a single admission request for a subject
pub(crate) fn mutate_subject(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = request.uid.clone();
    let allow = || AdmissionResponse::from(request);

    if !matches!(request.operation, Operation::Create | Operation::Update) {
        return allow();
    }
    let Some(kind) = SubjectKind::from_gvk(&request.kind.group, &request.kind.version, &request.kind.kind)
    else {
        debug!(uid = %uid, kind = %request.kind.kind, "Not a pod-bearing kind, allowing unchanged");
        return allow();
    };
    let Some(obj) = &request.object else {
        debug!(uid = %uid, "No object in request, allowing unchanged");
        return allow();
    };

    let bindings = match (state.list_all)() {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!(uid = %uid, error = %e, "Cannot list bindings");
            return allow().deny(e.to_string());
        }
    };

    let namespace = obj
        .metadata
        .namespace
        .clone()
        .or_else(|| request.namespace.clone())
        .unwrap_or_default();
    let object = match serde_json::to_value(obj) {
        Ok(v) => v,
        Err(e) => return allow().deny(format!("cannot encode object: {e}")),
    };

    let patch = match mutate_object(&bindings, kind, &namespace, &object) {
        Ok(Some(patch)) => patch,
        Ok(None) => return allow(),
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to mutate subject");
            return allow().deny(e.to_string());
        }
    };

    info!(
        uid = %uid,
        kind = %kind,
        name = ?obj.metadata.name,
        patch_ops = patch.0.len(),
        "Applying bindings to subject"
    );
    match allow().with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to serialize patch");
            allow().deny(format!("patch serialization error: {e}"))
        }
    }
}

/// Apply every binding addressing `object` and diff the result.
///
/// Bindings being deleted are unbound first, then live bindings are bound in
/// key order, so the result does not depend on the order of `bindings`.
/// Returns `None` when no binding applies or the mutations leave the object
/// unchanged.
pub fn mutate_object(
    bindings: &[Arc<dyn Bindable>],
    kind: SubjectKind,
    namespace: &str,
    object: &Value,
) -> Result<Option<json_patch::Patch>, Error> {
    let name = object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let labels: BTreeMap<String, String> = object
        .pointer("/metadata/labels")
        .cloned()
        .map(serde_json::from_value::<BTreeMap<String, String>>)
        .transpose()
        .map_err(|e| Error::serialization(format!("labels: {e}")))?
        .unwrap_or_default();

    let mut applicable: Vec<&Arc<dyn Bindable>> = bindings
        .iter()
        .filter(|b| {
            b.subject().matches_object(
                namespace,
                kind.api_version(),
                kind.kind(),
                namespace,
                name,
                &labels,
            )
        })
        .collect();
    if applicable.is_empty() {
        return Ok(None);
    }
    // Shared reserved names: a late unbind would strip a live injection
    applicable.sort_by_cached_key(|b| (!b.is_deleting(), b.key()));

    let Some(original) = kind.extract_pod_spec(object)? else {
        return Ok(None);
    };

    let mut pod = original.clone();
    for binding in applicable {
        if binding.is_deleting() {
            debug!(binding = %binding.key(), "Binding is being deleted, removing injection");
            pod = binding.unbind(&pod);
        } else {
            if binding.targets_user_container() && find_user_container(&pod).is_none() {
                warn!(
                    binding = %binding.key(),
                    subject = %kind,
                    name = %name,
                    "No container carries K_REVISION, secrets volume is not mounted into the workload"
                );
            }
            pod = binding.bind(&pod);
        }
    }

    if pod == original {
        return Ok(None);
    }

    let mut mutated = object.clone();
    kind.inject_pod_spec(&mut mutated, &original, &pod)?;
    let patch = json_patch::diff(object, &mutated);
    Ok((!patch.0.is_empty()).then_some(patch))
}
