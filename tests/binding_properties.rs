//! Properties of the injection engine, the condition set and the tracker,
//! exercised through the public API only.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, Volume, VolumeMount};
use serde_json::{json, Value};

use daytona_binding::binding::mutation::{bind, daytona_env, unbind};
use daytona_binding::binding::podable::SubjectKind;
use daytona_binding::binding::{Bindable, BindableStatus};
use daytona_binding::crd::{
    ConditionStatus, DaytonaBinding, DaytonaBindingSpec, DaytonaBindingStatus, LabelSelector,
    SecretRef, SubjectReference, CONDITION_PARAMETERS_VALID, CONDITION_SUBJECT_RESOLVED,
};
use daytona_binding::tracker::{BindingKey, ObservedObject, Tracker};
use daytona_binding::webhook::binding::mutate_object;

fn spec() -> DaytonaBindingSpec {
    DaytonaBindingSpec {
        subject: SubjectReference {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: Some("web".into()),
            ..Default::default()
        },
        image: "daytona:v1".into(),
        auth_mount: "k8s".into(),
        mount_path: "/home/vault".into(),
        ..Default::default()
    }
}

fn secret_spec() -> DaytonaBindingSpec {
    DaytonaBindingSpec {
        secret_ref: Some(SecretRef {
            name: "vault-dump".into(),
        }),
        ..spec()
    }
}

fn container(name: &str, env: &[(&str, &str)]) -> Container {
    Container {
        name: name.into(),
        image: Some(format!("{name}:1")),
        env: (!env.is_empty()).then(|| {
            env.iter()
                .map(|(k, v)| EnvVar {
                    name: k.to_string(),
                    value: Some(v.to_string()),
                    ..Default::default()
                })
                .collect()
        }),
        ..Default::default()
    }
}

/// Templates with no prior injected content
fn templates() -> Vec<PodSpec> {
    vec![
        PodSpec {
            containers: vec![container("app", &[("K_REVISION", "rev1")])],
            ..Default::default()
        },
        PodSpec {
            containers: vec![
                container("sidecar", &[]),
                container("app", &[("K_REVISION", "x")]),
            ],
            ..Default::default()
        },
        PodSpec {
            containers: vec![container("batch", &[])],
            ..Default::default()
        },
        PodSpec {
            containers: vec![Container {
                volume_mounts: Some(vec![VolumeMount {
                    name: "cache".into(),
                    mount_path: "/cache".into(),
                    ..Default::default()
                }]),
                ..container("app", &[("K_REVISION", "rev2")])
            }],
            init_containers: Some(vec![container("migrate", &[])]),
            volumes: Some(vec![Volume {
                name: "cache".into(),
                ..Default::default()
            }]),
            ..Default::default()
        },
    ]
}

#[test]
fn bind_is_idempotent_for_both_variants() {
    for spec in [spec(), secret_spec()] {
        for template in templates() {
            let once = bind(&spec, &template);
            assert_eq!(bind(&spec, &once), once);
        }
    }
}

#[test]
fn unbind_inverts_bind_on_clean_templates() {
    for template in templates() {
        assert_eq!(unbind(&spec(), &bind(&spec(), &template)), template);
    }
}

#[test]
fn secret_variant_unbind_restores_mounts_and_volumes() {
    for template in templates() {
        let restored = unbind(&secret_spec(), &bind(&secret_spec(), &template));
        assert_eq!(restored.containers, template.containers);
        assert_eq!(
            restored.volumes.unwrap_or_default(),
            template.volumes.clone().unwrap_or_default()
        );
    }
}

#[test]
fn env_has_two_required_and_five_optional_entries() {
    let full = DaytonaBindingSpec {
        auth_role: "reader".into(),
        token_path: "/home/vault/.token".into(),
        secret_path: "/home/vault/secrets".into(),
        vault_secrets_app: "app/web".into(),
        vault_secrets_global: "global".into(),
        ..spec()
    };
    let env: BTreeMap<String, String> = daytona_env(&full)
        .into_iter()
        .map(|e| (e.name, e.value.unwrap_or_default()))
        .collect();
    assert_eq!(env.len(), 7);
    assert_eq!(env["K8S_AUTH"], "true");
    assert_eq!(env["K8S_AUTH_MOUNT"], "k8s");
    assert_eq!(env["VAULT_AUTH_ROLE"], "reader");
    assert_eq!(env["TOKEN_PATH"], "/home/vault/.token");
    assert_eq!(env["SECRET_PATH"], "/home/vault/secrets");
    assert_eq!(env["VAULT_SECRETS_APP"], "app/web");
    assert_eq!(env["VAULT_SECRETS_GLOBAL"], "global");

    assert_eq!(daytona_env(&spec()).len(), 2);
}

#[test]
fn template_without_user_container_still_gets_volume_and_init_container() {
    let template = &templates()[2];
    let bound = bind(&spec(), template);
    assert_eq!(bound.volumes.as_ref().map(Vec::len), Some(1));
    assert_eq!(bound.init_containers.as_ref().map(Vec::len), Some(1));
    assert_eq!(bound.containers, template.containers);
}

/// Story: Ready follows its dependents through a binding's life
#[test]
fn story_ready_aggregates_dependent_conditions() {
    let ready = |status: &DaytonaBindingStatus| {
        status
            .condition("Ready")
            .map(|c| (c.status, c.reason.clone()))
            .unwrap_or_default()
    };

    let mut status = DaytonaBindingStatus::default();
    status.initialize_conditions();
    assert_eq!(ready(&status).0, ConditionStatus::Unknown);

    status.mark_parameters_valid();
    assert_eq!(ready(&status).0, ConditionStatus::Unknown);

    status.mark_subject_unresolved("SubjectNotFound", "deployment web not found");
    assert_eq!(
        ready(&status),
        (ConditionStatus::False, "SubjectNotFound".to_string())
    );

    status.mark_subject_resolved();
    assert_eq!(ready(&status).0, ConditionStatus::True);
    assert!(status.is_ready());
    for dependent in [CONDITION_SUBJECT_RESOLVED, CONDITION_PARAMETERS_VALID] {
        assert_eq!(
            status.condition(dependent).map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn tracker_lease_bounds_notifications() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let tracker = Tracker::new(
        Duration::from_secs(60),
        Arc::new(move |key: BindingKey| sink.lock().unwrap().push(key)),
    );
    let owner = BindingKey::new("team", "creds");
    let subject = SubjectReference {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        selector: Some(LabelSelector {
            match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            ..Default::default()
        }),
        ..Default::default()
    };
    tracker.track(&subject, "team", &owner);

    let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
    let observed = || ObservedObject {
        api_version: "apps/v1",
        kind: "Deployment",
        namespace: "team",
        name: "web-7f9",
        labels: &labels,
    };

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(tracker.on_changed(observed()), vec![owner.clone()]);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(tracker.on_changed(observed()).is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![owner]);
}

fn cronjob() -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "CronJob",
        "metadata": {"name": "nightly", "namespace": "team"},
        "spec": {
            "schedule": "0 3 * * *",
            "jobTemplate": {"spec": {"template": {"spec": {
                "restartPolicy": "Never",
                "containers": [{"name": "job", "image": "job:1", "env": [{"name": "K_REVISION", "value": "r"}]}]
            }}}}
        }
    })
}

#[test]
fn cronjob_templates_are_mutated_in_place() {
    let mut binding = DaytonaBinding::new(
        "creds",
        DaytonaBindingSpec {
            subject: SubjectReference {
                api_version: "batch/v1".into(),
                kind: "CronJob".into(),
                name: Some("nightly".into()),
                ..Default::default()
            },
            ..spec()
        },
    );
    binding.metadata.namespace = Some("team".into());
    let bindings: Vec<Arc<dyn Bindable>> = vec![Arc::new(binding)];

    let object = cronjob();
    let patch = mutate_object(&bindings, SubjectKind::CronJob, "team", &object)
        .unwrap()
        .expect("cronjob is a subject");
    let mut mutated = object.clone();
    json_patch::patch(&mut mutated, &patch).unwrap();

    let pod = &mutated["spec"]["jobTemplate"]["spec"]["template"]["spec"];
    assert_eq!(pod["initContainers"][0]["name"], "daytona");
    assert_eq!(pod["containers"][0]["volumeMounts"][0]["name"], "vault-secrets");
    assert_eq!(pod["restartPolicy"], "Never");
    assert_eq!(mutated["spec"]["schedule"], "0 3 * * *");
}
