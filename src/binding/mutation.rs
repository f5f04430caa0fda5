//! Pod template mutation for DaytonaBinding
//!
//! Two strategies share the reserved names:
//!
//! - **Init container** (default): an in-memory `vault-secrets` volume, a
//!   `daytona` init-container that logs into Vault and writes secrets into it,
//!   and a mount of the volume in the user container.
//! - **Secret volume** (`spec.secretRef` set): the volume is sourced from a
//!   Secret and mounted read-only into every container and init-container.
//!
//! Removal is by name only. Anything called `vault-secrets` or `daytona` is
//! treated as ours, so repeated bind/unbind pairs converge.

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSpec, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount,
};

use super::{
    CONTAINER_NAME, DEFAULT_MOUNT_PATH, RUN_AS_USER, SECRET_VOLUME_NAME, USER_CONTAINER_MARKER,
    VOLUME_MEDIUM,
};
use crate::crd::DaytonaBindingSpec;

/// Inject the binding into a pod template.
///
/// Always unbinds first so applying twice yields the same template as
/// applying once.
pub fn bind(spec: &DaytonaBindingSpec, pod: &PodSpec) -> PodSpec {
    let mut out = unbind(spec, pod);
    let mount = volume_mount(spec);

    out.volumes
        .get_or_insert_with(Vec::new)
        .push(secrets_volume(spec));

    match &spec.secret_ref {
        None => {
            out.init_containers
                .get_or_insert_with(Vec::new)
                .push(init_container(spec, mount.clone()));

            if let Some(i) = find_user_container(&out) {
                out.containers[i]
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(mount);
            }
        }
        Some(_) => {
            let containers = out
                .init_containers
                .iter_mut()
                .flatten()
                .chain(out.containers.iter_mut());
            for container in containers {
                container
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(mount.clone());
            }
        }
    }

    out
}

/// Remove the binding from a pod template.
///
/// Removes at most one volume and one init-container with the reserved
/// names, and the first mount of the reserved volume from each targeted
/// container.
pub fn unbind(spec: &DaytonaBindingSpec, pod: &PodSpec) -> PodSpec {
    let mut out = pod.clone();

    out.volumes = remove_first(pod.volumes.as_deref(), |v| v.name == SECRET_VOLUME_NAME);
    out.init_containers = remove_first(pod.init_containers.as_deref(), |c| {
        c.name == CONTAINER_NAME
    });

    match &spec.secret_ref {
        None => {
            if let Some(i) = find_user_container(pod) {
                out.containers[i] = without_secrets_mount(&pod.containers[i]);
            }
        }
        Some(_) => {
            out.init_containers = out
                .init_containers
                .map(|cs| cs.iter().map(without_secrets_mount).collect());
            out.containers = pod.containers.iter().map(without_secrets_mount).collect();
        }
    }

    out
}

/// Index of the user container: the first container whose environment
/// declares `K_REVISION`.
///
/// This is a heuristic. Sidecars and user containers can have any name, so
/// the marker variable injected by the serving layer is the only signal.
pub fn find_user_container(pod: &PodSpec) -> Option<usize> {
    pod.containers.iter().position(|c| {
        c.env
            .iter()
            .flatten()
            .any(|e| e.name == USER_CONTAINER_MARKER)
    })
}

/// Environment of the init-container.
///
/// `K8S_AUTH` and `K8S_AUTH_MOUNT` are always present; optional settings are
/// only emitted when non-empty.
pub fn daytona_env(spec: &DaytonaBindingSpec) -> Vec<EnvVar> {
    let mut vars = vec![
        env("K8S_AUTH", "true"),
        env("K8S_AUTH_MOUNT", &spec.auth_mount),
    ];

    let optional = [
        ("VAULT_AUTH_ROLE", &spec.auth_role),
        ("TOKEN_PATH", &spec.token_path),
        ("SECRET_PATH", &spec.secret_path),
        ("VAULT_SECRETS_APP", &spec.vault_secrets_app),
        ("VAULT_SECRETS_GLOBAL", &spec.vault_secrets_global),
    ];
    vars.extend(
        optional
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| env(name, value)),
    );

    vars
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn mount_path(spec: &DaytonaBindingSpec) -> String {
    if spec.mount_path.is_empty() {
        DEFAULT_MOUNT_PATH.to_string()
    } else {
        spec.mount_path.clone()
    }
}

fn volume_mount(spec: &DaytonaBindingSpec) -> VolumeMount {
    VolumeMount {
        name: SECRET_VOLUME_NAME.to_string(),
        mount_path: mount_path(spec),
        read_only: spec.secret_ref.as_ref().map(|_| true),
        ..Default::default()
    }
}

fn secrets_volume(spec: &DaytonaBindingSpec) -> Volume {
    match &spec.secret_ref {
        None => Volume {
            name: SECRET_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some(VOLUME_MEDIUM.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Some(secret) => Volume {
            name: SECRET_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn init_container(spec: &DaytonaBindingSpec, mount: VolumeMount) -> Container {
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        env: Some(daytona_env(spec)),
        security_context: Some(SecurityContext {
            run_as_user: Some(RUN_AS_USER),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        volume_mounts: Some(vec![mount]),
        ..Default::default()
    }
}

fn without_secrets_mount(container: &Container) -> Container {
    Container {
        volume_mounts: remove_first(container.volume_mounts.as_deref(), |m| {
            m.name == SECRET_VOLUME_NAME
        }),
        ..container.clone()
    }
}

/// Rebuild `items` without the first element matching `pred`.
///
/// Returns the input unchanged when nothing matches, and `None` when the
/// removal leaves the list empty.
fn remove_first<T: Clone>(items: Option<&[T]>, pred: impl Fn(&T) -> bool) -> Option<Vec<T>> {
    let items = items?;
    let Some(index) = items.iter().position(pred) else {
        return Some(items.to_vec());
    };

    let rest: Vec<T> = items
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, item)| item.clone())
        .collect();

    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
