//! Desired child objects of a session, rebuilt from the spec on every pass.

use crate::crds::{InteractiveSession, ReadinessProbeType};
use crate::tasks::config::ControllerConfig;
use crate::tasks::session::naming::ResourceNaming;
use crate::tasks::types::Result;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use serde_json::{json, Value};

pub const SESSION_CONTAINER_NAME: &str = "session";
pub const AUTH_PROXY_CONTAINER_NAME: &str = "authproxy";
pub const SERVICE_PORT_NAME: &str = "http";
pub const SERVICE_META_PORT_NAME: &str = "http-meta";
pub const SERVICE_PORT: i32 = 80;
/// Port the authentication proxy listens on in front of the session
pub const AUTH_PROXY_PORT: i32 = 65535;
/// Port of the proxy metadata endpoints (`/request_stats`)
pub const AUTH_PROXY_META_PORT: i32 = 65534;

const SESSION_VOLUME_NAME: &str = "session-volume";
const SHM_VOLUME_NAME: &str = "dev-shm";
const AUTH_VOLUME_NAME: &str = "session-auth";
const AUTH_CONFIG_DIR: &str = "/etc/authproxy";
const DATA_SOURCE_SECRET_ANNOTATION: &str = "csi-rclone.dev/secretName";

/// Path prefix the session is served under, always ending in `/`
pub fn path_prefix(session: &InteractiveSession) -> String {
    let path = session.spec.session.url_path.trim();
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Public URL of the session, `None` when no ingress host is declared
pub fn session_url(session: &InteractiveSession) -> Option<String> {
    let ingress = session.spec.ingress.as_ref()?;
    let host = ingress.host.as_deref().filter(|h| !h.is_empty())?;
    let scheme = if ingress
        .tls_secret
        .as_ref()
        .is_some_and(|tls| !tls.name.is_empty())
    {
        "https"
    } else {
        "http"
    };
    Some(format!("{scheme}://{host}{}", path_prefix(session)))
}

pub fn stateful_set(session: &InteractiveSession, config: &ControllerConfig) -> Result<StatefulSet> {
    let spec = &session.spec;
    let name = ResourceNaming::child_name(session);
    let labels = ResourceNaming::labels(session);
    let replicas = i32::from(!spec.hibernated);

    let mut volumes = vec![json!({
        "name": SESSION_VOLUME_NAME,
        "persistentVolumeClaim": { "claimName": name }
    })];
    let mut mounts = vec![json!({
        "name": SESSION_VOLUME_NAME,
        "mountPath": spec.session.storage.mount_path
    })];

    if let Some(shm_size) = &spec.session.shm_size {
        volumes.push(json!({
            "name": SHM_VOLUME_NAME,
            "emptyDir": { "medium": "Memory", "sizeLimit": shm_size }
        }));
        mounts.push(json!({ "name": SHM_VOLUME_NAME, "mountPath": "/dev/shm" }));
    }

    for (index, data_source) in spec.data_sources.iter().enumerate() {
        let volume_name = ResourceNaming::data_source_volume_name(index);
        volumes.push(json!({
            "name": volume_name,
            "persistentVolumeClaim": {
                "claimName": ResourceNaming::data_source_claim_name(session, index)
            }
        }));
        mounts.push(json!({
            "name": volume_name,
            "mountPath": data_source.mount_path
        }));
    }

    for mount in &spec.session.extra_volume_mounts {
        mounts.push(serde_json::to_value(mount)?);
    }

    let mut session_container = json!({
        "name": SESSION_CONTAINER_NAME,
        "image": spec.session.image,
        "env": spec.session.env,
        "ports": [{ "name": "session", "containerPort": spec.session.port }],
        "volumeMounts": mounts,
        "securityContext": {
            "runAsUser": spec.session.run_as_user,
            "runAsGroup": spec.session.run_as_group,
            "runAsNonRoot": spec.session.run_as_user != 0
        }
    });
    if !spec.session.command.is_empty() {
        session_container["command"] = json!(spec.session.command);
    }
    if !spec.session.args.is_empty() {
        session_container["args"] = json!(spec.session.args);
    }
    if let Some(resources) = &spec.session.resources {
        session_container["resources"] = serde_json::to_value(resources)?;
    }
    if let Some(working_dir) = &spec.session.working_dir {
        session_container["workingDir"] = json!(working_dir);
    }
    if let Some(policy) = &spec.session.image_pull_policy {
        session_container["imagePullPolicy"] = json!(policy);
    }
    if let Some(probe) = readiness_probe(session) {
        session_container["readinessProbe"] = probe;
    }

    let mut containers = vec![session_container];

    if let Some(auth) = spec.authentication.as_ref().filter(|a| a.enabled) {
        volumes.push(json!({
            "name": AUTH_VOLUME_NAME,
            "secret": { "secretName": auth.secret_ref.name }
        }));
        let mut auth_mounts = vec![json!({
            "name": AUTH_VOLUME_NAME,
            "mountPath": AUTH_CONFIG_DIR,
            "readOnly": true
        })];
        for mount in &auth.extra_volume_mounts {
            auth_mounts.push(serde_json::to_value(mount)?);
        }
        let config_file = auth.secret_ref.key.as_deref().unwrap_or("config.yaml");

        containers.push(json!({
            "name": AUTH_PROXY_CONTAINER_NAME,
            "image": config.sidecars.image,
            "args": ["authproxy", "serve"],
            "env": [
                { "name": "AUTHPROXY_MODE", "value": auth.auth_type.to_string() },
                { "name": "AUTHPROXY_PORT", "value": AUTH_PROXY_PORT.to_string() },
                { "name": "AUTHPROXY_META_PORT", "value": AUTH_PROXY_META_PORT.to_string() },
                {
                    "name": "AUTHPROXY_REMOTE",
                    "value": format!("http://127.0.0.1:{}", spec.session.port)
                },
                { "name": "AUTHPROXY_PATH_PREFIX", "value": path_prefix(session) },
                {
                    "name": "AUTHPROXY_CONFIG_FILE",
                    "value": format!("{AUTH_CONFIG_DIR}/{config_file}")
                }
            ],
            "ports": [
                { "name": "auth-proxy", "containerPort": AUTH_PROXY_PORT },
                { "name": "auth-meta", "containerPort": AUTH_PROXY_META_PORT }
            ],
            "volumeMounts": auth_mounts,
            "readinessProbe": {
                "tcpSocket": { "port": AUTH_PROXY_PORT },
                "periodSeconds": 5
            },
            "securityContext": {
                "runAsUser": 1000,
                "runAsGroup": 1000,
                "runAsNonRoot": true,
                "allowPrivilegeEscalation": false
            }
        }));
    }

    for container in &spec.extra_containers {
        containers.push(serde_json::to_value(container)?);
    }
    for volume in &spec.extra_volumes {
        volumes.push(serde_json::to_value(volume)?);
    }

    let mut pod_spec = json!({
        "enableServiceLinks": false,
        "securityContext": {
            "fsGroup": spec.session.run_as_group,
            "fsGroupChangePolicy": "OnRootMismatch"
        },
        "containers": containers,
        "volumes": volumes
    });
    if !spec.init_containers.is_empty() {
        pod_spec["initContainers"] = serde_json::to_value(&spec.init_containers)?;
    }
    if !spec.tolerations.is_empty() {
        pod_spec["tolerations"] = serde_json::to_value(&spec.tolerations)?;
    }
    if !spec.node_selector.is_empty() {
        pod_spec["nodeSelector"] = json!(spec.node_selector);
    }
    if let Some(affinity) = &spec.affinity {
        pod_spec["affinity"] = serde_json::to_value(affinity)?;
    }
    if let Some(priority_class) = spec.priority_class_name.as_ref().filter(|p| !p.is_empty()) {
        pod_spec["priorityClassName"] = json!(priority_class);
    }
    if let Some(sa_name) = spec
        .service_account_name
        .as_ref()
        .filter(|s| !s.trim().is_empty())
    {
        pod_spec["serviceAccountName"] = json!(sa_name);
    }
    if !spec.image_pull_secrets.is_empty() {
        let secrets: Vec<Value> = spec
            .image_pull_secrets
            .iter()
            .map(|secret| json!({ "name": secret.name }))
            .collect();
        pod_spec["imagePullSecrets"] = json!(secrets);
    }

    let sts = json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "labels": labels
        },
        "spec": {
            "replicas": replicas,
            "podManagementPolicy": "Parallel",
            "selector": { "matchLabels": ResourceNaming::selector_labels(session) },
            "template": {
                "metadata": { "labels": labels },
                "spec": pod_spec
            }
        }
    });

    Ok(serde_json::from_value(sts)?)
}

fn readiness_probe(session: &InteractiveSession) -> Option<Value> {
    let container = &session.spec.session;
    match container.readiness_probe.probe_type {
        ReadinessProbeType::None => None,
        ReadinessProbeType::Tcp => Some(json!({
            "tcpSocket": { "port": container.port },
            "periodSeconds": 10,
            "failureThreshold": 3
        })),
        ReadinessProbeType::Http => Some(json!({
            "httpGet": { "path": path_prefix(session), "port": container.port },
            "periodSeconds": 10,
            "failureThreshold": 3
        })),
    }
}

pub fn service(session: &InteractiveSession) -> Result<Service> {
    let target_port = if session.authentication_enabled() {
        AUTH_PROXY_PORT
    } else {
        session.spec.session.port
    };

    let svc = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": ResourceNaming::child_name(session),
            "labels": ResourceNaming::labels(session)
        },
        "spec": {
            "ports": [
                {
                    "name": SERVICE_PORT_NAME,
                    "port": SERVICE_PORT,
                    "targetPort": target_port,
                    "protocol": "TCP"
                },
                {
                    "name": SERVICE_META_PORT_NAME,
                    "port": AUTH_PROXY_META_PORT,
                    "targetPort": AUTH_PROXY_META_PORT,
                    "protocol": "TCP"
                }
            ],
            "selector": ResourceNaming::selector_labels(session)
        }
    });

    Ok(serde_json::from_value(svc)?)
}

/// `None` when the session declares no ingress
pub fn ingress(session: &InteractiveSession) -> Result<Option<Ingress>> {
    let Some(declared) = &session.spec.ingress else {
        return Ok(None);
    };
    let name = ResourceNaming::child_name(session);

    let mut rule = json!({
        "http": {
            "paths": [{
                "path": path_prefix(session),
                "pathType": "Prefix",
                "backend": {
                    "service": { "name": name, "port": { "name": SERVICE_PORT_NAME } }
                }
            }]
        }
    });
    if let Some(host) = declared.host.as_ref().filter(|h| !h.is_empty()) {
        rule["host"] = json!(host);
    }

    let mut spec = json!({ "rules": [rule] });
    if let Some(class) = &declared.ingress_class_name {
        spec["ingressClassName"] = json!(class);
    }
    if let Some(tls) = declared.tls_secret.as_ref().filter(|t| !t.name.is_empty()) {
        let hosts: Vec<&String> = declared.host.iter().collect();
        spec["tls"] = json!([{ "hosts": hosts, "secretName": tls.name }]);
    }

    let ing = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": name,
            "labels": ResourceNaming::labels(session),
            "annotations": declared.annotations
        },
        "spec": spec
    });

    Ok(Some(serde_json::from_value(ing)?))
}

/// Primary claim backing the session volume
pub fn session_claim(
    session: &InteractiveSession,
    config: &ControllerConfig,
) -> Result<PersistentVolumeClaim> {
    let storage = &session.spec.session.storage;
    let size = storage
        .size
        .as_ref()
        .map_or_else(|| config.storage.default_session_size.clone(), |q| q.0.clone());

    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": size } }
    });
    if let Some(class) = storage.class_name.as_ref().filter(|c| !c.is_empty()) {
        spec["storageClassName"] = json!(class);
    }

    let pvc = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": ResourceNaming::child_name(session),
            "labels": ResourceNaming::labels(session)
        },
        "spec": spec
    });

    Ok(serde_json::from_value(pvc)?)
}

/// One claim per data source, mounted through the rclone CSI storage class
pub fn data_source_claims(
    session: &InteractiveSession,
    config: &ControllerConfig,
) -> Result<Vec<PersistentVolumeClaim>> {
    session
        .spec
        .data_sources
        .iter()
        .enumerate()
        .map(|(index, data_source)| {
            let pvc = json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": {
                    "name": ResourceNaming::data_source_claim_name(session, index),
                    "labels": ResourceNaming::labels(session),
                    "annotations": {
                        (DATA_SOURCE_SECRET_ANNOTATION): data_source.secret_ref.name
                    }
                },
                "spec": {
                    "accessModes": [data_source.access_mode],
                    "resources": {
                        "requests": { "storage": config.storage.data_source_size }
                    },
                    "storageClassName": config.storage.data_source_storage_class
                }
            });
            Ok(serde_json::from_value(pvc)?)
        })
        .collect()
}
