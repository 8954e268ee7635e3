//! Session lifecycle tests
//!
//! Drives whole reconcile passes against an in-memory cluster and checks the
//! children, the recorded status and the culling side effects.

use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::apps::v1::StatefulSetStatus;
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus,
    Event, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodStatus,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::controller::Action;
use session_controller::crds::{
    Culling, InteractiveSession, InteractiveSessionSpec, InteractiveSessionStatus,
    SessionIngress, SessionSecretRef, SessionState,
};
use session_controller::tasks::config::ControllerConfig;
use session_controller::tasks::session::children::{Child, ChildKind};
use session_controller::tasks::session::cleanup::cleanup_session;
use session_controller::tasks::session::client::SessionClient;
use session_controller::tasks::session::idle::{DisabledIdleProbe, IdleProbe};
use session_controller::tasks::session::{apply_session, naming::ResourceNaming};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, Once};
use tokio_test::assert_ok;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

fn not_found(what: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{what} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    })
}

/// In-memory stand-in for the namespace a session lives in
#[derive(Default)]
struct FakeCluster {
    children: Mutex<BTreeMap<(ChildKind, String), Child>>,
    pod: Mutex<Option<Pod>>,
    status: Mutex<Option<InteractiveSessionStatus>>,
    secrets: Mutex<Vec<String>>,
    hibernate_requests: Mutex<u32>,
    deleted: Mutex<bool>,
    resource_version: Mutex<u64>,
    writes: Mutex<u32>,
}

impl FakeCluster {
    fn next_version(&self) -> String {
        let mut version = self.resource_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    fn insert(&self, mut child: Child) {
        child.meta_mut().resource_version = Some(self.next_version());
        self.children
            .lock()
            .unwrap()
            .insert((child.kind(), child.name()), child);
    }

    fn child(&self, kind: ChildKind, name: &str) -> Option<Child> {
        self.children
            .lock()
            .unwrap()
            .get(&(kind, name.to_string()))
            .cloned()
    }

    fn writes(&self) -> u32 {
        *self.writes.lock().unwrap()
    }

    /// The StatefulSet controller reports its single replica as ready
    fn mark_workload_ready(&self, name: &str) {
        let mut children = self.children.lock().unwrap();
        if let Some(Child::StatefulSet(sts)) =
            children.get_mut(&(ChildKind::StatefulSet, name.to_string()))
        {
            sts.status = Some(StatefulSetStatus {
                replicas: 1,
                ready_replicas: Some(1),
                ..StatefulSetStatus::default()
            });
        }
    }

    fn set_pod(&self, pod: Option<Pod>) {
        *self.pod.lock().unwrap() = pod;
    }

    /// The session as the next watch event would deliver it
    fn observe(&self, session: &InteractiveSession) -> InteractiveSession {
        let mut observed = session.clone();
        observed.status = self.status.lock().unwrap().clone();
        observed
    }
}

#[async_trait::async_trait]
impl SessionClient for FakeCluster {
    async fn get_child(&self, kind: ChildKind, name: &str) -> Result<Option<Child>, kube::Error> {
        Ok(self.child(kind, name))
    }

    async fn create_child(&self, child: &Child) -> Result<Child, kube::Error> {
        *self.writes.lock().unwrap() += 1;
        self.insert(child.clone());
        Ok(self
            .child(child.kind(), &child.name())
            .unwrap_or_else(|| child.clone()))
    }

    async fn patch_child(
        &self,
        kind: ChildKind,
        name: &str,
        patch: &Value,
    ) -> Result<Child, kube::Error> {
        *self.writes.lock().unwrap() += 1;
        let current = self.child(kind, name).ok_or_else(|| not_found(name))?;
        let patched = match &current {
            Child::StatefulSet(o) => Child::StatefulSet(merge_patched(o, patch)),
            Child::Service(o) => Child::Service(merge_patched(o, patch)),
            Child::Ingress(o) => Child::Ingress(merge_patched(o, patch)),
            Child::PersistentVolumeClaim(o) => Child::PersistentVolumeClaim(merge_patched(o, patch)),
            Child::DataSourceClaim(o) => Child::DataSourceClaim(merge_patched(o, patch)),
        };
        if patched == current {
            return Ok(current);
        }
        self.insert(patched);
        Ok(self.child(kind, name).unwrap_or(current))
    }

    async fn get_pod(&self, _name: &str) -> Result<Option<Pod>, kube::Error> {
        Ok(self.pod.lock().unwrap().clone())
    }

    async fn list_pod_events(&self, _pod_name: &str) -> Result<Vec<Event>, kube::Error> {
        Ok(Vec::new())
    }

    async fn patch_session_status(
        &self,
        _name: &str,
        status: &InteractiveSessionStatus,
    ) -> Result<(), kube::Error> {
        *self.status.lock().unwrap() = Some(status.clone());
        Ok(())
    }

    async fn hibernate_session(&self, _name: &str) -> Result<(), kube::Error> {
        *self.hibernate_requests.lock().unwrap() += 1;
        Ok(())
    }

    async fn delete_session(&self, _name: &str) -> Result<(), kube::Error> {
        *self.deleted.lock().unwrap() = true;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<bool, kube::Error> {
        let mut secrets = self.secrets.lock().unwrap();
        let before = secrets.len();
        secrets.retain(|s| s != name);
        Ok(secrets.len() != before)
    }
}

/// Apply a JSON merge patch the way the API server does: `null` removes a
/// key, objects merge recursively and everything else is replaced
fn merge_json(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let Value::Object(target_fields) = target else {
        return;
    };
    for (key, value) in fields {
        if value.is_null() {
            target_fields.remove(key);
        } else {
            merge_json(target_fields.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn merge_patched<K: Serialize + DeserializeOwned>(object: &K, patch: &Value) -> K {
    let mut value = serde_json::to_value(object).unwrap();
    merge_json(&mut value, patch);
    serde_json::from_value(value).unwrap()
}

struct AlwaysIdle;

#[async_trait::async_trait]
impl IdleProbe for AlwaysIdle {
    async fn is_idle(&self, _session: &InteractiveSession) -> bool {
        true
    }
}

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-01T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn new_session(spec: InteractiveSessionSpec) -> InteractiveSession {
    let mut session = InteractiveSession::new("notebook", spec);
    session.metadata.namespace = Some("sessions".to_string());
    session.metadata.uid = Some("4f1e6a52-9a8f-4d8e-bb43-0a6a0c1f7d10".to_string());
    session.metadata.creation_timestamp = Some(Time(now() - TimeDelta::minutes(5)));
    session
}

fn running_pod(session: &InteractiveSession) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(ResourceNaming::pod_name(session)),
            creation_timestamp: Some(Time(now() - TimeDelta::minutes(4))),
            ..ObjectMeta::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "session".to_string(),
                ready: true,
                started: Some(true),
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..ContainerState::default()
                }),
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        }),
    }
}

/// The session container keeps crashing and kubelet backs off restarting it
fn crash_looping_pod(session: &InteractiveSession) -> Pod {
    let mut pod = running_pod(session);
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        container_statuses: Some(vec![ContainerStatus {
            name: "session".to_string(),
            ready: false,
            started: Some(false),
            restart_count: 6,
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("CrashLoopBackOff".to_string()),
                    message: Some("back-off 5m0s restarting failed container".to_string()),
                }),
                ..ContainerState::default()
            }),
            ..ContainerStatus::default()
        }]),
        ..PodStatus::default()
    });
    pod
}

fn init_containers(cluster: &FakeCluster, session: &InteractiveSession) -> Option<Vec<Container>> {
    match cluster.child(ChildKind::StatefulSet, &ResourceNaming::child_name(session)) {
        Some(Child::StatefulSet(sts)) => sts
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|pod| pod.init_containers),
        _ => None,
    }
}

fn replicas(cluster: &FakeCluster, session: &InteractiveSession) -> Option<i32> {
    match cluster.child(ChildKind::StatefulSet, &ResourceNaming::child_name(session)) {
        Some(Child::StatefulSet(sts)) => sts.spec.and_then(|s| s.replicas),
        _ => None,
    }
}

fn recorded(cluster: &FakeCluster) -> InteractiveSessionStatus {
    cluster.status.lock().unwrap().clone().unwrap_or_default()
}

/// Reconcile until the session is running and return it as last observed
async fn bring_up(cluster: &FakeCluster, session: &InteractiveSession) -> InteractiveSession {
    let config = ControllerConfig::default();
    assert_ok!(apply_session(session, cluster, &DisabledIdleProbe, &config, now()).await);

    cluster.mark_workload_ready(&ResourceNaming::child_name(session));
    cluster.set_pod(Some(running_pod(session)));
    let observed = cluster.observe(session);
    assert_ok!(apply_session(&observed, cluster, &DisabledIdleProbe, &config, now()).await);
    cluster.observe(session)
}

#[tokio::test]
async fn new_session_without_ingress_becomes_running() {
    init_tracing();
    let cluster = FakeCluster::default();
    let session = new_session(InteractiveSessionSpec::default());
    let config = ControllerConfig::default();

    let action = apply_session(&session, &cluster, &DisabledIdleProbe, &config, now())
        .await
        .expect("first pass succeeds");
    assert_eq!(
        action,
        Action::requeue(std::time::Duration::from_secs(
            config.reconcile.status_changed_requeue_seconds
        ))
    );

    let name = ResourceNaming::child_name(&session);
    assert!(cluster.child(ChildKind::StatefulSet, &name).is_some());
    assert!(cluster.child(ChildKind::Service, &name).is_some());
    assert!(cluster.child(ChildKind::PersistentVolumeClaim, &name).is_some());
    assert!(cluster.child(ChildKind::Ingress, &name).is_none());
    assert_eq!(recorded(&cluster).state, SessionState::NotReady);

    let observed = bring_up(&cluster, &session).await;
    let status = observed.status.expect("status recorded");
    assert_eq!(status.state, SessionState::Running);
    assert_eq!(status.container_counts.ready, 1);
    assert_eq!(status.container_counts.total, 1);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn unchanged_session_is_a_no_op() {
    init_tracing();
    let cluster = FakeCluster::default();
    let session = new_session(InteractiveSessionSpec::default());
    let config = ControllerConfig::default();

    let observed = bring_up(&cluster, &session).await;
    let writes = cluster.writes();
    let status = recorded(&cluster);

    let action = apply_session(&observed, &cluster, &DisabledIdleProbe, &config, now())
        .await
        .expect("steady pass succeeds");
    assert_eq!(cluster.writes(), writes);
    assert_eq!(recorded(&cluster), status);
    assert_eq!(
        action,
        Action::requeue(std::time::Duration::from_secs(config.reconcile.requeue_seconds))
    );
}

#[tokio::test]
async fn hibernation_scales_to_zero_and_clears_timestamps() {
    init_tracing();
    let cluster = FakeCluster::default();
    let mut session = new_session(InteractiveSessionSpec::default());
    let config = ControllerConfig::default();

    let observed = bring_up(&cluster, &session).await;
    assert_eq!(replicas(&cluster, &session), Some(1));

    session.spec.hibernated = true;
    session.status = observed.status;
    assert_ok!(apply_session(&session, &cluster, &DisabledIdleProbe, &config, now()).await);

    assert_eq!(replicas(&cluster, &session), Some(0));
    let status = recorded(&cluster);
    assert_eq!(status.state, SessionState::Hibernated);
    assert!(status.idle_since.is_none());
    assert!(status.failing_since.is_none());
    assert!(status.will_hibernate_at.is_none());
    assert_eq!(status.hibernated_since.as_deref(), Some("2025-06-01T08:00:00Z"));
    assert_eq!(status.container_counts.ready, 0);
    assert_eq!(status.container_counts.total, 0);
}

#[tokio::test]
async fn idle_session_is_hibernated_after_max_idle() {
    init_tracing();
    let config = ControllerConfig::default();

    for (max_idle, expected_requests) in [("10s", 1), ("0s", 0)] {
        let cluster = FakeCluster::default();
        let session = new_session(InteractiveSessionSpec {
            culling: Culling {
                max_idle_duration: Some(max_idle.to_string()),
                ..Culling::default()
            },
            ..InteractiveSessionSpec::default()
        });
        let observed = bring_up(&cluster, &session).await;

        assert_ok!(apply_session(&observed, &cluster, &AlwaysIdle, &config, now()).await);
        let status = recorded(&cluster);
        assert!(status.idle);
        assert_eq!(status.idle_since.as_deref(), Some("2025-06-01T08:00:00Z"));

        let later = now() + TimeDelta::seconds(11);
        let observed = cluster.observe(&session);
        assert_ok!(apply_session(&observed, &cluster, &AlwaysIdle, &config, later).await);
        assert_eq!(
            *cluster.hibernate_requests.lock().unwrap(),
            expected_requests,
            "max idle {max_idle}"
        );
    }
}

#[tokio::test]
async fn claim_keeps_live_storage_class() {
    init_tracing();
    let cluster = FakeCluster::default();
    let session = new_session(InteractiveSessionSpec::default());
    let name = ResourceNaming::child_name(&session);

    cluster.insert(Child::PersistentVolumeClaim(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some("standard".to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity("500Mi".to_string()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    }));

    assert_ok!(
        apply_session(
            &session,
            &cluster,
            &DisabledIdleProbe,
            &ControllerConfig::default(),
            now()
        )
        .await
    );

    let Some(Child::PersistentVolumeClaim(claim)) =
        cluster.child(ChildKind::PersistentVolumeClaim, &name)
    else {
        panic!("claim missing");
    };
    let spec = claim.spec.expect("claim spec");
    assert_eq!(spec.storage_class_name.as_deref(), Some("standard"));
    assert_eq!(
        spec.resources
            .and_then(|r| r.requests)
            .and_then(|r| r.get("storage").cloned()),
        Some(Quantity("1Gi".to_string()))
    );
}

#[tokio::test]
async fn long_hibernated_session_is_deleted() {
    init_tracing();
    let cluster = FakeCluster::default();
    let mut session = new_session(InteractiveSessionSpec {
        hibernated: true,
        culling: Culling {
            max_hibernated_duration: Some("1h".to_string()),
            ..Culling::default()
        },
        ..InteractiveSessionSpec::default()
    });
    session.status = Some(InteractiveSessionStatus {
        state: SessionState::Hibernated,
        hibernated_since: Some("2025-06-01T06:00:00Z".to_string()),
        ..InteractiveSessionStatus::default()
    });

    let action = apply_session(
        &session,
        &cluster,
        &DisabledIdleProbe,
        &ControllerConfig::default(),
        now(),
    )
    .await
    .expect("pass succeeds");

    assert_eq!(action, Action::await_change());
    assert!(*cluster.deleted.lock().unwrap());
    assert_eq!(
        recorded(&cluster).hibernated_since.as_deref(),
        Some("2025-06-01T06:00:00Z")
    );
}

#[tokio::test]
async fn recently_hibernated_session_is_kept() {
    init_tracing();
    let cluster = FakeCluster::default();
    let session = new_session(InteractiveSessionSpec {
        hibernated: true,
        culling: Culling {
            max_hibernated_duration: Some("1h".to_string()),
            ..Culling::default()
        },
        ..InteractiveSessionSpec::default()
    });

    assert_ok!(
        apply_session(
            &session,
            &cluster,
            &DisabledIdleProbe,
            &ControllerConfig::default(),
            now()
        )
        .await
    );
    assert_eq!(recorded(&cluster).state, SessionState::Hibernated);
    assert!(!*cluster.deleted.lock().unwrap());
}

#[tokio::test]
async fn cleanup_deletes_adopted_secrets_only() {
    init_tracing();
    let cluster = FakeCluster::default();
    cluster.secrets.lock().unwrap().extend([
        "notebook-tls".to_string(),
        "registry-creds".to_string(),
        "shared-creds".to_string(),
    ]);

    let session = new_session(InteractiveSessionSpec {
        ingress: Some(SessionIngress {
            host: Some("notebook.example.com".to_string()),
            tls_secret: Some(SessionSecretRef {
                name: "notebook-tls".to_string(),
                key: None,
                adopt: true,
            }),
            ..SessionIngress::default()
        }),
        image_pull_secrets: vec![
            SessionSecretRef {
                name: "registry-creds".to_string(),
                key: None,
                adopt: true,
            },
            SessionSecretRef {
                name: "shared-creds".to_string(),
                key: None,
                adopt: false,
            },
        ],
        ..InteractiveSessionSpec::default()
    });

    let action = cleanup_session(&session, &cluster)
        .await
        .expect("cleanup succeeds");
    assert_eq!(action, Action::await_change());
    assert_eq!(*cluster.secrets.lock().unwrap(), vec!["shared-creds".to_string()]);
    assert_eq!(recorded(&cluster).state, SessionState::NotReady);
}

#[tokio::test]
async fn removed_init_containers_disappear_from_the_workload() {
    init_tracing();
    let cluster = FakeCluster::default();
    let session = new_session(InteractiveSessionSpec {
        init_containers: vec![Container {
            name: "git-clone".to_string(),
            image: Some("alpine/git:2.45".to_string()),
            ..Container::default()
        }],
        ..InteractiveSessionSpec::default()
    });

    let mut observed = bring_up(&cluster, &session).await;
    let before = init_containers(&cluster, &session).expect("init containers created");
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].name, "git-clone");

    observed.spec.init_containers.clear();
    assert_ok!(
        apply_session(
            &observed,
            &cluster,
            &DisabledIdleProbe,
            &ControllerConfig::default(),
            now()
        )
        .await
    );

    assert_eq!(init_containers(&cluster, &session), None);
    assert_eq!(replicas(&cluster, &session), Some(1));
}

#[tokio::test]
async fn failing_session_is_hibernated_after_max_failed() {
    init_tracing();
    let cluster = FakeCluster::default();
    let config = ControllerConfig::default();
    let session = new_session(InteractiveSessionSpec {
        culling: Culling {
            max_failed_duration: Some("10m".to_string()),
            ..Culling::default()
        },
        ..InteractiveSessionSpec::default()
    });
    bring_up(&cluster, &session).await;

    cluster.set_pod(Some(crash_looping_pod(&session)));
    let observed = cluster.observe(&session);
    assert_ok!(apply_session(&observed, &cluster, &DisabledIdleProbe, &config, now()).await);

    let status = recorded(&cluster);
    assert_eq!(status.state, SessionState::Failed);
    assert_eq!(status.failing_since.as_deref(), Some("2025-06-01T08:00:00Z"));
    assert_eq!(status.will_hibernate_at.as_deref(), Some("2025-06-01T08:10:00Z"));
    assert!(status
        .error
        .as_deref()
        .is_some_and(|e| e.contains("container session keeps crashing")));
    assert_eq!(*cluster.hibernate_requests.lock().unwrap(), 0);

    let later = now() + TimeDelta::minutes(11);
    let observed = cluster.observe(&session);
    assert_ok!(apply_session(&observed, &cluster, &DisabledIdleProbe, &config, later).await);

    assert_eq!(recorded(&cluster).failing_since, status.failing_since);
    assert_eq!(*cluster.hibernate_requests.lock().unwrap(), 1);
}
