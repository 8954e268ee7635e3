//! `InteractiveSession` Custom Resource Definition for user-facing interactive workloads

use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, ResourceRequirements, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

fn default_port() -> i32 {
    8000
}

fn default_run_as_id() -> i64 {
    1000
}

fn default_url_path() -> String {
    "/".to_string()
}

fn default_mount_path() -> String {
    "/workspace".to_string()
}

fn default_data_source_access_mode() -> String {
    "ReadOnlyMany".to_string()
}

/// `InteractiveSession` CRD for running a user session with storage, routing and culling
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "sessions.platform", version = "v1alpha1", kind = "InteractiveSession")]
#[kube(namespaced)]
#[kube(status = "InteractiveSessionStatus")]
#[kube(shortname = "isess")]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#)]
#[kube(printcolumn = r#"{"name":"Hibernated","type":"boolean","jsonPath":".spec.hibernated"}"#)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveSessionSpec {
    /// The main session container
    pub session: SessionContainer,

    /// Remote storage mounted into the session through CSI claims
    #[serde(default)]
    pub data_sources: Vec<DataSource>,

    /// Authentication proxy placed in front of the session
    #[serde(default)]
    pub authentication: Option<Authentication>,

    /// Thresholds after which the session is hibernated or deleted
    #[serde(default)]
    pub culling: Culling,

    /// Scale the session down to zero replicas while keeping its storage
    #[serde(default)]
    pub hibernated: bool,

    #[serde(default)]
    pub extra_containers: Vec<Container>,

    #[serde(default)]
    pub init_containers: Vec<Container>,

    #[serde(default)]
    pub extra_volumes: Vec<Volume>,

    /// Ingress exposing the session; no ingress is created when absent
    #[serde(default)]
    pub ingress: Option<SessionIngress>,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub affinity: Option<Affinity>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub priority_class_name: Option<String>,

    #[serde(default)]
    pub service_account_name: Option<String>,

    #[serde(default)]
    pub image_pull_secrets: Vec<SessionSecretRef>,

    /// When existing child objects may be patched
    #[serde(default)]
    pub reconcile_strategy: ReconcileStrategy,
}

/// Main session container configuration
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionContainer {
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Port the session listens on
    #[serde(default = "default_port")]
    pub port: i32,

    #[serde(default)]
    pub storage: SessionStorage,

    /// Size of the memory-backed `/dev/shm` volume
    #[serde(default)]
    pub shm_size: Option<Quantity>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default = "default_run_as_id")]
    pub run_as_user: i64,

    #[serde(default = "default_run_as_id")]
    pub run_as_group: i64,

    /// Path prefix the session is served under
    #[serde(default = "default_url_path")]
    pub url_path: String,

    #[serde(default)]
    pub extra_volume_mounts: Vec<VolumeMount>,

    #[serde(default)]
    pub readiness_probe: ReadinessProbe,

    #[serde(default)]
    pub image_pull_policy: Option<String>,
}

impl Default for SessionContainer {
    fn default() -> Self {
        Self {
            image: String::new(),
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            resources: None,
            port: default_port(),
            storage: SessionStorage::default(),
            shm_size: None,
            working_dir: None,
            run_as_user: default_run_as_id(),
            run_as_group: default_run_as_id(),
            url_path: default_url_path(),
            extra_volume_mounts: Vec::new(),
            readiness_probe: ReadinessProbe::default(),
            image_pull_policy: None,
        }
    }
}

/// Primary persistent volume of the session
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStorage {
    #[serde(default)]
    pub class_name: Option<String>,

    /// Requested size; the controller default applies when absent
    #[serde(default)]
    pub size: Option<Quantity>,

    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

impl Default for SessionStorage {
    fn default() -> Self {
        Self {
            class_name: None,
            size: None,
            mount_path: default_mount_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ReadinessProbe {
    #[serde(default, rename = "type")]
    pub probe_type: ReadinessProbeType,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessProbeType {
    None,
    #[default]
    Tcp,
    Http,
}

/// Reference to a secret, optionally adopted (deleted together with the session)
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSecretRef {
    pub name: String,

    /// Key within the secret, when only one entry is consumed
    #[serde(default)]
    pub key: Option<String>,

    /// Delete the secret when the session is deleted
    #[serde(default)]
    pub adopt: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceType {
    #[default]
    Rclone,
}

/// Remote storage mounted into the session
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(default, rename = "type")]
    pub source_type: DataSourceType,

    /// Secret holding the backend configuration
    pub secret_ref: SessionSecretRef,

    pub mount_path: String,

    #[serde(default = "default_data_source_access_mode")]
    pub access_mode: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationType {
    #[default]
    Token,
    Oauth2proxy,
}

impl fmt::Display for AuthenticationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthenticationType::Token => write!(f, "token"),
            AuthenticationType::Oauth2proxy => write!(f, "oauth2proxy"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, rename = "type")]
    pub auth_type: AuthenticationType,

    /// Secret with the proxy configuration or token
    pub secret_ref: SessionSecretRef,

    #[serde(default)]
    pub extra_volume_mounts: Vec<VolumeMount>,
}

/// Culling thresholds, written as durations such as `10s`, `2h5m` or `1h 30m`.
/// Absent or zero disables a rule.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Culling {
    #[serde(default)]
    pub max_age: Option<String>,

    #[serde(default)]
    pub max_idle_duration: Option<String>,

    #[serde(default)]
    pub max_starting_duration: Option<String>,

    #[serde(default)]
    pub max_failed_duration: Option<String>,

    #[serde(default)]
    pub max_hibernated_duration: Option<String>,

    /// Last time a user interacted with the session (RFC3339)
    #[serde(default)]
    pub last_interaction: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIngress {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub ingress_class_name: Option<String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// TLS secret; the session URL uses https when set
    #[serde(default)]
    pub tls_secret: Option<SessionSecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReconcileStrategy {
    Never,
    #[default]
    Always,
    WhenFailedOrHibernated,
}

/// Lifecycle state of a session
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    NotReady,
    Running,
    RunningDegraded,
    Failed,
    Hibernated,
}

impl SessionState {
    /// Lower-cased human readable form used in condition messages
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            SessionState::NotReady => "not ready",
            SessionState::Running => "running",
            SessionState::RunningDegraded => "running degraded",
            SessionState::Failed => "failed",
            SessionState::Hibernated => "hibernated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotReady => "NotReady",
            SessionState::Running => "Running",
            SessionState::RunningDegraded => "RunningDegraded",
            SessionState::Failed => "Failed",
            SessionState::Hibernated => "Hibernated",
        };
        f.write_str(name)
    }
}

/// Ready / total counts for a group of containers
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ContainerCounts {
    pub ready: i32,
    pub total: i32,
}

impl ContainerCounts {
    #[must_use]
    pub fn all_ready(self) -> bool {
        self.ready == self.total
    }
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum SessionConditionType {
    Ready,
    RoutingReady,
}

impl fmt::Display for SessionConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionConditionType::Ready => f.write_str("Ready"),
            SessionConditionType::RoutingReady => f.write_str("RoutingReady"),
        }
    }
}

/// Condition for the `InteractiveSession`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCondition {
    #[serde(rename = "type")]
    pub condition_type: SessionConditionType,

    /// "True" or "False"
    pub status: String,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// RFC3339
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl SessionCondition {
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Status of the `InteractiveSession`, rewritten by the controller on every pass.
///
/// Optional fields serialize as `null` so a merge patch clears them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveSessionStatus {
    #[serde(default)]
    pub conditions: Vec<SessionCondition>,

    #[serde(default)]
    pub state: SessionState,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub container_counts: ContainerCounts,

    #[serde(default)]
    pub init_container_counts: ContainerCounts,

    #[serde(default)]
    pub idle: bool,

    #[serde(default)]
    pub idle_since: Option<String>,

    #[serde(default)]
    pub failing_since: Option<String>,

    #[serde(default)]
    pub hibernated_since: Option<String>,

    #[serde(default)]
    pub will_hibernate_at: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

impl InteractiveSession {
    /// Secrets deleted together with the session
    #[must_use]
    pub fn adopted_secrets(&self) -> Vec<String> {
        let spec = &self.spec;
        let mut refs: Vec<&SessionSecretRef> = Vec::new();
        if let Some(tls) = spec.ingress.as_ref().and_then(|i| i.tls_secret.as_ref()) {
            refs.push(tls);
        }
        if let Some(auth) = &spec.authentication {
            refs.push(&auth.secret_ref);
        }
        refs.extend(spec.data_sources.iter().map(|ds| &ds.secret_ref));
        refs.extend(spec.image_pull_secrets.iter());

        let mut names: Vec<String> = Vec::new();
        for secret in refs.into_iter().filter(|r| r.adopt && !r.name.is_empty()) {
            if !names.contains(&secret.name) {
                names.push(secret.name.clone());
            }
        }
        names
    }

    #[must_use]
    pub fn authentication_enabled(&self) -> bool {
        self.spec
            .authentication
            .as_ref()
            .is_some_and(|auth| auth.enabled)
    }
}
