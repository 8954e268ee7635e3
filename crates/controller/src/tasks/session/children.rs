//! Child object reconciliation.
//!
//! Every child kind of a session is one variant of [`Child`] with its own
//! merge rule. A live object is never overwritten wholesale: only the
//! whitelisted mutable fields of the desired object are copied onto it.

use crate::crds::{InteractiveSession, ReconcileStrategy, SessionState};
use crate::tasks::config::ControllerConfig;
use crate::tasks::session::client::SessionClient;
use crate::tasks::session::manifests;
use crate::tasks::types::{ChildErrors, Result};
use futures::future::join_all;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    StatefulSet,
    Service,
    Ingress,
    PersistentVolumeClaim,
    DataSourceClaim,
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChildKind::StatefulSet => "statefulset",
            ChildKind::Service => "service",
            ChildKind::Ingress => "ingress",
            ChildKind::PersistentVolumeClaim => "persistentvolumeclaim",
            ChildKind::DataSourceClaim => "data source claim",
        };
        f.write_str(name)
    }
}

/// A child object of a session
#[derive(Clone, Debug, PartialEq)]
pub enum Child {
    StatefulSet(StatefulSet),
    Service(Service),
    Ingress(Ingress),
    PersistentVolumeClaim(PersistentVolumeClaim),
    DataSourceClaim(PersistentVolumeClaim),
}

impl Child {
    #[must_use]
    pub fn kind(&self) -> ChildKind {
        match self {
            Child::StatefulSet(_) => ChildKind::StatefulSet,
            Child::Service(_) => ChildKind::Service,
            Child::Ingress(_) => ChildKind::Ingress,
            Child::PersistentVolumeClaim(_) => ChildKind::PersistentVolumeClaim,
            Child::DataSourceClaim(_) => ChildKind::DataSourceClaim,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Child::StatefulSet(o) => &o.metadata,
            Child::Service(o) => &o.metadata,
            Child::Ingress(o) => &o.metadata,
            Child::PersistentVolumeClaim(o) | Child::DataSourceClaim(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Child::StatefulSet(o) => &mut o.metadata,
            Child::Service(o) => &mut o.metadata,
            Child::Ingress(o) => &mut o.metadata,
            Child::PersistentVolumeClaim(o) | Child::DataSourceClaim(o) => &mut o.metadata,
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    /// Label used in logs and combined errors; data source claims are named by claim
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Child::DataSourceClaim(_) => self.name(),
            other => other.kind().to_string(),
        }
    }

    /// Copy the whitelisted mutable fields of `desired` onto `self`
    pub fn merge_from(&mut self, desired: &Child, scope: MergeScope) -> Result<(), ChildMismatch> {
        match (self, desired) {
            (Child::StatefulSet(current), Child::StatefulSet(desired)) => {
                merge_stateful_set(current, desired, scope);
            }
            (Child::Service(current), Child::Service(desired)) => {
                if scope == MergeScope::Full {
                    merge_service(current, desired);
                }
            }
            (Child::Ingress(current), Child::Ingress(desired)) => {
                if scope == MergeScope::Full {
                    current.spec.clone_from(&desired.spec);
                }
            }
            (Child::PersistentVolumeClaim(current), Child::PersistentVolumeClaim(desired))
            | (Child::DataSourceClaim(current), Child::DataSourceClaim(desired)) => {
                if scope == MergeScope::Full {
                    merge_claim(current, desired);
                }
            }
            (current, desired) => {
                return Err(ChildMismatch {
                    expected: desired.kind(),
                    found: current.kind(),
                });
            }
        }
        Ok(())
    }
}

impl Child {
    /// JSON merge patch carrying the whitelisted fields of this desired object.
    ///
    /// Fields the desired object leaves out are sent as `null` so the API
    /// server clears them. Metadata is never sent, so the write is not
    /// guarded by the resource version.
    #[must_use]
    pub fn merge_patch(&self, scope: MergeScope) -> Value {
        match self {
            Child::StatefulSet(desired) => stateful_set_patch(desired, scope),
            _ if scope == MergeScope::ReplicasOnly => json!({}),
            Child::Service(desired) => {
                let spec = desired.spec.as_ref();
                json!({
                    "spec": {
                        "ports": list_or_null(spec.and_then(|s| s.ports.as_ref())),
                        "selector": spec.and_then(|s| s.selector.as_ref())
                    }
                })
            }
            Child::Ingress(desired) => {
                let spec = desired.spec.as_ref();
                json!({
                    "spec": {
                        "ingressClassName": spec.and_then(|s| s.ingress_class_name.as_ref()),
                        "defaultBackend": spec.and_then(|s| s.default_backend.as_ref()),
                        "rules": list_or_null(spec.and_then(|s| s.rules.as_ref())),
                        "tls": list_or_null(spec.and_then(|s| s.tls.as_ref()))
                    }
                })
            }
            Child::PersistentVolumeClaim(desired) | Child::DataSourceClaim(desired) => {
                let spec = desired.spec.as_ref();
                let requests = spec
                    .and_then(|s| s.resources.as_ref())
                    .and_then(|r| r.requests.as_ref());
                let mut patch = json!({ "spec": { "resources": { "requests": requests } } });
                if let Some(class) = spec.and_then(|s| s.storage_class_name.as_ref()) {
                    patch["spec"]["storageClassName"] = json!(class);
                }
                patch
            }
        }
    }
}

fn list_or_null<T: Serialize>(items: Option<&Vec<T>>) -> Value {
    match items {
        Some(items) if !items.is_empty() => json!(items),
        _ => Value::Null,
    }
}

fn stateful_set_patch(desired: &StatefulSet, scope: MergeScope) -> Value {
    let spec = desired.spec.as_ref();
    let mut patch = json!({ "spec": { "replicas": spec.and_then(|s| s.replicas) } });
    if scope == MergeScope::ReplicasOnly {
        return patch;
    }
    if let Some(pod) = spec.and_then(|s| s.template.spec.as_ref()) {
        patch["spec"]["template"] = json!({
            "spec": {
                "containers": pod.containers,
                "initContainers": list_or_null(pod.init_containers.as_ref()),
                "volumes": list_or_null(pod.volumes.as_ref())
            }
        });
    }
    patch
}

/// The live object is of another kind than the desired one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildMismatch {
    pub expected: ChildKind,
    pub found: ChildKind,
}

impl fmt::Display for ChildMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected a {} but found a {}", self.expected, self.found)
    }
}

fn merge_stateful_set(current: &mut StatefulSet, desired: &StatefulSet, scope: MergeScope) {
    let Some(desired_spec) = &desired.spec else {
        return;
    };
    let current_spec = current.spec.get_or_insert_with(Default::default);
    current_spec.replicas = desired_spec.replicas;

    if scope == MergeScope::ReplicasOnly {
        return;
    }

    let Some(desired_pod) = &desired_spec.template.spec else {
        return;
    };
    let current_pod = current_spec.template.spec.get_or_insert_with(Default::default);
    current_pod.containers.clone_from(&desired_pod.containers);
    current_pod.init_containers.clone_from(&desired_pod.init_containers);
    current_pod.volumes.clone_from(&desired_pod.volumes);
}

fn merge_service(current: &mut Service, desired: &Service) {
    let Some(desired_spec) = &desired.spec else {
        return;
    };
    let current_spec = current.spec.get_or_insert_with(Default::default);
    current_spec.ports.clone_from(&desired_spec.ports);
    current_spec.selector.clone_from(&desired_spec.selector);
}

fn merge_claim(current: &mut PersistentVolumeClaim, desired: &PersistentVolumeClaim) {
    let Some(desired_spec) = &desired.spec else {
        return;
    };
    let current_spec = current.spec.get_or_insert_with(Default::default);

    let requests = desired_spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.clone());
    current_spec
        .resources
        .get_or_insert_with(Default::default)
        .requests = requests;

    // The storage class of a bound claim is only replaced by an explicit one
    if desired_spec.storage_class_name.is_some() {
        current_spec
            .storage_class_name
            .clone_from(&desired_spec.storage_class_name);
    }
}

/// Which fields of existing children may be patched
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeScope {
    /// Every whitelisted field
    Full,
    /// Only the runner replica count, so hibernation keeps working
    ReplicasOnly,
}

impl MergeScope {
    #[must_use]
    pub fn for_strategy(strategy: ReconcileStrategy, recorded: SessionState) -> Self {
        match strategy {
            ReconcileStrategy::Always => MergeScope::Full,
            ReconcileStrategy::WhenFailedOrHibernated
                if matches!(recorded, SessionState::Failed | SessionState::Hibernated) =>
            {
                MergeScope::Full
            }
            ReconcileStrategy::WhenFailedOrHibernated | ReconcileStrategy::Never => {
                MergeScope::ReplicasOnly
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperationResult {
    #[default]
    None,
    Created,
    Updated,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResult::None => f.write_str("unchanged"),
            OperationResult::Created => f.write_str("created"),
            OperationResult::Updated => f.write_str("updated"),
        }
    }
}

/// Desired state of one child
#[derive(Clone, Debug)]
pub struct ChildResource {
    pub desired: Child,
}

/// Outcome of reconciling one child
#[derive(Debug)]
pub struct ChildResourceUpdate {
    pub kind: ChildKind,
    pub label: String,
    /// The object as last seen or written; `None` when it could not be read
    pub manifest: Option<Child>,
    pub operation: OperationResult,
    pub error: Option<String>,
}

impl ChildResourceUpdate {
    fn failed(desired: &Child, error: impl fmt::Display) -> Self {
        Self {
            kind: desired.kind(),
            label: desired.label(),
            manifest: None,
            operation: OperationResult::None,
            error: Some(error.to_string()),
        }
    }

    fn done(desired: &Child, manifest: Child, operation: OperationResult) -> Self {
        Self {
            kind: desired.kind(),
            label: desired.label(),
            manifest: Some(manifest),
            operation,
            error: None,
        }
    }

    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.error.is_none() && self.operation == OperationResult::None
    }
}

impl ChildResource {
    #[must_use]
    pub fn new(desired: Child) -> Self {
        Self { desired }
    }

    /// Get the live object, create it when missing, otherwise merge and patch
    pub async fn reconcile(
        &self,
        client: &dyn SessionClient,
        owner: &OwnerReference,
        scope: MergeScope,
    ) -> ChildResourceUpdate {
        let desired = &self.desired;
        let name = desired.name();

        let current = match client.get_child(desired.kind(), &name).await {
            Ok(current) => current,
            Err(e) => return ChildResourceUpdate::failed(desired, e),
        };

        let Some(current) = current else {
            let mut child = desired.clone();
            child.meta_mut().owner_references = Some(vec![owner.clone()]);
            return match client.create_child(&child).await {
                Ok(created) => {
                    info!("✅ Created {} {}", desired.kind(), name);
                    ChildResourceUpdate::done(desired, created, OperationResult::Created)
                }
                Err(e) => ChildResourceUpdate::failed(desired, e),
            };
        };

        let mut merged = current.clone();
        if let Err(mismatch) = merged.merge_from(desired, scope) {
            return ChildResourceUpdate::failed(desired, mismatch);
        }
        if merged == current {
            debug!("{} {} is up to date", desired.kind(), name);
            return ChildResourceUpdate::done(desired, current, OperationResult::None);
        }

        match client
            .patch_child(desired.kind(), &name, &desired.merge_patch(scope))
            .await
        {
            Ok(patched) => {
                // The API server leaves the resource version alone for no-op writes
                let operation =
                    if patched.meta().resource_version == current.meta().resource_version {
                        OperationResult::None
                    } else {
                        info!("🔄 Updated {} {}", desired.kind(), name);
                        OperationResult::Updated
                    };
                ChildResourceUpdate::done(desired, patched, operation)
            }
            Err(e) => ChildResourceUpdate::failed(desired, e),
        }
    }
}

/// The full desired child set of one session
#[derive(Clone, Debug)]
pub struct ChildResources {
    pub stateful_set: ChildResource,
    pub service: ChildResource,
    pub ingress: Option<ChildResource>,
    pub claim: ChildResource,
    pub data_source_claims: Vec<ChildResource>,
}

impl ChildResources {
    pub fn for_session(session: &InteractiveSession, config: &ControllerConfig) -> Result<Self> {
        Ok(Self {
            stateful_set: ChildResource::new(Child::StatefulSet(manifests::stateful_set(
                session, config,
            )?)),
            service: ChildResource::new(Child::Service(manifests::service(session)?)),
            ingress: manifests::ingress(session)?.map(|i| ChildResource::new(Child::Ingress(i))),
            claim: ChildResource::new(Child::PersistentVolumeClaim(manifests::session_claim(
                session, config,
            )?)),
            data_source_claims: manifests::data_source_claims(session, config)?
                .into_iter()
                .map(|c| ChildResource::new(Child::DataSourceClaim(c)))
                .collect(),
        })
    }

    /// Reconcile every child; one failing child never stops the others
    pub async fn reconcile(
        &self,
        client: &dyn SessionClient,
        owner: &OwnerReference,
        scope: MergeScope,
    ) -> ChildResourceUpdates {
        let ingress = async {
            match &self.ingress {
                Some(ingress) => Some(ingress.reconcile(client, owner, scope).await),
                None => None,
            }
        };
        let data_sources = join_all(
            self.data_source_claims
                .iter()
                .map(|claim| claim.reconcile(client, owner, scope)),
        );

        let (stateful_set, service, ingress, claim, data_source_claims) = futures::join!(
            self.stateful_set.reconcile(client, owner, scope),
            self.service.reconcile(client, owner, scope),
            ingress,
            self.claim.reconcile(client, owner, scope),
            data_sources,
        );

        let updates = ChildResourceUpdates {
            stateful_set,
            service,
            ingress,
            claim,
            data_source_claims,
        };
        for update in updates.iter() {
            if let Some(error) = &update.error {
                warn!("❌ Failed to reconcile {}: {}", update.label, error);
            }
        }
        updates
    }
}

/// Outcome of reconciling the whole child set
#[derive(Debug)]
pub struct ChildResourceUpdates {
    pub stateful_set: ChildResourceUpdate,
    pub service: ChildResourceUpdate,
    pub ingress: Option<ChildResourceUpdate>,
    pub claim: ChildResourceUpdate,
    pub data_source_claims: Vec<ChildResourceUpdate>,
}

impl ChildResourceUpdates {
    pub fn iter(&self) -> impl Iterator<Item = &ChildResourceUpdate> {
        [&self.stateful_set, &self.service, &self.claim]
            .into_iter()
            .chain(self.ingress.as_ref())
            .chain(self.data_source_claims.iter())
    }

    /// Nothing was written and nothing failed in this pass
    #[must_use]
    pub fn all_unchanged(&self) -> bool {
        self.iter().all(ChildResourceUpdate::is_unchanged)
    }

    /// Every failing child, or `None` when all succeeded
    #[must_use]
    pub fn errors(&self) -> Option<ChildErrors> {
        let mut errors = ChildErrors::default();
        for update in self.iter() {
            if let Some(error) = &update.error {
                errors.push(update.label.clone(), error.clone());
            }
        }
        (!errors.is_empty()).then_some(errors)
    }

    #[must_use]
    pub fn stateful_set(&self) -> Option<&StatefulSet> {
        match &self.stateful_set.manifest {
            Some(Child::StatefulSet(sts)) => Some(sts),
            _ => None,
        }
    }

    #[must_use]
    pub fn service(&self) -> Option<&Service> {
        match &self.service.manifest {
            Some(Child::Service(svc)) => Some(svc),
            _ => None,
        }
    }

    #[must_use]
    pub fn ingress(&self) -> Option<&Ingress> {
        match self.ingress.as_ref().and_then(|u| u.manifest.as_ref()) {
            Some(Child::Ingress(ing)) => Some(ing),
            _ => None,
        }
    }

    /// Session claim followed by the data source claims that could be read
    pub fn claims(&self) -> impl Iterator<Item = &PersistentVolumeClaim> {
        std::iter::once(&self.claim)
            .chain(self.data_source_claims.iter())
            .filter_map(|u| match &u.manifest {
                Some(Child::PersistentVolumeClaim(pvc) | Child::DataSourceClaim(pvc)) => Some(pvc),
                _ => None,
            })
    }
}
