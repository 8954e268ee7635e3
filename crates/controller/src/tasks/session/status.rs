//! Session status derivation.
//!
//! Everything here is a pure function of the session, the children updates of
//! the current pass, the observed pod and the wall-clock time handed in.

use crate::crds::{
    ContainerCounts, InteractiveSession, InteractiveSessionStatus, SessionCondition,
    SessionConditionType, SessionState,
};
use crate::tasks::session::children::ChildResourceUpdates;
use crate::tasks::session::diagnosis;
use crate::tasks::session::manifests;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod};
use std::collections::BTreeMap;

pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Signals gathered from the cluster during a pass
#[derive(Debug, Clone, Copy)]
pub struct Observations<'a> {
    pub pod: Option<&'a Pod>,
    /// Pod events, oldest first
    pub events: &'a [Event],
    pub idle: bool,
}

/// Inputs of the lifecycle state derivation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateInputs {
    pub deleting: bool,
    pub hibernation_requested: bool,
    /// Replica target of the live StatefulSet
    pub replica_target: Option<i32>,
    pub failing: bool,
    /// One of one replicas ready and no child written in this pass
    pub workload_ready: bool,
    pub pod_ready: bool,
    pub pod_degraded: bool,
}

/// First matching rule wins
#[must_use]
pub fn derive_state(inputs: &StateInputs) -> SessionState {
    if inputs.deleting {
        SessionState::NotReady
    } else if inputs.hibernation_requested && inputs.replica_target == Some(0) {
        SessionState::Hibernated
    } else if inputs.failing {
        SessionState::Failed
    } else if inputs.workload_ready && inputs.pod_ready {
        SessionState::Running
    } else if inputs.pod_degraded {
        SessionState::RunningDegraded
    } else {
        SessionState::NotReady
    }
}

fn init_container_ready(status: &ContainerStatus) -> bool {
    status
        .state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .is_some_and(|t| t.exit_code == 0 && t.reason.as_deref() == Some("Completed"))
}

fn container_ready(status: &ContainerStatus) -> bool {
    let state = status.state.as_ref();
    let running = state.is_some_and(|s| s.running.is_some());
    let completed = state
        .and_then(|s| s.terminated.as_ref())
        .is_some_and(|t| t.exit_code == 0);
    (status.ready && running) || completed
}

fn count(statuses: Option<&Vec<ContainerStatus>>, ready: fn(&ContainerStatus) -> bool) -> ContainerCounts {
    let statuses = statuses.map(Vec::as_slice).unwrap_or_default();
    ContainerCounts {
        ready: i32::try_from(statuses.iter().filter(|s| ready(s)).count()).unwrap_or(i32::MAX),
        total: i32::try_from(statuses.len()).unwrap_or(i32::MAX),
    }
}

/// Init and main container readiness counts of a pod
#[must_use]
pub fn container_counts(pod: Option<&Pod>) -> (ContainerCounts, ContainerCounts) {
    let status = pod.and_then(|p| p.status.as_ref());
    (
        count(status.and_then(|s| s.init_container_statuses.as_ref()), init_container_ready),
        count(status.and_then(|s| s.container_statuses.as_ref()), container_ready),
    )
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

fn pod_ready(pod: &Pod, init: ContainerCounts, main: ContainerCounts) -> bool {
    matches!(pod_phase(pod), "Running" | "Succeeded") && init.all_ready() && main.all_ready()
}

fn pod_degraded(pod: &Pod, init: ContainerCounts, main: ContainerCounts) -> bool {
    pod_phase(pod) == "Running" && init.all_ready() && main.ready > 0 && main.ready < main.total
}

fn workload_ready(updates: &ChildResourceUpdates) -> bool {
    let ready = updates
        .stateful_set()
        .and_then(|sts| sts.status.as_ref())
        .is_some_and(|s| s.replicas == 1 && s.ready_replicas == Some(1));
    ready && updates.all_unchanged()
}

/// First non-empty diagnosis over the pod, its events, the claims and the routes
#[must_use]
pub fn failure_reason(updates: &ChildResourceUpdates, observations: &Observations<'_>) -> String {
    let pod = observations.pod.map(diagnosis::pod_failure_reason);
    let events = Some(diagnosis::scheduling_failure_reason(observations.events));
    let claims = updates.claims().map(diagnosis::claim_failure_reason).map(Some);
    let service = updates.service().map(diagnosis::service_failure_reason);
    let ingress = updates.ingress().map(diagnosis::ingress_failure_reason);

    [pod, events]
        .into_iter()
        .chain(claims)
        .chain([service, ingress])
        .flatten()
        .find(|reason| !reason.is_empty())
        .unwrap_or_default()
}

/// Stamp `now` when the predicate turns true, keep the stamp while it holds, clear it otherwise
fn latch(active: bool, since: Option<&String>, now: DateTime<Utc>) -> Option<String> {
    match (active, since) {
        (false, _) => None,
        (true, Some(since)) => Some(since.clone()),
        (true, None) => Some(format_timestamp(now)),
    }
}

/// Conditions every new session starts with
#[must_use]
pub fn initial_conditions(now: DateTime<Utc>) -> Vec<SessionCondition> {
    [SessionConditionType::Ready, SessionConditionType::RoutingReady]
        .into_iter()
        .map(|condition_type| SessionCondition {
            condition_type,
            status: "False".to_string(),
            reason: "SessionCreated".to_string(),
            message: "the session was just created".to_string(),
            last_transition_time: Some(format_timestamp(now)),
        })
        .collect()
}

fn condition(
    condition_type: SessionConditionType,
    status: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> SessionCondition {
    SessionCondition {
        condition_type,
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Some(format_timestamp(now)),
    }
}

/// Rebuild the condition set, replacing a record only when its status flips
#[must_use]
pub fn advance_conditions(
    previous: &[SessionCondition],
    state: SessionState,
    ingress_declared: bool,
    ingress_live: bool,
    now: DateTime<Utc>,
) -> Vec<SessionCondition> {
    let seed = if previous.is_empty() {
        initial_conditions(now)
    } else {
        previous.to_vec()
    };
    let mut conditions: BTreeMap<SessionConditionType, SessionCondition> = seed
        .into_iter()
        .map(|c| (c.condition_type, c))
        .collect();

    let ready = condition(
        SessionConditionType::Ready,
        state == SessionState::Running,
        &state.to_string(),
        &format!("the session is {}", state.description()),
        now,
    );
    let routing = if !ingress_declared {
        Some(condition(
            SessionConditionType::RoutingReady,
            false,
            "NoIngress",
            "the session has no ingress",
            now,
        ))
    } else if ingress_live {
        Some(condition(
            SessionConditionType::RoutingReady,
            true,
            "IngressReady",
            "the ingress of the session exists",
            now,
        ))
    } else {
        None
    };

    for next in std::iter::once(ready).chain(routing) {
        let flipped = conditions
            .get(&next.condition_type)
            .map_or(true, |prior| prior.status != next.status);
        if flipped {
            conditions.insert(next.condition_type, next);
        }
    }

    conditions.into_values().collect()
}

/// Compute the full status for this pass; `willHibernateAt` is filled in by the culling engine
#[must_use]
pub fn build_status(
    session: &InteractiveSession,
    updates: &ChildResourceUpdates,
    observations: &Observations<'_>,
    now: DateTime<Utc>,
) -> InteractiveSessionStatus {
    let previous = session.status.clone().unwrap_or_default();
    let deleting = session.metadata.deletion_timestamp.is_some();
    let pod = observations
        .pod
        .filter(|p| p.metadata.deletion_timestamp.is_none());
    let (init_counts, counts) = container_counts(pod);

    let reason = if deleting {
        String::new()
    } else {
        failure_reason(updates, observations)
    };

    let state = derive_state(&StateInputs {
        deleting,
        hibernation_requested: session.spec.hibernated,
        replica_target: updates
            .stateful_set()
            .and_then(|sts| sts.spec.as_ref())
            .and_then(|spec| spec.replicas),
        failing: !reason.is_empty(),
        workload_ready: workload_ready(updates),
        pod_ready: pod.is_some_and(|p| pod_ready(p, init_counts, counts)),
        pod_degraded: pod.is_some_and(|p| pod_degraded(p, init_counts, counts)),
    });

    let hibernated = state == SessionState::Hibernated;
    let idle = observations.idle && !hibernated && !deleting;
    let failing = state == SessionState::Failed;
    let zero_counts = hibernated || deleting;

    InteractiveSessionStatus {
        conditions: advance_conditions(
            &previous.conditions,
            state,
            session.spec.ingress.is_some(),
            updates.ingress().is_some(),
            now,
        ),
        state,
        url: manifests::session_url(session).unwrap_or_default(),
        container_counts: if zero_counts { ContainerCounts::default() } else { counts },
        init_container_counts: if zero_counts {
            ContainerCounts::default()
        } else {
            init_counts
        },
        idle,
        idle_since: latch(idle, previous.idle_since.as_ref(), now),
        failing_since: latch(failing, previous.failing_since.as_ref(), now),
        hibernated_since: latch(hibernated, previous.hibernated_since.as_ref(), now),
        will_hibernate_at: None,
        error: failing.then_some(reason),
    }
}
