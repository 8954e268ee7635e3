//! Failure reasons inferred from child object and pod snapshots.
//!
//! Every function returns an empty string when nothing is wrong or when the
//! object is already being deleted.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Event, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;

/// Waiting reasons every container goes through while starting up
const BENIGN_WAITING_REASONS: [&str; 2] = ["ContainerCreating", "PodInitializing"];

const SCHEDULING_REASONS: [&str; 3] = ["FailedScheduling", "Scheduled", "TriggeredScaleUp"];

const RESIZE_INFEASIBLE: [&str; 2] = ["NodeResizeInfeasible", "ControllerResizeInfeasible"];

fn container_failure(status: &ContainerStatus) -> Option<String> {
    if status.started == Some(true) && status.ready {
        return None;
    }
    let state = status.state.as_ref()?;

    if let Some(waiting) = &state.waiting {
        let reason = waiting.reason.as_deref().unwrap_or_default();
        if BENIGN_WAITING_REASONS.contains(&reason) {
            return None;
        }
        let message = waiting.message.as_deref().unwrap_or_default();
        let name = &status.name;
        return Some(match reason {
            "ErrImagePull" | "ImagePullBackOff" => {
                if status.image.is_empty() {
                    format!("failed to pull the image for container {name}: {message}")
                } else {
                    format!(
                        "failed to pull image {} for container {name}: {message}",
                        status.image
                    )
                }
            }
            "CrashLoopBackOff" => format!(
                "the command in container {name} keeps crashing, which can happen when the disk is full; last reported reason: {message:?}"
            ),
            _ if !message.is_empty() => {
                format!("the container {name} is failing because {message}")
            }
            _ => format!("the container {name} is failing because {reason}"),
        });
    }

    let terminated = state.terminated.as_ref().filter(|t| t.exit_code != 0)?;
    Some(match terminated.message.as_deref().filter(|m| !m.is_empty()) {
        Some(message) => format!(
            "the container {} terminated with an error: {message}",
            status.name
        ),
        None => format!(
            "the command in container {} exited with code {}, likely because the disk ran out of space",
            status.name, terminated.exit_code
        ),
    })
}

pub fn pod_failure_reason(pod: &Pod) -> String {
    if pod.metadata.deletion_timestamp.is_some() {
        return String::new();
    }
    let Some(status) = &pod.status else {
        return String::new();
    };

    // Container statuses carry better messages than pod conditions
    let init = status.init_container_statuses.iter().flatten();
    let main = status.container_statuses.iter().flatten();
    if let Some(reason) = init.chain(main).find_map(container_failure) {
        return reason;
    }

    status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "DisruptionTarget" && c.status == "True")
        .map(|c| {
            c.message
                .clone()
                .filter(|m| !m.is_empty())
                .or_else(|| c.reason.clone())
                .unwrap_or_default()
        })
        .unwrap_or_default()
}

pub fn ingress_failure_reason(ingress: &Ingress) -> String {
    if ingress.metadata.deletion_timestamp.is_some() {
        return String::new();
    }
    ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .flat_map(|lb| lb.ports.iter().flatten())
        .find_map(|port| port.error.clone())
        .unwrap_or_default()
}

pub fn service_failure_reason(service: &Service) -> String {
    if service.metadata.deletion_timestamp.is_some() {
        return String::new();
    }
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .flat_map(|lb| lb.ports.iter().flatten())
        .find_map(|port| port.error.clone())
        .unwrap_or_default()
}

pub fn claim_failure_reason(claim: &PersistentVolumeClaim) -> String {
    if claim.metadata.deletion_timestamp.is_some() {
        return String::new();
    }
    let Some(status) = &claim.status else {
        return String::new();
    };
    if status.phase.as_deref() == Some("Bound") {
        return String::new();
    }

    let name = claim.metadata.name.as_deref().unwrap_or_default();
    if let Some((resource, state)) = status
        .allocated_resource_statuses
        .iter()
        .flatten()
        .find(|(_, state)| RESIZE_INFEASIBLE.contains(&state.as_str()))
    {
        return format!("the claim {name:?} failed with status {state:?} for resource {resource}");
    }

    status
        .conditions
        .iter()
        .flatten()
        .find(|c| {
            matches!(c.type_.as_str(), "Resizing" | "FileSystemResizePending") && c.status == "False"
        })
        .and_then(|c| c.message.clone())
        .unwrap_or_default()
}

fn event_time(event: &Event) -> Option<DateTime<Utc>> {
    event
        .event_time
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.last_timestamp.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
}

/// Oldest first; events without any timestamp keep their relative order at the front
pub fn sort_events(events: &mut [Event]) {
    events.sort_by_key(event_time);
}

/// Reports a scheduling failure only while `FailedScheduling` is the latest scheduling event
pub fn scheduling_failure_reason(events: &[Event]) -> String {
    events
        .iter()
        .filter(|e| {
            e.reason
                .as_deref()
                .is_some_and(|r| SCHEDULING_REASONS.contains(&r))
        })
        .next_back()
        .filter(|e| e.reason.as_deref() == Some("FailedScheduling"))
        .map(|e| {
            format!(
                "Failed scheduling: {}",
                e.message.as_deref().unwrap_or_default()
            )
        })
        .unwrap_or_default()
}
