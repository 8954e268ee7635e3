use super::children::{ChildResources, MergeScope};
use super::cleanup::cleanup_session;
use super::client::{KubeSessionClient, SessionClient};
use super::culling::CullingPolicy;
use super::diagnosis;
use super::idle::IdleProbe;
use super::naming::ResourceNaming;
use super::status::{build_status, format_timestamp, Observations};
use crate::crds::{InteractiveSession, SessionState};
use crate::tasks::config::ControllerConfig;
use crate::tasks::types::{Context, Error, Result, SESSION_FINALIZER_NAME};
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[instrument(skip(ctx), fields(session_name = %session.name_any(), namespace = %ctx.namespace))]
pub async fn reconcile_session(session: Arc<InteractiveSession>, ctx: Arc<Context>) -> Result<Action> {
    debug!("🎯 Starting reconcile for session {}", session.name_any());

    let sessions: Api<InteractiveSession> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let client = KubeSessionClient::new(ctx.client.clone(), &ctx.namespace);

    finalizer(&sessions, SESSION_FINALIZER_NAME, session, |event| async {
        match event {
            FinalizerEvent::Apply(session) => {
                apply_session(
                    &session,
                    &client,
                    ctx.idle_probe.as_ref(),
                    &ctx.config,
                    Utc::now(),
                )
                .await
            }
            FinalizerEvent::Cleanup(session) => cleanup_session(&session, &client).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::FinalizerError(format!("invalid finalizer name {SESSION_FINALIZER_NAME}"))
        }
    })
}

/// One reconcile pass over a live session.
///
/// Child errors do not stop the pass: the status is still computed and written
/// from what was observed, and the combined error is returned at the end.
pub async fn apply_session(
    session: &InteractiveSession,
    client: &dyn SessionClient,
    idle_probe: &dyn IdleProbe,
    config: &ControllerConfig,
    now: DateTime<Utc>,
) -> Result<Action> {
    let name = session.name_any();
    let owner = session.controller_owner_ref(&()).ok_or(Error::MissingObjectKey)?;
    let policy = CullingPolicy::from_spec(&session.spec.culling)?;

    let recorded_state = session
        .status
        .as_ref()
        .map(|s| s.state)
        .unwrap_or_default();
    let scope = MergeScope::for_strategy(session.spec.reconcile_strategy, recorded_state);
    if scope == MergeScope::ReplicasOnly {
        debug!(
            strategy = ?session.spec.reconcile_strategy,
            state = %recorded_state,
            "Only replicas of existing children will be updated"
        );
    }

    let updates = ChildResources::for_session(session, config)?
        .reconcile(client, &owner, scope)
        .await;

    let pod_name = ResourceNaming::pod_name(session);
    // The status is still written without the pod; the error is returned afterwards
    let (pod, pod_error) = match client.get_pod(&pod_name).await {
        Ok(pod) => (pod, None),
        Err(e) => {
            warn!("Failed to get pod {}: {}", pod_name, e);
            (None, Some(e))
        }
    };
    let mut events = match &pod {
        Some(_) => client.list_pod_events(&pod_name).await.unwrap_or_else(|e| {
            warn!("Failed to list events of pod {}: {}", pod_name, e);
            Vec::new()
        }),
        None => Vec::new(),
    };
    diagnosis::sort_events(&mut events);

    let idle = match &pod {
        Some(_) if !session.spec.hibernated => idle_probe.is_idle(session).await,
        _ => false,
    };

    let mut status = build_status(
        session,
        &updates,
        &Observations {
            pod: pod.as_ref(),
            events: &events,
            idle,
        },
        now,
    );

    let started_at = pod
        .as_ref()
        .and_then(|p| p.metadata.creation_timestamp.as_ref())
        .or(session.metadata.creation_timestamp.as_ref())
        .map(|t| t.0);
    if status.state != SessionState::Hibernated && !session.spec.hibernated {
        status.will_hibernate_at = policy
            .hibernation_date(started_at, &status)
            .map(format_timestamp);
    }
    let recorded_hibernation = session.status.as_ref().and_then(|s| s.will_hibernate_at.as_ref());
    if status.will_hibernate_at.as_ref() != recorded_hibernation {
        info!(
            will_hibernate_at = status.will_hibernate_at.as_deref().unwrap_or("never"),
            "Hibernation date of session {} changed",
            name
        );
    }

    let status_changed = session.status.as_ref() != Some(&status);
    if status_changed {
        info!(
            "📝 Session {} is {} ({})",
            name,
            status.state,
            status.state.description()
        );
        client.patch_session_status(&name, &status).await?;
    }

    if let Some(e) = pod_error {
        return Err(Error::KubeError(e));
    }

    if policy.needs_deletion(now, &status) {
        info!("🗑️ Session {} exceeded its maximum hibernation time, deleting", name);
        client.delete_session(&name).await?;
        return Ok(Action::await_change());
    }

    if !session.spec.hibernated && policy.needs_scale_down(now, started_at, &status) {
        info!("💤 Hibernating session {}", name);
        client.hibernate_session(&name).await?;
    }

    if let Some(errors) = updates.errors() {
        return Err(Error::ChildResources(errors));
    }

    let requeue = if status_changed {
        config.reconcile.status_changed_requeue_seconds
    } else {
        config.reconcile.requeue_seconds
    };
    Ok(Action::requeue(Duration::from_secs(requeue)))
}
