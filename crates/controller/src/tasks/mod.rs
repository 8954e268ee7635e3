use crate::crds::InteractiveSession;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ListParams;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, Instrument};

pub mod config;
pub mod session;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use session::reconcile_session;
pub use types::{Error, Result};

use session::idle::{DisabledIdleProbe, IdleProbe, MetricsIdleProbe};
use types::Context;

/// Main entry point for the session controller
#[instrument(skip(client, config), fields(namespace = %namespace))]
pub async fn run_session_controller(
    client: Client,
    namespace: String,
    config: ControllerConfig,
) -> Result<()> {
    info!("Starting session controller in namespace: {}", namespace);

    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }

    let idle_probe: Arc<dyn IdleProbe> = if config.idle.enabled {
        Arc::new(MetricsIdleProbe::new(client.clone(), config.idle.clone()))
    } else {
        info!("Idle detection disabled");
        Arc::new(DisabledIdleProbe)
    };
    let concurrency = config.reconcile.concurrency;

    let context = Arc::new(Context {
        client: client.clone(),
        namespace: namespace.clone(),
        config: Arc::new(config),
        idle_probe,
    });
    debug!("Controller context created successfully");

    let sessions: Api<InteractiveSession> = Api::namespaced(client.clone(), &namespace);

    // Startup visibility
    match sessions.list(&ListParams::default()).await {
        Ok(list) => {
            info!(
                "Controller startup: found {} session(s) in namespace {}",
                list.items.len(),
                namespace
            );
            for session in list.items {
                let state = session
                    .status
                    .as_ref()
                    .map(|s| s.state.to_string())
                    .unwrap_or_default();
                debug!(
                    "Existing session: name={}, hibernated={}, state='{}'",
                    session.name_any(),
                    session.spec.hibernated,
                    state
                );
            }
        }
        Err(e) => {
            error!("Failed to list sessions at startup: {}", e);
        }
    }

    let watcher_config = Config::default().any_semantic();

    Controller::new(sessions, watcher_config.clone())
        .owns(
            Api::<StatefulSet>::namespaced(client.clone(), &namespace),
            watcher_config.clone(),
        )
        .owns(
            Api::<Service>::namespaced(client.clone(), &namespace),
            watcher_config.clone(),
        )
        .owns(
            Api::<Ingress>::namespaced(client.clone(), &namespace),
            watcher_config.clone(),
        )
        .owns(
            Api::<PersistentVolumeClaim>::namespaced(client.clone(), &namespace),
            watcher_config,
        )
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_session, error_policy, context)
        .for_each(|reconciliation_result| {
            let session_span = tracing::info_span!("session_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(session_resource) => {
                        info!(
                            resource = ?session_resource,
                            "Session reconciliation successful"
                        );
                    }
                    Err(reconciliation_err) => {
                        error!(
                            error = ?reconciliation_err,
                            "Session reconciliation error"
                        );
                    }
                }
            }
            .instrument(session_span)
        })
        .await;

    info!("Session controller shutting down");
    Ok(())
}

/// Error policy: log and try again after the configured delay
#[instrument(skip(ctx), fields(session_name = %session.name_any(), namespace = %ctx.namespace))]
fn error_policy(session: Arc<InteractiveSession>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(
        error = ?err,
        session_name = %session.name_any(),
        "Session reconciliation failed, requeueing"
    );
    Action::requeue(Duration::from_secs(ctx.config.reconcile.error_requeue_seconds))
}
