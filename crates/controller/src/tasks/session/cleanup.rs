use crate::crds::{ContainerCounts, InteractiveSession, SessionState};
use crate::tasks::session::client::SessionClient;
use crate::tasks::types::{ChildErrors, Error, Result};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

/// Finalizer cleanup: report the session as going away and delete the secrets it adopted.
///
/// Child workloads are owned by the session and are removed by garbage collection.
#[instrument(skip(session, client), fields(session_name = %session.name_any()))]
pub async fn cleanup_session(
    session: &InteractiveSession,
    client: &dyn SessionClient,
) -> Result<Action> {
    let name = session.name_any();
    info!("🧹 Cleaning up session {}", name);

    let previous = session.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    status.state = SessionState::NotReady;
    status.container_counts = ContainerCounts::default();
    status.init_container_counts = ContainerCounts::default();
    status.idle = false;
    status.will_hibernate_at = None;
    if status != previous {
        client.patch_session_status(&name, &status).await?;
    }

    let mut errors = ChildErrors::default();
    for secret in session.adopted_secrets() {
        match client.delete_secret(&secret).await {
            Ok(true) => info!("🗑️ Deleted adopted secret {}", secret),
            Ok(false) => info!("Adopted secret {} already gone", secret),
            Err(e) => errors.push(format!("secret/{secret}"), e.to_string()),
        }
    }
    if !errors.is_empty() {
        return Err(Error::ChildResources(errors));
    }

    info!("✅ Cleanup completed for session {}", name);
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        Authentication, AuthenticationType, InteractiveSessionSpec, InteractiveSessionStatus,
        SessionSecretRef,
    };
    use crate::tasks::session::client::MockSessionClient;
    use kube::core::ErrorResponse;

    fn session_with_secrets() -> InteractiveSession {
        let mut session = InteractiveSession::new(
            "notebook",
            InteractiveSessionSpec {
                authentication: Some(Authentication {
                    enabled: true,
                    auth_type: AuthenticationType::Token,
                    secret_ref: SessionSecretRef {
                        name: "notebook-auth".to_string(),
                        key: None,
                        adopt: true,
                    },
                    extra_volume_mounts: Vec::new(),
                }),
                ..InteractiveSessionSpec::default()
            },
        );
        session.metadata.namespace = Some("sessions".to_string());
        session.status = Some(InteractiveSessionStatus {
            state: SessionState::Running,
            container_counts: ContainerCounts { ready: 2, total: 2 },
            ..InteractiveSessionStatus::default()
        });
        session
    }

    #[tokio::test]
    async fn deletes_adopted_secrets_and_resets_status() {
        let session = session_with_secrets();
        let mut client = MockSessionClient::new();
        client
            .expect_patch_session_status()
            .withf(|name, status| {
                name == "notebook"
                    && status.state == SessionState::NotReady
                    && status.container_counts == ContainerCounts::default()
            })
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_delete_secret()
            .withf(|name| name == "notebook-auth")
            .times(1)
            .returning(|_| Ok(true));

        let action = cleanup_session(&session, &client).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn failed_secret_deletion_is_reported() {
        let session = session_with_secrets();
        let mut client = MockSessionClient::new();
        client.expect_patch_session_status().returning(|_, _| Ok(()));
        client.expect_delete_secret().returning(|_| {
            Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "secrets is forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }))
        });

        let err = cleanup_session(&session, &client).await.unwrap_err();
        assert!(matches!(err, Error::ChildResources(ref e) if e.len() == 1));
        assert!(err.to_string().contains("secret/notebook-auth"));
    }
}
