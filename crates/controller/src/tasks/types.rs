use crate::tasks::config::ControllerConfig;
use crate::tasks::session::idle::IdleProbe;
use kube::Client;
use std::fmt;
use std::sync::Arc;

// Finalizer name
pub(crate) const SESSION_FINALIZER_NAME: &str = "sessions.platform/finalizer";

/// Error type for controller operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Culling policy error: {0}")]
    PolicyError(String),

    #[error("Child resource reconciliation failed: {0}")]
    ChildResources(ChildErrors),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One failing child object of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildError {
    /// Child kind, or the claim name for data source claims
    pub child: String,
    pub message: String,
}

/// All child errors of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildErrors(pub Vec<ChildError>);

impl ChildErrors {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, child: impl Into<String>, message: impl Into<String>) {
        self.0.push(ChildError {
            child: child.into(),
            message: message.into(),
        });
    }
}

impl fmt::Display for ChildErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|e| format!("{}: {}", e.child, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

/// Context shared across controller operations
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub namespace: String,
    pub config: Arc<ControllerConfig>,
    pub idle_probe: Arc<dyn IdleProbe>,
}
