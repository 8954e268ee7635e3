use crate::crds::InteractiveSession;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// StatefulSet names leave room for the 11 character controller-revision-hash suffix
const MAX_STATEFULSET_NAME_LENGTH: usize = 52;
const MAX_K8S_NAME_LENGTH: usize = 253;
const DATA_SOURCE_CLAIM_PREFIX: &str = "session-";

pub const APP_NAME: &str = "interactive-session";
pub const PART_OF: &str = "session-platform";
pub const CREATED_BY: &str = "session-controller";

pub struct ResourceNaming;

impl ResourceNaming {
    /// Name shared by the StatefulSet, Service, Ingress and session claim
    pub fn child_name(session: &InteractiveSession) -> String {
        Self::ensure_k8s_name_length(&session.name_any(), MAX_STATEFULSET_NAME_LENGTH)
    }

    /// The single pod of the session StatefulSet
    pub fn pod_name(session: &InteractiveSession) -> String {
        format!("{}-0", Self::child_name(session))
    }

    /// Format: session-{name}-ds-{index}
    pub fn data_source_claim_name(session: &InteractiveSession, index: usize) -> String {
        let name = format!("{DATA_SOURCE_CLAIM_PREFIX}{}-ds-{index}", session.name_any());
        Self::ensure_k8s_name_length(&name, MAX_K8S_NAME_LENGTH)
    }

    /// Pod volume name of a data source claim
    pub fn data_source_volume_name(index: usize) -> String {
        format!("data-source-{index}")
    }

    /// Labels put on every child object and the pod template
    pub fn labels(session: &InteractiveSession) -> BTreeMap<String, String> {
        let mut labels = Self::selector_labels(session);
        labels.insert("app.kubernetes.io/part-of".to_string(), PART_OF.to_string());
        labels.insert(
            "app.kubernetes.io/created-by".to_string(),
            CREATED_BY.to_string(),
        );
        labels
    }

    pub fn selector_labels(session: &InteractiveSession) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
            (
                "app.kubernetes.io/instance".to_string(),
                Self::child_name(session),
            ),
        ])
    }

    fn ensure_k8s_name_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }

        // Keep a readable prefix and disambiguate with a stable hash of the full name
        let hash = Self::hash_string(name);
        let prefix: String = name.chars().take(limit.saturating_sub(hash.len() + 1)).collect();
        format!("{}-{hash}", prefix.trim_end_matches('-'))
    }

    fn hash_string(input: &str) -> String {
        hex::encode(Sha256::digest(input.as_bytes()))[..8].to_string()
    }
}
