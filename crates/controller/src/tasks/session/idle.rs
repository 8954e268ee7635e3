//! Idle detection for running sessions.
//!
//! Two signals are combined: CPU usage of the session container reported by the
//! metrics API, and the time since the authentication proxy last forwarded a
//! request. A session is idle only when no signal says otherwise and at least
//! one signal says idle.

use crate::crds::InteractiveSession;
use crate::tasks::config::IdleConfig;
use crate::tasks::session::manifests::{AUTH_PROXY_META_PORT, SESSION_CONTAINER_NAME};
use crate::tasks::session::naming::ResourceNaming;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

lazy_static! {
    /// CPU quantities as reported by metrics-server: `12345678n`, `250m`, `1`
    static ref CPU_QUANTITY: Regex =
        Regex::new(r"^([0-9]+(?:\.[0-9]+)?)(n|u|m)?$").expect("cpu pattern is valid");
}

/// Ordered so that combining decisions is taking the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum IdleDecision {
    #[default]
    Unknown,
    Idle,
    NotIdle,
}

impl IdleDecision {
    #[must_use]
    pub fn combine(decisions: &[IdleDecision]) -> bool {
        decisions.iter().copied().max().unwrap_or_default() == IdleDecision::Idle
    }
}

/// Point-in-time idle decision for a session with a live pod
#[async_trait]
pub trait IdleProbe: Send + Sync {
    async fn is_idle(&self, session: &InteractiveSession) -> bool;
}

/// Never reports a session as idle
pub struct DisabledIdleProbe;

#[async_trait]
impl IdleProbe for DisabledIdleProbe {
    async fn is_idle(&self, _session: &InteractiveSession) -> bool {
        false
    }
}

/// Millicores of a CPU quantity string
#[must_use]
pub fn parse_cpu_millicores(quantity: &str) -> Option<f64> {
    let captures = CPU_QUANTITY.captures(quantity.trim())?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let scale = match captures.get(2).map(|m| m.as_str()) {
        Some("n") => 1e-6,
        Some("u") => 1e-3,
        Some("m") => 1.0,
        _ => 1000.0,
    };
    Some(value * scale)
}

#[must_use]
pub fn cpu_decision(usage_millicores: Option<f64>, threshold_millicores: u64) -> IdleDecision {
    match usage_millicores {
        None => IdleDecision::Unknown,
        #[allow(clippy::cast_precision_loss)]
        Some(usage) if usage < threshold_millicores as f64 => IdleDecision::Idle,
        Some(_) => IdleDecision::NotIdle,
    }
}

#[must_use]
pub fn request_decision(
    last_request: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> IdleDecision {
    match last_request {
        None => IdleDecision::Unknown,
        Some(last) if (now - last).to_std().unwrap_or_default() >= threshold => IdleDecision::Idle,
        Some(_) => IdleDecision::NotIdle,
    }
}

#[derive(Debug, Deserialize)]
struct RequestStats {
    #[serde(rename = "lastRequestTime")]
    last_request_time: DateTime<Utc>,
}

/// [`IdleProbe`] backed by `metrics.k8s.io` and the proxy request statistics
pub struct MetricsIdleProbe {
    client: Client,
    http: reqwest::Client,
    config: IdleConfig,
}

impl MetricsIdleProbe {
    #[must_use]
    pub fn new(client: Client, config: IdleConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, http, config }
    }

    async fn cpu_usage(&self, session: &InteractiveSession) -> Result<Option<f64>, kube::Error> {
        let namespace = session.namespace().unwrap_or_else(|| "default".to_string());
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &namespace, &resource);

        let Some(metrics) = api.get_opt(&ResourceNaming::pod_name(session)).await? else {
            return Ok(None);
        };
        let usage = metrics.data["containers"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|c| c["name"].as_str() == Some(SESSION_CONTAINER_NAME))
            .and_then(|c| c["usage"]["cpu"].as_str())
            .and_then(parse_cpu_millicores);
        Ok(usage)
    }

    async fn last_request(&self, session: &InteractiveSession) -> Result<DateTime<Utc>, reqwest::Error> {
        let namespace = session.namespace().unwrap_or_else(|| "default".to_string());
        let url = format!(
            "http://{}.{namespace}.svc:{AUTH_PROXY_META_PORT}/request_stats",
            ResourceNaming::child_name(session)
        );
        let stats: RequestStats = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(stats.last_request_time)
    }
}

#[async_trait]
impl IdleProbe for MetricsIdleProbe {
    async fn is_idle(&self, session: &InteractiveSession) -> bool {
        if !self.config.enabled {
            return false;
        }

        let cpu = match self.cpu_usage(session).await {
            Ok(usage) => cpu_decision(usage, self.config.cpu_threshold_millicores),
            Err(e) => {
                debug!("CPU metrics unavailable for {}: {}", session.name_any(), e);
                IdleDecision::Unknown
            }
        };

        // The request statistics are served by the authentication proxy only
        let requests = if session.authentication_enabled() {
            match self.last_request(session).await {
                Ok(last) => request_decision(
                    Some(last),
                    Utc::now(),
                    Duration::from_secs(self.config.last_request_age_seconds),
                ),
                Err(e) => {
                    debug!("Request stats unavailable for {}: {}", session.name_any(), e);
                    IdleDecision::Unknown
                }
            }
        } else {
            IdleDecision::Unknown
        };

        IdleDecision::combine(&[cpu, requests])
    }
}
