//! Session Controller Configuration
//!
//! Loaded from the YAML file mounted into the controller pod. Every section is
//! defaulted so a partial (or missing) file still yields a usable configuration.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref QUANTITY_PATTERN: Regex =
        Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$")
            .expect("quantity pattern is valid");
}

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Authentication proxy sidecar configuration
    #[serde(default)]
    pub sidecars: SidecarsConfig,

    /// Storage defaults for session and data source claims
    #[serde(default)]
    pub storage: StorageConfig,

    /// Idle detection configuration
    #[serde(default)]
    pub idle: IdleConfig,

    /// Requeue timings
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SidecarsConfig {
    /// Image running the authentication proxy
    #[serde(default = "default_sidecars_image")]
    pub image: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Size of the session claim when the session does not request one
    #[serde(default = "default_session_size", rename = "defaultSessionSize")]
    pub default_session_size: String,

    /// Storage class backing data source claims (CSI rclone driver)
    #[serde(
        default = "default_data_source_storage_class",
        rename = "dataSourceStorageClass"
    )]
    pub data_source_storage_class: String,

    /// Nominal size requested by data source claims
    #[serde(default = "default_data_source_size", rename = "dataSourceSize")]
    pub data_source_size: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdleConfig {
    #[serde(default = "default_idle_enabled")]
    pub enabled: bool,

    /// CPU usage of the session container below which it counts as idle
    #[serde(default = "default_cpu_threshold", rename = "cpuThresholdMillicores")]
    pub cpu_threshold_millicores: u64,

    /// Minimum age of the last proxied request for the session to count as idle
    #[serde(default = "default_last_request_age", rename = "lastRequestAgeSeconds")]
    pub last_request_age_seconds: u64,

    /// Timeout for metrics and request stats calls
    #[serde(default = "default_request_timeout", rename = "requestTimeoutSeconds")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_requeue", rename = "requeueSeconds")]
    pub requeue_seconds: u64,

    /// Requeue delay after a pass that changed the status
    #[serde(
        default = "default_status_changed_requeue",
        rename = "statusChangedRequeueSeconds"
    )]
    pub status_changed_requeue_seconds: u64,

    #[serde(default = "default_error_requeue", rename = "errorRequeueSeconds")]
    pub error_requeue_seconds: u64,

    /// Number of sessions reconciled in parallel (0 means unbounded)
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,
}

fn default_sidecars_image() -> String {
    std::env::var("SIDECARS_IMAGE")
        .unwrap_or_else(|_| "ghcr.io/5dlabs/session-sidecars:latest".to_string())
}

fn default_session_size() -> String {
    "1Gi".to_string()
}

fn default_data_source_storage_class() -> String {
    std::env::var("RCLONE_STORAGE_CLASS").unwrap_or_else(|_| "csi-rclone".to_string())
}

fn default_data_source_size() -> String {
    "10Gi".to_string()
}

fn default_idle_enabled() -> bool {
    true
}

fn default_cpu_threshold() -> u64 {
    300
}

fn default_last_request_age() -> u64 {
    30 * 60
}

fn default_request_timeout() -> u64 {
    5
}

fn default_requeue() -> u64 {
    10
}

fn default_status_changed_requeue() -> u64 {
    1
}

fn default_error_requeue() -> u64 {
    30
}

fn default_concurrency() -> u16 {
    16
}

impl Default for SidecarsConfig {
    fn default() -> Self {
        Self {
            image: default_sidecars_image(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_session_size: default_session_size(),
            data_source_storage_class: default_data_source_storage_class(),
            data_source_size: default_data_source_size(),
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: default_idle_enabled(),
            cpu_threshold_millicores: default_cpu_threshold(),
            last_request_age_seconds: default_last_request_age(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            requeue_seconds: default_requeue(),
            status_changed_requeue_seconds: default_status_changed_requeue(),
            error_requeue_seconds: default_error_requeue(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sidecars: SidecarsConfig::default(),
            storage: StorageConfig::default(),
            idle: IdleConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.sidecars.image.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "sidecars.image must name the authentication proxy image"
            ));
        }

        for (field, value) in [
            ("storage.defaultSessionSize", &self.storage.default_session_size),
            ("storage.dataSourceSize", &self.storage.data_source_size),
        ] {
            if !QUANTITY_PATTERN.is_match(value.trim()) {
                return Err(anyhow::anyhow!(
                    "{field} '{value}' is not a valid storage quantity"
                ));
            }
        }

        if self.storage.data_source_storage_class.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "storage.dataSourceStorageClass must not be empty"
            ));
        }

        let reconcile = &self.reconcile;
        if reconcile.requeue_seconds == 0
            || reconcile.status_changed_requeue_seconds == 0
            || reconcile.error_requeue_seconds == 0
        {
            return Err(anyhow::anyhow!(
                "reconcile requeue intervals must be greater than zero"
            ));
        }

        if self.idle.enabled && self.idle.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "idle.requestTimeoutSeconds must be greater than zero"
            ));
        }

        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        let mut config: ControllerConfig = serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables win over the mounted file
    fn apply_env_overrides(&mut self) {
        if let Ok(image) = std::env::var("SIDECARS_IMAGE") {
            self.sidecars.image = image;
        }
        if let Ok(class) = std::env::var("RCLONE_STORAGE_CLASS") {
            self.storage.data_source_storage_class = class;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
sidecars:
  image: "registry.local/sidecars:1.2.0"

storage:
  defaultSessionSize: "5Gi"
  dataSourceSize: "100Gi"

idle:
  enabled: false
  cpuThresholdMillicores: 150

reconcile:
  requeueSeconds: 20
  errorRequeueSeconds: 60
"#;

        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sidecars.image, "registry.local/sidecars:1.2.0");
        assert_eq!(config.storage.default_session_size, "5Gi");
        assert_eq!(config.storage.data_source_size, "100Gi");
        assert!(!config.idle.enabled);
        assert_eq!(config.idle.cpu_threshold_millicores, 150);
        assert_eq!(config.idle.last_request_age_seconds, 1800);
        assert_eq!(config.reconcile.requeue_seconds, 20);
        assert_eq!(config.reconcile.status_changed_requeue_seconds, 1);
        assert_eq!(config.reconcile.error_requeue_seconds, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: ControllerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.storage.default_session_size, "1Gi");
        assert_eq!(config.reconcile.requeue_seconds, 10);
        assert!(config.idle.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_requeue() {
        let mut config = ControllerConfig::default();
        config.reconcile.status_changed_requeue_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_quantity() {
        let mut config = ControllerConfig::default();
        config.storage.default_session_size = "lots".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage.defaultSessionSize"));
    }

    #[test]
    fn validate_rejects_empty_image() {
        let mut config = ControllerConfig::default();
        config.sidecars.image = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
