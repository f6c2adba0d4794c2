//! Driver configuration. Built once by the caller and handed to every
//! component's constructor; nothing here is read from process globals after
//! construction.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{DriverError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Base URL of the hypervisor REST API.
    pub endpoint: String,
    /// Root of the per-instance directory tree (console logs, ephemerals, locks).
    pub instances_path: PathBuf,
    /// Hypervisor data directory, used to locate container root filesystems.
    pub lxd_root_dir: PathBuf,
    /// Identity of this host as the orchestrator names it in migrations.
    pub host: String,
    pub product_name: String,
    /// Default bound, in seconds, for ordinary lifecycle operations.
    pub operation_timeout: u64,
    /// Seconds to wait for VIF plugged events; 0 disables waiting.
    pub vif_plugging_timeout: u64,
    pub vif_plugging_is_fatal: bool,
    pub resume_guests_state_on_host_boot: bool,
    pub config_drive_format: String,
    pub force_config_drive: bool,
    /// Per-request HTTP timeout in seconds, on top of any long-poll window.
    /// Image uploads and exports are not bounded by it.
    pub request_timeout: u64,
    pub retry: RetryPolicy,
    pub poll: PollConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://127.0.0.1:8443".to_string(),
            instances_path: PathBuf::from("/var/lib/nova/instances"),
            lxd_root_dir: PathBuf::from("/var/lib/lxd"),
            host: "localhost".to_string(),
            product_name: "LXD Compute Driver".to_string(),
            operation_timeout: 30,
            vif_plugging_timeout: 300,
            vif_plugging_is_fatal: true,
            resume_guests_state_on_host_boot: false,
            config_drive_format: "iso9660".to_string(),
            force_config_drive: false,
            request_timeout: 60,
            retry: RetryPolicy::default(),
            poll: PollConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by any `LXD_*` variable present in the environment.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(endpoint) = std::env::var("LXD_ENDPOINT") {
            cfg.endpoint = endpoint;
        }
        if let Ok(path) = std::env::var("LXD_INSTANCES_PATH") {
            cfg.instances_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("LXD_ROOT_DIR") {
            cfg.lxd_root_dir = PathBuf::from(path);
        }
        if let Ok(host) = std::env::var("LXD_HOST") {
            cfg.host = host;
        }
        if let Ok(name) = std::env::var("LXD_PRODUCT_NAME") {
            cfg.product_name = name;
        }
        if let Ok(format) = std::env::var("LXD_CONFIG_DRIVE_FORMAT") {
            cfg.config_drive_format = format;
        }

        cfg.operation_timeout = env_parse("LXD_OPERATION_TIMEOUT", cfg.operation_timeout)?;
        cfg.vif_plugging_timeout =
            env_parse("LXD_VIF_PLUGGING_TIMEOUT", cfg.vif_plugging_timeout)?;
        cfg.vif_plugging_is_fatal =
            env_parse("LXD_VIF_PLUGGING_IS_FATAL", cfg.vif_plugging_is_fatal)?;
        cfg.resume_guests_state_on_host_boot = env_parse(
            "LXD_RESUME_GUESTS_STATE_ON_HOST_BOOT",
            cfg.resume_guests_state_on_host_boot,
        )?;
        cfg.force_config_drive = env_parse("LXD_FORCE_CONFIG_DRIVE", cfg.force_config_drive)?;
        cfg.request_timeout = env_parse("LXD_REQUEST_TIMEOUT", cfg.request_timeout)?;
        cfg.retry.max_retries = env_parse("LXD_MAX_RETRIES", cfg.retry.max_retries)?;

        Ok(cfg)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DriverError::Config(format!("{key} has invalid value {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Retry policy for transient transport failures on idempotent requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No automatic retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based), capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// How the operation tracker polls the hypervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Longest single server-side wait requested per status query.
    pub poll_slice: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_slice: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_no_retry_policy() {
        assert_eq!(RetryPolicy::none().max_retries, 0);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("LXD_ENDPOINT", "https://10.0.0.5:8443");
        std::env::set_var("LXD_OPERATION_TIMEOUT", "45");
        std::env::set_var("LXD_VIF_PLUGGING_IS_FATAL", "false");
        let cfg = DriverConfig::from_env().unwrap();
        std::env::remove_var("LXD_ENDPOINT");
        std::env::remove_var("LXD_OPERATION_TIMEOUT");
        std::env::remove_var("LXD_VIF_PLUGGING_IS_FATAL");

        assert_eq!(cfg.endpoint, "https://10.0.0.5:8443");
        assert_eq!(cfg.operation_timeout, 45);
        assert!(!cfg.vif_plugging_is_fatal);
        assert_eq!(cfg.config_drive_format, "iso9660");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        std::env::set_var("LXD_REQUEST_TIMEOUT", "soon");
        let result = DriverConfig::from_env();
        std::env::remove_var("LXD_REQUEST_TIMEOUT");

        assert!(matches!(result, Err(DriverError::Config(msg)) if msg.contains("LXD_REQUEST_TIMEOUT")));
    }
}
