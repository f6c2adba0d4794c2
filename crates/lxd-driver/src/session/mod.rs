//! The hypervisor API surface the driver depends on.
//!
//! "Not found" is a first-class [`RemoteError`] variant so callers match on it
//! instead of inspecting status codes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::profile::Profile;

pub mod rest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("API error {status}: {message}")]
    Api { status: i64, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        RemoteError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Status codes shared by operations and containers.
pub mod status {
    pub const STOPPED: i64 = 102;
    pub const RUNNING: i64 = 103;
    pub const FROZEN: i64 = 110;
    pub const ERROR: i64 = 112;
    pub const SUCCESS: i64 = 200;
    pub const FAILURE: i64 = 400;
    pub const CANCELLED: i64 = 401;
}

/// Handle for an asynchronous hypervisor job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    pub id: String,
    pub status_code: i64,
}

impl OperationHandle {
    /// Handle from the `operation` path of an async response,
    /// e.g. `/1.0/operations/<uuid>`.
    pub fn from_path(path: &str, status_code: i64) -> Self {
        let id = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
        Self {
            id: id.to_string(),
            status_code,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub err: String,
}

/// One reading of the operation endpoint: the response envelope's status code
/// plus the embedded job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub status_code: i64,
    pub metadata: OperationMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: String,
    pub status_code: i64,
}

impl ContainerState {
    pub fn stopped() -> Self {
        Self {
            status: "Stopped".to_string(),
            status_code: status::STOPPED,
        }
    }

    pub fn running() -> Self {
        Self {
            status: "Running".to_string(),
            status_code: status::RUNNING,
        }
    }

    pub fn frozen() -> Self {
        Self {
            status: "Frozen".to_string(),
            status_code: status::FROZEN,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.status_code == status::STOPPED
    }

    pub fn is_running(&self) -> bool {
        self.status_code == status::RUNNING
    }

    pub fn is_frozen(&self) -> bool {
        self.status_code == status::FROZEN
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEnvironment {
    #[serde(default)]
    pub storage: String,
    #[serde(default)]
    pub server_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(default)]
    pub api_extensions: Vec<String>,
    #[serde(default)]
    pub environment: HostEnvironment,
}

impl HostInfo {
    pub fn has_extension(&self, extension: &str) -> bool {
        self.api_extensions.iter().any(|e| e == extension)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContainerSource {
    Image {
        alias: String,
    },
    Migration {
        mode: String,
        operation: String,
        secrets: BTreeMap<String, String>,
    },
}

/// Body of a container create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub profiles: Vec<String>,
    pub source: ContainerSource,
}

impl ContainerConfig {
    /// Container bound to its same-named profile.
    pub fn new(name: &str, source: ContainerSource) -> Self {
        Self {
            name: name.to_string(),
            profiles: vec![name.to_string()],
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub action: StateAction,
    pub timeout: i64,
    pub force: bool,
}

impl StateChange {
    pub fn new(action: StateAction, timeout: i64) -> Self {
        Self {
            action,
            timeout,
            force: matches!(action, StateAction::Stop | StateAction::Restart),
        }
    }
}

/// A split image: manifest tarball plus root filesystem.
#[derive(Clone)]
pub struct ImageUpload {
    pub fingerprint: String,
    pub manifest: Vec<u8>,
    pub rootfs: Vec<u8>,
}

impl std::fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageUpload")
            .field("fingerprint", &self.fingerprint)
            .field("manifest_len", &self.manifest.len())
            .field("rootfs_len", &self.rootfs.len())
            .finish()
    }
}

/// Everything a destination needs to pull a container from its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSource {
    pub operation: String,
    pub secrets: BTreeMap<String, String>,
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn host_info(&self) -> RemoteResult<HostInfo>;

    // Containers
    async fn container_list(&self) -> RemoteResult<Vec<String>>;
    async fn container_state(&self, name: &str) -> RemoteResult<ContainerState>;
    async fn container_init(&self, config: &ContainerConfig) -> RemoteResult<OperationHandle>;
    async fn container_update_state(
        &self,
        name: &str,
        change: &StateChange,
    ) -> RemoteResult<OperationHandle>;
    async fn container_delete(&self, name: &str) -> RemoteResult<OperationHandle>;
    async fn container_rename(&self, name: &str, new_name: &str) -> RemoteResult<OperationHandle>;
    async fn container_publish(&self, name: &str) -> RemoteResult<OperationHandle>;
    async fn container_migration_source(&self, name: &str) -> RemoteResult<MigrationSource>;

    async fn container_exists(&self, name: &str) -> RemoteResult<bool> {
        match self.container_state(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // Profiles
    async fn profile_get(&self, name: &str) -> RemoteResult<Profile>;
    async fn profile_create(&self, profile: &Profile) -> RemoteResult<()>;
    async fn profile_update(&self, profile: &Profile) -> RemoteResult<()>;
    async fn profile_delete(&self, name: &str) -> RemoteResult<()>;

    // Images
    /// Fingerprint the alias points at.
    async fn image_alias_get(&self, alias: &str) -> RemoteResult<String>;
    async fn image_alias_create(&self, alias: &str, fingerprint: &str) -> RemoteResult<()>;
    async fn image_upload(&self, upload: ImageUpload) -> RemoteResult<OperationHandle>;
    async fn image_export(&self, fingerprint: &str) -> RemoteResult<Vec<u8>>;
    async fn image_delete(&self, fingerprint: &str) -> RemoteResult<OperationHandle>;

    // Operations
    /// Block server-side for up to `timeout` and report the operation status.
    async fn operation_wait(&self, id: &str, timeout: Duration) -> RemoteResult<OperationStatus>;
}
