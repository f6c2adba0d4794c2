// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("Image service error: {0}")]
    Image(String),

    #[error("Network plugging error: {0}")]
    Network(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Volume connector error: {0}")]
    Volume(String),

    #[error("Config drive error: {0}")]
    ConfigDrive(String),

    #[error("Timed out waiting for events: {0}")]
    EventTimeout(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

// Define the primary Result type for collaborator calls
pub type Result<T> = std::result::Result<T, CollaboratorError>;

/// Per-request context handed through from the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            user_id: None,
            project_id: None,
        }
    }
}

/// Read-only instance facts. Sizing is signed because the orchestrator
/// uses negative values to mean "unlimited".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub memory_mb: i64,
    pub vcpus: i64,
    pub root_gb: i64,
    #[serde(default)]
    pub ephemeral_gb: i64,
    pub image_ref: String,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
    #[serde(default)]
    pub config_drive: bool,
}

impl Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Instance(name: {}, id: {})", self.name, self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VifNetwork {
    #[serde(default)]
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VifDetails {
    #[serde(default)]
    pub ovs_hybrid_plug: bool,
}

/// One virtual interface as described by the networking service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vif {
    pub id: String,
    pub address: String,
    #[serde(rename = "type")]
    pub vif_type: String,
    #[serde(default)]
    pub network: VifNetwork,
    #[serde(default)]
    pub devname: Option<String>,
    #[serde(default)]
    pub details: VifDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralDisk {
    pub virtual_name: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapDisk {
    pub device_name: String,
    pub swap_size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceInfo {
    #[serde(default)]
    pub ephemerals: Vec<EphemeralDisk>,
    #[serde(default)]
    pub swap: Option<SwapDisk>,
}

impl BlockDeviceInfo {
    pub fn swap_requested(&self) -> bool {
        self.swap.as_ref().is_some_and(|swap| swap.swap_size > 0)
    }
}

/// Connection data for a block-storage volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConnection {
    pub volume_id: String,
    pub driver_volume_type: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDevice {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    ImagePendingUpload,
    ImageUploading,
}

/// Receives task-state transitions while a long-running job makes progress.
pub trait TaskStateCallback: Send + Sync {
    fn update(&self, state: TaskState, expected: Option<TaskState>);
}

impl<F> TaskStateCallback for F
where
    F: Fn(TaskState, Option<TaskState>) + Send + Sync,
{
    fn update(&self, state: TaskState, expected: Option<TaskState>) {
        self(state, expected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub id: String,
    pub name: String,
}

/// Metadata attached to an uploaded snapshot image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUpdate {
    pub name: String,
    pub disk_format: String,
    pub container_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    NoState,
    Running,
    Paused,
    Shutdown,
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub state: PowerState,
    pub max_mem_kb: i64,
    pub num_cpu: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub source_host: String,
    pub dest_host: String,
}

// --- Collaborators ---

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Fetch the image into local storage and return its path.
    async fn download(&self, ctx: &RequestContext, image_ref: &str) -> Result<PathBuf>;
    async fn get(&self, ctx: &RequestContext, image_id: &str) -> Result<ImageMeta>;
    async fn update(
        &self,
        ctx: &RequestContext,
        image_id: &str,
        metadata: ImageUpdate,
        data: Vec<u8>,
    ) -> Result<()>;
}

#[async_trait]
pub trait VifDriver: Send + Sync {
    async fn plug(&self, instance: &Instance, vif: &Vif) -> Result<()>;
    async fn unplug(&self, instance: &Instance, vif: &Vif) -> Result<()>;
}

#[async_trait]
pub trait FirewallDriver: Send + Sync {
    async fn setup_basic_filtering(&self, instance: &Instance, network_info: &[Vif]) -> Result<()>;
    async fn prepare_instance_filter(&self, instance: &Instance, network_info: &[Vif])
        -> Result<()>;
    async fn apply_instance_filter(&self, instance: &Instance, network_info: &[Vif]) -> Result<()>;
    async fn unfilter_instance(&self, instance: &Instance, network_info: &[Vif]) -> Result<()>;
}

#[async_trait]
pub trait StorageConnector: Send + Sync {
    async fn connect_volume(&self, connection: &VolumeConnection) -> Result<VolumeDevice>;
    async fn disconnect_volume(&self, connection: &VolumeConnection) -> Result<()>;
}

#[async_trait]
pub trait ConfigDriveBuilder: Send + Sync {
    /// Write the config-drive tree for `instance` into `target`.
    async fn make_drive(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        admin_password: Option<&str>,
        network_info: &[Vif],
        target: &Path,
    ) -> Result<()>;
}

/// Hooks back into the orchestrator.
#[async_trait]
pub trait VirtApi: Send + Sync {
    /// Block until the networking service reports every VIF as plugged.
    /// Returns `CollaboratorError::EventTimeout` when `timeout` elapses first.
    async fn wait_for_vif_plugged(
        &self,
        instance: &Instance,
        vif_ids: &[String],
        timeout: Duration,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_deserialization_defaults() {
        let json = r#"{
            "id": "4f8e3c1a",
            "name": "instance-00000001",
            "memory_mb": 512,
            "vcpus": 1,
            "root_gb": 10,
            "image_ref": "ubuntu-noble"
        }"#;
        let instance: Instance = serde_json::from_str(json).unwrap();
        assert_eq!(instance.ephemeral_gb, 0);
        assert!(instance.extra_specs.is_empty());
        assert!(!instance.config_drive);
        assert_eq!(
            instance.to_string(),
            "Instance(name: instance-00000001, id: 4f8e3c1a)"
        );
    }

    #[test]
    fn test_vif_type_field_is_renamed() {
        let json = r#"{
            "id": "0123456789abcdef",
            "address": "fa:16:3e:00:00:01",
            "type": "bridge",
            "network": {"bridge": "br100"}
        }"#;
        let vif: Vif = serde_json::from_str(json).unwrap();
        assert_eq!(vif.vif_type, "bridge");
        assert_eq!(vif.network.bridge.as_deref(), Some("br100"));
        assert!(vif.devname.is_none());
        assert!(!vif.details.ovs_hybrid_plug);
    }

    #[test]
    fn test_swap_requested() {
        let mut info = BlockDeviceInfo::default();
        assert!(!info.swap_requested());
        info.swap = Some(SwapDisk {
            device_name: "/dev/sdb".to_string(),
            swap_size: 0,
        });
        assert!(!info.swap_requested());
        info.swap = Some(SwapDisk {
            device_name: "/dev/sdb".to_string(),
            swap_size: 1024,
        });
        assert!(info.swap_requested());
    }

    #[test]
    fn test_closure_task_state_callback() {
        let seen = std::sync::Mutex::new(Vec::new());
        let callback = |state: TaskState, expected: Option<TaskState>| {
            seen.lock().unwrap().push((state, expected));
        };
        callback.update(TaskState::ImagePendingUpload, None);
        callback.update(
            TaskState::ImageUploading,
            Some(TaskState::ImagePendingUpload),
        );
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
