use std::path::PathBuf;

use crate::config::DriverConfig;

/// Deterministic host-side layout for one instance.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    instances_path: PathBuf,
    lxd_root_dir: PathBuf,
    name: String,
}

impl InstancePaths {
    pub fn new(config: &DriverConfig, name: &str) -> Self {
        Self {
            instances_path: config.instances_path.clone(),
            lxd_root_dir: config.lxd_root_dir.clone(),
            name: name.to_string(),
        }
    }

    pub fn instance_dir(&self) -> PathBuf {
        self.instances_path.join(&self.name)
    }

    pub fn console_log(&self) -> PathBuf {
        self.instance_dir().join("console.log")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.instance_dir().join("storage")
    }

    pub fn ephemeral(&self, virtual_name: &str) -> PathBuf {
        self.storage_dir().join(virtual_name)
    }

    pub fn config_drive_dir(&self) -> PathBuf {
        self.instance_dir().join("configdrive")
    }

    pub fn rescue_name(&self) -> String {
        format!("{}-rescue", self.name)
    }

    /// Root filesystem of the renamed original while the instance is in rescue.
    pub fn rescue_rootfs(&self) -> PathBuf {
        self.lxd_root_dir
            .join("containers")
            .join(self.rescue_name())
            .join("rootfs")
    }
}

/// Directory holding the host-local named lock files. Instance names cannot
/// start with a dot, so this never collides with an instance directory.
pub fn lock_dir(config: &DriverConfig) -> PathBuf {
    config.instances_path.join(".locks")
}
