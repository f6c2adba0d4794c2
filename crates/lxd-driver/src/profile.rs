//! Profile synthesis from instance, network and block-device facts.

use std::collections::BTreeMap;

use lxd_common::{BlockDeviceInfo, Instance, Vif};
use serde::{Deserialize, Serialize};

use crate::config::DriverConfig;
use crate::device::{DeviceSpec, DiskDevice};
use crate::paths::InstancePaths;
use crate::session::HostInfo;
use crate::units::{DiskQuota, NetworkQuota, QuotaError};
use crate::vif;
use crate::{DriverError, Result};

pub const ROOT_DEVICE: &str = "root";

/// Storage backends that honour a size on the root device.
const SIZED_ROOT_BACKENDS: [&str; 2] = ["btrfs", "zfs"];

/// API extension required for per-container isolated id maps.
const ID_MAP_EXTENSION: &str = "id_map";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSpec>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds a device, refusing to replace one already under `key`.
    pub fn insert_device(&mut self, key: impl Into<String>, device: DeviceSpec) -> Result<()> {
        let key = key.into();
        if self.devices.contains_key(&key) {
            return Err(DriverError::DuplicateDevice {
                name: self.name.clone(),
                key,
            });
        }
        self.devices.insert(key, device);
        Ok(())
    }

    pub fn remove_device(&mut self, key: &str) -> Option<DeviceSpec> {
        self.devices.remove(key)
    }
}

fn flag_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn invalid_quota(instance: &Instance, err: QuotaError) -> DriverError {
    DriverError::InvalidQuota {
        name: instance.name.clone(),
        key: err.key,
        value: err.value,
    }
}

pub struct ProfileBuilder<'a> {
    config: &'a DriverConfig,
}

impl<'a> ProfileBuilder<'a> {
    pub fn new(config: &'a DriverConfig) -> Self {
        Self { config }
    }

    /// Builds the full profile for `instance`. Pure: nothing is created on the
    /// hypervisor, so a failure here leaves no state behind.
    pub fn build(
        &self,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
        host: &HostInfo,
    ) -> Result<Profile> {
        let mut profile = Profile::new(&instance.name);
        profile.config = self.base_config(instance, host)?;

        profile.insert_device(ROOT_DEVICE, self.root_device(instance, host)?)?;

        let paths = InstancePaths::new(self.config, &instance.name);
        for (idx, ephemeral) in block_device_info.ephemerals.iter().enumerate() {
            let mount = if idx == 0 {
                "/mnt".to_string()
            } else {
                format!("/mnt/{}", ephemeral.virtual_name)
            };
            let source = paths.ephemeral(&ephemeral.virtual_name);
            profile.insert_device(
                &ephemeral.virtual_name,
                DeviceSpec::Disk(DiskDevice::bind(mount, source.to_string_lossy())),
            )?;
        }

        for vif in network_info {
            let (key, nic) = self.nic_device(instance, vif)?;
            profile.insert_device(key, nic)?;
        }

        Ok(profile)
    }

    fn base_config(&self, instance: &Instance, host: &HostInfo) -> Result<BTreeMap<String, String>> {
        let paths = InstancePaths::new(self.config, &instance.name);
        let mut config = BTreeMap::new();
        config.insert(
            "environment.product_name".to_string(),
            self.config.product_name.clone(),
        );
        config.insert(
            "raw.lxc".to_string(),
            format!("lxc.console.logfile={}\n", paths.console_log().display()),
        );
        config.insert(
            "boot.autostart".to_string(),
            self.config.resume_guests_state_on_host_boot.to_string(),
        );

        let specs = &instance.extra_specs;
        let enabled = |key: &str| specs.get(key).is_some_and(|v| flag_enabled(v));
        if enabled("lxd:nested_allowed") {
            config.insert("security.nesting".to_string(), "true".to_string());
        }
        if enabled("lxd:privileged_allowed") {
            config.insert("security.privileged".to_string(), "true".to_string());
        }
        if enabled("lxd:isolated") {
            if !host.has_extension(ID_MAP_EXTENSION) {
                return Err(DriverError::UnsupportedHostCapability {
                    name: instance.name.clone(),
                    capability: ID_MAP_EXTENSION.to_string(),
                });
            }
            config.insert("security.idmap.isolated".to_string(), "true".to_string());
        }

        if instance.memory_mb >= 0 {
            config.insert(
                "limits.memory".to_string(),
                format!("{}MB", instance.memory_mb),
            );
        }
        if instance.vcpus >= 0 {
            config.insert("limits.cpu".to_string(), instance.vcpus.to_string());
        }

        Ok(config)
    }

    fn root_device(&self, instance: &Instance, host: &HostInfo) -> Result<DeviceSpec> {
        let limits = DiskQuota::from_extra_specs(&instance.extra_specs)
            .map_err(|e| invalid_quota(instance, e))?
            .limits();

        let size = SIZED_ROOT_BACKENDS
            .contains(&host.environment.storage.as_str())
            .then(|| format!("{}GB", instance.root_gb));

        Ok(DeviceSpec::Disk(DiskDevice {
            path: "/".to_string(),
            size,
            limits_read: limits.read,
            limits_write: limits.write,
            limits_max: limits.max,
            ..Default::default()
        }))
    }

    /// Device key and NIC for a single VIF, with the instance's network quota.
    pub fn nic_device(&self, instance: &Instance, vif: &Vif) -> Result<(String, DeviceSpec)> {
        let limits = NetworkQuota::from_extra_specs(&instance.extra_specs)
            .map_err(|e| invalid_quota(instance, e))?
            .limits();
        let resolved = vif::resolve(&instance.name, vif)?;
        Ok(resolved.nic_device(&limits))
    }
}
