use lxd_common::{Instance, RequestContext, Vif};
use tracing::info;

use crate::device::{DeviceSpec, DiskDevice};
use crate::driver::LxdDriver;
use crate::paths::InstancePaths;
use crate::profile::Profile;
use crate::{DriverError, Result};

pub const CONFIG_DRIVE_DEVICE: &str = "configdrive";
pub const CONFIG_DRIVE_MOUNT: &str = "/config-drive";
const SUPPORTED_FORMAT: &str = "iso9660";

impl LxdDriver {
    /// Whether `instance` gets a config drive. Fails up front on a format or
    /// builder the driver cannot honour.
    pub(crate) fn config_drive_required(&self, instance: &Instance) -> Result<bool> {
        if !(instance.config_drive || self.config.force_config_drive) {
            return Ok(false);
        }
        if self.config.config_drive_format != SUPPORTED_FORMAT {
            return Err(DriverError::ConfigDriveFormat {
                name: instance.name.clone(),
                format: self.config.config_drive_format.clone(),
            });
        }
        if self.collaborators.config_drive.is_none() {
            return Err(DriverError::UnsupportedFeature {
                name: instance.name.clone(),
                feature: "config drive".to_string(),
            });
        }
        Ok(true)
    }

    /// Render the drive on the host and bind it read-only into the container.
    pub(crate) async fn attach_config_drive(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        admin_password: Option<&str>,
        network_info: &[Vif],
        profile: &mut Profile,
    ) -> Result<()> {
        let name = instance.name.as_str();
        let builder = self.collaborators.config_drive.as_ref().ok_or_else(|| {
            DriverError::UnsupportedFeature {
                name: name.to_string(),
                feature: "config drive".to_string(),
            }
        })?;

        let target = InstancePaths::new(&self.config, name).config_drive_dir();
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| DriverError::io(name, e))?;
        info!(instance = %name, path = %target.display(), "Building config drive");
        builder
            .make_drive(ctx, instance, admin_password, network_info, &target)
            .await
            .map_err(|e| DriverError::collaborator(name, e))?;

        let device = DiskDevice {
            readonly: Some(true),
            ..DiskDevice::bind(CONFIG_DRIVE_MOUNT, target.to_string_lossy())
        };
        profile.insert_device(CONFIG_DRIVE_DEVICE, DeviceSpec::Disk(device))?;
        self.session
            .profile_update(profile)
            .await
            .map_err(|e| DriverError::remote(name, e))
    }
}
