//! Rescue mode: boot a fresh container with the broken root filesystem
//! mounted at `/mnt`.
//!
//! Nothing is rolled back once the original container has been renamed; an
//! operator can always finish or undo the swap by hand from that point.

use lxd_common::{Instance, RequestContext};
use tracing::{error, info, instrument};

use crate::device::{DeviceSpec, DiskDevice};
use crate::driver::LxdDriver;
use crate::paths::InstancePaths;
use crate::session::{ContainerConfig, ContainerSource, StateAction};
use crate::{DriverError, Result};

pub const RESCUE_DEVICE: &str = "rescue";
const RESCUE_MOUNT: &str = "/mnt";

impl LxdDriver {
    async fn rename_container(&self, name: &str, new_name: &str) -> Result<()> {
        let handle = self
            .session
            .container_rename(name, new_name)
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        self.tracker
            .wait_for_success(name, &handle, self.op_timeout())
            .await?;
        Ok(())
    }

    async fn start_rescue_container(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        rescue_image_ref: Option<&str>,
        paths: &InstancePaths,
    ) -> Result<()> {
        let name = instance.name.as_str();
        let mut image_owner = instance.clone();
        if let Some(image_ref) = rescue_image_ref {
            image_owner.image_ref = image_ref.to_string();
        }
        self.ensure_image(ctx, &image_owner).await?;

        let mut profile = self
            .session
            .profile_get(name)
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        let device = DiskDevice::bind(RESCUE_MOUNT, paths.rescue_rootfs().to_string_lossy());
        profile.insert_device(RESCUE_DEVICE, DeviceSpec::Disk(device))?;
        self.session
            .profile_update(&profile)
            .await
            .map_err(|e| DriverError::remote(name, e))?;

        info!("Creating rescue container");
        let source = ContainerSource::Image {
            alias: image_owner.image_ref.clone(),
        };
        let handle = self
            .session
            .container_init(&ContainerConfig::new(name, source))
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        self.tracker
            .wait_for_success(name, &handle, self.op_timeout())
            .await?;

        self.change_state(name, StateAction::Start).await
    }

    /// `rescue_image_ref` overrides the image the rescue container boots from.
    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn rescue(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        rescue_image_ref: Option<&str>,
    ) -> Result<()> {
        let name = instance.name.as_str();
        let paths = InstancePaths::new(&self.config, name);
        let rescue_name = paths.rescue_name();

        info!("Stopping container for rescue");
        self.power_off(instance).await?;

        info!(backup = %rescue_name, "Renaming original container");
        self.rename_container(name, &rescue_name).await?;

        let rescued = self
            .start_rescue_container(ctx, instance, rescue_image_ref, &paths)
            .await;

        if let Err(e) = &rescued {
            error!(backup = %rescue_name, error = %e, "Rescue failed after the original was renamed");
        }
        rescued
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn unrescue(&self, instance: &Instance) -> Result<()> {
        let name = instance.name.as_str();
        let rescue_name = InstancePaths::new(&self.config, name).rescue_name();

        info!("Removing rescue container");
        self.remove_container(name).await?;

        let mut profile = self
            .session
            .profile_get(name)
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        if profile.remove_device(RESCUE_DEVICE).is_some() {
            self.session
                .profile_update(&profile)
                .await
                .map_err(|e| DriverError::remote(name, e))?;
        }

        info!(backup = %rescue_name, "Restoring original container");
        self.rename_container(&rescue_name, name).await?;
        self.change_state(name, StateAction::Start).await
    }
}
