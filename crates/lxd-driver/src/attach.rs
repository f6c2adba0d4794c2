//! Hot attach and detach of volumes and network interfaces. Both edit the
//! instance's profile in place.

use lxd_common::{Instance, Vif, VolumeConnection};
use tracing::{info, instrument, warn};

use crate::device::{DeviceSpec, DiskDevice};
use crate::driver::LxdDriver;
use crate::profile::{Profile, ProfileBuilder};
use crate::{DriverError, Result};

impl LxdDriver {
    async fn load_profile(&self, name: &str) -> Result<Profile> {
        self.session
            .profile_get(name)
            .await
            .map_err(|e| DriverError::remote(name, e))
    }

    async fn save_profile(&self, profile: &Profile) -> Result<()> {
        self.session
            .profile_update(profile)
            .await
            .map_err(|e| DriverError::remote(&profile.name, e))
    }

    #[instrument(skip_all, fields(instance = %instance.name, volume = %connection.volume_id))]
    pub async fn attach_volume(
        &self,
        instance: &Instance,
        connection: &VolumeConnection,
        mountpoint: &str,
    ) -> Result<()> {
        let name = instance.name.as_str();
        let storage = &self.collaborators.storage;
        let device = storage
            .connect_volume(connection)
            .await
            .map_err(|e| DriverError::collaborator(name, e))?;

        let attached = async {
            let mut profile = self.load_profile(name).await?;
            let disk = DiskDevice::bind(mountpoint, device.path.to_string_lossy());
            profile.insert_device(&connection.volume_id, DeviceSpec::Disk(disk))?;
            self.save_profile(&profile).await
        };
        if let Err(e) = attached.await {
            if let Err(disconnect) = storage.disconnect_volume(connection).await {
                warn!(error = %disconnect, "Failed to disconnect volume after failed attach");
            }
            return Err(e);
        }
        info!(path = %device.path.display(), %mountpoint, "Volume attached");
        Ok(())
    }

    #[instrument(skip_all, fields(instance = %instance.name, volume = %connection.volume_id))]
    pub async fn detach_volume(&self, instance: &Instance, connection: &VolumeConnection) -> Result<()> {
        let name = instance.name.as_str();
        let mut profile = self.load_profile(name).await?;
        if profile.remove_device(&connection.volume_id).is_some() {
            self.save_profile(&profile).await?;
        }
        self.collaborators
            .storage
            .disconnect_volume(connection)
            .await
            .map_err(|e| DriverError::collaborator(name, e))?;
        info!("Volume detached");
        Ok(())
    }

    #[instrument(skip_all, fields(instance = %instance.name, vif = %vif.id))]
    pub async fn attach_interface(&self, instance: &Instance, vif: &Vif) -> Result<()> {
        let name = instance.name.as_str();
        let (key, nic) = ProfileBuilder::new(&self.config).nic_device(instance, vif)?;

        let vifs = std::slice::from_ref(vif);
        self.plug_vifs(instance, vifs).await?;
        self.collaborators
            .firewall
            .setup_basic_filtering(instance, vifs)
            .await
            .map_err(|e| DriverError::collaborator(name, e))?;

        let mut profile = self.load_profile(name).await?;
        profile.insert_device(key, nic)?;
        self.save_profile(&profile).await?;
        info!("Interface attached");
        Ok(())
    }

    #[instrument(skip_all, fields(instance = %instance.name, vif = %vif.id))]
    pub async fn detach_interface(&self, instance: &Instance, vif: &Vif) -> Result<()> {
        let name = instance.name.as_str();
        let (key, _) = ProfileBuilder::new(&self.config).nic_device(instance, vif)?;

        let mut profile = self.load_profile(name).await?;
        if profile.remove_device(&key).is_some() {
            self.save_profile(&profile).await?;
        }
        self.collaborators
            .vif_driver
            .unplug(instance, vif)
            .await
            .map_err(|e| DriverError::collaborator(name, e))?;
        info!("Interface detached");
        Ok(())
    }
}
