//! Resize and cold migration.
//!
//! The source side stops the container (refreshing its profile first when the
//! move stays on this host); the destination pulls the stopped container
//! straight from the source hypervisor.

use lxd_common::{BlockDeviceInfo, Instance, Migration, Vif};
use tracing::{error, info, instrument};

use crate::driver::LxdDriver;
use crate::operation::WaitTimeout;
use crate::session::{ContainerConfig, ContainerSource, Session};
use crate::{DriverError, Result};

impl LxdDriver {
    fn is_local(&self, host: &str) -> bool {
        host == self.config.host
    }

    #[instrument(skip_all, fields(instance = %instance.name, dest = %dest))]
    pub async fn migrate_disk_and_power_off(
        &self,
        instance: &Instance,
        dest: &str,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
    ) -> Result<()> {
        let name = instance.name.as_str();
        if self.is_local(dest) {
            info!("Same-host resize, refreshing profile");
            let profile = self
                .build_profile(instance, network_info, block_device_info)
                .await?;
            self.session
                .profile_update(&profile)
                .await
                .map_err(|e| DriverError::remote(name, e))?;
        }
        self.power_off(instance).await
    }

    /// Destination side. `source` is a session on the host the container is
    /// coming from; it is only used when the hosts differ.
    #[instrument(skip_all, fields(instance = %instance.name, source_host = %migration.source_host))]
    pub async fn finish_migration(
        &self,
        migration: &Migration,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
        source: &dyn Session,
        power_on: bool,
    ) -> Result<()> {
        if migration.source_host == migration.dest_host {
            if power_on {
                self.power_on(instance).await?;
            }
            return Ok(());
        }

        let pulled = self
            .pull_container(instance, network_info, block_device_info, source, power_on)
            .await;
        if let Err(e) = pulled {
            error!(error = %e, "Migration failed, rolling back destination");
            self.rollback_spawn(instance, network_info, block_device_info)
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn pull_container(
        &self,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
        source: &dyn Session,
        power_on: bool,
    ) -> Result<()> {
        let name = instance.name.as_str();
        let profile = self
            .build_profile(instance, network_info, block_device_info)
            .await?;

        self.plug_vifs(instance, network_info).await?;
        self.prepare_filters(instance, network_info).await?;

        self.session
            .profile_create(&profile)
            .await
            .map_err(|e| DriverError::remote(name, e))?;

        info!("Requesting migration source");
        let offer = source
            .container_migration_source(name)
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        let pull = ContainerSource::Migration {
            mode: "pull".to_string(),
            operation: offer.operation,
            secrets: offer.secrets,
        };
        let handle = self
            .session
            .container_init(&ContainerConfig::new(name, pull))
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        // Transfers run as long as the root filesystem takes to copy.
        self.tracker
            .wait_for_success(name, &handle, WaitTimeout::Infinite)
            .await?;
        info!("Container transferred");

        if power_on {
            self.start_filtered(instance, network_info).await?;
        }
        Ok(())
    }

    /// Source side, once the destination has taken over.
    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn confirm_migration(
        &self,
        migration: &Migration,
        instance: &Instance,
        network_info: &[Vif],
    ) -> Result<()> {
        if migration.source_host == migration.dest_host {
            return Ok(());
        }
        info!("Removing migrated container from source");
        self.unplug_vifs(instance, network_info).await;
        self.remove_container(&instance.name).await?;
        match self.session.profile_delete(&instance.name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(DriverError::remote(&instance.name, e)),
        }
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn finish_revert_migration(&self, instance: &Instance, power_on: bool) -> Result<()> {
        if power_on {
            self.power_on(instance).await?;
        }
        Ok(())
    }
}
