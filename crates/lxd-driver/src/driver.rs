//! Container lifecycle on top of the hypervisor session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lxd_common::{
    BlockDeviceInfo, CollaboratorError, ConfigDriveBuilder, FirewallDriver, ImageStore, Instance,
    InstanceInfo, PowerState, RequestContext, StorageConnector, VifDriver, Vif, VirtApi,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::DriverConfig;
use crate::lock::NamedLocks;
use crate::operation::{OperationTracker, WaitTimeout};
use crate::paths::{lock_dir, InstancePaths};
use crate::profile::{Profile, ProfileBuilder};
use crate::session::rest::RestSession;
use crate::session::{
    status, ContainerConfig, ContainerSource, HostInfo, Session, StateAction, StateChange,
};
use crate::{DriverError, Result};

/// External services the driver calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub image_store: Arc<dyn ImageStore>,
    pub vif_driver: Arc<dyn VifDriver>,
    pub firewall: Arc<dyn FirewallDriver>,
    pub storage: Arc<dyn StorageConnector>,
    pub virtapi: Arc<dyn VirtApi>,
    pub config_drive: Option<Arc<dyn ConfigDriveBuilder>>,
}

pub struct LxdDriver {
    pub(crate) config: DriverConfig,
    pub(crate) session: Arc<dyn Session>,
    pub(crate) tracker: OperationTracker,
    pub(crate) locks: NamedLocks,
    pub(crate) collaborators: Collaborators,
}

impl LxdDriver {
    pub fn new(config: DriverConfig, session: Arc<dyn Session>, collaborators: Collaborators) -> Self {
        let tracker = OperationTracker::new(session.clone(), config.poll.clone());
        let locks = NamedLocks::new(lock_dir(&config));
        Self {
            config,
            session,
            tracker,
            locks,
            collaborators,
        }
    }

    /// Driver talking to the REST endpoint named in `config`.
    pub fn connect(config: DriverConfig, collaborators: Collaborators) -> Result<Self> {
        let session = RestSession::new(&config)
            .map_err(|e| DriverError::Config(format!("cannot reach {}: {e}", config.endpoint)))?;
        Ok(Self::new(config, Arc::new(session), collaborators))
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn session(&self) -> Arc<dyn Session> {
        self.session.clone()
    }

    pub(crate) fn op_timeout(&self) -> WaitTimeout {
        WaitTimeout::Seconds(self.config.operation_timeout)
    }

    pub async fn host_info(&self) -> Result<HostInfo> {
        self.session
            .host_info()
            .await
            .map_err(|e| DriverError::remote(&self.config.host, e))
    }

    pub async fn list_instances(&self) -> Result<Vec<String>> {
        self.session
            .container_list()
            .await
            .map_err(|e| DriverError::remote(&self.config.host, e))
    }

    pub async fn instance_exists(&self, name: &str) -> Result<bool> {
        self.session
            .container_exists(name)
            .await
            .map_err(|e| DriverError::remote(name, e))
    }

    /// Profile for `instance` against the live host's capabilities.
    pub(crate) async fn build_profile(
        &self,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
    ) -> Result<Profile> {
        let host = self
            .session
            .host_info()
            .await
            .map_err(|e| DriverError::remote(&instance.name, e))?;
        ProfileBuilder::new(&self.config).build(instance, network_info, block_device_info, &host)
    }

    /// Request a state change and wait for it with the ordinary timeout.
    pub(crate) async fn change_state(&self, name: &str, action: StateAction) -> Result<()> {
        let change = StateChange::new(action, self.config.operation_timeout as i64);
        let handle = self
            .session
            .container_update_state(name, &change)
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        self.tracker
            .wait_for_success(name, &handle, self.op_timeout())
            .await?;
        Ok(())
    }

    pub(crate) async fn plug_vifs(&self, instance: &Instance, network_info: &[Vif]) -> Result<()> {
        for vif in network_info {
            debug!(vif = %vif.id, "Plugging VIF");
            self.collaborators
                .vif_driver
                .plug(instance, vif)
                .await
                .map_err(|e| DriverError::collaborator(&instance.name, e))?;
        }
        Ok(())
    }

    pub(crate) async fn unplug_vifs(&self, instance: &Instance, network_info: &[Vif]) {
        let vif_driver = &self.collaborators.vif_driver;
        let results = join_all(network_info.iter().map(|vif| vif_driver.unplug(instance, vif))).await;
        for (vif, result) in network_info.iter().zip(results) {
            if let Err(e) = result {
                warn!(instance = %instance.name, vif = %vif.id, error = %e, "Failed to unplug VIF");
            }
        }
    }

    /// Plug VIFs while waiting for the networking service to confirm them.
    async fn plug_vifs_awaiting_events(
        &self,
        instance: &Instance,
        network_info: &[Vif],
    ) -> Result<()> {
        let vif_ids: Vec<String> = network_info.iter().map(|vif| vif.id.clone()).collect();
        let timeout = Duration::from_secs(self.config.vif_plugging_timeout);

        let (events, plugged) = tokio::join!(
            self.collaborators
                .virtapi
                .wait_for_vif_plugged(instance, &vif_ids, timeout),
            self.plug_vifs(instance, network_info)
        );
        plugged?;

        match events {
            Ok(()) => Ok(()),
            Err(CollaboratorError::EventTimeout(detail)) => {
                if self.config.vif_plugging_is_fatal {
                    error!(instance = %instance.name, %detail, "Timed out waiting for VIF plugging");
                    Err(DriverError::VirtualInterfaceCreate {
                        name: instance.name.clone(),
                    })
                } else {
                    warn!(instance = %instance.name, %detail, "Timed out waiting for VIF plugging, continuing");
                    Ok(())
                }
            }
            Err(e) => Err(DriverError::collaborator(&instance.name, e)),
        }
    }

    pub(crate) async fn prepare_filters(&self, instance: &Instance, network_info: &[Vif]) -> Result<()> {
        let firewall = &self.collaborators.firewall;
        firewall
            .setup_basic_filtering(instance, network_info)
            .await
            .map_err(|e| DriverError::collaborator(&instance.name, e))?;
        firewall
            .prepare_instance_filter(instance, network_info)
            .await
            .map_err(|e| DriverError::collaborator(&instance.name, e))
    }

    /// Start the container, then apply the instance filter prepared earlier.
    pub(crate) async fn start_filtered(&self, instance: &Instance, network_info: &[Vif]) -> Result<()> {
        info!(instance = %instance.name, "Starting container");
        self.change_state(&instance.name, StateAction::Start).await?;
        self.collaborators
            .firewall
            .apply_instance_filter(instance, network_info)
            .await
            .map_err(|e| DriverError::collaborator(&instance.name, e))
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn spawn(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
        admin_password: Option<&str>,
    ) -> Result<()> {
        let name = instance.name.as_str();
        if block_device_info.swap_requested() {
            return Err(DriverError::UnsupportedFeature {
                name: name.to_string(),
                feature: "swap disks".to_string(),
            });
        }
        if self.instance_exists(name).await? {
            return Err(DriverError::AlreadyExists {
                name: name.to_string(),
            });
        }
        let with_config_drive = self.config_drive_required(instance)?;

        // Nothing exists yet; a builder failure leaves no state behind.
        let profile = self
            .build_profile(instance, network_info, block_device_info)
            .await?;

        info!("Spawning container");
        let spawned = self
            .spawn_steps(
                ctx,
                instance,
                network_info,
                block_device_info,
                admin_password,
                profile,
                with_config_drive,
            )
            .await;

        if let Err(e) = spawned {
            error!(error = %e, "Spawn failed, rolling back");
            self.rollback_spawn(instance, network_info, block_device_info)
                .await;
            return Err(e);
        }
        info!("Container running");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_steps(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
        admin_password: Option<&str>,
        mut profile: Profile,
        with_config_drive: bool,
    ) -> Result<()> {
        let name = instance.name.as_str();
        let paths = InstancePaths::new(&self.config, name);
        tokio::fs::create_dir_all(paths.instance_dir())
            .await
            .map_err(|e| DriverError::io(name, e))?;

        self.ensure_image(ctx, instance).await?;

        let await_plugging = self.config.vif_plugging_timeout > 0 && !network_info.is_empty();
        if await_plugging {
            self.plug_vifs_awaiting_events(instance, network_info)
                .await?;
        }

        info!("Creating profile");
        self.session
            .profile_create(&profile)
            .await
            .map_err(|e| DriverError::remote(name, e))?;

        info!(image = %instance.image_ref, "Creating container");
        let source = ContainerSource::Image {
            alias: instance.image_ref.clone(),
        };
        let handle = self
            .session
            .container_init(&ContainerConfig::new(name, source))
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        self.tracker
            .wait_for_success(name, &handle, self.op_timeout())
            .await?;

        if !await_plugging {
            self.plug_vifs(instance, network_info).await?;
        }

        for ephemeral in &block_device_info.ephemerals {
            tokio::fs::create_dir_all(paths.ephemeral(&ephemeral.virtual_name))
                .await
                .map_err(|e| DriverError::io(name, e))?;
        }

        if with_config_drive {
            self.attach_config_drive(ctx, instance, admin_password, network_info, &mut profile)
                .await?;
        }

        self.prepare_filters(instance, network_info).await?;
        self.start_filtered(instance, network_info).await
    }

    /// Undo a partial spawn: the container goes first so the profile is no
    /// longer in use when cleanup deletes it.
    pub(crate) async fn rollback_spawn(
        &self,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
    ) {
        if let Err(e) = self.remove_container(&instance.name).await {
            warn!(instance = %instance.name, error = %e, "Failed to remove container during rollback");
        }
        if let Err(e) = self.cleanup(instance, network_info, block_device_info).await {
            warn!(instance = %instance.name, error = %e, "Cleanup after failed spawn did not complete");
        }
    }

    /// Stop (if needed) and delete the container. A missing container is fine.
    pub(crate) async fn remove_container(&self, name: &str) -> Result<()> {
        let state = match self.session.container_state(name).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                info!(instance = %name, "Container already gone");
                return Ok(());
            }
            Err(e) => return Err(DriverError::remote(name, e)),
        };

        if !state.is_stopped() {
            info!(instance = %name, status = %state.status, "Stopping container");
            let change = StateChange::new(StateAction::Stop, self.config.operation_timeout as i64);
            match self.session.container_update_state(name, &change).await {
                Ok(handle) => {
                    self.tracker
                        .wait_allow_gone(name, &handle, self.op_timeout())
                        .await?
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(DriverError::remote(name, e)),
            }
        }

        info!(instance = %name, "Deleting container");
        match self.session.container_delete(name).await {
            Ok(handle) => {
                self.tracker
                    .wait_allow_gone(name, &handle, self.op_timeout())
                    .await
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(DriverError::remote(name, e)),
        }
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn destroy(
        &self,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
    ) -> Result<()> {
        info!("Destroying instance");
        let removed = self.remove_container(&instance.name).await;
        let cleaned = self
            .cleanup(instance, network_info, block_device_info)
            .await;

        match (removed, cleaned) {
            (Err(e), cleaned) => {
                if let Err(cleanup_err) = cleaned {
                    warn!(error = %cleanup_err, "Cleanup after failed destroy did not complete");
                }
                error!(error = %e, "Destroy failed");
                Err(e)
            }
            (Ok(()), cleaned) => cleaned,
        }
    }

    /// Release everything host-side for `instance`. Safe to repeat. Collaborator
    /// failures are logged; the first remote or filesystem failure is returned
    /// after every step has been attempted.
    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn cleanup(
        &self,
        instance: &Instance,
        network_info: &[Vif],
        block_device_info: &BlockDeviceInfo,
    ) -> Result<()> {
        let name = instance.name.as_str();
        let paths = InstancePaths::new(&self.config, name);
        let mut first_error: Option<DriverError> = None;

        self.unplug_vifs(instance, network_info).await;
        if let Err(e) = self
            .collaborators
            .firewall
            .unfilter_instance(instance, network_info)
            .await
        {
            warn!(error = %e, "Failed to remove firewall rules");
        }

        for ephemeral in &block_device_info.ephemerals {
            if let Err(e) = remove_tree(&paths.ephemeral(&ephemeral.virtual_name)).await {
                warn!(disk = %ephemeral.virtual_name, error = %e, "Failed to remove ephemeral storage");
                first_error.get_or_insert(DriverError::io(name, e));
            }
        }

        let instance_dir = paths.instance_dir();
        if tokio::fs::try_exists(&instance_dir).await.unwrap_or(false) {
            normalize_ownership(instance_dir.clone()).await;
            if let Err(e) = remove_tree(&instance_dir).await {
                warn!(path = %instance_dir.display(), error = %e, "Failed to remove instance directory");
                first_error.get_or_insert(DriverError::io(name, e));
            }
        }

        match self.session.profile_delete(name).await {
            Ok(()) => debug!("Profile deleted"),
            Err(e) if e.is_not_found() => debug!("Profile already gone"),
            Err(e) => {
                warn!(error = %e, "Failed to delete profile");
                first_error.get_or_insert(DriverError::remote(name, e));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn reboot(&self, instance: &Instance) -> Result<()> {
        info!("Rebooting container");
        self.change_state(&instance.name, StateAction::Restart).await
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn power_off(&self, instance: &Instance) -> Result<()> {
        let state = self
            .session
            .container_state(&instance.name)
            .await
            .map_err(|e| DriverError::remote(&instance.name, e))?;
        if state.is_stopped() {
            debug!("Container already stopped");
            return Ok(());
        }
        info!("Powering off container");
        self.change_state(&instance.name, StateAction::Stop).await
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn power_on(&self, instance: &Instance) -> Result<()> {
        let state = self
            .session
            .container_state(&instance.name)
            .await
            .map_err(|e| DriverError::remote(&instance.name, e))?;
        if state.is_running() {
            debug!("Container already running");
            return Ok(());
        }
        info!("Powering on container");
        self.change_state(&instance.name, StateAction::Start).await
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn pause(&self, instance: &Instance) -> Result<()> {
        info!("Freezing container");
        self.change_state(&instance.name, StateAction::Freeze).await
    }

    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn unpause(&self, instance: &Instance) -> Result<()> {
        info!("Unfreezing container");
        self.change_state(&instance.name, StateAction::Unfreeze)
            .await
    }

    /// Same as [`pause`](Self::pause); there is no suspend-to-disk.
    pub async fn suspend(&self, instance: &Instance) -> Result<()> {
        self.pause(instance).await
    }

    pub async fn resume(&self, instance: &Instance) -> Result<()> {
        self.unpause(instance).await
    }

    pub async fn get_info(&self, instance: &Instance) -> Result<InstanceInfo> {
        let state = self
            .session
            .container_state(&instance.name)
            .await
            .map_err(|e| DriverError::remote(&instance.name, e))?;
        let power = match state.status_code {
            status::RUNNING => PowerState::Running,
            status::FROZEN => PowerState::Paused,
            status::STOPPED => PowerState::Shutdown,
            status::ERROR => PowerState::Crashed,
            _ => PowerState::NoState,
        };
        Ok(InstanceInfo {
            state: power,
            max_mem_kb: instance.memory_mb.max(0).saturating_mul(1024),
            num_cpu: instance.vcpus.max(0),
        })
    }
}

async fn remove_tree(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Hand every entry under `root` back to the driver's own uid/gid so the tree
/// can be removed after the container's id map has shifted ownership.
async fn normalize_ownership(root: PathBuf) {
    let outcome = tokio::task::spawn_blocking(move || {
        // SAFETY: getuid/getgid have no preconditions.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        chown_tree(&root, uid, gid);
    })
    .await;
    if let Err(e) = outcome {
        warn!(error = %e, "Ownership normalization task failed");
    }
}

fn chown_tree(path: &Path, uid: libc::uid_t, gid: libc::gid_t) {
    use std::os::unix::ffi::OsStrExt;

    if let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) {
        // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
        let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
        if rc != 0 {
            debug!(path = %path.display(), error = %std::io::Error::last_os_error(), "lchown failed");
        }
    }

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            chown_tree(&entry.path(), uid, gid);
        }
    }
}
