//! In-memory hypervisor and recording collaborators for tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lxd_common::{
    CollaboratorError, ConfigDriveBuilder, FirewallDriver, ImageMeta, ImageStore, ImageUpdate,
    Instance, RequestContext, StorageConnector, Vif, VifDetails, VifDriver, VifNetwork, VirtApi,
    VolumeConnection, VolumeDevice,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::{DriverConfig, PollConfig};
use crate::driver::{Collaborators, LxdDriver};
use crate::profile::Profile;
use crate::session::{
    status, ContainerConfig, ContainerSource, ContainerState, HostEnvironment, HostInfo,
    ImageUpload, MigrationSource, OperationHandle, OperationMetadata, OperationStatus,
    RemoteError, RemoteResult, Session, StateAction, StateChange,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub state: ContainerState,
    pub profiles: Vec<String>,
    pub source: ContainerSource,
}

#[derive(Default)]
struct Hypervisor {
    host: HostInfo,
    containers: BTreeMap<String, FakeContainer>,
    profiles: BTreeMap<String, Profile>,
    images: BTreeMap<String, Vec<u8>>,
    aliases: BTreeMap<String, String>,
    operations: HashMap<String, OperationStatus>,
    calls: Vec<String>,
    fail_next: HashMap<String, RemoteError>,
    fail_operation: HashMap<String, String>,
}

/// A hypervisor that applies every request immediately and records it.
///
/// Async endpoints register an already-finished operation, so the tracker
/// resolves them on the first query.
pub struct FakeSession {
    inner: Mutex<Hypervisor>,
    uploads: AtomicUsize,
    operation_queries: AtomicUsize,
    upload_delay: Mutex<Duration>,
    publish_delay: Mutex<Duration>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSession {
    pub fn new() -> Self {
        let host = HostInfo {
            api_extensions: vec!["id_map".to_string()],
            environment: HostEnvironment {
                storage: "zfs".to_string(),
                server_version: "2.0.11".to_string(),
            },
        };
        Self {
            inner: Mutex::new(Hypervisor {
                host,
                ..Default::default()
            }),
            uploads: AtomicUsize::new(0),
            operation_queries: AtomicUsize::new(0),
            upload_delay: Mutex::new(Duration::ZERO),
            publish_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_host(&self, host: HostInfo) {
        guard(&self.inner).host = host;
    }

    /// The next call to `method` returns `err` without touching any state.
    pub fn fail_next(&self, method: &str, err: RemoteError) {
        guard(&self.inner).fail_next.insert(method.to_string(), err);
    }

    /// The next call to `method` is accepted but its operation fails with `message`.
    pub fn fail_operation(&self, method: &str, message: &str) {
        guard(&self.inner)
            .fail_operation
            .insert(method.to_string(), message.to_string());
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *guard(&self.upload_delay) = delay;
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *guard(&self.publish_delay) = delay;
    }

    /// Register an operation that reports `reading` on every query.
    pub fn push_operation(&self, reading: OperationStatus) -> OperationHandle {
        let id = uuid::Uuid::new_v4().to_string();
        guard(&self.inner).operations.insert(id.clone(), reading);
        OperationHandle {
            id,
            status_code: 100,
        }
    }

    pub fn insert_container(&self, name: &str, state: ContainerState) {
        guard(&self.inner).containers.insert(
            name.to_string(),
            FakeContainer {
                state,
                profiles: vec![name.to_string()],
                source: ContainerSource::Image {
                    alias: "preexisting".to_string(),
                },
            },
        );
    }

    pub fn insert_alias(&self, alias: &str, fingerprint: &str) {
        let mut hv = guard(&self.inner);
        hv.images.insert(fingerprint.to_string(), Vec::new());
        hv.aliases
            .insert(alias.to_string(), fingerprint.to_string());
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        guard(&self.inner).containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        guard(&self.inner).containers.keys().cloned().collect()
    }

    pub fn profile(&self, name: &str) -> Option<Profile> {
        guard(&self.inner).profiles.get(name).cloned()
    }

    pub fn profile_names(&self) -> Vec<String> {
        guard(&self.inner).profiles.keys().cloned().collect()
    }

    pub fn alias(&self, alias: &str) -> Option<String> {
        guard(&self.inner).aliases.get(alias).cloned()
    }

    pub fn image_fingerprints(&self) -> Vec<String> {
        guard(&self.inner).images.keys().cloned().collect()
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn operation_queries(&self) -> usize {
        self.operation_queries.load(Ordering::SeqCst)
    }

    /// Every request so far as `"<method> <subject>"`.
    pub fn calls(&self) -> Vec<String> {
        guard(&self.inner).calls.clone()
    }

    pub fn count_calls(&self, method: &str) -> usize {
        let prefix = format!("{method} ");
        guard(&self.inner)
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn begin(&self, method: &str, subject: &str) -> RemoteResult<()> {
        let mut hv = guard(&self.inner);
        hv.calls.push(format!("{method} {subject}"));
        match hv.fail_next.remove(method) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Register a finished operation: success carrying `metadata`, or failure.
    fn finish(&self, outcome: Result<Value, String>) -> OperationHandle {
        let metadata = match outcome {
            Ok(metadata) => OperationMetadata {
                status: "Success".to_string(),
                status_code: status::SUCCESS,
                metadata,
                ..Default::default()
            },
            Err(message) => OperationMetadata {
                status: "Failure".to_string(),
                status_code: status::FAILURE,
                err: message,
                ..Default::default()
            },
        };
        self.push_operation(OperationStatus {
            status_code: status::SUCCESS,
            metadata,
        })
    }

    /// A failed operation for `method` if one was queued with [`fail_operation`](Self::fail_operation).
    fn queued_failure(&self, method: &str) -> Option<OperationHandle> {
        let message = guard(&self.inner).fail_operation.remove(method)?;
        Some(self.finish(Err(message)))
    }

    fn profile_in_use(hv: &Hypervisor, profile: &str) -> bool {
        hv.containers
            .values()
            .any(|c| c.profiles.iter().any(|p| p == profile))
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn host_info(&self) -> RemoteResult<HostInfo> {
        self.begin("host_info", "/")?;
        Ok(guard(&self.inner).host.clone())
    }

    async fn container_list(&self) -> RemoteResult<Vec<String>> {
        self.begin("container_list", "/")?;
        Ok(self.container_names())
    }

    async fn container_state(&self, name: &str) -> RemoteResult<ContainerState> {
        self.begin("container_state", name)?;
        guard(&self.inner)
            .containers
            .get(name)
            .map(|c| c.state.clone())
            .ok_or_else(|| RemoteError::not_found(format!("container {name}")))
    }

    async fn container_init(&self, config: &ContainerConfig) -> RemoteResult<OperationHandle> {
        self.begin("container_init", &config.name)?;
        if let Some(failed) = self.queued_failure("container_init") {
            return Ok(failed);
        }
        let outcome = {
            let mut hv = guard(&self.inner);
            let missing_profile = config
                .profiles
                .iter()
                .find(|p| !hv.profiles.contains_key(*p))
                .cloned();
            let checked: Result<(), String> = if hv.containers.contains_key(&config.name) {
                Err(format!("container {} already exists", config.name))
            } else if let Some(missing) = missing_profile {
                Err(format!("profile {missing} not found"))
            } else {
                match &config.source {
                    ContainerSource::Image { alias } if !hv.aliases.contains_key(alias) => {
                        Err(format!("image {alias} not found"))
                    }
                    _ => Ok(()),
                }
            };
            checked.map(|()| {
                hv.containers.insert(
                    config.name.clone(),
                    FakeContainer {
                        state: ContainerState::stopped(),
                        profiles: config.profiles.clone(),
                        source: config.source.clone(),
                    },
                );
                Value::Null
            })
        };
        Ok(self.finish(outcome))
    }

    async fn container_update_state(
        &self,
        name: &str,
        change: &StateChange,
    ) -> RemoteResult<OperationHandle> {
        self.begin("container_update_state", &format!("{name} {:?}", change.action))?;
        let method = format!("container_update_state_{:?}", change.action).to_lowercase();
        if let Some(failed) = self.queued_failure(&method) {
            return Ok(failed);
        }
        let outcome = {
            let mut hv = guard(&self.inner);
            let container = hv
                .containers
                .get_mut(name)
                .ok_or_else(|| RemoteError::not_found(format!("container {name}")))?;
            let current = container.state.clone();
            let next = match change.action {
                StateAction::Start if current.is_running() => {
                    Err("container is already running".to_string())
                }
                StateAction::Start => Ok(ContainerState::running()),
                StateAction::Stop if current.is_stopped() => {
                    Err("container is already stopped".to_string())
                }
                StateAction::Stop => Ok(ContainerState::stopped()),
                StateAction::Restart => Ok(ContainerState::running()),
                StateAction::Freeze if current.is_running() => Ok(ContainerState::frozen()),
                StateAction::Freeze => Err("container is not running".to_string()),
                StateAction::Unfreeze if current.is_frozen() => Ok(ContainerState::running()),
                StateAction::Unfreeze => Err("container is not frozen".to_string()),
            };
            next.map(|next| {
                container.state = next;
                Value::Null
            })
        };
        Ok(self.finish(outcome))
    }

    async fn container_delete(&self, name: &str) -> RemoteResult<OperationHandle> {
        self.begin("container_delete", name)?;
        if let Some(failed) = self.queued_failure("container_delete") {
            return Ok(failed);
        }
        let outcome = {
            let mut hv = guard(&self.inner);
            match hv.containers.get(name) {
                None => return Err(RemoteError::not_found(format!("container {name}"))),
                Some(c) if !c.state.is_stopped() => {
                    Err("container is running".to_string())
                }
                Some(_) => {
                    hv.containers.remove(name);
                    Ok(Value::Null)
                }
            }
        };
        Ok(self.finish(outcome))
    }

    async fn container_rename(&self, name: &str, new_name: &str) -> RemoteResult<OperationHandle> {
        self.begin("container_rename", &format!("{name} {new_name}"))?;
        if let Some(failed) = self.queued_failure("container_rename") {
            return Ok(failed);
        }
        let outcome = {
            let mut hv = guard(&self.inner);
            if hv.containers.contains_key(new_name) {
                Err(format!("container {new_name} already exists"))
            } else {
                match hv.containers.remove(name) {
                    None => return Err(RemoteError::not_found(format!("container {name}"))),
                    Some(c) if !c.state.is_stopped() => {
                        hv.containers.insert(name.to_string(), c);
                        Err("renaming of running container not allowed".to_string())
                    }
                    Some(c) => {
                        hv.containers.insert(new_name.to_string(), c);
                        Ok(Value::Null)
                    }
                }
            }
        };
        Ok(self.finish(outcome))
    }

    async fn container_publish(&self, name: &str) -> RemoteResult<OperationHandle> {
        self.begin("container_publish", name)?;
        if let Some(failed) = self.queued_failure("container_publish") {
            return Ok(failed);
        }
        let delay = *guard(&self.publish_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = {
            let mut hv = guard(&self.inner);
            match hv.containers.get(name) {
                None => return Err(RemoteError::not_found(format!("container {name}"))),
                Some(c) if !c.state.is_stopped() => {
                    Err("container must be stopped to publish".to_string())
                }
                Some(_) => {
                    let data = format!("published-{name}-{}", hv.images.len()).into_bytes();
                    let fingerprint = format!("{:x}", Sha256::digest(&data));
                    hv.images.insert(fingerprint.clone(), data);
                    Ok(json!({ "fingerprint": fingerprint }))
                }
            }
        };
        Ok(self.finish(outcome))
    }

    async fn container_migration_source(&self, name: &str) -> RemoteResult<MigrationSource> {
        self.begin("container_migration_source", name)?;
        if !guard(&self.inner).containers.contains_key(name) {
            return Err(RemoteError::not_found(format!("container {name}")));
        }
        let id = uuid::Uuid::new_v4();
        Ok(MigrationSource {
            operation: format!("https://source:8443/1.0/operations/{id}"),
            secrets: BTreeMap::from([
                ("control".to_string(), "control-secret".to_string()),
                ("fs".to_string(), "fs-secret".to_string()),
            ]),
        })
    }

    async fn profile_get(&self, name: &str) -> RemoteResult<Profile> {
        self.begin("profile_get", name)?;
        guard(&self.inner)
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("profile {name}")))
    }

    async fn profile_create(&self, profile: &Profile) -> RemoteResult<()> {
        self.begin("profile_create", &profile.name)?;
        let mut hv = guard(&self.inner);
        if hv.profiles.contains_key(&profile.name) {
            return Err(RemoteError::Api {
                status: 409,
                message: format!("profile {} already exists", profile.name),
            });
        }
        hv.profiles.insert(profile.name.clone(), profile.clone());
        Ok(())
    }

    async fn profile_update(&self, profile: &Profile) -> RemoteResult<()> {
        self.begin("profile_update", &profile.name)?;
        let mut hv = guard(&self.inner);
        match hv.profiles.get_mut(&profile.name) {
            Some(existing) => {
                *existing = profile.clone();
                Ok(())
            }
            None => Err(RemoteError::not_found(format!("profile {}", profile.name))),
        }
    }

    async fn profile_delete(&self, name: &str) -> RemoteResult<()> {
        self.begin("profile_delete", name)?;
        let mut hv = guard(&self.inner);
        if !hv.profiles.contains_key(name) {
            return Err(RemoteError::not_found(format!("profile {name}")));
        }
        if Self::profile_in_use(&hv, name) {
            return Err(RemoteError::Api {
                status: 400,
                message: format!("profile {name} is currently in use"),
            });
        }
        hv.profiles.remove(name);
        Ok(())
    }

    async fn image_alias_get(&self, alias: &str) -> RemoteResult<String> {
        self.begin("image_alias_get", alias)?;
        guard(&self.inner)
            .aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("image alias {alias}")))
    }

    async fn image_alias_create(&self, alias: &str, fingerprint: &str) -> RemoteResult<()> {
        self.begin("image_alias_create", alias)?;
        let mut hv = guard(&self.inner);
        if hv.aliases.contains_key(alias) {
            return Err(RemoteError::Api {
                status: 409,
                message: format!("alias {alias} already exists"),
            });
        }
        hv.aliases
            .insert(alias.to_string(), fingerprint.to_string());
        Ok(())
    }

    async fn image_upload(&self, upload: ImageUpload) -> RemoteResult<OperationHandle> {
        self.begin("image_upload", &upload.fingerprint)?;
        if let Some(failed) = self.queued_failure("image_upload") {
            return Ok(failed);
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let delay = *guard(&self.upload_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut data = upload.manifest;
        data.extend_from_slice(&upload.rootfs);
        guard(&self.inner)
            .images
            .insert(upload.fingerprint.clone(), data);
        Ok(self.finish(Ok(json!({ "fingerprint": upload.fingerprint }))))
    }

    async fn image_export(&self, fingerprint: &str) -> RemoteResult<Vec<u8>> {
        self.begin("image_export", fingerprint)?;
        guard(&self.inner)
            .images
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("image {fingerprint}")))
    }

    async fn image_delete(&self, fingerprint: &str) -> RemoteResult<OperationHandle> {
        self.begin("image_delete", fingerprint)?;
        if guard(&self.inner).images.remove(fingerprint).is_none() {
            return Err(RemoteError::not_found(format!("image {fingerprint}")));
        }
        Ok(self.finish(Ok(Value::Null)))
    }

    async fn operation_wait(&self, id: &str, _timeout: Duration) -> RemoteResult<OperationStatus> {
        self.operation_queries.fetch_add(1, Ordering::SeqCst);
        self.begin("operation_wait", id)?;
        guard(&self.inner)
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("operation {id}")))
    }
}

// --- Collaborators ---

/// Image store backed by a directory; downloads materialize small rootfs files.
pub struct FakeImageStore {
    root: PathBuf,
    downloads: AtomicUsize,
    updates: Mutex<Vec<(String, ImageUpdate, Vec<u8>)>>,
}

impl FakeImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            downloads: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<(String, ImageUpdate, Vec<u8>)> {
        guard(&self.updates).clone()
    }
}

#[async_trait]
impl ImageStore for FakeImageStore {
    async fn download(&self, _ctx: &RequestContext, image_ref: &str) -> lxd_common::Result<PathBuf> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(format!("{}.rootfs", image_ref.replace('/', "_")));
        tokio::fs::write(&path, format!("rootfs of {image_ref}")).await?;
        Ok(path)
    }

    async fn get(&self, _ctx: &RequestContext, image_id: &str) -> lxd_common::Result<ImageMeta> {
        Ok(ImageMeta {
            id: image_id.to_string(),
            name: format!("snapshot-{image_id}"),
        })
    }

    async fn update(
        &self,
        _ctx: &RequestContext,
        image_id: &str,
        metadata: ImageUpdate,
        data: Vec<u8>,
    ) -> lxd_common::Result<()> {
        guard(&self.updates).push((image_id.to_string(), metadata, data));
        Ok(())
    }
}

/// Shared event log for collaborators whose ordering matters.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        guard(&self.0).push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        guard(&self.0).clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        guard(&self.0).iter().any(|e| e == event)
    }
}

pub struct RecordingVifDriver {
    pub log: EventLog,
    fail_plug: Mutex<bool>,
}

impl RecordingVifDriver {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_plug: Mutex::new(false),
        }
    }

    pub fn fail_plugging(&self) {
        *guard(&self.fail_plug) = true;
    }
}

#[async_trait]
impl VifDriver for RecordingVifDriver {
    async fn plug(&self, _instance: &Instance, vif: &Vif) -> lxd_common::Result<()> {
        if *guard(&self.fail_plug) {
            return Err(CollaboratorError::Network(format!("cannot plug {}", vif.id)));
        }
        self.log.push(format!("plug {}", vif.id));
        Ok(())
    }

    async fn unplug(&self, _instance: &Instance, vif: &Vif) -> lxd_common::Result<()> {
        self.log.push(format!("unplug {}", vif.id));
        Ok(())
    }
}

pub struct RecordingFirewall {
    pub log: EventLog,
}

#[async_trait]
impl FirewallDriver for RecordingFirewall {
    async fn setup_basic_filtering(&self, instance: &Instance, _network_info: &[Vif]) -> lxd_common::Result<()> {
        self.log.push(format!("setup {}", instance.name));
        Ok(())
    }

    async fn prepare_instance_filter(&self, instance: &Instance, _network_info: &[Vif]) -> lxd_common::Result<()> {
        self.log.push(format!("prepare {}", instance.name));
        Ok(())
    }

    async fn apply_instance_filter(&self, instance: &Instance, _network_info: &[Vif]) -> lxd_common::Result<()> {
        self.log.push(format!("apply {}", instance.name));
        Ok(())
    }

    async fn unfilter_instance(&self, instance: &Instance, _network_info: &[Vif]) -> lxd_common::Result<()> {
        self.log.push(format!("unfilter {}", instance.name));
        Ok(())
    }
}

pub struct FakeStorageConnector {
    pub log: EventLog,
}

#[async_trait]
impl StorageConnector for FakeStorageConnector {
    async fn connect_volume(&self, connection: &VolumeConnection) -> lxd_common::Result<VolumeDevice> {
        self.log.push(format!("connect {}", connection.volume_id));
        Ok(VolumeDevice {
            path: PathBuf::from(format!("/dev/disk/by-id/{}", connection.volume_id)),
        })
    }

    async fn disconnect_volume(&self, connection: &VolumeConnection) -> lxd_common::Result<()> {
        self.log.push(format!("disconnect {}", connection.volume_id));
        Ok(())
    }
}

/// Writes a minimal metadata tree into the target directory.
pub struct FakeConfigDrive;

#[async_trait]
impl ConfigDriveBuilder for FakeConfigDrive {
    async fn make_drive(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
        admin_password: Option<&str>,
        _network_info: &[Vif],
        target: &Path,
    ) -> lxd_common::Result<()> {
        let dir = target.join("openstack/latest");
        tokio::fs::create_dir_all(&dir).await?;
        let meta = json!({
            "uuid": instance.id,
            "name": instance.name,
            "admin_pass": admin_password,
        });
        tokio::fs::write(dir.join("meta_data.json"), meta.to_string()).await?;
        Ok(())
    }
}

/// Reports every VIF as plugged straight away.
pub struct ImmediateVirtApi;

#[async_trait]
impl VirtApi for ImmediateVirtApi {
    async fn wait_for_vif_plugged(
        &self,
        _instance: &Instance,
        _vif_ids: &[String],
        _timeout: Duration,
    ) -> lxd_common::Result<()> {
        Ok(())
    }
}

// --- Fixtures ---

pub fn instance(name: &str) -> Instance {
    Instance {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        memory_mb: 512,
        vcpus: 1,
        root_gb: 10,
        ephemeral_gb: 0,
        image_ref: "ubuntu-22.04".to_string(),
        extra_specs: BTreeMap::new(),
        config_drive: false,
    }
}

pub fn bridge_vif(id: &str, bridge: &str) -> Vif {
    Vif {
        id: id.to_string(),
        address: "fa:16:3e:12:34:56".to_string(),
        vif_type: "bridge".to_string(),
        network: VifNetwork {
            bridge: Some(bridge.to_string()),
        },
        devname: None,
        details: VifDetails::default(),
    }
}

/// A driver wired to a [`FakeSession`] and recording collaborators, rooted in
/// a temporary directory.
pub struct TestHarness {
    pub driver: LxdDriver,
    pub session: Arc<FakeSession>,
    pub images: Arc<FakeImageStore>,
    pub vifs: Arc<RecordingVifDriver>,
    pub log: EventLog,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(|_| {}, Arc::new(ImmediateVirtApi))
    }

    pub fn with_config(adjust: impl FnOnce(&mut DriverConfig)) -> Self {
        Self::build(adjust, Arc::new(ImmediateVirtApi))
    }

    pub fn build(adjust: impl FnOnce(&mut DriverConfig), virtapi: Arc<dyn VirtApi>) -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let mut config = DriverConfig {
            instances_path: dir.path().join("instances"),
            lxd_root_dir: dir.path().join("lxd"),
            host: "compute-1".to_string(),
            operation_timeout: 5,
            vif_plugging_timeout: 5,
            poll: PollConfig {
                poll_slice: Duration::from_millis(200),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
            ..Default::default()
        };
        adjust(&mut config);

        let session = Arc::new(FakeSession::new());
        let images = Arc::new(FakeImageStore::new(dir.path().join("glance")));
        let log = EventLog::default();
        let vifs = Arc::new(RecordingVifDriver::new(log.clone()));
        let collaborators = Collaborators {
            image_store: images.clone(),
            vif_driver: vifs.clone(),
            firewall: Arc::new(RecordingFirewall { log: log.clone() }),
            storage: Arc::new(FakeStorageConnector { log: log.clone() }),
            virtapi,
            config_drive: Some(Arc::new(FakeConfigDrive)),
        };
        let driver = LxdDriver::new(config, session.clone(), collaborators);

        Self {
            driver,
            session,
            images,
            vifs,
            log,
            dir,
        }
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.driver.config().instances_path.join(name)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
