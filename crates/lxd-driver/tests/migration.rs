use lxd_driver::common::{BlockDeviceInfo, Migration, RequestContext};
use lxd_driver::session::{ContainerSource, ContainerState};
use lxd_driver::test_utils::{bridge_vif, instance, FakeSession, TestHarness};
use lxd_driver::DriverError;

fn migration(source: &str, dest: &str) -> Migration {
    Migration {
        source_host: source.to_string(),
        dest_host: dest.to_string(),
    }
}

async fn running(h: &TestHarness, name: &str) {
    h.driver
        .spawn(
            &RequestContext::default(),
            &instance(name),
            &[],
            &BlockDeviceInfo::default(),
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_same_host_resize_refreshes_profile_and_stops() {
    let h = TestHarness::new();
    running(&h, "instance-1").await;

    let mut resized = instance("instance-1");
    resized.memory_mb = 1024;
    resized.vcpus = 2;
    h.driver
        .migrate_disk_and_power_off(&resized, "compute-1", &[], &BlockDeviceInfo::default())
        .await
        .unwrap();

    let profile = h.session.profile("instance-1").unwrap();
    assert_eq!(profile.config["limits.memory"], "1024MB");
    assert_eq!(profile.config["limits.cpu"], "2");
    assert_eq!(h.session.container("instance-1").unwrap().state, ContainerState::stopped());
}

#[tokio::test]
async fn test_remote_migration_only_stops_source() {
    let h = TestHarness::new();
    running(&h, "instance-1").await;

    h.driver
        .migrate_disk_and_power_off(
            &instance("instance-1"),
            "compute-2",
            &[],
            &BlockDeviceInfo::default(),
        )
        .await
        .unwrap();

    assert_eq!(h.session.count_calls("profile_update"), 0);
    assert!(h.session.container("instance-1").unwrap().state.is_stopped());
}

#[tokio::test]
async fn test_power_off_of_stopped_source_is_noop() {
    let h = TestHarness::new();
    h.session.insert_container("instance-1", ContainerState::stopped());

    h.driver
        .migrate_disk_and_power_off(
            &instance("instance-1"),
            "compute-2",
            &[],
            &BlockDeviceInfo::default(),
        )
        .await
        .unwrap();
    assert_eq!(h.session.count_calls("container_update_state"), 0);
}

#[tokio::test]
async fn test_finish_migration_pulls_from_source() {
    let source = FakeSession::new();
    source.insert_container("instance-1", ContainerState::stopped());
    let dest = TestHarness::new();
    let vifs = [bridge_vif("vif-1", "br100")];

    dest.driver
        .finish_migration(
            &migration("compute-0", "compute-1"),
            &instance("instance-1"),
            &vifs,
            &BlockDeviceInfo::default(),
            &source,
            true,
        )
        .await
        .unwrap();

    let container = dest.session.container("instance-1").unwrap();
    assert!(container.state.is_running());
    match container.source {
        ContainerSource::Migration {
            mode,
            operation,
            secrets,
        } => {
            assert_eq!(mode, "pull");
            assert!(operation.starts_with("https://source:8443/1.0/operations/"));
            assert_eq!(secrets["control"], "control-secret");
        }
        other => panic!("expected migration source, got {other:?}"),
    }
    assert!(dest.session.profile("instance-1").is_some());
    assert!(dest.log.contains("plug vif-1"));
    assert!(dest.log.contains("apply instance-1"));
}

#[tokio::test]
async fn test_finish_migration_without_power_on_leaves_stopped() {
    let source = FakeSession::new();
    source.insert_container("instance-1", ContainerState::stopped());
    let dest = TestHarness::new();

    dest.driver
        .finish_migration(
            &migration("compute-0", "compute-1"),
            &instance("instance-1"),
            &[],
            &BlockDeviceInfo::default(),
            &source,
            false,
        )
        .await
        .unwrap();

    assert!(dest.session.container("instance-1").unwrap().state.is_stopped());
}

#[tokio::test]
async fn test_failed_pull_rolls_back_destination() {
    let source = FakeSession::new();
    let dest = TestHarness::new();
    let vifs = [bridge_vif("vif-1", "br100")];

    let err = dest
        .driver
        .finish_migration(
            &migration("compute-0", "compute-1"),
            &instance("instance-1"),
            &vifs,
            &BlockDeviceInfo::default(),
            &source,
            true,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DriverError::NotFound { .. }), "{err}");
    assert!(dest.session.profile_names().is_empty());
    assert!(dest.session.container_names().is_empty());
    assert!(dest.log.contains("unplug vif-1"));
}

#[tokio::test]
async fn test_same_host_finish_powers_on() {
    let h = TestHarness::new();
    h.session.insert_container("instance-1", ContainerState::stopped());
    let unused = FakeSession::new();

    h.driver
        .finish_migration(
            &migration("compute-1", "compute-1"),
            &instance("instance-1"),
            &[],
            &BlockDeviceInfo::default(),
            &unused,
            true,
        )
        .await
        .unwrap();

    assert!(h.session.container("instance-1").unwrap().state.is_running());
    assert!(unused.calls().is_empty());
}

#[tokio::test]
async fn test_confirm_migration_removes_source_container() {
    let h = TestHarness::new();
    running(&h, "instance-1").await;
    let vifs = [bridge_vif("vif-1", "br100")];

    h.driver
        .confirm_migration(&migration("compute-1", "compute-2"), &instance("instance-1"), &vifs)
        .await
        .unwrap();

    assert!(h.session.container_names().is_empty());
    assert!(h.session.profile_names().is_empty());
    assert!(h.log.contains("unplug vif-1"));
}

#[tokio::test]
async fn test_confirm_same_host_migration_keeps_container() {
    let h = TestHarness::new();
    running(&h, "instance-1").await;

    h.driver
        .confirm_migration(&migration("compute-1", "compute-1"), &instance("instance-1"), &[])
        .await
        .unwrap();

    assert_eq!(h.session.container_names(), vec!["instance-1"]);
}

#[tokio::test]
async fn test_finish_revert_migration_restarts_when_asked() {
    let h = TestHarness::new();
    h.session.insert_container("instance-1", ContainerState::stopped());

    h.driver
        .finish_revert_migration(&instance("instance-1"), false)
        .await
        .unwrap();
    assert!(h.session.container("instance-1").unwrap().state.is_stopped());

    h.driver
        .finish_revert_migration(&instance("instance-1"), true)
        .await
        .unwrap();
    assert!(h.session.container("instance-1").unwrap().state.is_running());
}
