use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lxd_driver::common::{
    BlockDeviceInfo, CollaboratorError, Instance, RequestContext, VirtApi,
};
use lxd_driver::test_utils::{bridge_vif, instance, TestHarness};
use lxd_driver::DriverError;
use mockall::mock;

mock! {
    pub Events {}

    #[async_trait]
    impl VirtApi for Events {
        async fn wait_for_vif_plugged(
            &self,
            instance: &Instance,
            vif_ids: &[String],
            timeout: Duration,
        ) -> lxd_common::Result<()>;
    }
}

fn timing_out() -> MockEvents {
    let mut events = MockEvents::new();
    events
        .expect_wait_for_vif_plugged()
        .times(1)
        .returning(|_, _, _| Err(CollaboratorError::EventTimeout("vif-1".to_string())));
    events
}

async fn spawn_with_vif(h: &TestHarness) -> lxd_driver::Result<()> {
    h.driver
        .spawn(
            &RequestContext::default(),
            &instance("instance-1"),
            &[bridge_vif("vif-1", "br100")],
            &BlockDeviceInfo::default(),
            None,
        )
        .await
}

#[tokio::test]
async fn test_waits_for_every_vif_with_configured_timeout() {
    let mut events = MockEvents::new();
    events
        .expect_wait_for_vif_plugged()
        .withf(|instance, ids, timeout| {
            instance.name == "instance-1"
                && ids.len() == 1
                && ids[0] == "vif-1"
                && *timeout == Duration::from_secs(5)
        })
        .times(1)
        .returning(|_, _, _| Ok(()));
    let h = TestHarness::build(|_| {}, Arc::new(events));

    spawn_with_vif(&h).await.unwrap();

    assert!(h.session.container("instance-1").unwrap().state.is_running());
    assert_eq!(
        h.log.events().iter().filter(|e| *e == "plug vif-1").count(),
        1
    );
}

#[tokio::test]
async fn test_fatal_plugging_timeout_rolls_back() {
    let h = TestHarness::build(|_| {}, Arc::new(timing_out()));

    let err = spawn_with_vif(&h).await.unwrap_err();

    assert!(
        matches!(err, DriverError::VirtualInterfaceCreate { ref name } if name == "instance-1"),
        "{err}"
    );
    assert!(h.session.container_names().is_empty());
    assert!(h.session.profile_names().is_empty());
    assert!(h.log.contains("unplug vif-1"));
    assert!(!h.instance_dir("instance-1").exists());
}

#[tokio::test]
async fn test_non_fatal_plugging_timeout_continues() {
    let h = TestHarness::build(|c| c.vif_plugging_is_fatal = false, Arc::new(timing_out()));

    spawn_with_vif(&h).await.unwrap();

    assert!(h.session.container("instance-1").unwrap().state.is_running());
}

#[tokio::test]
async fn test_zero_timeout_skips_event_wait() {
    let mut events = MockEvents::new();
    events.expect_wait_for_vif_plugged().times(0);
    let h = TestHarness::build(|c| c.vif_plugging_timeout = 0, Arc::new(events));

    spawn_with_vif(&h).await.unwrap();

    assert!(h.log.contains("plug vif-1"));
}

#[tokio::test]
async fn test_no_vifs_skips_event_wait() {
    let mut events = MockEvents::new();
    events.expect_wait_for_vif_plugged().times(0);
    let h = TestHarness::build(|_| {}, Arc::new(events));

    h.driver
        .spawn(
            &RequestContext::default(),
            &instance("instance-1"),
            &[],
            &BlockDeviceInfo::default(),
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_other_event_errors_fail_spawn() {
    let mut events = MockEvents::new();
    events
        .expect_wait_for_vif_plugged()
        .returning(|_, _, _| Err(CollaboratorError::Network("neutron unreachable".to_string())));
    let h = TestHarness::build(|c| c.vif_plugging_is_fatal = false, Arc::new(events));

    let err = spawn_with_vif(&h).await.unwrap_err();

    assert!(matches!(err, DriverError::Collaborator { .. }), "{err}");
    assert!(h.session.container_names().is_empty());
}
