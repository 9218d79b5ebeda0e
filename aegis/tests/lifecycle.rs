//! Idle policy, exec streaming and wake behavior against the fake backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aegis::types::InstanceState;
use aegis::vmm::fake::FakeVmm;

use common::{spec, TestDaemon};

#[tokio::test(start_paused = true)]
async fn idle_running_instance_pauses() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();

    daemon.manager.start(&id).await.unwrap();
    assert_eq!(daemon.manager.get(&id).unwrap().state, InstanceState::Running);

    // Fixture pause threshold is 500 ms of inactivity.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(daemon.manager.get(&id).unwrap().state, InstanceState::Paused);

    // Persistent pause (fake backend default): no stop timer, ever.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(daemon.manager.get(&id).unwrap().state, InstanceState::Paused);
}

#[tokio::test(start_paused = true)]
async fn paused_instance_stops_without_persistent_pause() {
    let daemon = TestDaemon::with_driver(Arc::new(FakeVmm::without_persistent_pause())).await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();

    daemon.manager.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(daemon.manager.get(&id).unwrap().state, InstanceState::Paused);

    // Fixture stop threshold is 800 ms in paused.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let record = daemon.manager.get(&id).unwrap();
    assert_eq!(record.state, InstanceState::Stopped);
    assert!(record.vm_handle.is_none());
    assert!(record.endpoints.is_empty());
}

#[tokio::test(start_paused = true)]
async fn resume_rearms_the_idle_timer() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();

    daemon.manager.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(daemon.manager.get(&id).unwrap().state, InstanceState::Paused);

    let resumed = daemon.manager.resume(&id).await.unwrap();
    assert_eq!(resumed.state, InstanceState::Running);

    // It pauses again after another idle window.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(daemon.manager.get(&id).unwrap().state, InstanceState::Paused);
}

#[tokio::test(start_paused = true)]
async fn wake_starts_enabled_stopped_instances() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();

    let woken = daemon.manager.wake(&id).await.unwrap();
    assert_eq!(woken.state, InstanceState::Running);

    // Disabled instances never wake.
    daemon.manager.disable(&id).await.unwrap();
    let err = daemon.manager.wake(&id).await.unwrap_err();
    assert!(err.to_string().contains("state conflict"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_streams_output_then_exit() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();
    daemon.manager.start(&id).await.unwrap();

    let mut rx = daemon
        .manager
        .exec(&id, vec!["hello".into(), "world".into()], false)
        .await
        .unwrap();

    let mut lines = Vec::new();
    while let Some(value) = rx.recv().await {
        let done = value.get("done").is_some();
        lines.push(value);
        if done {
            break;
        }
    }

    assert_eq!(lines.len(), 3, "two output frames and one exit: {lines:?}");
    assert_eq!(lines[0]["data"], "hello\n");
    assert_eq!(lines[1]["data"], "world\n");
    assert_eq!(lines[2]["done"], true);
    assert_eq!(lines[2]["exit_code"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_on_stopped_is_not_running() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();

    let err = daemon
        .manager
        .exec(record.id.as_str(), vec!["true".into()], true)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not_running"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn exec_auto_wakes_paused_instances() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();
    daemon.manager.start(&id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(daemon.manager.get(&id).unwrap().state, InstanceState::Paused);

    let mut rx = daemon
        .manager
        .exec(&id, vec!["ping".into()], true)
        .await
        .unwrap();
    // During the exec the instance was woken back to running.
    assert_eq!(daemon.manager.get(&id).unwrap().state, InstanceState::Running);

    let mut saw_exit = false;
    while let Some(value) = rx.recv().await {
        if value.get("done").is_some() {
            saw_exit = true;
            break;
        }
    }
    assert!(saw_exit);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_failure_rolls_back_to_failed() {
    let driver = Arc::new(FakeVmm::new());
    driver
        .fail_start
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let daemon = TestDaemon::with_driver(driver.clone()).await;

    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();

    let err = daemon.manager.start(&id).await.unwrap_err();
    assert!(err.to_string().contains("simulated boot failure"), "{err}");

    let record = daemon.manager.get(&id).unwrap();
    assert_eq!(record.state, InstanceState::Failed);
    assert!(record.vm_handle.is_none());
    record.check_invariants().unwrap();

    // Operator retry succeeds once the backend recovers.
    driver
        .fail_start
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let record = daemon.manager.start(&id).await.unwrap();
    assert_eq!(record.state, InstanceState::Running);
}
