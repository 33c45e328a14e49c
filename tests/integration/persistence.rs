//! Shutdown snapshots and resumption.

use tempfile::TempDir;

use conductor::core::task::{StatusKind, TaskId, TaskSpec};
use conductor::state::Snapshot;
use conductor::Error;

use crate::fixtures::{test_config, RuntimeHarness, SchedulerHarness};

/// Test: Resume after shutdown
/// Given a runtime with no agents and two dependent tasks
/// When it shuts down and a new runtime restores the snapshot with an agent
/// Then both tasks run to completion in dependency order
#[tokio::test]
async fn test_shutdown_then_resume_runs_pending_work() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("conductor.json");
    let mut config = test_config();
    config.runtime.state_path = Some(path.to_string_lossy().to_string());

    let first = RuntimeHarness::new(config.clone());
    let t1 = TaskId::new();
    let t2 = TaskId::new();
    first
        .handle
        .submit_batch(vec![
            TaskSpec::new("schema").with_id(t1),
            TaskSpec::new("migrate").with_id(t2).depends_on(t1),
        ])
        .await
        .unwrap();
    let snapshot = first.handle.shutdown().await.unwrap();
    assert_eq!(snapshot.unfinished().count(), 2);

    let saved = Snapshot::load(&path).await.unwrap().expect("snapshot written");
    assert_eq!(saved.tasks.len(), 2);

    let mut second = RuntimeHarness::new(config);
    second.agent("worker", 1).await;
    assert_eq!(second.handle.restore(saved).await.unwrap(), 2);

    second.wait_named(t1, "task:completed").await;
    second.wait_named(t2, "task:completed").await;
    let titles: Vec<String> = second
        .executor
        .calls()
        .into_iter()
        .map(|(title, _)| title)
        .collect();
    assert_eq!(titles, vec!["schema", "migrate"]);
}

/// Test: In-flight work returns to pending on restore
#[test]
fn test_restore_resets_in_flight_tasks() {
    let mut before = SchedulerHarness::new(test_config());
    let agent = before.agent("worker", 2);
    let done = before.submit(TaskSpec::new("done"));
    let running = before.submit(TaskSpec::new("running"));
    let dispatched = before.dispatched();
    before.complete(&dispatched[0]);
    before.start(&dispatched[1]);
    assert_eq!(before.status(&done), StatusKind::Completed);
    assert_eq!(before.status(&running), StatusKind::InProgress);

    let snapshot = before.sched.snapshot();
    assert_eq!(snapshot.unfinished().count(), 1);

    let mut after = SchedulerHarness::new(test_config());
    assert_eq!(after.sched.restore(snapshot).unwrap(), 1);
    assert_eq!(after.status(&done), StatusKind::Completed);

    // The restored agent is idle again and picks the task up on restore
    let redispatch = after.next();
    assert_eq!((redispatch.task, redispatch.agent), (running, agent));
    assert_eq!(after.status(&running), StatusKind::Assigned);
    after.complete(&redispatch);
    assert_eq!(after.status(&running), StatusKind::Completed);
}

/// Test: Restoring over existing tasks is refused
#[test]
fn test_restore_rejects_duplicate_tasks() {
    let mut h = SchedulerHarness::new(test_config());
    h.submit(TaskSpec::new("already here"));
    let snapshot = h.sched.snapshot();
    assert!(matches!(
        h.sched.restore(snapshot),
        Err(Error::TaskExists(_))
    ));
}

/// Test: Missing snapshot file is not an error
#[tokio::test]
async fn test_load_missing_snapshot() {
    let dir = TempDir::new().unwrap();
    let loaded = Snapshot::load(&dir.path().join("absent.json")).await.unwrap();
    assert!(loaded.is_none());
}
