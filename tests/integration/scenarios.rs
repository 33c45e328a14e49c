//! Scheduling scenarios: priority, dependencies and capacity bounds.

use conductor::agent::AgentId;
use conductor::core::task::{Priority, StatusKind, TaskId, TaskSpec, TaskStatus, TaskType};
use conductor::events::OrchestratorEvent;
use conductor::orchestration::{CapacityTracker, ReleaseOutcome, ReportKind};
use conductor::Error;

use crate::fixtures::{independent_tasks, test_config, SchedulerHarness};

/// Test: Priority ordering on a single slot
/// Given one single-slot agent busy with a blocker
/// When low, critical, medium and high tasks queue behind it
/// Then they run critical, high, medium, low
#[test]
fn test_priority_order_on_single_slot() {
    let mut h = SchedulerHarness::new(test_config());
    h.agent("solo", 1);
    h.submit(TaskSpec::new("blocker"));
    let blocker = h.next();

    for (title, priority) in [
        ("low", Priority::Low),
        ("critical", Priority::Critical),
        ("medium", Priority::Medium),
        ("high", Priority::High),
    ] {
        h.submit(TaskSpec::new(title).with_priority(priority));
    }
    assert!(h.dispatched().is_empty(), "slot is taken");

    h.complete(&blocker);
    let mut order = Vec::new();
    for _ in 0..4 {
        let a = h.next();
        order.push(a.title.clone());
        assert!(h.dispatched().is_empty(), "only one task at a time");
        h.complete(&a);
    }
    assert_eq!(order, vec!["critical", "high", "medium", "low"]);
}

/// Test: Equal priorities keep submission order
#[test]
fn test_equal_priority_is_fifo() {
    let mut h = SchedulerHarness::new(test_config());
    h.agent("solo", 1);
    let specs = independent_tasks(3);
    for spec in specs {
        h.submit(spec);
    }
    let mut order = Vec::new();
    for _ in 0..3 {
        let a = h.next();
        order.push(a.title.clone());
        h.complete(&a);
    }
    assert_eq!(order, vec!["task-1", "task-2", "task-3"]);
}

/// Test: Failed dependency blocks its dependents
/// Given T1 → T2 → T3 and no retries
/// When T1 completes and T2 fails
/// Then T2 is failed and T3 is blocked with T2 as the cause
#[test]
fn test_failed_dependency_blocks_dependent() {
    let mut config = test_config();
    config.scheduler.max_retries = 0;
    let mut h = SchedulerHarness::new(config);
    h.agent("worker", 2);
    let mut events = h.sched.events().subscribe();

    let t1 = TaskId::new();
    let t2 = TaskId::new();
    let t3 = TaskId::new();
    h.sched
        .submit_batch(vec![
            TaskSpec::new("t1").with_id(t1),
            TaskSpec::new("t2").with_id(t2).depends_on(t1),
            TaskSpec::new("t3").with_id(t3).depends_on(t2),
        ])
        .unwrap();

    let a1 = h.next();
    assert_eq!(a1.task, t1);
    h.complete(&a1);

    let a2 = h.next();
    assert_eq!(a2.task, t2);
    h.fail(&a2, "compile error");

    assert_eq!(h.status(&t1), StatusKind::Completed);
    assert_eq!(h.status(&t2), StatusKind::Failed);
    assert_eq!(h.status(&t3), StatusKind::Blocked);
    assert!(h.dispatched().is_empty(), "t3 never runs");

    let error = match h.sched.task(&t2).unwrap().status {
        TaskStatus::Failed { error } => error,
        other => panic!("unexpected status: {:?}", other),
    };
    assert!(error.contains("retry limit"));
    assert!(error.contains("compile error"));

    let mut saw_block = false;
    while let Ok(event) = events.try_recv() {
        if let OrchestratorEvent::TaskBlocked { task, cause } = event {
            assert_eq!((task, cause), (t3, t2));
            saw_block = true;
        }
    }
    assert!(saw_block);
}

/// Test: All dependencies must complete
/// Given T4 depending on three independent tasks
/// When two of them complete
/// Then T4 stays pending until the third completes
#[test]
fn test_unmet_dependencies_keep_task_pending() {
    let mut h = SchedulerHarness::new(test_config());
    h.agent("worker", 3);
    let deps: Vec<TaskId> = (0..3).map(|_| TaskId::new()).collect();
    let t4 = TaskId::new();
    let mut specs: Vec<TaskSpec> = deps
        .iter()
        .enumerate()
        .map(|(i, id)| TaskSpec::new(&format!("dep-{}", i)).with_id(*id))
        .collect();
    let mut last = TaskSpec::new("t4").with_id(t4);
    for dep in &deps {
        last = last.depends_on(*dep);
    }
    specs.push(last);
    h.sched.submit_batch(specs).unwrap();

    let running = h.dispatched();
    assert_eq!(running.len(), 3);

    h.complete(&running[0]);
    h.complete(&running[1]);
    assert_eq!(h.status(&t4), StatusKind::Pending);
    assert!(!h.sched.resolver().ready().contains(&t4));

    h.complete(&running[2]);
    assert_eq!(h.status(&t4), StatusKind::Assigned);
    assert_eq!(h.next().task, t4);
}

/// Test: Cycles are rejected at registration
#[test]
fn test_cycle_rejected() {
    let mut h = SchedulerHarness::new(test_config());
    let a = TaskId::new();
    let b = TaskId::new();
    let err = h
        .sched
        .submit_batch(vec![
            TaskSpec::new("a").with_id(a).depends_on(b),
            TaskSpec::new("b").with_id(b).depends_on(a),
        ])
        .unwrap_err();
    assert!(matches!(err, Error::CycleDetected(_)));
    assert!(h.sched.task(&a).is_none());
    assert!(h.sched.task(&b).is_none());

    let x = h.submit(TaskSpec::new("x"));
    let y = h.submit(TaskSpec::new("y").depends_on(x));
    assert!(matches!(
        h.sched.add_dependency(&x, &y),
        Err(Error::CycleDetected(_))
    ));
}

/// Test: Capacity is never exceeded
/// Given two agents with two slots each and seven tasks
/// When the scheduler places work
/// Then at most four run at once and task states mirror the slot sets
#[test]
fn test_capacity_bound_and_state_correspondence() {
    let mut h = SchedulerHarness::new(test_config());
    let agents: Vec<AgentId> = vec![h.agent("a", 2), h.agent("b", 2)];
    for spec in independent_tasks(7) {
        h.submit(spec);
    }

    let first = h.dispatched();
    assert_eq!(first.len(), 4);
    for id in &agents {
        assert_eq!(h.sched.capacity().in_flight(id), 2);
        assert_eq!(h.sched.capacity().available_slots(id), 0);
    }
    let report = h.sched.capacity_report();
    assert_eq!(report.used_capacity, report.total_capacity);
    assert_eq!(report.pending_tasks, 3);

    h.start(&first[0]);
    let started = h.sched.task(&first[0].task).unwrap();
    assert_eq!(started.status.kind(), StatusKind::InProgress);
    assert!(h.sched.capacity().is_running(&first[0].agent, &started.id));
    assert!(!h.sched.capacity().is_queued(&first[0].agent, &started.id));

    let queued = h.sched.task(&first[1].task).unwrap();
    assert_eq!(queued.status.kind(), StatusKind::Assigned);
    assert!(h.sched.capacity().is_queued(&first[1].agent, &queued.id));

    // Each completion frees exactly one slot for exactly one task
    let output = serde_json::Value::Null;
    assert!(h.report(&first[0], ReportKind::Completed { output }));
    for a in &first[1..] {
        h.complete(a);
        for id in &agents {
            assert!(h.sched.capacity().in_flight(id) <= 2);
        }
    }
    assert_eq!(h.dispatched().len(), 3);
}

/// Test: Double release is an explicit error
#[test]
fn test_double_release_is_error() {
    let mut capacity = CapacityTracker::new(0.2);
    let agent = AgentId::new();
    let task = TaskId::new();
    capacity.add_agent(agent, 2);
    capacity.reserve(&agent, task).unwrap();
    capacity.mark_started(&agent, &task).unwrap();

    capacity
        .release(&agent, &task, ReleaseOutcome::success(TaskType::Test))
        .unwrap();
    let err = capacity
        .release(&agent, &task, ReleaseOutcome::success(TaskType::Test))
        .unwrap_err();
    assert!(matches!(err, Error::ReservationNotFound { .. }));

    assert_eq!(capacity.in_flight(&agent), 0);
    assert_eq!(capacity.available_slots(&agent), 2);
    assert_eq!(capacity.stats(&agent).unwrap().processed, 1);
}

/// Test: Reserve refuses past the limit
#[test]
fn test_reserve_past_limit_refused() {
    let mut capacity = CapacityTracker::new(0.2);
    let agent = AgentId::new();
    capacity.add_agent(agent, 1);
    capacity.reserve(&agent, TaskId::new()).unwrap();
    assert!(matches!(
        capacity.reserve(&agent, TaskId::new()),
        Err(Error::CapacityExceeded { max: 1, .. })
    ));
    assert_eq!(capacity.in_flight(&agent), 1);
}
