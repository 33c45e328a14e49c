//! Load classification, recommendations and task migration.

use conductor::agent::AgentId;
use conductor::core::task::{StatusKind, TaskId, TaskSpec};
use conductor::events::OrchestratorEvent;
use conductor::orchestration::{Assignment, Migration, Recommendation, ReportKind};

use crate::fixtures::{independent_tasks, test_config, RuntimeHarness, SchedulerHarness};

struct Loaded {
    h: SchedulerHarness,
    busy: AgentId,
    spare: AgentId,
    queued: TaskId,
    /// Original dispatch of `queued` on the busy agent.
    source: Assignment,
}

/// B at 90% (nine running, one queued), C at 10% (one running of ten).
fn loaded_pool() -> Loaded {
    let mut h = SchedulerHarness::new(test_config());
    let busy = h.agent("b", 10);
    for spec in independent_tasks(10) {
        h.submit(spec);
    }
    let on_busy = h.dispatched();
    assert_eq!(on_busy.len(), 10);
    for a in &on_busy[..9] {
        h.start(a);
    }
    let source = on_busy[9].clone();
    let queued = source.task;

    let spare = h.agent("c", 10);
    h.submit(TaskSpec::new("warm").pinned_to(spare));
    let warm = h.next();
    h.start(&warm);

    assert_eq!(h.sched.capacity().utilization(&busy), 90.0);
    assert_eq!(h.sched.capacity().utilization(&spare), 10.0);
    Loaded {
        h,
        busy,
        spare,
        queued,
        source,
    }
}

/// Test: Rebalance from a 90% agent to a 10% agent
/// Given B at 90% with T4 queued and C at 10%
/// When rebalance runs after one load sample
/// Then T4 moves to C, stays assigned and is dispatched again
#[test]
fn test_rebalance_moves_queued_task() {
    let Loaded {
        mut h,
        busy,
        spare,
        queued,
        ..
    } = loaded_pool();
    let mut events = h.sched.events().subscribe();

    h.sched.sample_load();
    let report = h.sched.capacity_report();
    assert_eq!(report.bottlenecks, vec![busy]);
    assert_eq!(report.underutilized, vec![spare]);

    let recs = h.sched.recommendations();
    assert!(recs.contains(&Recommendation::Redistribute {
        from: busy,
        to: spare,
        tasks: vec![queued],
    }));

    let moved = h.sched.rebalance();
    assert_eq!(
        moved,
        vec![Migration {
            task: queued,
            from: busy,
            to: spare,
        }]
    );

    let task = h.sched.task(&queued).unwrap();
    assert_eq!(task.status.kind(), StatusKind::Assigned);
    assert_eq!(task.assigned_agent, Some(spare));
    assert_eq!(task.attempt, 2);
    assert!(h.sched.capacity().is_queued(&spare, &queued));
    assert!(!h.sched.capacity().is_queued(&busy, &queued));
    assert_eq!(h.sched.capacity().in_flight(&busy), 9);

    let redispatch = h.next();
    assert_eq!((redispatch.task, redispatch.agent), (queued, spare));

    let mut reassigned = false;
    while let Ok(event) = events.try_recv() {
        if let OrchestratorEvent::TaskReassigned { task, from, to } = event {
            assert_eq!((task, from, to), (queued, busy, spare));
            reassigned = true;
        }
    }
    assert!(reassigned);
}

/// Test: The abandoned dispatch cannot touch a migrated task
#[test]
fn test_report_from_source_after_migration_is_stale() {
    let Loaded {
        mut h,
        spare,
        queued,
        source,
        ..
    } = loaded_pool();
    h.sched.sample_load();
    assert_eq!(h.sched.rebalance().len(), 1);
    let redispatch = h.next();
    assert!(source.cancel.is_cancelled());

    assert!(!h.report(&source, ReportKind::Started));
    assert!(!h.report(&source, ReportKind::Cancelled));
    assert_eq!(h.status(&queued), StatusKind::Assigned);
    assert_eq!(h.sched.task(&queued).unwrap().assigned_agent, Some(spare));

    h.complete(&redispatch);
    assert_eq!(h.status(&queued), StatusKind::Completed);
    assert_eq!(h.sched.capacity().stats(&spare).unwrap().succeeded, 1);
}

/// Test: Started tasks never move
/// Given the queued task on B acknowledges before rebalancing
/// When rebalance runs
/// Then nothing is movable and B stays a bottleneck
#[test]
fn test_started_tasks_are_not_migrated() {
    let Loaded {
        mut h,
        busy,
        queued,
        source,
        ..
    } = loaded_pool();
    h.start(&source);
    h.sched.sample_load();

    assert!(h.sched.rebalance().is_empty());
    assert_eq!(h.sched.capacity_report().bottlenecks, vec![busy]);
    assert_eq!(h.status(&queued), StatusKind::InProgress);
    assert!(h.sched.capacity().is_running(&busy, &queued));
}

/// Test: Scale recommendations without a migration target
/// Given a single agent at 100%
/// When recommendations are computed
/// Then a scale-up for its kind is suggested and nothing moves
#[test]
fn test_scale_up_without_spare_agents() {
    let mut h = SchedulerHarness::new(test_config());
    h.agent("only", 2);
    for spec in independent_tasks(3) {
        h.submit(spec);
    }
    for a in h.dispatched() {
        h.start(&a);
    }
    h.sched.sample_load();

    let recs = h.sched.recommendations();
    assert_eq!(
        recs,
        vec![Recommendation::ScaleUp {
            kind: "coder".to_string(),
            bottlenecks: 1,
        }]
    );
    assert!(h.sched.rebalance().is_empty());
    assert_eq!(h.sched.capacity_report().pending_tasks, 1);
}

/// Test: On-demand rebalance through the runtime handle
#[tokio::test]
async fn test_runtime_capacity_update_and_rebalance() {
    let h = RuntimeHarness::new(test_config());
    let agent = h.agent("elastic", 1).await;

    h.handle.update_capacity(agent, 4).await.unwrap();
    let report = h.handle.capacity().await.unwrap();
    assert_eq!(report.total_capacity, 4);
    assert_eq!(report.agent(&agent).unwrap().available_slots, 4);

    assert!(h.handle.rebalance().await.unwrap().is_empty());
    assert!(matches!(
        h.handle.update_capacity(AgentId::new(), 2).await,
        Err(conductor::Error::AgentNotFound { .. })
    ));
}
