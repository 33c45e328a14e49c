//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Driving the scheduler by hand (`SchedulerHarness`)
//! - Scripted executor responses (`ScriptedExecutor`)
//! - A spawned runtime with event helpers (`RuntimeHarness`)
//! - Predefined agents and task sets

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use conductor::agent::{Agent, AgentId};
use conductor::config::Config;
use conductor::core::task::{StatusKind, TaskId, TaskSpec};
use conductor::events::OrchestratorEvent;
use conductor::orchestration::{
    AgentExecutor, AgentReport, Assignment, ExecutionOutcome, Orchestrator, OrchestratorHandle,
    ProgressReporter, ReportKind, Scheduler,
};
use conductor::state::MemoryTaskStore;

/// How long async tests wait for an event before giving up.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Config tuned for tests: one-sample balancer window, no background noise.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.balancer.window = 1;
    config.scheduler.tick_interval_ms = 20;
    config.runtime.drain_timeout_ms = 500;
    config
}

pub fn agent(name: &str, slots: u32) -> Agent {
    Agent::new(name, "coder").with_capacity(slots)
}

/// `count` independent tasks named `task-1..=count`.
pub fn independent_tasks(count: usize) -> Vec<TaskSpec> {
    (1..=count)
        .map(|i| TaskSpec::new(&format!("task-{}", i)).with_id(TaskId::new()))
        .collect()
}

/// Scheduler driven by hand: assignments land in `rx` and tests feed reports
/// back one at a time.
pub struct SchedulerHarness {
    pub sched: Scheduler,
    pub rx: mpsc::UnboundedReceiver<Assignment>,
}

impl SchedulerHarness {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sched: Scheduler::new(config, Box::new(MemoryTaskStore::new()), tx),
            rx,
        }
    }

    pub fn agent(&mut self, name: &str, slots: u32) -> AgentId {
        self.sched
            .register_agent(agent(name, slots))
            .expect("agent registers")
    }

    pub fn submit(&mut self, spec: TaskSpec) -> TaskId {
        self.sched.submit(spec).expect("task submits").task.id
    }

    /// Every assignment dispatched so far.
    pub fn dispatched(&mut self) -> Vec<Assignment> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    pub fn next(&mut self) -> Assignment {
        self.rx.try_recv().expect("expected an assignment")
    }

    pub fn report(&mut self, assignment: &Assignment, kind: ReportKind) -> bool {
        self.sched.handle_report(AgentReport::new(assignment, kind))
    }

    pub fn start(&mut self, assignment: &Assignment) {
        assert!(self.report(assignment, ReportKind::Started));
    }

    pub fn complete(&mut self, assignment: &Assignment) {
        self.start(assignment);
        let output = json!({ "done": assignment.title });
        assert!(self.report(assignment, ReportKind::Completed { output }));
    }

    pub fn fail(&mut self, assignment: &Assignment, error: &str) {
        self.start(assignment);
        let error = error.to_string();
        assert!(self.report(assignment, ReportKind::Failed { error }));
    }

    pub fn status(&self, id: &TaskId) -> StatusKind {
        self.sched.task(id).expect("task exists").status.kind()
    }
}

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(Value),
    Fail(String),
    /// Acknowledge and never finish.
    Hang,
}

impl Step {
    pub fn success(output: Value) -> Self {
        Step::Succeed(output)
    }

    pub fn error(message: &str) -> Self {
        Step::Fail(message.to_string())
    }
}

/// Executor answering from per-title scripts. Titles without a script, or
/// whose script ran out, echo the prompt back.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, AgentId)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, title: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(title.to_string(), steps.into());
    }

    /// `(title, agent)` of every execution, in call order.
    pub fn calls(&self) -> Vec<(String, AgentId)> {
        self.calls.lock().unwrap().clone()
    }

    fn next_step(&self, title: &str) -> Option<Step> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(title)
            .and_then(|steps| steps.pop_front())
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, assignment: Assignment, progress: ProgressReporter) -> ExecutionOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((assignment.title.clone(), assignment.agent));
        progress.started();
        match self.next_step(&assignment.title) {
            Some(Step::Succeed(output)) => ExecutionOutcome::Completed(output),
            Some(Step::Fail(error)) => ExecutionOutcome::Failed(error),
            Some(Step::Hang) => futures::future::pending().await,
            None => ExecutionOutcome::Completed(json!({
                "agent": assignment.agent,
                "answer": assignment.prompt,
            })),
        }
    }
}

/// Spawned runtime plus a subscription opened before any work is submitted.
pub struct RuntimeHarness {
    pub handle: OrchestratorHandle,
    pub events: broadcast::Receiver<OrchestratorEvent>,
    pub executor: Arc<ScriptedExecutor>,
}

impl RuntimeHarness {
    pub fn new(config: Config) -> Self {
        let executor = Arc::new(ScriptedExecutor::new());
        let handle = Orchestrator::new(config, Box::new(MemoryTaskStore::new()), executor.clone())
            .expect("valid config")
            .spawn();
        let events = handle.subscribe();
        Self {
            handle,
            events,
            executor,
        }
    }

    pub async fn agent(&self, name: &str, slots: u32) -> AgentId {
        self.handle
            .register_agent(agent(name, slots))
            .await
            .expect("agent registers")
    }

    /// Next event matching `pred`, skipping the rest.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> OrchestratorEvent
    where
        F: FnMut(&OrchestratorEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn wait_named(&mut self, task: TaskId, name: &str) -> OrchestratorEvent {
        self.wait_for(|e| e.task() == Some(task) && e.name() == name)
            .await
    }
}
