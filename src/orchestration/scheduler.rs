//! Scheduler for task placement and lifecycle.
//!
//! The Scheduler owns every piece of orchestration state: the agent
//! registry, capacity accounting, the dependency resolver, the task store
//! and the collaboration coordinator. It is synchronous and single-writer;
//! the runtime drives it from one loop and feeds it agent reports.
//!
//! A tick pops ready tasks in priority order and places each one:
//! single-agent tasks on the best-ranked agent with a free slot,
//! collaborative tasks on a reserved group. Tasks that cannot be placed go
//! back to the ready queue after the tick.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentId, AgentStatus};
use crate::config::{Config, StartMode};
use crate::core::task::{
    CollaborationStrategy, SessionId, StatusKind, Task, TaskId, TaskSpec, TaskStatus,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, OrchestratorEvent};
use crate::orchestration::balancer::{LoadBalancer, Recommendation};
use crate::orchestration::capacity::{CapacityReport, CapacityTracker, ReleaseOutcome};
use crate::orchestration::collaboration::{
    CollaborationCoordinator, CollaborationSession, ConsensusPolicy, SessionAction, Stage,
    StepResult,
};
use crate::orchestration::executor::{AgentReport, Assignment, ReportKind};
use crate::orchestration::health::{DeadlineTracker, RetryDecision, RetryPolicy};
use crate::orchestration::registry::AgentRegistry;
use crate::orchestration::resolver::DependencyResolver;
use crate::state::{Snapshot, TaskFilter, TaskStore};

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task: Task,
    /// Agent the task was placed on during the submission tick.
    pub assigned: Option<AgentId>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// One entry per reservation made, collaboration participants included.
    pub placed: Vec<(TaskId, AgentId)>,
    pub sessions: Vec<SessionId>,
    /// Ready tasks left waiting for capacity.
    pub deferred: usize,
}

/// A task moved by the rebalancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub task: TaskId,
    pub from: AgentId,
    pub to: AgentId,
}

/// A dispatch waiting for its agent to report back.
#[derive(Debug)]
struct Outstanding {
    dispatch: u64,
    session: Option<SessionId>,
    cancel: CancellationToken,
    started: bool,
}

/// Ranking inputs for one candidate agent.
#[derive(Debug)]
struct Candidate {
    agent: AgentId,
    score: f64,
    load: f64,
    success_rate: f64,
}

pub struct Scheduler {
    config: Config,
    registry: AgentRegistry,
    capacity: CapacityTracker,
    resolver: DependencyResolver,
    store: Box<dyn TaskStore>,
    coordinator: CollaborationCoordinator,
    balancer: LoadBalancer,
    events: EventBus,
    retry: RetryPolicy,
    deadlines: DeadlineTracker,
    outstanding: HashMap<(TaskId, AgentId), Outstanding>,
    dispatch_tx: mpsc::UnboundedSender<Assignment>,
    /// Parent of every assignment's cancellation token.
    root_cancel: CancellationToken,
    next_sequence: u64,
    next_dispatch: u64,
    /// No new placements while draining.
    draining: bool,
}

impl Scheduler {
    /// Create a scheduler over an empty store. Assignments are sent on
    /// `dispatch_tx`.
    pub fn new(
        config: Config,
        store: Box<dyn TaskStore>,
        dispatch_tx: mpsc::UnboundedSender<Assignment>,
    ) -> Self {
        Self {
            registry: AgentRegistry::new(),
            capacity: CapacityTracker::new(config.scheduler.duration_smoothing),
            resolver: DependencyResolver::new(),
            store,
            coordinator: CollaborationCoordinator::new(&config.collaboration),
            balancer: LoadBalancer::new(config.balancer.clone()),
            events: EventBus::new(config.events.capacity),
            retry: RetryPolicy::new(config.scheduler.max_retries),
            deadlines: DeadlineTracker::new(),
            outstanding: HashMap::new(),
            dispatch_tx,
            root_cancel: CancellationToken::new(),
            next_sequence: 0,
            next_dispatch: 0,
            draining: false,
            config,
        }
    }

    /// Replace the consensus agreement function.
    pub fn with_consensus_policy(mut self, policy: Box<dyn ConsensusPolicy>) -> Self {
        self.coordinator = self.coordinator.with_policy(policy);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn capacity(&self) -> &CapacityTracker {
        &self.capacity
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.store.get(id)
    }

    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.store.scan(filter)
    }

    pub fn session_for_task(&self, id: &TaskId) -> Option<&CollaborationSession> {
        self.coordinator.session_for_task(id)
    }

    /// Dispatches still waiting for a report.
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    fn mutate<F>(&mut self, id: &TaskId, mut f: F) -> Result<Task>
    where
        F: FnMut(&mut Task) -> Result<()>,
    {
        self.store.update(id, &mut f)?;
        self.store.get(id).ok_or(Error::TaskNotFound(*id))
    }

    // ---- agents ----

    pub fn register_agent(&mut self, agent: Agent) -> Result<AgentId> {
        let id = agent.id;
        let (name, kind, max) = (agent.name.clone(), agent.kind.clone(), agent.max_concurrent_tasks);
        self.registry.register(agent)?;
        self.capacity.add_agent(id, max);
        self.events.publish(OrchestratorEvent::AgentRegistered {
            agent: id,
            name,
            kind,
        });
        self.tick();
        Ok(id)
    }

    /// Remove an agent. Refused with `AgentBusy` while it holds reservations.
    pub fn unregister_agent(&mut self, id: &AgentId) -> Result<Agent> {
        self.capacity.remove_agent(id)?;
        let agent = self.registry.remove(id)?;
        self.balancer.forget(id);
        self.events
            .publish(OrchestratorEvent::AgentUnregistered { agent: *id });
        // Pinned tasks waiting on this agent can no longer run
        self.tick();
        Ok(agent)
    }

    pub fn set_agent_status(&mut self, id: &AgentId, status: AgentStatus) -> Result<()> {
        let status = match status {
            AgentStatus::Idle | AgentStatus::Busy if self.capacity.in_flight(id) > 0 => {
                AgentStatus::Busy
            }
            AgentStatus::Idle | AgentStatus::Busy => AgentStatus::Idle,
            other => other,
        };
        let previous = self.registry.set_status(id, status)?;
        if !previous.is_schedulable() && status.is_schedulable() {
            self.tick();
        }
        Ok(())
    }

    /// Change an agent's slot count. Shrinking below its in-flight count is
    /// refused.
    pub fn update_capacity(&mut self, id: &AgentId, max_concurrent_tasks: u32) -> Result<()> {
        self.registry.require(id)?;
        self.capacity.set_max_concurrent(id, max_concurrent_tasks)?;
        self.registry.set_capacity(id, max_concurrent_tasks)?;
        tracing::info!(agent = %id.short(), max = max_concurrent_tasks, "capacity updated");
        self.tick();
        Ok(())
    }

    /// Keep Idle/Busy in step with in-flight accounting. Administrative
    /// states are left alone.
    fn refresh_agent_status(&mut self, id: &AgentId) {
        let busy = self.capacity.in_flight(id) > 0;
        let next = match self.registry.get(id).map(|a| a.status) {
            Some(AgentStatus::Idle) if busy => AgentStatus::Busy,
            Some(AgentStatus::Busy) if !busy => AgentStatus::Idle,
            _ => return,
        };
        let _ = self.registry.set_status(id, next);
    }

    // ---- submission ----

    fn validate_spec(&self, spec: &TaskSpec) -> Result<()> {
        if spec.title.trim().is_empty() {
            return Err(Error::Validation("task title must not be empty".to_string()));
        }
        if let Some(collab) = &spec.collaboration {
            if collab.min_agents == 0 {
                return Err(Error::Validation(
                    "collaboration needs at least one agent".to_string(),
                ));
            }
            if collab.strategy == CollaborationStrategy::Hierarchical && collab.min_agents < 2 {
                return Err(Error::Validation(
                    "hierarchical collaboration needs at least two agents".to_string(),
                ));
            }
            if spec.pinned_agent.is_some() {
                return Err(Error::Validation(
                    "a collaborative task cannot be pinned to one agent".to_string(),
                ));
            }
        }
        if let Some(agent) = &spec.pinned_agent {
            self.registry.require(agent)?;
        }
        Ok(())
    }

    /// Submit one task.
    ///
    /// # Errors
    /// `Validation`, `TaskExists`, `UnknownDependency`, `CycleDetected`,
    /// `AgentNotFound` for an unknown pinned agent.
    pub fn submit(&mut self, spec: TaskSpec) -> Result<Submission> {
        self.submit_batch(vec![spec])?
            .pop()
            .ok_or_else(|| Error::Validation("empty submission".to_string()))
    }

    /// Submit a decomposition batch atomically. Tasks may depend on each
    /// other in any order; nothing is stored if any task is rejected.
    pub fn submit_batch(&mut self, specs: Vec<TaskSpec>) -> Result<Vec<Submission>> {
        for spec in &specs {
            self.validate_spec(spec)?;
        }
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            let task = Task::from_spec(spec, self.next_sequence);
            if self.store.contains(&task.id) {
                return Err(Error::TaskExists(task.id));
            }
            self.next_sequence += 1;
            tasks.push(task);
        }
        self.resolver.register_batch(&tasks, self.store.as_ref())?;

        let mut failed_upstream = Vec::new();
        for task in &tasks {
            for dep in &task.dependencies {
                let dead = self.store.get(dep).is_some_and(|d| {
                    matches!(d.status.kind(), StatusKind::Failed | StatusKind::Blocked)
                });
                if dead && !failed_upstream.contains(dep) {
                    failed_upstream.push(*dep);
                }
            }
            self.store.insert(task.clone())?;
            tracing::info!(
                task = %task.id.short(),
                title = %task.title,
                priority = %task.priority,
                "task created"
            );
            self.events.publish(OrchestratorEvent::TaskCreated {
                task: task.id,
                title: task.title.clone(),
                priority: task.priority,
            });
        }
        // Depending on something already dead blocks right away
        for dep in failed_upstream {
            self.block_downstream(&dep);
        }

        self.tick();
        Ok(tasks
            .iter()
            .filter_map(|t| self.store.get(&t.id))
            .map(|task| Submission {
                assigned: task.assigned_agent,
                task,
            })
            .collect())
    }

    /// Add an edge between two existing tasks.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let target = self.store.get(to).ok_or(Error::TaskNotFound(*to))?;
        if target.status != TaskStatus::Pending {
            return Err(Error::Validation(format!(
                "task {} is {} and cannot gain dependencies",
                to.short(),
                target.status.kind()
            )));
        }
        self.resolver.add_dependency(from, to, self.store.as_ref())?;
        self.mutate(to, |t| {
            if !t.dependencies.contains(from) {
                t.dependencies.push(*from);
            }
            Ok(())
        })?;
        Ok(())
    }

    // ---- placement ----

    /// Rank agents that could take `task` right now.
    fn candidates(&self, task: &Task) -> Vec<AgentId> {
        let mut candidates: Vec<Candidate> = self
            .registry
            .schedulable()
            .filter(|a| task.pinned_agent.map_or(true, |p| p == a.id))
            .filter(|a| self.capacity.available_slots(&a.id) > 0)
            .filter_map(|a| {
                let score = a.capabilities.score(task.task_type, &task.requirements)?;
                Some(Candidate {
                    agent: a.id,
                    score,
                    load: self.capacity.in_flight(&a.id) as f64
                        / a.max_concurrent_tasks.max(1) as f64,
                    success_rate: self.capacity.success_rate(&a.id, task.task_type),
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.load.total_cmp(&b.load))
                .then(b.success_rate.total_cmp(&a.success_rate))
                .then(a.agent.cmp(&b.agent))
        });
        candidates.into_iter().map(|c| c.agent).collect()
    }

    /// Place ready tasks on agents.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if self.draining {
            return report;
        }
        let mut deferred = Vec::new();
        while let Some(id) = self.resolver.pop_ready() {
            let Some(task) = self.store.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            if let Some(pinned) = task.pinned_agent {
                if !self.registry.contains(&pinned) {
                    let err = Error::AgentUnavailable(task.id);
                    tracing::warn!(task = %id.short(), agent = %pinned.short(), "pinned agent is gone");
                    self.fail_terminal(&id, &err.to_string());
                    continue;
                }
            }

            let placed = if task.is_collaborative() {
                self.open_session(&task)
            } else {
                self.place(&task)
            };
            match placed {
                Ok(Some((agents, session))) => {
                    report.placed.extend(agents.into_iter().map(|a| (id, a)));
                    report.sessions.extend(session);
                }
                Ok(None) => {
                    tracing::debug!(
                        task = %id.short(),
                        reason = %Error::AgentUnavailable(id),
                        "task deferred"
                    );
                    deferred.push(task);
                }
                Err(e) => {
                    tracing::warn!(task = %id.short(), error = %e, "task cannot be scheduled");
                    self.fail_terminal(&id, &e.to_string());
                }
            }
        }
        report.deferred = deferred.len();
        for task in &deferred {
            self.resolver.enqueue_if_ready(task, self.store.as_ref());
        }
        report
    }

    fn place(&mut self, task: &Task) -> Result<Option<(Vec<AgentId>, Option<SessionId>)>> {
        for agent in self.candidates(task) {
            match self.capacity.reserve(&agent, task.id) {
                Ok(()) => {
                    let task = self.mutate(&task.id, |t| t.assign(agent))?;
                    self.refresh_agent_status(&agent);
                    tracing::debug!(task = %task.id.short(), agent = %agent.short(), "task assigned");
                    self.events.publish(OrchestratorEvent::TaskAssigned {
                        task: task.id,
                        agent,
                    });
                    let input = json!({ "prompt": task.prompt });
                    self.dispatch(&task, agent, None, Stage::Execute, input);
                    return Ok(Some((vec![agent], None)));
                }
                Err(Error::CapacityExceeded { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn open_session(&mut self, task: &Task) -> Result<Option<(Vec<AgentId>, Option<SessionId>)>> {
        let Some(spec) = task.collaboration.clone() else {
            return Ok(None);
        };
        let group: Vec<AgentId> = self
            .candidates(task)
            .into_iter()
            .take(spec.group_limit())
            .collect();
        if group.len() < spec.min_agents {
            return Ok(None);
        }

        let holders = CollaborationCoordinator::initial_holders(spec.strategy, &group);
        let mut reserved = Vec::new();
        for agent in &holders {
            if let Err(e) = self.capacity.reserve(agent, task.id) {
                for r in &reserved {
                    let _ = self.capacity.cancel_reservation(r, &task.id);
                }
                return match e {
                    Error::CapacityExceeded { .. } => Ok(None),
                    other => Err(other),
                };
            }
            reserved.push(*agent);
        }

        let lead = group[0];
        let assigned = self.mutate(&task.id, |t| t.assign(lead))?;
        let (session, actions) = match self.coordinator.open(&assigned, group.clone()) {
            Ok(opened) => opened,
            Err(e) => {
                for r in &reserved {
                    let _ = self.capacity.cancel_reservation(r, &task.id);
                }
                return Err(e);
            }
        };
        self.mutate(&task.id, |t| {
            t.session = Some(session);
            Ok(())
        })?;
        for agent in &group {
            self.refresh_agent_status(agent);
            self.events.publish(OrchestratorEvent::TaskAssigned {
                task: task.id,
                agent: *agent,
            });
        }
        self.events.publish(OrchestratorEvent::SessionOpened {
            session,
            task: task.id,
            strategy: spec.strategy,
            participants: group.clone(),
        });
        self.apply_session_actions(session, task.id, actions);
        Ok(Some((reserved, Some(session))))
    }

    /// Send an assignment to the executor and start its deadline.
    fn dispatch(
        &mut self,
        task: &Task,
        agent: AgentId,
        session: Option<SessionId>,
        stage: Stage,
        input: Value,
    ) {
        let Some(timeout) = self.registry.get(&agent).map(Agent::timeout) else {
            tracing::warn!(agent = %agent.short(), "dispatch to unknown agent skipped");
            return;
        };
        self.next_dispatch += 1;
        let cancel = self.root_cancel.child_token();
        let assignment = Assignment {
            task: task.id,
            agent,
            attempt: task.attempt,
            dispatch: self.next_dispatch,
            session,
            stage,
            title: task.title.clone(),
            task_type: task.task_type,
            prompt: task.prompt.clone(),
            input,
            timeout,
            cancel: cancel.clone(),
        };
        self.outstanding.insert(
            (task.id, agent),
            Outstanding {
                dispatch: self.next_dispatch,
                session,
                cancel,
                started: false,
            },
        );
        self.deadlines.track(task.id, agent, task.attempt, timeout);
        if self.dispatch_tx.send(assignment).is_err() {
            tracing::warn!(task = %task.id.short(), "dispatch channel closed");
        }
        if self.config.scheduler.start_mode == StartMode::Immediate {
            if let Err(e) = self.on_started(task.id, agent) {
                tracing::warn!(task = %task.id.short(), error = %e, "immediate start failed");
            }
        }
    }

    // ---- reports ----

    /// Apply an agent report. Returns false when the report is stale: it
    /// belongs to a dispatch that was replaced, cancelled or timed out.
    pub fn handle_report(&mut self, report: AgentReport) -> bool {
        let key = (report.task, report.agent);
        match self.outstanding.get(&key) {
            Some(o) if o.dispatch == report.dispatch => {}
            _ => {
                tracing::warn!(
                    task = %report.task.short(),
                    agent = %report.agent.short(),
                    dispatch = report.dispatch,
                    "stale report ignored"
                );
                return false;
            }
        }

        let result = match report.kind {
            ReportKind::Started => self.on_started(report.task, report.agent),
            ReportKind::Completed { output } => {
                self.on_finished(report.task, report.agent, Ok(output))
            }
            ReportKind::Failed { error } => self.on_finished(report.task, report.agent, Err(error)),
            ReportKind::TimedOut => {
                let timeout = self
                    .deadlines
                    .get(&report.task, &report.agent)
                    .map(|d| d.timeout)
                    .unwrap_or_default();
                let error = Error::DispatchTimeout {
                    task: report.task,
                    agent: report.agent,
                    timeout,
                };
                self.on_finished(report.task, report.agent, Err(error.to_string()))
            }
            ReportKind::Cancelled => {
                self.on_finished(report.task, report.agent, Err("cancelled".to_string()))
            }
        };
        if let Err(e) = result {
            tracing::warn!(task = %report.task.short(), error = %e, "report handling failed");
        }
        self.tick();
        true
    }

    fn on_started(&mut self, task_id: TaskId, agent: AgentId) -> Result<()> {
        let Some(o) = self.outstanding.get_mut(&(task_id, agent)) else {
            return Ok(());
        };
        if o.started {
            return Ok(());
        }
        o.started = true;
        let session = o.session;

        if let Err(e) = self.capacity.mark_started(&agent, &task_id) {
            tracing::warn!(task = %task_id.short(), error = %e, "start without reservation");
        }
        if let Some(session) = session {
            self.coordinator.on_started(&session, &agent);
        }
        let task = self.store.get(&task_id).ok_or(Error::TaskNotFound(task_id))?;
        if task.status == TaskStatus::Assigned {
            self.mutate(&task_id, Task::start)?;
            tracing::debug!(task = %task_id.short(), agent = %agent.short(), "task started");
            self.events.publish(OrchestratorEvent::TaskStarted {
                task: task_id,
                agent,
            });
        }
        Ok(())
    }

    fn on_finished(&mut self, task_id: TaskId, agent: AgentId, result: StepResult) -> Result<()> {
        let Some(outstanding) = self.outstanding.remove(&(task_id, agent)) else {
            return Ok(());
        };
        self.deadlines.clear(&task_id, &agent);
        let task = self.store.get(&task_id).ok_or(Error::TaskNotFound(task_id))?;

        let outcome = match &result {
            Ok(_) => ReleaseOutcome::success(task.task_type),
            Err(_) => ReleaseOutcome::failure(task.task_type),
        };
        if let Err(e) = self.capacity.release(&agent, &task_id, outcome) {
            tracing::warn!(task = %task_id.short(), error = %e, "release failed");
        }
        self.refresh_agent_status(&agent);

        match outstanding.session {
            Some(session) => {
                if let Some(actions) = self.coordinator.on_result(&session, &agent, result) {
                    self.apply_session_actions(session, task_id, actions);
                }
                Ok(())
            }
            None => match result {
                Ok(output) => self.complete_task(&task_id, output),
                Err(error) => self.fail_task(&task_id, &error),
            },
        }
    }

    fn apply_session_actions(
        &mut self,
        session: SessionId,
        task_id: TaskId,
        actions: Vec<SessionAction>,
    ) {
        for action in actions {
            let applied = match action {
                SessionAction::Dispatch { agent, stage, input } => {
                    let held = self.capacity.is_queued(&agent, &task_id)
                        || self.capacity.is_running(&agent, &task_id);
                    if !held {
                        tracing::warn!(
                            task = %task_id.short(),
                            agent = %agent.short(),
                            "participant dispatched without a slot"
                        );
                    }
                    match self.store.get(&task_id) {
                        Some(task) => {
                            self.dispatch(&task, agent, Some(session), stage, input);
                            Ok(())
                        }
                        None => Err(Error::TaskNotFound(task_id)),
                    }
                }
                SessionAction::Hold { agent } => {
                    let held = self.capacity.reserve(&agent, task_id);
                    if let Err(e) = &held {
                        tracing::warn!(agent = %agent.short(), error = %e, "could not hold slot");
                        self.coordinator.set_holding(&session, &agent, false);
                    }
                    self.refresh_agent_status(&agent);
                    Ok(())
                }
                SessionAction::Cancel { agents } => {
                    for agent in agents {
                        self.cancel_participant(task_id, agent);
                    }
                    Ok(())
                }
                SessionAction::SpawnChildren { children } => {
                    self.spawn_children(session, task_id, children)
                }
                SessionAction::Complete { output } => {
                    self.close_session(session, task_id, true);
                    self.complete_task(&task_id, output)
                }
                SessionAction::Fail { error } => {
                    self.close_session(session, task_id, false);
                    self.fail_task(&task_id, &error)
                }
            };
            if let Err(e) = applied {
                tracing::warn!(task = %task_id.short(), error = %e, "session action failed");
            }
        }
    }

    fn close_session(&mut self, session: SessionId, task: TaskId, success: bool) {
        if self.coordinator.close(&session).is_some() {
            tracing::info!(session = %session, task = %task.short(), success, "collaboration session closed");
            self.events.publish(OrchestratorEvent::SessionClosed {
                session,
                task,
                success,
            });
        }
    }

    /// Drop a participant's slot and outstanding work.
    fn cancel_participant(&mut self, task: TaskId, agent: AgentId) {
        if let Some(o) = self.outstanding.remove(&(task, agent)) {
            o.cancel.cancel();
        }
        self.deadlines.clear(&task, &agent);
        let _ = self.capacity.cancel_reservation(&agent, &task);
        self.refresh_agent_status(&agent);
    }

    fn spawn_children(
        &mut self,
        session: SessionId,
        parent_id: TaskId,
        children: Vec<(AgentId, String)>,
    ) -> Result<()> {
        let parent = self
            .store
            .get(&parent_id)
            .ok_or(Error::TaskNotFound(parent_id))?;
        let total = children.len();
        let mut ids = Vec::with_capacity(total);
        for (i, (agent, prompt)) in children.into_iter().enumerate() {
            let mut spec = TaskSpec::new(&format!("{} [{}/{}]", parent.title, i + 1, total))
                .with_prompt(&prompt)
                .with_type(parent.task_type)
                .with_priority(parent.priority)
                .with_requirements(parent.requirements.clone())
                .pinned_to(agent);
            spec.project_id = parent.project_id.clone();
            let mut child = Task::from_spec(spec, self.next_sequence);
            self.next_sequence += 1;
            child.parent = Some(parent_id);

            self.resolver.register(&child, self.store.as_ref())?;
            self.store.insert(child.clone())?;
            self.events.publish(OrchestratorEvent::TaskCreated {
                task: child.id,
                title: child.title.clone(),
                priority: child.priority,
            });
            ids.push(child.id);
        }
        tracing::info!(
            task = %parent_id.short(),
            children = ids.len(),
            "hierarchical plan spawned child tasks"
        );
        self.coordinator.attach_children(&session, ids);
        Ok(())
    }

    /// Forward a terminal child outcome to its parent's session.
    fn child_finished(&mut self, parent: TaskId, child: TaskId, result: StepResult) {
        let Some(session) = self.store.get(&parent).and_then(|p| p.session) else {
            return;
        };
        let actions = self.coordinator.on_child_finished(&session, child, result);
        self.apply_session_actions(session, parent, actions);
    }

    // ---- terminal transitions ----

    fn complete_task(&mut self, id: &TaskId, output: Value) -> Result<()> {
        let task = self.mutate(id, |t| {
            if t.status == TaskStatus::Assigned {
                t.start()?;
            }
            t.complete(output.clone())
        })?;
        self.deadlines.clear_task(id);
        tracing::info!(
            task = %id.short(),
            duration_ms = ?task.duration_ms(),
            "task completed"
        );
        self.events.publish(OrchestratorEvent::TaskCompleted {
            task: *id,
            result: output.clone(),
            duration_ms: task.duration_ms(),
        });

        let ready = self.resolver.on_completed(id, self.store.as_ref());
        if !ready.is_empty() {
            tracing::debug!(task = %id.short(), unlocked = ready.len(), "dependents ready");
        }
        if let Some(parent) = task.parent {
            self.child_finished(parent, *id, Ok(output));
        }
        Ok(())
    }

    /// An execution failed: retry under the policy or fail for good.
    fn fail_task(&mut self, id: &TaskId, error: &str) -> Result<()> {
        let task = self.store.get(id).ok_or(Error::TaskNotFound(*id))?;
        if task.cancel_requested {
            self.finish_cancelled(id, error);
            return Ok(());
        }
        match self.retry.decide(&task) {
            RetryDecision::Retry(retry) => {
                let task = self.mutate(id, |t| {
                    t.reset();
                    t.retries = retry;
                    t.error = Some(error.to_string());
                    Ok(())
                })?;
                tracing::info!(
                    task = %id.short(),
                    retry,
                    max = self.retry.max_retries,
                    error,
                    "task failed, retrying"
                );
                self.events.publish(OrchestratorEvent::TaskFailed {
                    task: *id,
                    error: error.to_string(),
                    will_retry: true,
                });
                self.resolver.enqueue_if_ready(&task, self.store.as_ref());
            }
            RetryDecision::Exhausted { limit } => {
                let reason = format!(
                    "{}: {}",
                    Error::RetryLimitExceeded { task: *id, limit },
                    error
                );
                self.fail_terminal(id, &reason);
            }
        }
        Ok(())
    }

    /// Fail a task without retry and block everything downstream.
    fn fail_terminal(&mut self, id: &TaskId, reason: &str) {
        let task = match self.mutate(id, |t| t.fail(reason)) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task = %id.short(), error = %e, "cannot fail task");
                return;
            }
        };
        self.resolver.dequeue(id);
        self.deadlines.clear_task(id);
        tracing::warn!(task = %id.short(), reason, "task failed");
        self.events.publish(OrchestratorEvent::TaskFailed {
            task: *id,
            error: reason.to_string(),
            will_retry: false,
        });
        self.block_downstream(id);
        if let Some(parent) = task.parent {
            self.child_finished(parent, *id, Err(reason.to_string()));
        }
    }

    fn finish_cancelled(&mut self, id: &TaskId, reason: &str) {
        let reason = if reason == "cancelled" {
            reason.to_string()
        } else {
            format!("cancelled: {}", reason)
        };
        self.fail_terminal(id, &reason);
        self.events.publish(OrchestratorEvent::TaskCancelled { task: *id });
    }

    fn block_downstream(&mut self, cause: &TaskId) {
        let reason = format!("dependency {} failed", cause.short());
        for dependent in self.resolver.propagate_failure(cause, self.store.as_ref()) {
            if self.mutate(&dependent, |t| t.block(&reason)).is_ok() {
                tracing::info!(task = %dependent.short(), cause = %cause.short(), "task blocked");
                self.events.publish(OrchestratorEvent::TaskBlocked {
                    task: dependent,
                    cause: *cause,
                });
            }
        }
    }

    // ---- admin ----

    /// Cancel a task.
    ///
    /// Pending tasks fail at once. In-flight single-agent tasks have their
    /// assignment cancelled and fail when the agent acknowledges or the
    /// deadline passes. Collaborative tasks abandon their session at once.
    pub fn cancel(&mut self, id: &TaskId) -> Result<()> {
        let task = self.store.get(id).ok_or(Error::TaskNotFound(*id))?;
        match task.status {
            TaskStatus::Pending => {
                self.resolver.dequeue(id);
                self.finish_cancelled(id, "cancelled");
            }
            TaskStatus::Assigned | TaskStatus::InProgress => {
                self.mutate(id, |t| {
                    t.cancel_requested = true;
                    Ok(())
                })?;
                match task.session {
                    Some(session) => {
                        let (holders, children) = self.coordinator.abort(&session);
                        for agent in holders {
                            self.cancel_participant(*id, agent);
                        }
                        self.events.publish(OrchestratorEvent::SessionClosed {
                            session,
                            task: *id,
                            success: false,
                        });
                        self.finish_cancelled(id, "cancelled");
                        for child in children {
                            if let Err(e) = self.cancel(&child) {
                                tracing::debug!(task = %child.short(), error = %e, "child cancel skipped");
                            }
                        }
                    }
                    None => {
                        let agent = task.assigned_agent.ok_or(Error::TaskNotFound(*id))?;
                        if let Some(o) = self.outstanding.get(&(*id, agent)) {
                            o.cancel.cancel();
                        }
                        tracing::info!(task = %id.short(), "cancellation requested");
                    }
                }
            }
            _ => {
                return Err(Error::InvalidTransition {
                    from: task.status.kind().to_string(),
                    to: "cancelled".to_string(),
                })
            }
        }
        self.tick();
        Ok(())
    }

    /// Re-open a terminally failed task with a fresh retry budget. Its
    /// blocked dependents return to pending.
    pub fn retry(&mut self, id: &TaskId) -> Result<()> {
        let task = self.store.get(id).ok_or(Error::TaskNotFound(*id))?;
        if task.status.kind() != StatusKind::Failed {
            return Err(Error::InvalidTransition {
                from: task.status.kind().to_string(),
                to: "pending".to_string(),
            });
        }
        let task = self.mutate(id, |t| {
            t.reset();
            t.retries = 0;
            t.error = None;
            t.output = None;
            Ok(())
        })?;
        self.resolver.enqueue_if_ready(&task, self.store.as_ref());

        let unblocked = self.resolver.on_reopened(id, self.store.as_ref());
        for dependent in &unblocked {
            if let Ok(t) = self.mutate(dependent, |t| {
                t.reset();
                Ok(())
            }) {
                self.resolver.enqueue_if_ready(&t, self.store.as_ref());
            }
        }
        tracing::info!(task = %id.short(), unblocked = unblocked.len(), "task re-opened");
        self.tick();
        Ok(())
    }

    /// Fail every dispatch whose deadline has passed. Returns how many
    /// timed out.
    pub fn check_timeouts(&mut self, now: Instant) -> usize {
        let mut count = 0;
        for deadline in self.deadlines.take_expired(now) {
            let key = (deadline.task, deadline.agent);
            let Some(o) = self.outstanding.get(&key) else {
                continue;
            };
            o.cancel.cancel();
            count += 1;
            let error = Error::DispatchTimeout {
                task: deadline.task,
                agent: deadline.agent,
                timeout: deadline.timeout,
            };
            tracing::warn!(error = %error, "dispatch timed out");
            if let Err(e) = self.on_finished(deadline.task, deadline.agent, Err(error.to_string()))
            {
                tracing::warn!(task = %deadline.task.short(), error = %e, "timeout handling failed");
            }
        }
        if count > 0 {
            self.tick();
        }
        count
    }

    // ---- capacity & balancing ----

    /// Record a utilization sample for the balancer.
    pub fn sample_load(&mut self) {
        self.balancer.sample(&self.capacity.snapshot());
    }

    pub fn capacity_report(&self) -> CapacityReport {
        let mut report = CapacityReport::from_snapshots(self.capacity.snapshot());
        report.pending_tasks = self.resolver.ready().len();
        let classes = self.balancer.classify(&self.capacity);
        report.bottlenecks = classes.bottlenecks;
        report.underutilized = classes.underutilized;
        report
    }

    fn is_movable(&self, task: &TaskId) -> bool {
        let Some(t) = self.store.get(task) else {
            return false;
        };
        let started = t
            .assigned_agent
            .and_then(|a| self.outstanding.get(&(t.id, a)))
            .map_or(false, |o| o.started);
        t.status == TaskStatus::Assigned && t.session.is_none() && !t.is_collaborative() && !started
    }

    fn fits(&self, task: &TaskId, agent: &AgentId) -> bool {
        let (Some(t), Some(a)) = (self.store.get(task), self.registry.get(agent)) else {
            return false;
        };
        a.status.is_schedulable()
            && t.pinned_agent.map_or(true, |p| p == a.id)
            && a.capabilities.score(t.task_type, &t.requirements).is_some()
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.balancer.recommend(
            &self.registry,
            &self.capacity,
            |t| self.is_movable(t),
            |t, a| self.fits(t, a),
        )
    }

    /// Carry out every redistribution recommendation.
    pub fn rebalance(&mut self) -> Vec<Migration> {
        let mut moved = Vec::new();
        for rec in self.recommendations() {
            let Recommendation::Redistribute { from, to, tasks } = rec else {
                continue;
            };
            for task in tasks {
                match self.migrate(task, from, to) {
                    Ok(()) => moved.push(Migration { task, from, to }),
                    Err(e) => {
                        tracing::debug!(task = %task.short(), error = %e, "migration skipped")
                    }
                }
            }
        }
        if !moved.is_empty() {
            tracing::info!(moved = moved.len(), "rebalance complete");
        }
        moved
    }

    /// Move an assigned, not yet started task from one agent to another.
    pub fn migrate(&mut self, task_id: TaskId, from: AgentId, to: AgentId) -> Result<()> {
        let task = self
            .store
            .get(&task_id)
            .ok_or(Error::TaskNotFound(task_id))?;
        if !self.is_movable(&task_id) || task.assigned_agent != Some(from) {
            return Err(Error::Validation(format!(
                "task {} cannot move from agent {}",
                task_id.short(),
                from.short()
            )));
        }
        if !self.candidates(&task).contains(&to) {
            return Err(Error::AgentUnavailable(task_id));
        }

        self.capacity.reserve(&to, task_id)?;
        if let Err(e) = self.capacity.cancel_reservation(&from, &task_id) {
            let _ = self.capacity.cancel_reservation(&to, &task_id);
            return Err(e);
        }
        if let Some(o) = self.outstanding.remove(&(task_id, from)) {
            o.cancel.cancel();
        }
        self.deadlines.clear(&task_id, &from);
        let task = self.mutate(&task_id, |t| t.reassign(to))?;
        self.refresh_agent_status(&from);
        self.refresh_agent_status(&to);

        tracing::info!(
            task = %task_id.short(),
            from = %from.short(),
            to = %to.short(),
            "task reassigned"
        );
        self.events.publish(OrchestratorEvent::TaskReassigned {
            task: task_id,
            from,
            to,
        });
        let input = json!({ "prompt": task.prompt });
        self.dispatch(&task, to, None, Stage::Execute, input);
        Ok(())
    }

    // ---- persistence & shutdown ----

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.registry.iter().cloned().collect(),
            self.store.scan(&TaskFilter::all()),
        )
    }

    /// Load a snapshot into an idle scheduler. In-flight tasks return to
    /// pending; unfinished children of an unfinished parent are dropped as
    /// failed since their session is gone. Returns the number of tasks that
    /// will run again.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<usize> {
        for mut agent in snapshot.agents {
            if self.registry.contains(&agent.id) {
                continue;
            }
            agent.status = match agent.status {
                AgentStatus::Busy => AgentStatus::Idle,
                other => other,
            };
            let (id, max) = (agent.id, agent.max_concurrent_tasks);
            self.registry.register(agent)?;
            self.capacity.add_agent(id, max);
        }

        let finished: HashMap<TaskId, bool> = snapshot
            .tasks
            .iter()
            .map(|t| (t.id, t.is_finished()))
            .collect();
        let mut tasks = Vec::with_capacity(snapshot.tasks.len());
        let mut resumed = 0;
        for mut task in snapshot.tasks {
            if self.store.contains(&task.id) {
                return Err(Error::TaskExists(task.id));
            }
            if !task.is_finished() {
                let orphaned = task
                    .parent
                    .is_some_and(|p| !finished.get(&p).copied().unwrap_or(false));
                task.reset();
                if orphaned {
                    task.fail("parent session lost on restart")?;
                } else {
                    resumed += 1;
                }
            }
            self.next_sequence = self.next_sequence.max(task.sequence + 1);
            tasks.push(task);
        }
        self.resolver.register_batch(&tasks, self.store.as_ref())?;
        for task in tasks {
            self.store.insert(task)?;
        }
        tracing::info!(resumed, "snapshot restored");
        self.tick();
        Ok(resumed)
    }

    /// Stop placing new work. Outstanding dispatches still report back.
    pub fn begin_drain(&mut self) {
        self.draining = true;
    }

    /// Cancel every outstanding assignment.
    pub fn cancel_all(&mut self) {
        self.root_cancel.cancel();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("agents", &self.registry.len())
            .field("tasks", &self.store.len())
            .field("ready", &self.resolver.ready().len())
            .field("in_flight", &self.outstanding.len())
            .field("sessions", &self.coordinator.active_sessions())
            .finish()
    }
}
