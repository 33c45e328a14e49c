//! Orchestration runtime.
//!
//! One tokio task owns the [`Scheduler`] and is the only writer. It is fed
//! by:
//! - commands from [`OrchestratorHandle`]s
//! - agent reports from running assignments
//! - the periodic tick (timeouts, load samples, placement)
//! - optionally, the auto-rebalance timer
//!
//! Assignments leave on an unbounded channel; a dispatcher task runs each
//! one in its own task through the [`AgentExecutor`].

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::agent::{Agent, AgentId, AgentStatus};
use crate::config::Config;
use crate::core::task::{Task, TaskId, TaskSpec};
use crate::error::{Error, Result};
use crate::events::{EventBus, OrchestratorEvent};
use crate::orchestration::balancer::Recommendation;
use crate::orchestration::capacity::CapacityReport;
use crate::orchestration::collaboration::ConsensusPolicy;
use crate::orchestration::executor::{
    run_assignment, AgentExecutor, AgentReport, Assignment, ProgressReporter,
};
use crate::orchestration::scheduler::{Migration, Scheduler, Submission};
use crate::state::{Snapshot, TaskFilter, TaskStore};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Submit(TaskSpec, Reply<Result<Submission>>),
    SubmitBatch(Vec<TaskSpec>, Reply<Result<Vec<Submission>>>),
    AddDependency(TaskId, TaskId, Reply<Result<()>>),
    RegisterAgent(Agent, Reply<Result<AgentId>>),
    UnregisterAgent(AgentId, Reply<Result<Agent>>),
    SetAgentStatus(AgentId, AgentStatus, Reply<Result<()>>),
    UpdateCapacity(AgentId, u32, Reply<Result<()>>),
    Rebalance(Reply<Vec<Migration>>),
    Recommendations(Reply<Vec<Recommendation>>),
    Capacity(Reply<CapacityReport>),
    Task(TaskId, Reply<Option<Task>>),
    Tasks(TaskFilter, Reply<Vec<Task>>),
    Cancel(TaskId, Reply<Result<()>>),
    Retry(TaskId, Reply<Result<()>>),
    Snapshot(Reply<Snapshot>),
    Restore(Snapshot, Reply<Result<usize>>),
    Shutdown(Reply<Snapshot>),
}

/// Builder for the orchestration loop.
pub struct Orchestrator {
    scheduler: Scheduler,
    dispatch_rx: mpsc::UnboundedReceiver<Assignment>,
    executor: Arc<dyn AgentExecutor>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Box<dyn TaskStore>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Ok(Self {
            scheduler: Scheduler::new(config, store, dispatch_tx),
            dispatch_rx,
            executor,
        })
    }

    pub fn with_consensus_policy(mut self, policy: Box<dyn ConsensusPolicy>) -> Self {
        self.scheduler = self.scheduler.with_consensus_policy(policy);
        self
    }

    /// Start the loop and the dispatcher. Must be called inside a tokio
    /// runtime.
    pub fn spawn(self) -> OrchestratorHandle {
        let Orchestrator {
            scheduler,
            mut dispatch_rx,
            executor,
        } = self;
        let (cmd_tx, cmd_rx) = mpsc::channel(scheduler.config().runtime.command_buffer.max(1));
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let events = scheduler.events().clone();

        let dispatcher_reports = report_tx.clone();
        tokio::spawn(async move {
            while let Some(assignment) = dispatch_rx.recv().await {
                tracing::trace!(
                    task = %assignment.task.short(),
                    agent = %assignment.agent.short(),
                    stage = ?assignment.stage,
                    "dispatching"
                );
                let executor = Arc::clone(&executor);
                let reporter = ProgressReporter::new(dispatcher_reports.clone(), &assignment);
                tokio::spawn(async move {
                    run_assignment(executor.as_ref(), assignment, reporter).await;
                });
            }
            tracing::debug!("dispatcher stopped");
        });

        let runtime = Runtime {
            scheduler,
            commands: cmd_rx,
            reports: report_rx,
            _report_tx: report_tx,
        };
        tokio::spawn(runtime.run());
        tracing::info!("orchestrator started");

        OrchestratorHandle { tx: cmd_tx, events }
    }
}

struct Runtime {
    scheduler: Scheduler,
    commands: mpsc::Receiver<Command>,
    reports: mpsc::UnboundedReceiver<AgentReport>,
    // Keeps the report channel open while no assignment is running
    _report_tx: mpsc::UnboundedSender<AgentReport>,
}

struct Drain {
    deadline: Instant,
    replies: Vec<Reply<Snapshot>>,
}

impl Runtime {
    async fn run(mut self) {
        let config = self.scheduler.config().clone();
        let mut tick = tokio::time::interval(config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rebalance = tokio::time::interval(config.rebalance_interval());
        rebalance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let auto_rebalance = config.balancer.auto_rebalance;

        let mut drain: Option<Drain> = None;
        let mut commands_open = true;

        loop {
            if let Some(d) = &drain {
                if self.scheduler.in_flight() == 0 || Instant::now() >= d.deadline {
                    break;
                }
            }
            let drain_deadline = drain.as_ref().map(|d| d.deadline);

            tokio::select! {
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(Command::Shutdown(reply)) => {
                        tracing::info!(in_flight = self.scheduler.in_flight(), "shutdown requested, draining");
                        self.scheduler.begin_drain();
                        drain
                            .get_or_insert_with(|| Drain {
                                deadline: Instant::now() + config.drain_timeout(),
                                replies: Vec::new(),
                            })
                            .replies
                            .push(reply);
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        commands_open = false;
                        if drain.is_none() {
                            tracing::info!("all handles dropped, draining");
                            self.scheduler.begin_drain();
                            drain = Some(Drain {
                                deadline: Instant::now() + config.drain_timeout(),
                                replies: Vec::new(),
                            });
                        }
                    }
                },
                Some(report) = self.reports.recv() => {
                    self.scheduler.handle_report(report);
                }
                _ = tick.tick() => {
                    self.scheduler.check_timeouts(Instant::now());
                    self.scheduler.sample_load();
                    self.scheduler.tick();
                }
                _ = rebalance.tick(), if auto_rebalance && drain.is_none() => {
                    self.scheduler.rebalance();
                }
                _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => {}
            }
        }

        self.finish(&config, drain.map(|d| d.replies).unwrap_or_default())
            .await;
    }

    async fn finish(mut self, config: &Config, replies: Vec<Reply<Snapshot>>) {
        let abandoned = self.scheduler.in_flight();
        if abandoned > 0 {
            tracing::warn!(abandoned, "drain timeout reached, cancelling outstanding work");
        }
        self.scheduler.cancel_all();
        let snapshot = self.scheduler.snapshot();
        if let Some(path) = config.state_path() {
            match snapshot.save(&path).await {
                Ok(()) => tracing::info!(
                    path = %path.display(),
                    unfinished = snapshot.unfinished().count(),
                    "state saved"
                ),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to save state"),
            }
        }
        for reply in replies {
            let _ = reply.send(snapshot.clone());
        }
        tracing::info!("orchestrator stopped");
    }

    fn handle(&mut self, cmd: Command) {
        let s = &mut self.scheduler;
        // A dropped reply receiver only means the caller stopped waiting
        match cmd {
            Command::Submit(spec, reply) => {
                let _ = reply.send(s.submit(spec));
            }
            Command::SubmitBatch(specs, reply) => {
                let _ = reply.send(s.submit_batch(specs));
            }
            Command::AddDependency(from, to, reply) => {
                let _ = reply.send(s.add_dependency(&from, &to));
            }
            Command::RegisterAgent(agent, reply) => {
                let _ = reply.send(s.register_agent(agent));
            }
            Command::UnregisterAgent(id, reply) => {
                let _ = reply.send(s.unregister_agent(&id));
            }
            Command::SetAgentStatus(id, status, reply) => {
                let _ = reply.send(s.set_agent_status(&id, status));
            }
            Command::UpdateCapacity(id, max, reply) => {
                let _ = reply.send(s.update_capacity(&id, max));
            }
            Command::Rebalance(reply) => {
                s.sample_load();
                let _ = reply.send(s.rebalance());
            }
            Command::Recommendations(reply) => {
                let _ = reply.send(s.recommendations());
            }
            Command::Capacity(reply) => {
                let _ = reply.send(s.capacity_report());
            }
            Command::Task(id, reply) => {
                let _ = reply.send(s.task(&id));
            }
            Command::Tasks(filter, reply) => {
                let _ = reply.send(s.tasks(&filter));
            }
            Command::Cancel(id, reply) => {
                let _ = reply.send(s.cancel(&id));
            }
            Command::Retry(id, reply) => {
                let _ = reply.send(s.retry(&id));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(s.snapshot());
            }
            Command::Restore(snapshot, reply) => {
                let _ = reply.send(s.restore(snapshot));
            }
            Command::Shutdown(_) => {}
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable client for a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
    events: EventBus,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Submit(..) => "Submit",
            Command::SubmitBatch(..) => "SubmitBatch",
            Command::AddDependency(..) => "AddDependency",
            Command::RegisterAgent(..) => "RegisterAgent",
            Command::UnregisterAgent(..) => "UnregisterAgent",
            Command::SetAgentStatus(..) => "SetAgentStatus",
            Command::UpdateCapacity(..) => "UpdateCapacity",
            Command::Rebalance(..) => "Rebalance",
            Command::Recommendations(..) => "Recommendations",
            Command::Capacity(..) => "Capacity",
            Command::Task(..) => "Task",
            Command::Tasks(..) => "Tasks",
            Command::Cancel(..) => "Cancel",
            Command::Retry(..) => "Retry",
            Command::Snapshot(..) => "Snapshot",
            Command::Restore(..) => "Restore",
            Command::Shutdown(..) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl OrchestratorHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub async fn submit(&self, spec: TaskSpec) -> Result<Submission> {
        self.request(|r| Command::Submit(spec, r)).await?
    }

    pub async fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<Submission>> {
        self.request(|r| Command::SubmitBatch(specs, r)).await?
    }

    pub async fn add_dependency(&self, from: TaskId, to: TaskId) -> Result<()> {
        self.request(|r| Command::AddDependency(from, to, r)).await?
    }

    pub async fn register_agent(&self, agent: Agent) -> Result<AgentId> {
        self.request(|r| Command::RegisterAgent(agent, r)).await?
    }

    pub async fn unregister_agent(&self, id: AgentId) -> Result<Agent> {
        self.request(|r| Command::UnregisterAgent(id, r)).await?
    }

    pub async fn set_agent_status(&self, id: AgentId, status: AgentStatus) -> Result<()> {
        self.request(|r| Command::SetAgentStatus(id, status, r))
            .await?
    }

    pub async fn update_capacity(&self, id: AgentId, max_concurrent_tasks: u32) -> Result<()> {
        self.request(|r| Command::UpdateCapacity(id, max_concurrent_tasks, r))
            .await?
    }

    /// Sample load and migrate queued work off bottlenecked agents.
    pub async fn rebalance(&self) -> Result<Vec<Migration>> {
        self.request(Command::Rebalance).await
    }

    pub async fn recommendations(&self) -> Result<Vec<Recommendation>> {
        self.request(Command::Recommendations).await
    }

    pub async fn capacity(&self) -> Result<CapacityReport> {
        self.request(Command::Capacity).await
    }

    pub async fn task(&self, id: TaskId) -> Result<Option<Task>> {
        self.request(|r| Command::Task(id, r)).await
    }

    pub async fn tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.request(|r| Command::Tasks(filter, r)).await
    }

    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        self.request(|r| Command::Cancel(id, r)).await?
    }

    pub async fn retry(&self, id: TaskId) -> Result<()> {
        self.request(|r| Command::Retry(id, r)).await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(Command::Snapshot).await
    }

    pub async fn restore(&self, snapshot: Snapshot) -> Result<usize> {
        self.request(|r| Command::Restore(snapshot, r)).await?
    }

    /// Drain in-flight work, persist state if configured, and stop. Returns
    /// the final snapshot.
    pub async fn shutdown(&self) -> Result<Snapshot> {
        self.request(Command::Shutdown).await
    }
}
