//! Capacity tracking.
//!
//! Per agent the tracker keeps the set of reserved-but-not-started tasks
//! (`queued`) and started tasks (`running`), and guarantees
//! `|running| + |queued| <= max_concurrent_tasks`. Check-and-insert happens in
//! a single `&mut self` call so the invariant also holds behind a mutex.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::core::task::{TaskId, TaskType};
use crate::error::{Error, Result};

/// Success/failure counts for one task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    pub succeeded: u64,
    pub failed: u64,
}

/// Rolling performance statistics for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Exponential moving average; the first sample seeds it.
    pub avg_duration_ms: Option<f64>,
    pub by_type: BTreeMap<TaskType, TypeStats>,
}

impl AgentStats {
    /// Smoothed success rate for a task type. An agent with no history for
    /// the type scores 0.5.
    pub fn success_rate(&self, task_type: TaskType) -> f64 {
        let s = self.by_type.get(&task_type).copied().unwrap_or_default();
        (s.succeeded as f64 + 1.0) / ((s.succeeded + s.failed) as f64 + 2.0)
    }

    fn record(&mut self, outcome: &ReleaseOutcome, duration: Duration, alpha: f64) {
        self.processed += 1;
        let by_type = self.by_type.entry(outcome.task_type).or_default();
        if outcome.success {
            self.succeeded += 1;
            by_type.succeeded += 1;
        } else {
            self.failed += 1;
            by_type.failed += 1;
        }

        let sample = duration.as_secs_f64() * 1000.0;
        self.avg_duration_ms = Some(match self.avg_duration_ms {
            None => sample,
            Some(avg) => alpha * sample + (1.0 - alpha) * avg,
        });
    }
}

/// What happened to a released reservation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleaseOutcome {
    pub success: bool,
    pub task_type: TaskType,
    /// Measured from `mark_started` (or the reservation) when not given.
    pub duration: Option<Duration>,
}

impl ReleaseOutcome {
    pub fn success(task_type: TaskType) -> Self {
        Self {
            success: true,
            task_type,
            duration: None,
        }
    }

    pub fn failure(task_type: TaskType) -> Self {
        Self {
            success: false,
            task_type,
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[derive(Debug)]
struct AgentLoad {
    max: u32,
    running: BTreeSet<TaskId>,
    /// Reservation order is kept so migration takes the newest first.
    queued: Vec<TaskId>,
    since: HashMap<TaskId, Instant>,
    stats: AgentStats,
}

impl AgentLoad {
    fn new(max: u32) -> Self {
        Self {
            max,
            running: BTreeSet::new(),
            queued: Vec::new(),
            since: HashMap::new(),
            stats: AgentStats::default(),
        }
    }

    fn in_flight(&self) -> usize {
        self.running.len() + self.queued.len()
    }

    fn available(&self) -> u32 {
        (self.max as usize).saturating_sub(self.in_flight()) as u32
    }

    fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.running.len() as f64 / self.max as f64 * 100.0
    }

    fn holds(&self, task: &TaskId) -> bool {
        self.running.contains(task) || self.queued.contains(task)
    }

    /// Drop a reservation from either set. Returns whether it existed.
    fn drop_reservation(&mut self, task: &TaskId) -> bool {
        let was_running = self.running.remove(task);
        let was_queued = match self.queued.iter().position(|t| t == task) {
            Some(pos) => {
                self.queued.remove(pos);
                true
            }
            None => false,
        };
        was_running || was_queued
    }
}

/// Point-in-time view of one agent's capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub agent: AgentId,
    pub max_concurrent_tasks: u32,
    pub running: Vec<TaskId>,
    pub queued: Vec<TaskId>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_duration_ms: Option<f64>,
    pub utilization_percentage: f64,
    pub available_slots: u32,
}

/// Aggregate capacity across the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapacityReport {
    pub agents: Vec<CapacitySnapshot>,
    pub total_capacity: u32,
    pub used_capacity: u32,
    pub available_capacity: u32,
    pub queued_tasks: usize,
    /// Ready tasks with no placement yet.
    pub pending_tasks: usize,
    pub bottlenecks: Vec<AgentId>,
    pub underutilized: Vec<AgentId>,
}

impl CapacityReport {
    pub fn from_snapshots(agents: Vec<CapacitySnapshot>) -> Self {
        let total_capacity = agents.iter().map(|s| s.max_concurrent_tasks).sum();
        let available_capacity = agents.iter().map(|s| s.available_slots).sum();
        let used_capacity = agents
            .iter()
            .map(|s| (s.running.len() + s.queued.len()) as u32)
            .sum();
        let queued_tasks = agents.iter().map(|s| s.queued.len()).sum();
        Self {
            agents,
            total_capacity,
            used_capacity,
            available_capacity,
            queued_tasks,
            ..Default::default()
        }
    }

    pub fn agent(&self, id: &AgentId) -> Option<&CapacitySnapshot> {
        self.agents.iter().find(|s| &s.agent == id)
    }
}

/// Per-agent slot accounting and performance statistics.
#[derive(Debug)]
pub struct CapacityTracker {
    loads: BTreeMap<AgentId, AgentLoad>,
    /// EMA smoothing factor in `(0, 1]`.
    alpha: f64,
}

impl CapacityTracker {
    pub fn new(alpha: f64) -> Self {
        Self {
            loads: BTreeMap::new(),
            alpha: alpha.clamp(f64::EPSILON, 1.0),
        }
    }

    fn load(&self, agent: &AgentId) -> Result<&AgentLoad> {
        self.loads
            .get(agent)
            .ok_or(Error::AgentNotFound { id: *agent })
    }

    fn load_mut(&mut self, agent: &AgentId) -> Result<&mut AgentLoad> {
        self.loads
            .get_mut(agent)
            .ok_or(Error::AgentNotFound { id: *agent })
    }

    /// Start tracking an agent. Re-adding keeps its existing state.
    pub fn add_agent(&mut self, agent: AgentId, max: u32) {
        self.loads.entry(agent).or_insert_with(|| AgentLoad::new(max));
    }

    /// Stop tracking an agent. Refused while it holds reservations.
    pub fn remove_agent(&mut self, agent: &AgentId) -> Result<()> {
        let load = self.load(agent)?;
        if load.in_flight() > 0 {
            return Err(Error::AgentBusy {
                id: *agent,
                in_flight: load.in_flight(),
            });
        }
        self.loads.remove(agent);
        Ok(())
    }

    /// Reserve a slot for `task` on `agent`.
    ///
    /// # Errors
    /// - `AgentNotFound` for an untracked agent
    /// - `CapacityExceeded` when no slot is free
    /// - `Validation` if the task already holds a slot on this agent
    pub fn reserve(&mut self, agent: &AgentId, task: TaskId) -> Result<()> {
        let load = self.load_mut(agent)?;
        if load.holds(&task) {
            return Err(Error::Validation(format!(
                "task {} already reserved on agent {}",
                task.short(),
                agent.short()
            )));
        }
        if load.available() == 0 {
            return Err(Error::CapacityExceeded {
                agent: *agent,
                max: load.max,
            });
        }
        load.queued.push(task);
        load.since.insert(task, Instant::now());
        Ok(())
    }

    /// Move a reservation from `queued` to `running`. Idempotent for a task
    /// that is already running.
    pub fn mark_started(&mut self, agent: &AgentId, task: &TaskId) -> Result<()> {
        let load = self.load_mut(agent)?;
        if load.running.contains(task) {
            return Ok(());
        }
        let pos = load
            .queued
            .iter()
            .position(|t| t == task)
            .ok_or(Error::ReservationNotFound {
                agent: *agent,
                task: *task,
            })?;
        load.queued.remove(pos);
        load.running.insert(*task);
        load.since.insert(*task, Instant::now());
        Ok(())
    }

    /// Release a reservation and record its outcome. Returns the duration
    /// that was recorded.
    ///
    /// Releasing a task that holds no reservation fails with
    /// `ReservationNotFound` and changes nothing.
    pub fn release(
        &mut self,
        agent: &AgentId,
        task: &TaskId,
        outcome: ReleaseOutcome,
    ) -> Result<Duration> {
        let alpha = self.alpha;
        let load = self.load_mut(agent)?;
        if !load.drop_reservation(task) {
            return Err(Error::ReservationNotFound {
                agent: *agent,
                task: *task,
            });
        }
        let measured = load
            .since
            .remove(task)
            .map(|at| at.elapsed())
            .unwrap_or_default();
        let duration = outcome.duration.unwrap_or(measured);
        load.stats.record(&outcome, duration, alpha);
        Ok(duration)
    }

    /// Drop a reservation without touching statistics.
    pub fn cancel_reservation(&mut self, agent: &AgentId, task: &TaskId) -> Result<()> {
        let load = self.load_mut(agent)?;
        if !load.drop_reservation(task) {
            return Err(Error::ReservationNotFound {
                agent: *agent,
                task: *task,
            });
        }
        load.since.remove(task);
        Ok(())
    }

    /// Change an agent's slot count.
    ///
    /// Rejected when `max` is zero or below the agent's current in-flight
    /// count; shrinking never evicts work.
    pub fn set_max_concurrent(&mut self, agent: &AgentId, max: u32) -> Result<()> {
        let load = self.load_mut(agent)?;
        if max == 0 {
            return Err(Error::Validation(
                "max_concurrent_tasks must be positive".to_string(),
            ));
        }
        if (max as usize) < load.in_flight() {
            return Err(Error::AgentBusy {
                id: *agent,
                in_flight: load.in_flight(),
            });
        }
        load.max = max;
        Ok(())
    }

    /// Free slots; zero for an unknown agent.
    pub fn available_slots(&self, agent: &AgentId) -> u32 {
        self.loads.get(agent).map_or(0, AgentLoad::available)
    }

    /// `running / max * 100`; zero for an unknown agent.
    pub fn utilization(&self, agent: &AgentId) -> f64 {
        self.loads.get(agent).map_or(0.0, AgentLoad::utilization)
    }

    pub fn in_flight(&self, agent: &AgentId) -> usize {
        self.loads.get(agent).map_or(0, AgentLoad::in_flight)
    }

    pub fn is_running(&self, agent: &AgentId, task: &TaskId) -> bool {
        self.loads
            .get(agent)
            .is_some_and(|l| l.running.contains(task))
    }

    pub fn is_queued(&self, agent: &AgentId, task: &TaskId) -> bool {
        self.loads
            .get(agent)
            .is_some_and(|l| l.queued.contains(task))
    }

    /// Queued tasks in reservation order.
    pub fn queued(&self, agent: &AgentId) -> &[TaskId] {
        self.loads
            .get(agent)
            .map(|l| l.queued.as_slice())
            .unwrap_or(&[])
    }

    pub fn stats(&self, agent: &AgentId) -> Option<&AgentStats> {
        self.loads.get(agent).map(|l| &l.stats)
    }

    pub fn success_rate(&self, agent: &AgentId, task_type: TaskType) -> f64 {
        self.stats(agent)
            .map_or(0.5, |s| s.success_rate(task_type))
    }

    pub fn agent_snapshot(&self, agent: &AgentId) -> Option<CapacitySnapshot> {
        self.loads.get(agent).map(|load| CapacitySnapshot {
            agent: *agent,
            max_concurrent_tasks: load.max,
            running: load.running.iter().copied().collect(),
            queued: load.queued.clone(),
            processed: load.stats.processed,
            succeeded: load.stats.succeeded,
            failed: load.stats.failed,
            avg_duration_ms: load.stats.avg_duration_ms,
            utilization_percentage: load.utilization(),
            available_slots: load.available(),
        })
    }

    /// Snapshots of every agent, in ID order.
    pub fn snapshot(&self) -> Vec<CapacitySnapshot> {
        self.loads
            .keys()
            .filter_map(|id| self.agent_snapshot(id))
            .collect()
    }
}
