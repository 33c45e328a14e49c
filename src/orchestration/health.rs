//! Dispatch health: deadlines and retry decisions.
//!
//! Every assignment gets a deadline of `agent.timeout` from the moment it is
//! reserved. The scheduler sweeps expired deadlines on each tick and treats
//! them as `DispatchTimeout` failures. Whether a failure is retried is
//! decided by [`RetryPolicy`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::agent::AgentId;
use crate::core::task::{Task, TaskId};

/// Default maximum number of automatic retries.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One outstanding dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub task: TaskId,
    pub agent: AgentId,
    pub attempt: u32,
    pub timeout: Duration,
    pub expires_at: Instant,
}

/// Outstanding dispatch deadlines keyed by task and agent.
///
/// Collaborative tasks hold one deadline per participant, so the key
/// includes the agent.
#[derive(Debug, Default)]
pub struct DeadlineTracker {
    deadlines: HashMap<(TaskId, AgentId), Deadline>,
}

impl DeadlineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock for a dispatch, replacing any earlier deadline for
    /// the same task on the same agent.
    pub fn track(&mut self, task: TaskId, agent: AgentId, attempt: u32, timeout: Duration) {
        self.track_at(task, agent, attempt, timeout, Instant::now());
    }

    pub fn track_at(
        &mut self,
        task: TaskId,
        agent: AgentId,
        attempt: u32,
        timeout: Duration,
        now: Instant,
    ) {
        self.deadlines.insert(
            (task, agent),
            Deadline {
                task,
                agent,
                attempt,
                timeout,
                expires_at: now + timeout,
            },
        );
    }

    pub fn clear(&mut self, task: &TaskId, agent: &AgentId) -> Option<Deadline> {
        self.deadlines.remove(&(*task, *agent))
    }

    /// Forget every deadline of a task.
    pub fn clear_task(&mut self, task: &TaskId) {
        self.deadlines.retain(|(t, _), _| t != task);
    }

    pub fn get(&self, task: &TaskId, agent: &AgentId) -> Option<&Deadline> {
        self.deadlines.get(&(*task, *agent))
    }

    /// Remove and return every deadline that has passed, oldest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Deadline> {
        let mut expired: Vec<Deadline> = self
            .deadlines
            .values()
            .filter(|d| d.expires_at <= now)
            .copied()
            .collect();
        expired.sort_by_key(|d| d.expires_at);
        for d in &expired {
            self.deadlines.remove(&(d.task, d.agent));
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the task to pending; carries the retry number.
    Retry(u32),
    /// The retry budget is spent; the failure is terminal.
    Exhausted { limit: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide what to do with a task that just failed. Cancelled tasks are
    /// never retried.
    pub fn decide(&self, task: &Task) -> RetryDecision {
        if task.cancel_requested || task.retries >= self.max_retries {
            RetryDecision::Exhausted {
                limit: self.max_retries,
            }
        } else {
            RetryDecision::Retry(task.retries + 1)
        }
    }
}
