//! Agent registry.
//!
//! Holds every known agent with its declared capabilities and live status.
//! Agents are kept in ID order so that iteration, and therefore tie-breaking
//! during selection, is deterministic.

use std::collections::BTreeMap;

use crate::agent::{Agent, AgentId, AgentStatus};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentId, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent.
    ///
    /// # Errors
    /// - `Validation` if the agent declares zero capacity
    /// - `AgentExists` if the ID is already registered
    pub fn register(&mut self, agent: Agent) -> Result<()> {
        if agent.max_concurrent_tasks == 0 {
            return Err(Error::Validation(format!(
                "agent {} must accept at least one task",
                agent.name
            )));
        }
        if self.agents.contains_key(&agent.id) {
            return Err(Error::AgentExists { id: agent.id });
        }
        tracing::info!(
            agent = %agent.id.short(),
            name = %agent.name,
            kind = %agent.kind,
            capacity = agent.max_concurrent_tasks,
            "agent registered"
        );
        self.agents.insert(agent.id, agent);
        Ok(())
    }

    /// Remove an agent. The caller checks that nothing is in flight on it.
    pub fn remove(&mut self, id: &AgentId) -> Result<Agent> {
        let agent = self
            .agents
            .remove(id)
            .ok_or(Error::AgentNotFound { id: *id })?;
        tracing::info!(agent = %id.short(), "agent unregistered");
        Ok(agent)
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn require(&self, id: &AgentId) -> Result<&Agent> {
        self.agents.get(id).ok_or(Error::AgentNotFound { id: *id })
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Agents in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Agents the scheduler may place work on.
    pub fn schedulable(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values().filter(|a| a.status.is_schedulable())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Set the live status. Returns the previous status.
    pub fn set_status(&mut self, id: &AgentId, status: AgentStatus) -> Result<AgentStatus> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(Error::AgentNotFound { id: *id })?;
        let previous = agent.status;
        if previous != status {
            tracing::debug!(agent = %id.short(), from = %previous, to = %status, "agent status");
            agent.status = status;
        }
        Ok(previous)
    }

    /// Record a new declared capacity. Validation against in-flight work is
    /// done by the capacity tracker.
    pub fn set_capacity(&mut self, id: &AgentId, max_concurrent_tasks: u32) -> Result<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or(Error::AgentNotFound { id: *id })?;
        agent.max_concurrent_tasks = max_concurrent_tasks;
        Ok(())
    }
}
