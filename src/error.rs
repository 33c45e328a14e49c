use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    TaskExists(TaskId),

    #[error("Agent not found: {id}")]
    AgentNotFound { id: AgentId },

    #[error("Agent already registered: {id}")]
    AgentExists { id: AgentId },

    #[error("Agent {id} still holds {in_flight} in-flight task(s)")]
    AgentBusy { id: AgentId, in_flight: usize },

    #[error("Agent {agent} has no free capacity (max: {max})")]
    CapacityExceeded { agent: AgentId, max: u32 },

    #[error("No reservation for task {task} on agent {agent}")]
    ReservationNotFound { agent: AgentId, task: TaskId },

    #[error("No capable agent with free capacity for task {0}")]
    AgentUnavailable(TaskId),

    #[error("Agent {agent} did not finish task {task} within {timeout:?}")]
    DispatchTimeout {
        task: TaskId,
        agent: AgentId,
        timeout: std::time::Duration,
    },

    #[error("Collaboration quorum not reached: {0}")]
    CollaborationQuorumFailure(String),

    #[error("Task {task} exhausted its retry limit ({limit})")]
    RetryLimitExceeded { task: TaskId, limit: u32 },

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Orchestrator channel closed")]
    ChannelClosed,

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
