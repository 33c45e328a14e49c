//! Agent data model.
//!
//! An agent is a worker with bounded concurrency and a declared capability
//! profile. The scheduler only ever looks at the profile to score how well an
//! agent fits a task; what the agent actually does with a task is opaque.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::{Requirements, TaskType};

/// Default execution timeout for an agent that does not declare one.
pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 300_000;

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Create a new unique agent identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Live status of an agent.
///
/// `Idle` and `Busy` follow in-flight accounting. `Error` and `Offline` are
/// set administratively and exclude the agent from selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
    Offline,
}

impl AgentStatus {
    /// Whether the scheduler may place work on an agent in this status.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// How demanding a task an agent can take on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Basic,
    #[default]
    Standard,
    Advanced,
}

/// Declared capability profile of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Task types the agent accepts. Empty means a generalist.
    #[serde(default)]
    pub task_types: BTreeSet<TaskType>,
    /// Highest complexity the agent handles.
    #[serde(default)]
    pub complexity: ComplexityTier,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub frameworks: BTreeSet<String>,
}

const SPECIALIST_SCORE: f64 = 1.0;
const GENERALIST_SCORE: f64 = 0.6;
const AFFINITY_BONUS: f64 = 0.1;
const TIER_HEADROOM_PENALTY: f64 = 0.05;

impl Capabilities {
    /// Score how well this profile fits a task.
    ///
    /// Returns `None` when the agent cannot take the task at all: the task
    /// type is not accepted, or the task needs a higher complexity tier.
    /// Higher scores are better. Overqualified agents score slightly lower so
    /// advanced agents stay free for work only they can do.
    pub fn score(&self, task_type: TaskType, req: &Requirements) -> Option<f64> {
        if self.complexity < req.complexity {
            return None;
        }

        let mut score = if self.task_types.is_empty() {
            GENERALIST_SCORE
        } else if self.task_types.contains(&task_type) {
            SPECIALIST_SCORE
        } else {
            return None;
        };

        score += AFFINITY_BONUS
            * req
                .languages
                .iter()
                .filter(|l| self.languages.contains(*l))
                .count() as f64;
        score += AFFINITY_BONUS
            * req
                .frameworks
                .iter()
                .filter(|f| self.frameworks.contains(*f))
                .count() as f64;

        let headroom = self.complexity as u8 - req.complexity as u8;
        score -= TIER_HEADROOM_PENALTY * headroom as f64;

        Some(score)
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    /// Agent type label, used to group scale recommendations.
    pub kind: String,
    pub capabilities: Capabilities,
    pub max_concurrent_tasks: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub status: AgentStatus,
}

impl Agent {
    /// Create an idle generalist agent with a single slot.
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            id: AgentId::new(),
            name: name.to_string(),
            kind: kind.to_string(),
            capabilities: Capabilities::default(),
            max_concurrent_tasks: 1,
            timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
            status: AgentStatus::Idle,
        }
    }

    pub fn with_capacity(mut self, max_concurrent_tasks: u32) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_task_types<I: IntoIterator<Item = TaskType>>(mut self, types: I) -> Self {
        self.capabilities.task_types = types.into_iter().collect();
        self
    }

    pub fn with_complexity(mut self, tier: ComplexityTier) -> Self {
        self.capabilities.complexity = tier;
        self
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_frameworks<I, S>(mut self, frameworks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.frameworks = frameworks.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
