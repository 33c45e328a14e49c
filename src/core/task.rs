//! Task data model.
//!
//! Tasks are the units of work handed to agents. The orchestrator manages
//! their lifecycle only: prompt, output and error payloads are opaque.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentId, ComplexityTier};
use crate::error::{Error, Result};

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a collaboration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority. Critical work is scheduled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Queue rank: lower ranks are dequeued first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Kind of work a task represents.
///
/// Only consulted when scoring agents; it never changes control flow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Requirement,
    Design,
    #[default]
    Implementation,
    Test,
    Deployment,
    Review,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Requirement => write!(f, "requirement"),
            TaskType::Design => write!(f, "design"),
            TaskType::Implementation => write!(f, "implementation"),
            TaskType::Test => write!(f, "test"),
            TaskType::Deployment => write!(f, "deployment"),
            TaskType::Review => write!(f, "review"),
        }
    }
}

/// Capability requirements a task places on its agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub complexity: ComplexityTier,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub frameworks: BTreeSet<String>,
}

/// Multi-agent execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationStrategy {
    Sequential,
    Parallel,
    Hierarchical,
    Consensus,
}

impl std::fmt::Display for CollaborationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollaborationStrategy::Sequential => write!(f, "sequential"),
            CollaborationStrategy::Parallel => write!(f, "parallel"),
            CollaborationStrategy::Hierarchical => write!(f, "hierarchical"),
            CollaborationStrategy::Consensus => write!(f, "consensus"),
        }
    }
}

/// How many participant successes a collaboration needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "count")]
pub enum Quorum {
    All,
    #[default]
    Majority,
    AtLeast(usize),
}

impl Quorum {
    /// Number of successes required out of `total` participants.
    pub fn required(&self, total: usize) -> usize {
        match self {
            Quorum::All => total,
            Quorum::Majority => total / 2 + 1,
            Quorum::AtLeast(n) => (*n).min(total),
        }
    }

    pub fn is_met(&self, successes: usize, total: usize) -> bool {
        total > 0 && successes >= self.required(total)
    }
}

/// Request for multi-agent execution of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationSpec {
    pub strategy: CollaborationStrategy,
    pub min_agents: usize,
    /// Upper bound on the group size. Defaults to `min_agents`.
    #[serde(default)]
    pub max_agents: Option<usize>,
    /// Overrides the configured default quorum.
    #[serde(default)]
    pub quorum: Option<Quorum>,
}

impl CollaborationSpec {
    pub fn new(strategy: CollaborationStrategy, min_agents: usize) -> Self {
        Self {
            strategy,
            min_agents,
            max_agents: None,
            quorum: None,
        }
    }

    pub fn with_max_agents(mut self, max: usize) -> Self {
        self.max_agents = Some(max);
        self
    }

    pub fn with_quorum(mut self, quorum: Quorum) -> Self {
        self.quorum = Some(quorum);
        self
    }

    /// Largest group this spec accepts.
    pub fn group_limit(&self) -> usize {
        self.max_agents
            .unwrap_or(self.min_agents)
            .max(self.min_agents)
    }
}

/// Task status in its lifecycle.
///
/// `pending → assigned → in_progress → {completed | failed | blocked}`.
/// Failed and blocked tasks re-enter `Pending` through a retry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for dependencies or for a free agent.
    #[default]
    Pending,
    /// Capacity reserved on an agent, not started yet.
    Assigned,
    /// Being executed.
    InProgress,
    Completed,
    Failed {
        error: String,
    },
    /// A dependency failed terminally.
    Blocked {
        reason: String,
    },
}

/// Payload-free view of [`TaskStatus`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            TaskStatus::Pending => StatusKind::Pending,
            TaskStatus::Assigned => StatusKind::Assigned,
            TaskStatus::InProgress => StatusKind::InProgress,
            TaskStatus::Completed => StatusKind::Completed,
            TaskStatus::Failed { .. } => StatusKind::Failed,
            TaskStatus::Blocked { .. } => StatusKind::Blocked,
        }
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusKind::Pending => write!(f, "pending"),
            StatusKind::Assigned => write!(f, "assigned"),
            StatusKind::InProgress => write!(f, "in_progress"),
            StatusKind::Completed => write!(f, "completed"),
            StatusKind::Failed => write!(f, "failed"),
            StatusKind::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// What a caller submits to create a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen ID, so batch siblings can reference each other.
    #[serde(default)]
    pub id: Option<TaskId>,
    pub title: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub collaboration: Option<CollaborationSpec>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub requirements: Requirements,
    /// Only this agent may run the task.
    #[serde(default)]
    pub pinned_agent: Option<AgentId>,
}

impl TaskSpec {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_collaboration(mut self, spec: CollaborationSpec) -> Self {
        self.collaboration = Some(spec);
        self
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn pinned_to(mut self, agent: AgentId) -> Self {
        self.pinned_agent = Some(agent);
        self
    }
}

/// A unit of work tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub prompt: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub assigned_agent: Option<AgentId>,
    pub collaboration: Option<CollaborationSpec>,
    pub session: Option<SessionId>,
    pub project_id: Option<String>,
    pub requirements: Requirements,
    pub pinned_agent: Option<AgentId>,
    /// Set on child tasks spawned by a hierarchical session.
    pub parent: Option<TaskId>,
    /// Insertion order, breaks priority ties.
    pub sequence: u64,
    /// Dispatch generation; bumped on every assignment.
    pub attempt: u32,
    /// Automatic retries consumed.
    pub retries: u32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Task {
    /// Build a pending task from a submission.
    pub fn from_spec(spec: TaskSpec, sequence: u64) -> Self {
        Self {
            id: spec.id.unwrap_or_default(),
            title: spec.title,
            prompt: spec.prompt,
            task_type: spec.task_type,
            priority: spec.priority,
            status: TaskStatus::Pending,
            dependencies: spec.dependencies,
            assigned_agent: None,
            collaboration: spec.collaboration,
            session: None,
            project_id: spec.project_id,
            requirements: spec.requirements,
            pinned_agent: spec.pinned_agent,
            parent: None,
            sequence,
            attempt: 0,
            retries: 0,
            cancel_requested: false,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
        }
    }

    fn invalid(&self, to: &str) -> Error {
        Error::InvalidTransition {
            from: self.status.kind().to_string(),
            to: to.to_string(),
        }
    }

    /// Reserve the task on an agent. Bumps the dispatch attempt.
    pub fn assign(&mut self, agent_id: AgentId) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.invalid("assigned"));
        }
        self.status = TaskStatus::Assigned;
        self.assigned_agent = Some(agent_id);
        self.assigned_at = Some(Utc::now());
        self.attempt += 1;
        Ok(())
    }

    /// Move an assigned task to another agent without changing its status.
    pub fn reassign(&mut self, agent_id: AgentId) -> Result<()> {
        if self.status != TaskStatus::Assigned {
            return Err(self.invalid("assigned"));
        }
        self.assigned_agent = Some(agent_id);
        self.assigned_at = Some(Utc::now());
        self.attempt += 1;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.status != TaskStatus::Assigned {
            return Err(self.invalid("in_progress"));
        }
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, output: serde_json::Value) -> Result<()> {
        if self.status != TaskStatus::InProgress {
            return Err(self.invalid("completed"));
        }
        self.status = TaskStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task failed. Allowed from any non-terminal state, since a
    /// pending task can be cancelled and an assigned one can time out.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        if self.is_finished() {
            return Err(self.invalid("failed"));
        }
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn block(&mut self, reason: &str) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.invalid("blocked"));
        }
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        Ok(())
    }

    /// Return the task to `Pending`, dropping its assignment.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.assigned_agent = None;
        self.assigned_at = None;
        self.started_at = None;
        self.completed_at = None;
        self.session = None;
        self.cancel_requested = false;
    }

    /// Completed, failed or blocked.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
        )
    }

    /// Holding capacity on an agent.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    pub fn is_collaborative(&self) -> bool {
        self.collaboration.is_some()
    }

    /// Milliseconds between start and completion, if both are known.
    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.completed_at?;
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}
