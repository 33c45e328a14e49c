//! Task storage boundary.
//!
//! The scheduler reads and writes tasks only through [`TaskStore`], so a
//! persistent backend can replace the in-memory one without touching
//! orchestration logic.

use std::collections::HashMap;

use crate::agent::AgentId;
use crate::core::task::{StatusKind, Task, TaskId};
use crate::error::{Error, Result};

/// Criteria for [`TaskStore::scan`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub status: Option<StatusKind>,
    pub project_id: Option<String>,
    pub agent: Option<AgentId>,
    pub parent: Option<TaskId>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: StatusKind) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_agent(mut self, agent: AgentId) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status.kind() == s)
            && self
                .project_id
                .as_deref()
                .map_or(true, |p| task.project_id.as_deref() == Some(p))
            && self.agent.map_or(true, |a| task.assigned_agent == Some(a))
            && self.parent.map_or(true, |p| task.parent == Some(p))
    }
}

/// Key-addressable task storage.
pub trait TaskStore: Send {
    /// Insert a new task. Fails with `TaskExists` on a duplicate ID.
    fn insert(&mut self, task: Task) -> Result<()>;

    fn get(&self, id: &TaskId) -> Option<Task>;

    /// Apply `f` to one task atomically: if `f` fails the stored task is
    /// left unchanged.
    fn update(&mut self, id: &TaskId, f: &mut dyn FnMut(&mut Task) -> Result<()>) -> Result<()>;

    /// Matching tasks in insertion order.
    fn scan(&self, filter: &TaskFilter) -> Vec<Task>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: &TaskId) -> bool {
        self.get(id).is_some()
    }
}

/// In-memory [`TaskStore`].
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: HashMap<TaskId, Task>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::TaskExists(task.id));
        }
        self.tasks.insert(task.id, task);
        Ok(())
    }

    fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).cloned()
    }

    fn update(&mut self, id: &TaskId, f: &mut dyn FnMut(&mut Task) -> Result<()>) -> Result<()> {
        let slot = self.tasks.get_mut(id).ok_or(Error::TaskNotFound(*id))?;
        let mut draft = slot.clone();
        f(&mut draft)?;
        *slot = draft;
        Ok(())
    }

    fn scan(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.sequence);
        out
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }
}
