//! Dependency resolution and the ready queue.
//!
//! The resolver owns the dependency graph and decides when a task may be
//! scheduled. Task state is read from the store; the resolver never mutates
//! tasks itself but tells the scheduler which ones to unblock or block.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::dag::TaskDAG;
use crate::core::task::{StatusKind, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::state::TaskStore;

type QueueKey = (u8, u64, TaskId);

/// Ready tasks ordered by priority, then insertion sequence.
///
/// Popping removes the task, so a task is never handed out twice.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    order: BTreeSet<QueueKey>,
    keys: HashMap<TaskId, QueueKey>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Pushing a task that is already queued is a no-op.
    pub fn push(&mut self, task: &Task) {
        if self.keys.contains_key(&task.id) {
            return;
        }
        let key = (task.priority.rank(), task.sequence, task.id);
        self.order.insert(key);
        self.keys.insert(task.id, key);
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        let key = self.order.pop_first()?;
        self.keys.remove(&key.2);
        Some(key.2)
    }

    pub fn remove(&mut self, id: &TaskId) -> bool {
        match self.keys.remove(id) {
            Some(key) => self.order.remove(&key),
            None => false,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.keys.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Queued task IDs in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.order.iter().map(|(_, _, id)| *id)
    }
}

#[derive(Debug, Default)]
pub struct DependencyResolver {
    dag: TaskDAG,
    ready: ReadyQueue,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dag(&self) -> &TaskDAG {
        &self.dag
    }

    pub fn ready(&self) -> &ReadyQueue {
        &self.ready
    }

    /// Add a task and its dependency edges.
    ///
    /// Every dependency must already be registered. On error the graph is
    /// left as it was.
    pub fn register(&mut self, task: &Task, store: &dyn TaskStore) -> Result<()> {
        self.register_batch(std::slice::from_ref(task), store)
    }

    /// Add several tasks at once. Tasks in the batch may depend on each
    /// other in any order. Any failure rolls back the whole batch.
    pub fn register_batch(&mut self, tasks: &[Task], store: &dyn TaskStore) -> Result<()> {
        let mut dag = self.dag.clone();
        let mut seen = HashSet::new();
        for task in tasks {
            if dag.contains_task(&task.id) || !seen.insert(task.id) {
                return Err(Error::TaskExists(task.id));
            }
            dag.add_task(task.id);
        }
        for task in tasks {
            for dependency in &task.dependencies {
                if !dag.contains_task(dependency) {
                    return Err(Error::UnknownDependency {
                        task: task.id,
                        dependency: *dependency,
                    });
                }
                dag.add_dependency(dependency, &task.id)?;
            }
        }
        self.dag = dag;

        for task in tasks {
            if task.status == TaskStatus::Pending && self.deps_completed(task, tasks, store) {
                self.ready.push(task);
            }
        }
        tracing::debug!(
            count = tasks.len(),
            ready = self.ready.len(),
            "resolver registered tasks"
        );
        Ok(())
    }

    /// Add an edge between two registered tasks. `to` leaves the ready queue
    /// if `from` has not completed yet.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        store: &dyn TaskStore,
    ) -> Result<()> {
        self.dag.add_dependency(from, to)?;
        let from_done = store
            .get(from)
            .is_some_and(|t| t.status == TaskStatus::Completed);
        if !from_done {
            self.ready.remove(to);
        }
        Ok(())
    }

    fn deps_completed(&self, task: &Task, batch: &[Task], store: &dyn TaskStore) -> bool {
        self.dag.dependencies(&task.id).iter().all(|dep| {
            let status = match store.get(dep) {
                Some(t) => Some(t.status),
                None => batch.iter().find(|t| t.id == *dep).map(|t| t.status.clone()),
            };
            status == Some(TaskStatus::Completed)
        })
    }

    /// True iff every dependency of `id` is completed.
    pub fn is_ready(&self, id: &TaskId, store: &dyn TaskStore) -> bool {
        self.dag.dependencies(id).iter().all(|dep| {
            store
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    /// Queue a pending task if its dependencies allow it.
    pub fn enqueue_if_ready(&mut self, task: &Task, store: &dyn TaskStore) -> bool {
        if task.status != TaskStatus::Pending || !self.is_ready(&task.id, store) {
            return false;
        }
        self.ready.push(task);
        true
    }

    pub fn pop_ready(&mut self) -> Option<TaskId> {
        self.ready.pop()
    }

    pub fn dequeue(&mut self, id: &TaskId) -> bool {
        self.ready.remove(id)
    }

    /// A task completed: queue dependents whose dependencies are now all
    /// complete. Returns the newly ready tasks.
    pub fn on_completed(&mut self, id: &TaskId, store: &dyn TaskStore) -> Vec<TaskId> {
        let mut newly_ready = Vec::new();
        for dependent in self.dag.dependents(id) {
            let Some(task) = store.get(&dependent) else {
                continue;
            };
            if self.enqueue_if_ready(&task, store) {
                newly_ready.push(dependent);
            }
        }
        newly_ready
    }

    /// A task failed terminally: every unfinished downstream task must be
    /// blocked. Returns them in breadth-first order and removes them from
    /// the ready queue.
    pub fn propagate_failure(&mut self, id: &TaskId, store: &dyn TaskStore) -> Vec<TaskId> {
        let mut to_block = Vec::new();
        for dependent in self.dag.transitive_dependents(id) {
            let pending = store
                .get(&dependent)
                .is_some_and(|t| t.status == TaskStatus::Pending);
            if pending {
                self.ready.remove(&dependent);
                to_block.push(dependent);
            }
        }
        to_block
    }

    /// A failed task was re-opened: return the blocked downstream tasks that
    /// can go back to `pending`, in dependency order.
    ///
    /// A blocked task stays blocked while another of its dependencies is
    /// still failed or blocked for an unrelated reason.
    pub fn on_reopened(&self, id: &TaskId, store: &dyn TaskStore) -> Vec<TaskId> {
        let candidates: HashSet<TaskId> = self
            .dag
            .transitive_dependents(id)
            .into_iter()
            .filter(|t| {
                store
                    .get(t)
                    .is_some_and(|t| t.status.kind() == StatusKind::Blocked)
            })
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let order = match self.dag.topological_order() {
            Ok(order) => order,
            Err(_) => return Vec::new(),
        };
        let mut unblocked: HashSet<TaskId> = HashSet::new();
        let mut out = Vec::new();
        for task in order.into_iter().filter(|t| candidates.contains(t)) {
            let clear = self.dag.dependencies(&task).iter().all(|dep| {
                dep == id
                    || unblocked.contains(dep)
                    || store.get(dep).is_some_and(|d| {
                        !matches!(d.status.kind(), StatusKind::Failed | StatusKind::Blocked)
                    })
            });
            if clear {
                unblocked.insert(task);
                out.push(task);
            }
        }
        out
    }
}
