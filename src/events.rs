//! Lifecycle events published by the orchestrator.
//!
//! Events go out on a `tokio::sync::broadcast` channel. Publishing never
//! blocks: a subscriber that falls behind sees `RecvError::Lagged` and misses
//! the overwritten events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::AgentId;
use crate::core::task::{CollaborationStrategy, Priority, SessionId, TaskId};

/// Default broadcast buffer size.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A lifecycle transition observed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum OrchestratorEvent {
    #[serde(rename = "task:created")]
    TaskCreated {
        task: TaskId,
        title: String,
        priority: Priority,
    },
    #[serde(rename = "task:assigned")]
    TaskAssigned { task: TaskId, agent: AgentId },
    #[serde(rename = "task:started")]
    TaskStarted { task: TaskId, agent: AgentId },
    #[serde(rename = "task:completed")]
    TaskCompleted {
        task: TaskId,
        result: serde_json::Value,
        duration_ms: Option<u64>,
    },
    #[serde(rename = "task:failed")]
    TaskFailed {
        task: TaskId,
        error: String,
        /// Whether the task goes back to pending for another attempt.
        will_retry: bool,
    },
    #[serde(rename = "task:blocked")]
    TaskBlocked { task: TaskId, cause: TaskId },
    #[serde(rename = "task:reassigned")]
    TaskReassigned {
        task: TaskId,
        from: AgentId,
        to: AgentId,
    },
    #[serde(rename = "task:cancelled")]
    TaskCancelled { task: TaskId },
    #[serde(rename = "agent:registered")]
    AgentRegistered {
        agent: AgentId,
        name: String,
        kind: String,
    },
    #[serde(rename = "agent:unregistered")]
    AgentUnregistered { agent: AgentId },
    #[serde(rename = "session:opened")]
    SessionOpened {
        session: SessionId,
        task: TaskId,
        strategy: CollaborationStrategy,
        participants: Vec<AgentId>,
    },
    #[serde(rename = "session:closed")]
    SessionClosed {
        session: SessionId,
        task: TaskId,
        success: bool,
    },
}

impl OrchestratorEvent {
    /// Wire name of the event, e.g. `task:created`.
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::TaskCreated { .. } => "task:created",
            OrchestratorEvent::TaskAssigned { .. } => "task:assigned",
            OrchestratorEvent::TaskStarted { .. } => "task:started",
            OrchestratorEvent::TaskCompleted { .. } => "task:completed",
            OrchestratorEvent::TaskFailed { .. } => "task:failed",
            OrchestratorEvent::TaskBlocked { .. } => "task:blocked",
            OrchestratorEvent::TaskReassigned { .. } => "task:reassigned",
            OrchestratorEvent::TaskCancelled { .. } => "task:cancelled",
            OrchestratorEvent::AgentRegistered { .. } => "agent:registered",
            OrchestratorEvent::AgentUnregistered { .. } => "agent:unregistered",
            OrchestratorEvent::SessionOpened { .. } => "session:opened",
            OrchestratorEvent::SessionClosed { .. } => "session:closed",
        }
    }

    /// The task this event concerns, if any.
    pub fn task(&self) -> Option<TaskId> {
        match self {
            OrchestratorEvent::TaskCreated { task, .. }
            | OrchestratorEvent::TaskAssigned { task, .. }
            | OrchestratorEvent::TaskStarted { task, .. }
            | OrchestratorEvent::TaskCompleted { task, .. }
            | OrchestratorEvent::TaskFailed { task, .. }
            | OrchestratorEvent::TaskBlocked { task, .. }
            | OrchestratorEvent::TaskReassigned { task, .. }
            | OrchestratorEvent::TaskCancelled { task }
            | OrchestratorEvent::SessionOpened { task, .. }
            | OrchestratorEvent::SessionClosed { task, .. } => Some(*task),
            OrchestratorEvent::AgentRegistered { .. }
            | OrchestratorEvent::AgentUnregistered { .. } => None,
        }
    }
}

/// Outbound event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: OrchestratorEvent) {
        tracing::trace!(event = event.name(), task = ?event.task(), "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn test_event_serializes_with_wire_name() {
        let event = OrchestratorEvent::TaskAssigned {
            task: TaskId::new(),
            agent: AgentId::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"task:assigned\""));
        let parsed: OrchestratorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_name_matches_serde_tag() {
        let event = OrchestratorEvent::TaskFailed {
            task: TaskId::new(),
            error: "boom".to_string(),
            will_retry: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(OrchestratorEvent::TaskCancelled { task: TaskId::new() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let task = TaskId::new();
        let agent = AgentId::new();

        bus.publish(OrchestratorEvent::TaskAssigned { task, agent });
        bus.publish(OrchestratorEvent::TaskStarted { task, agent });

        assert_eq!(rx.recv().await.unwrap().name(), "task:assigned");
        assert_eq!(rx.recv().await.unwrap().name(), "task:started");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(OrchestratorEvent::TaskCancelled { task: TaskId::new() });
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
    }
}
