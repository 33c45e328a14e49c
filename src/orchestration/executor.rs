//! The boundary between the orchestrator and the agents doing the work.
//!
//! The scheduler emits [`Assignment`]s. The runtime runs each one through an
//! [`AgentExecutor`] in its own task, bounded by the agent timeout, and feeds
//! the outcome back as an [`AgentReport`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentId;
use crate::core::task::{SessionId, TaskId, TaskType};
use crate::orchestration::collaboration::Stage;

/// One unit of work handed to an agent.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task: TaskId,
    pub agent: AgentId,
    /// Task attempt this dispatch belongs to.
    pub attempt: u32,
    /// Unique per dispatch; reports echo it back.
    pub dispatch: u64,
    pub session: Option<SessionId>,
    pub stage: Stage,
    pub title: String,
    pub task_type: TaskType,
    pub prompt: String,
    /// Strategy context: previous outputs, round number, child results.
    pub input: Value,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// What an executor returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(Value),
    Failed(String),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReportKind {
    Started,
    Completed { output: Value },
    Failed { error: String },
    TimedOut,
    Cancelled,
}

/// Agent-side report for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub task: TaskId,
    pub agent: AgentId,
    pub dispatch: u64,
    pub kind: ReportKind,
}

impl AgentReport {
    pub fn new(assignment: &Assignment, kind: ReportKind) -> Self {
        Self {
            task: assignment.task,
            agent: assignment.agent,
            dispatch: assignment.dispatch,
            kind,
        }
    }
}

/// Lets an executor acknowledge that work has started.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<AgentReport>,
    task: TaskId,
    agent: AgentId,
    dispatch: u64,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<AgentReport>, assignment: &Assignment) -> Self {
        Self {
            tx,
            task: assignment.task,
            agent: assignment.agent,
            dispatch: assignment.dispatch,
        }
    }

    fn send(&self, kind: ReportKind) {
        let report = AgentReport {
            task: self.task,
            agent: self.agent,
            dispatch: self.dispatch,
            kind,
        };
        if self.tx.send(report).is_err() {
            tracing::debug!(task = %self.task.short(), "report dropped, runtime gone");
        }
    }

    pub fn started(&self) {
        self.send(ReportKind::Started);
    }

    pub(crate) fn finish(&self, kind: ReportKind) {
        self.send(kind);
    }
}

/// Executes assignments on behalf of agents.
#[async_trait]
pub trait AgentExecutor: Send + Sync + 'static {
    /// Run one assignment. Call [`ProgressReporter::started`] once work has
    /// begun; the orchestrator keeps the task `assigned` until then.
    async fn execute(&self, assignment: Assignment, progress: ProgressReporter)
        -> ExecutionOutcome;
}

/// Run an assignment to completion, honouring its timeout and cancellation,
/// and send the final report.
pub async fn run_assignment<E>(executor: &E, assignment: Assignment, progress: ProgressReporter)
where
    E: AgentExecutor + ?Sized,
{
    let timeout = assignment.timeout;
    let cancel = assignment.cancel.clone();
    let task = assignment.task;
    let kind = tokio::select! {
        _ = cancel.cancelled() => ReportKind::Cancelled,
        result = tokio::time::timeout(timeout, executor.execute(assignment, progress.clone())) => {
            match result {
                Ok(ExecutionOutcome::Completed(output)) => ReportKind::Completed { output },
                Ok(ExecutionOutcome::Failed(error)) => ReportKind::Failed { error },
                Err(_) => {
                    tracing::warn!(task = %task.short(), ?timeout, "executor timed out");
                    ReportKind::TimedOut
                }
            }
        }
    };
    progress.finish(kind);
}

/// Executor that starts immediately and echoes its input back, after an
/// optional delay. Hierarchical plans are answered with one sub-prompt per
/// worker.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor {
    pub delay: Duration,
}

impl EchoExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(&self, assignment: Assignment, progress: ProgressReporter) -> ExecutionOutcome {
        progress.started();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let output = match assignment.stage {
            Stage::Plan => {
                let workers = assignment.input["workers"].as_u64().unwrap_or(1);
                Value::Array(
                    (1..=workers)
                        .map(|i| Value::String(format!("{} (part {})", assignment.prompt, i)))
                        .collect(),
                )
            }
            _ => json!({
                "agent": assignment.agent,
                "answer": assignment.prompt,
                "input": assignment.input,
            }),
        };
        ExecutionOutcome::Completed(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(stage: Stage, timeout: Duration) -> Assignment {
        Assignment {
            task: TaskId::new(),
            agent: AgentId::new(),
            attempt: 1,
            dispatch: 7,
            session: None,
            stage,
            title: "t".to_string(),
            task_type: TaskType::Implementation,
            prompt: "build it".to_string(),
            input: json!({ "workers": 2 }),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    struct Stuck;

    #[async_trait]
    impl AgentExecutor for Stuck {
        async fn execute(&self, _: Assignment, progress: ProgressReporter) -> ExecutionOutcome {
            progress.started();
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_echo_reports_started_then_completed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = assignment(Stage::Execute, Duration::from_secs(5));
        let reporter = ProgressReporter::new(tx, &a);
        run_assignment(&EchoExecutor::default(), a, reporter).await;

        assert_eq!(rx.recv().await.unwrap().kind, ReportKind::Started);
        let done = rx.recv().await.unwrap();
        assert_eq!(done.dispatch, 7);
        match done.kind {
            ReportKind::Completed { output } => assert_eq!(output["answer"], "build it"),
            other => panic!("unexpected report: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_echo_plan_splits_per_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = assignment(Stage::Plan, Duration::from_secs(5));
        let reporter = ProgressReporter::new(tx, &a);
        run_assignment(&EchoExecutor::default(), a, reporter).await;

        rx.recv().await.unwrap();
        match rx.recv().await.unwrap().kind {
            ReportKind::Completed { output } => {
                assert_eq!(output.as_array().unwrap().len(), 2)
            }
            other => panic!("unexpected report: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_timed_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = assignment(Stage::Execute, Duration::from_millis(50));
        let reporter = ProgressReporter::new(tx, &a);
        run_assignment(&Stuck, a, reporter).await;

        assert_eq!(rx.recv().await.unwrap().kind, ReportKind::Started);
        assert_eq!(rx.recv().await.unwrap().kind, ReportKind::TimedOut);
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = assignment(Stage::Execute, Duration::from_secs(60));
        let token = a.cancel.clone();
        let reporter = ProgressReporter::new(tx, &a);
        let handle = tokio::spawn(async move { run_assignment(&Stuck, a, reporter).await });

        assert_eq!(rx.recv().await.unwrap().kind, ReportKind::Started);
        token.cancel();
        handle.await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, ReportKind::Cancelled);
    }
}
