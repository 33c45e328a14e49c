//! Orchestration layer.
//!
//! Placement, capacity accounting, collaboration and balancing, plus the
//! runtime loop that drives them and the executor boundary agents sit
//! behind.

pub mod balancer;
pub mod capacity;
pub mod collaboration;
pub mod executor;
pub mod health;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod scheduler;

pub use balancer::{Classification, LoadBalancer, LoadClass, Recommendation};
pub use capacity::{
    AgentStats, CapacityReport, CapacitySnapshot, CapacityTracker, ReleaseOutcome, TypeStats,
};
pub use collaboration::{
    Agreement, CollaborationCoordinator, CollaborationSession, ConsensusPolicy, HighestConfidence,
    MajorityVote, ParticipantRole, ParticipantStatus, SessionAction, SessionPhase, Stage, Vote,
};
pub use executor::{
    AgentExecutor, AgentReport, Assignment, EchoExecutor, ExecutionOutcome, ProgressReporter,
    ReportKind,
};
pub use health::{DeadlineTracker, RetryDecision, RetryPolicy, DEFAULT_MAX_RETRIES};
pub use registry::AgentRegistry;
pub use resolver::{DependencyResolver, ReadyQueue};
pub use runtime::{Orchestrator, OrchestratorHandle};
pub use scheduler::{Migration, Scheduler, Submission, TickReport};
