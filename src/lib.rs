//! conductor: task orchestration and capacity balancing for agent pools.
//!
//! Tasks flow from the dependency resolver into the scheduler, which places
//! them on agents under capacity limits or hands them to the collaboration
//! coordinator. A single runtime loop owns all state; agents run behind the
//! [`orchestration::AgentExecutor`] trait and lifecycle changes are
//! published on an [`events::EventBus`].

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use agent::{Agent, AgentId, AgentStatus, Capabilities, ComplexityTier};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventBus, OrchestratorEvent};
pub use orchestration::{Orchestrator, OrchestratorHandle};
