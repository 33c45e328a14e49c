//! Core domain models for conductor orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks and their dependency DAG.

pub mod dag;
pub mod task;

pub use dag::TaskDAG;
pub use task::{
    CollaborationSpec, CollaborationStrategy, Priority, Quorum, Requirements, SessionId,
    StatusKind, Task, TaskId, TaskSpec, TaskStatus, TaskType,
};
