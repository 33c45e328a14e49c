//! Integration test suite for conductor.
//!
//! These tests drive the public API end to end: the scheduler directly for
//! step-by-step scenarios, and the spawned runtime with a scripted executor
//! for the asynchronous paths.
//!
//! # Test Categories
//!
//! - `scenarios`: Priority ordering, dependency blocking, capacity invariants
//! - `collaboration`: Multi-agent strategies through the runtime
//! - `rebalance`: Load classification and task migration
//! - `persistence`: Shutdown snapshots and resumption
//!
//! No test talks to a real agent; executors are scripted in `fixtures`.

mod fixtures;

mod collaboration;
mod persistence;
mod rebalance;
mod scenarios;
