//! Task storage and snapshot persistence.

mod snapshot;
mod store;

pub use snapshot::{Snapshot, SNAPSHOT_VERSION};
pub use store::{MemoryTaskStore, TaskFilter, TaskStore};
