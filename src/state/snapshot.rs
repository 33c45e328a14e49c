//! JSON snapshots of orchestrator state for resumption after shutdown.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::core::task::Task;
use crate::util::blocking;
use crate::Result;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Registered agents plus every known task.
///
/// Finished tasks are kept so that restored tasks can still resolve their
/// dependencies on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
}

impl Snapshot {
    pub fn new(agents: Vec<Agent>, tasks: Vec<Task>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            agents,
            tasks,
        }
    }

    /// Tasks that would run again after a resume.
    pub fn unfinished(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.is_finished())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        let path = path.to_path_buf();
        blocking(move || write_atomic(&path, &contents)).await
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let path = path.to_path_buf();
        blocking(move || Self::load_sync(&path)).await
    }

    /// Read a snapshot. A missing file is `Ok(None)`.
    pub fn load_sync(path: &Path) -> Result<Option<Self>> {
        tracing::debug!(path = %path.display(), "Snapshot::load");
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&contents)?;
        tracing::debug!(
            agents = snapshot.agents.len(),
            tasks = snapshot.tasks.len(),
            "Snapshot loaded"
        );
        Ok(Some(snapshot))
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    if path.exists() {
        let backup_path = path.with_extension("json.bak");
        fs::copy(path, &backup_path)?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    tracing::debug!(path = %path.display(), "Snapshot saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskSpec;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        let agent = Agent::new("coder", "coder");
        let pending = Task::from_spec(TaskSpec::new("pending"), 0);
        let mut done = Task::from_spec(TaskSpec::new("done"), 1);
        done.assign(agent.id).unwrap();
        done.start().unwrap();
        done.complete(json!("ok")).unwrap();
        Snapshot::new(vec![agent], vec![pending, done])
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("snapshot.json");
        let snapshot = sample();
        snapshot.save(&path).await.unwrap();

        let loaded = Snapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert_eq!(loaded.agents.len(), 1);
        assert_eq!(loaded.tasks.len(), 2);
        assert_eq!(loaded.unfinished().count(), 1);
    }

    #[tokio::test]
    async fn test_second_save_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        sample().save(&path).await.unwrap();
        sample().save(&path).await.unwrap();
        assert!(path.with_extension("json.bak").exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(Snapshot::load_sync(&dir.path().join("none.json"))
            .unwrap()
            .is_none());
    }
}
