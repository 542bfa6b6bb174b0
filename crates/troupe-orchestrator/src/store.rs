//! Durable agent snapshots
//!
//! One JSON file per agent at `<state_dir>/<agent_id>.json`. Writes go to a
//! temporary sibling and are renamed into place, so a reader sees either the
//! previous snapshot or the new one, never a torn file.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use troupe_core::{AgentId, Result};

use crate::state_machine::StateSnapshot;

/// Directory-backed snapshot store
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, agent_id: &AgentId) -> PathBuf {
        self.dir.join(format!("{}.json", agent_id))
    }

    /// Atomically replace the agent's snapshot
    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&snapshot.agent_id);
        let tmp = self.dir.join(format!(".{}.json.tmp", snapshot.agent_id));
        let json = serde_json::to_vec_pretty(snapshot)?;

        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Saved {} in {} to {}", snapshot.agent_id, snapshot.state, path.display());
        Ok(path)
    }

    /// Load an agent's snapshot, `None` if it was never saved
    pub async fn load(&self, agent_id: &AgentId) -> Result<Option<StateSnapshot>> {
        let path = self.path_for(agent_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every snapshot in the directory, sorted by agent id
    pub async fn list(&self) -> Result<Vec<StateSnapshot>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if is_snapshot {
                let bytes = fs::read(&path).await?;
                snapshots.push(serde_json::from_slice::<StateSnapshot>(&bytes)?);
            }
        }
        snapshots.sort_by(|a, b| a.agent_id.as_str().cmp(b.agent_id.as_str()));
        Ok(snapshots)
    }

    /// Delete an agent's snapshot; `false` if there was none
    pub async fn remove(&self, agent_id: &AgentId) -> Result<bool> {
        match fs::remove_file(self.path_for(agent_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
