//! Checkpoint management for training runs.
//!
//! Every run keeps a `checkpoints.json` manifest next to the serialized states
//! it lists. Entries carry a SHA-256 of the stored bytes so a state file can be
//! checked against its manifest entry before it is loaded.

use crate::error::LearnError;
use crate::persistence::{atomic_write, atomic_write_json};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::debug;

const MANIFEST: &str = "checkpoints.json";

/// A saved model state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    /// Group index or snapshot count, depending on the producer.
    pub step: usize,
    /// Higher is better (validation accuracy, negated error, ...).
    pub score: f64,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: impl Into<PathBuf>, max_checkpoints: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_checkpoints,
        }
    }

    pub fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }

    /// List checkpoints for a run, oldest first.
    pub fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>, LearnError> {
        let manifest_path = self.base_dir.join(run_id).join(MANIFEST);
        if !manifest_path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&manifest_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Get the best checkpoint (highest score, latest on ties).
    pub fn best(&self, run_id: &str) -> Result<Option<Checkpoint>, LearnError> {
        let checkpoints = self.list(run_id)?;
        Ok(checkpoints.into_iter().max_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }))
    }

    /// Serialize `state` under `<base>/<run_id>/<name>.json` and record it.
    pub fn save_state<T: Serialize + ?Sized>(
        &self,
        run_id: &str,
        name: &str,
        step: usize,
        score: f64,
        state: &T,
    ) -> Result<Checkpoint, LearnError> {
        let dir = self.base_dir.join(run_id);
        std::fs::create_dir_all(&dir)?;

        let bytes = serde_json::to_vec(state)?;
        let path = dir.join(format!("{name}.json"));
        atomic_write(&path, &bytes)?;

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            step,
            score,
            path,
            hash: content_hash(&bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        // Append to manifest.
        let mut checkpoints = self.list(run_id)?;
        checkpoints.push(checkpoint.clone());

        // Enforce max_checkpoints by removing oldest entries.
        while checkpoints.len() > self.max_checkpoints.max(1) {
            checkpoints.remove(0);
        }

        atomic_write_json(&dir.join(MANIFEST), &checkpoints)?;
        debug!(run_id, step, score, path = %checkpoint.path.display(), "Checkpoint saved");

        Ok(checkpoint)
    }

    /// Read back a saved state, verifying its hash.
    pub fn load_state<T: DeserializeOwned>(&self, checkpoint: &Checkpoint) -> Result<T, LearnError> {
        let bytes = std::fs::read(&checkpoint.path)?;
        if content_hash(&bytes) != checkpoint.hash {
            return Err(LearnError::model(format!(
                "checkpoint {} does not match its recorded hash",
                checkpoint.id
            )));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Look up a checkpoint by id.
    pub fn get(&self, run_id: &str, id: &str) -> Result<Checkpoint, LearnError> {
        self.list(run_id)?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| LearnError::not_found(format!("checkpoint {id}")))
    }
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_save_list_and_best() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10);
        manager.save_state("run", "group-0", 0, 0.4, &vec![1.0f32]).unwrap();
        let best = manager.save_state("run", "group-1", 1, 0.9, &vec![2.0f32]).unwrap();
        manager.save_state("run", "group-2", 2, 0.6, &vec![3.0f32]).unwrap();

        assert_eq!(manager.list("run").unwrap().len(), 3);
        assert_eq!(manager.best("run").unwrap().unwrap().id, best.id);
        assert!(manager.list("other").unwrap().is_empty());
    }

    #[test]
    fn test_max_checkpoints_drops_oldest() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2);
        for step in 0..4 {
            manager
                .save_state("run", &format!("s{step}"), step, step as f64, &step)
                .unwrap();
        }
        let steps: Vec<usize> = manager.list("run").unwrap().iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![2, 3]);
    }

    #[test]
    fn test_load_state_roundtrip_and_tamper_detection() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 5);
        let saved = manager.save_state("run", "state", 0, 1.0, &vec![1u32, 2, 3]).unwrap();
        let loaded: Vec<u32> = manager.load_state(&saved).unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
        assert_eq!(manager.get("run", &saved.id).unwrap(), saved);

        std::fs::write(&saved.path, b"[9]").unwrap();
        let err = manager.load_state::<Vec<u32>>(&saved).unwrap_err();
        assert!(matches!(err, LearnError::Model(_)));
        assert!(matches!(manager.get("run", "missing"), Err(LearnError::NotFound(_))));
    }
}
