//! Per-run training logs returned by the learners.

use serde::{Deserialize, Serialize};

/// Metrics of one group-sequential run, one entry per group.
///
/// `true_labels` and `predictions` hold the test pass of the last group only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLogs {
    /// Run id under which the group checkpoints were saved.
    #[serde(default)]
    pub run_id: String,
    pub group_train_loss: Vec<f32>,
    pub group_train_accuracies: Vec<f32>,
    pub val_losses: Vec<f32>,
    pub val_accuracies: Vec<f32>,
    pub test_accuracies: Vec<f32>,
    pub true_labels: Vec<usize>,
    pub predictions: Vec<usize>,
}

impl RunLogs {
    pub fn with_capacity(run_id: impl Into<String>, groups: usize) -> Self {
        Self {
            run_id: run_id.into(),
            group_train_loss: Vec::with_capacity(groups),
            group_train_accuracies: Vec::with_capacity(groups),
            val_losses: Vec::with_capacity(groups),
            val_accuracies: Vec::with_capacity(groups),
            test_accuracies: Vec::with_capacity(groups),
            true_labels: Vec::new(),
            predictions: Vec::new(),
        }
    }

    /// Number of groups recorded.
    pub fn num_groups(&self) -> usize {
        self.test_accuracies.len()
    }

    /// Mean test accuracy over every recorded group.
    pub fn average_incremental_accuracy(&self) -> Option<f32> {
        if self.test_accuracies.is_empty() {
            return None;
        }
        Some(self.test_accuracies.iter().sum::<f32>() / self.test_accuracies.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_incremental_accuracy() {
        let mut logs = RunLogs::with_capacity("run", 2);
        assert_eq!(logs.average_incremental_accuracy(), None);
        logs.test_accuracies.extend([0.8, 0.6]);
        assert_eq!(logs.num_groups(), 2);
        assert!((logs.average_incremental_accuracy().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_logs_without_run_id_still_load() {
        let logs: RunLogs = serde_json::from_str(r#"{"group_train_loss": [], "group_train_accuracies": [],
            "val_losses": [], "val_accuracies": [], "test_accuracies": [0.5],
            "true_labels": [], "predictions": []}"#)
        .unwrap();
        assert_eq!(logs.run_id, "");
        assert_eq!(logs.num_groups(), 1);
    }
}
