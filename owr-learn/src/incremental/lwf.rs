//! Learning without Forgetting: distillation from the previous group's best
//! network, no stored data.

use super::{GroupCheckpoints, check_run, record_group, run_group};
use crate::data::IncrementalDataset;
use crate::error::LearnError;
use crate::model::{Frozen, Network};
use crate::training::{CheckpointManager, RunLogs, Trainer};
use tracing::info;

pub struct LearningWithoutForgetting<N: Network> {
    trainer: Trainer<N>,
    old_net: Option<Frozen<N>>,
    best_net: Option<N>,
    checkpoints: GroupCheckpoints,
}

impl<N: Network> LearningWithoutForgetting<N> {
    pub fn new(trainer: Trainer<N>) -> Self {
        Self {
            trainer,
            old_net: None,
            best_net: None,
            checkpoints: GroupCheckpoints::new("lwf"),
        }
    }

    /// Save the best network of every group through `manager`.
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints.enable(manager);
        self
    }

    pub fn run_id(&self) -> &str {
        self.checkpoints.run_id()
    }

    pub fn trainer(&self) -> &Trainer<N> {
        &self.trainer
    }

    /// Best network of the last trained group.
    pub fn best_net(&self) -> Option<&N> {
        self.best_net.as_ref()
    }

    /// Distillation target for the next group.
    pub fn old_net(&self) -> Option<&Frozen<N>> {
        self.old_net.as_ref()
    }

    /// Train every group of `data` in order and test on all classes seen so
    /// far after each one.
    pub fn train_model(
        &mut self,
        data: &IncrementalDataset,
        epochs: usize,
    ) -> Result<RunLogs, LearnError> {
        check_run(&self.trainer, data, epochs)?;
        let num_groups = data.num_groups();
        let mut logs = RunLogs::with_capacity(self.checkpoints.run_id(), num_groups);

        for g in 0..num_groups {
            let group = data.group(g)?;
            let outcome = run_group(
                &mut self.trainer,
                group.train.clone(),
                &group.validation,
                self.old_net.as_ref(),
                epochs,
                g,
            )?;

            let test = self.trainer.test(&outcome.best_net, &group.test);
            info!(group = g + 1, accuracy = test.accuracy, "Testing classes seen so far");
            record_group(&mut logs, &outcome, &test);
            self.checkpoints.save(g, &outcome)?;

            if g + 1 < num_groups {
                self.trainer.add_output_nodes();
                self.old_net = Some(Frozen::capture(&outcome.best_net));
            }
            self.best_net = Some(outcome.best_net);
            logs.true_labels = test.true_labels;
            logs.predictions = test.predictions;
        }

        Ok(logs)
    }
}
