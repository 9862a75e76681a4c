//! Group-sequential class-incremental learners.
//!
//! Both learners share the per-group loop in [`run_group`]: a fresh optimizer
//! and schedule, `epochs` training passes against the distillation criterion,
//! and validation after every epoch to pick the best network of the group.
//! The live network keeps training from its last state; the best one becomes
//! the frozen distillation target of the next group.

pub mod icarl;
pub mod lwf;

pub use icarl::Icarl;
pub use lwf::LearningWithoutForgetting;

use crate::data::{IncrementalDataset, Sample};
use crate::error::LearnError;
use crate::model::{Frozen, Network};
use crate::optim::LrScheduler;
use crate::training::{CheckpointManager, EpochStats, RunLogs, TestOutcome, Trainer};
use tracing::info;

/// Best network of one group, plus the metrics of its last epoch.
#[derive(Debug, Clone)]
pub struct GroupOutcome<N> {
    pub best_net: N,
    /// Validation accuracy of `best_net`.
    pub best_accuracy: f32,
    pub best_epoch: Option<usize>,
    pub last_train: EpochStats,
    pub last_validation: EpochStats,
}

/// Train the current group for `epochs` epochs.
///
/// With `select_best_on_validation`, a network only replaces the running best
/// when its validation accuracy is strictly higher; otherwise the network of
/// the last epoch is returned.
pub fn run_group<N: Network>(
    trainer: &mut Trainer<N>,
    samples: Vec<Sample>,
    validation: &[Sample],
    old: Option<&Frozen<N>>,
    epochs: usize,
    group: usize,
) -> Result<GroupOutcome<N>, LearnError> {
    let (mut sgd, mut scheduler) = trainer.optimizer();
    let mut loader = trainer.train_loader(samples);
    let select_best = trainer.config().select_best_on_validation;

    let mut outcome = GroupOutcome {
        best_net: trainer.net().clone(),
        best_accuracy: 0.0,
        best_epoch: None,
        last_train: EpochStats::default(),
        last_validation: EpochStats::default(),
    };

    for epoch in 0..epochs {
        let lr = scheduler.get_lr();
        let train = trainer.train_epoch(&mut loader, old, &mut sgd, &scheduler)?;
        info!(
            group = group + 1,
            epoch = epoch + 1,
            epochs,
            lr,
            loss = train.loss,
            accuracy = train.accuracy,
            "Epoch finished"
        );

        let val = trainer.validate(validation);
        info!(group = group + 1, accuracy = val.accuracy, loss = val.loss, "Validation");
        scheduler.step();

        if select_best && val.accuracy > outcome.best_accuracy {
            outcome.best_accuracy = val.accuracy;
            outcome.best_net = trainer.net().clone();
            outcome.best_epoch = Some(epoch);
            info!(epoch = epoch + 1, "Best model updated");
        }
        outcome.last_train = train;
        outcome.last_validation = val;
    }

    if !select_best {
        outcome.best_net = trainer.net().clone();
        outcome.best_accuracy = outcome.last_validation.accuracy;
        outcome.best_epoch = epochs.checked_sub(1);
    }

    info!(
        group = group + 1,
        best_epoch = outcome.best_epoch.map(|e| e + 1),
        best_accuracy = outcome.best_accuracy,
        "Group finished"
    );
    Ok(outcome)
}

/// Reject runs that cannot start.
pub(crate) fn check_run<N: Network>(
    trainer: &Trainer<N>,
    data: &IncrementalDataset,
    epochs: usize,
) -> Result<(), LearnError> {
    if epochs == 0 {
        return Err(LearnError::config("epochs must be greater than zero"));
    }
    if data.classes_per_group != trainer.classes_per_group() {
        return Err(LearnError::config(format!(
            "dataset has {} classes per group but the trainer expects {}",
            data.classes_per_group,
            trainer.classes_per_group()
        )));
    }
    if data.num_groups() == 0 {
        return Err(LearnError::dataset("dataset has no groups"));
    }
    Ok(())
}

/// Append one group's metrics to `logs`.
pub(crate) fn record_group<N>(logs: &mut RunLogs, outcome: &GroupOutcome<N>, test: &TestOutcome) {
    logs.group_train_loss.push(outcome.last_train.loss);
    logs.group_train_accuracies.push(outcome.last_train.accuracy);
    logs.val_losses.push(outcome.last_validation.loss);
    logs.val_accuracies.push(outcome.last_validation.accuracy);
    logs.test_accuracies.push(test.accuracy);
}

/// Optional per-group checkpoints of the best network.
#[derive(Debug, Clone)]
pub(crate) struct GroupCheckpoints {
    manager: Option<CheckpointManager>,
    run_id: String,
}

impl GroupCheckpoints {
    pub(crate) fn new(prefix: &str) -> Self {
        Self {
            manager: None,
            run_id: format!("{prefix}-{}", uuid::Uuid::new_v4()),
        }
    }

    pub(crate) fn enable(&mut self, manager: CheckpointManager) {
        self.manager = Some(manager);
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) fn save<N: Network>(&self, group: usize, outcome: &GroupOutcome<N>) -> Result<(), LearnError> {
        if let Some(manager) = &self.manager {
            manager.save_state(
                &self.run_id,
                &format!("group-{group}"),
                group,
                f64::from(outcome.best_accuracy),
                &outcome.best_net,
            )?;
        }
        Ok(())
    }
}
