//! Base trainer shared by the incremental learners.
//!
//! Owns the live network and the pieces every group needs: an optimizer and
//! schedule rebuilt per group, one-hot encoding of the current group's labels,
//! the distillation criterion, and the epoch/validation/test passes.

use crate::config::TrainerConfig;
use crate::data::{Batch, BatchSource, LoaderConfig, Sample, SampleLoader, Transform};
use crate::distill::DistillationLoss;
use crate::error::LearnError;
use crate::model::{Frozen, Network};
use crate::ops::{LossOutput, argmax_rows, bce_with_logits, one_hot};
use crate::optim::{LrScheduler, MultiStepLr, Sgd};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Mean batch loss and sample accuracy of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub loss: f32,
    /// Fraction in `[0, 1]`.
    pub accuracy: f32,
}

/// Result of a test pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Fraction in `[0, 1]`.
    pub accuracy: f32,
    pub true_labels: Vec<usize>,
    pub predictions: Vec<usize>,
}

impl TestOutcome {
    pub fn from_predictions(true_labels: Vec<usize>, predictions: Vec<usize>) -> Self {
        Self {
            accuracy: crate::svm::accuracy(&predictions, &true_labels),
            true_labels,
            predictions,
        }
    }
}

/// Ordered, non-dropping batches of `samples` for evaluation.
pub fn eval_batches(
    samples: &[Sample],
    transform: Arc<dyn Transform>,
    batch_size: usize,
) -> Vec<Batch> {
    SampleLoader::new(samples.to_vec(), transform, LoaderConfig::eval(batch_size), 0)
        .epoch_batches()
}

pub struct Trainer<N: Network> {
    net: N,
    config: TrainerConfig,
    train_transform: Arc<dyn Transform>,
    test_transform: Arc<dyn Transform>,
    criterion: DistillationLoss,
    rng: StdRng,
}

impl<N: Network> Trainer<N> {
    pub fn new(
        net: N,
        config: TrainerConfig,
        train_transform: Arc<dyn Transform>,
        test_transform: Arc<dyn Transform>,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            net,
            config,
            train_transform,
            test_transform,
            criterion: DistillationLoss::new(),
            rng,
        }
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    pub fn into_net(self) -> N {
        self.net
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn classes_per_group(&self) -> usize {
        self.config.classes_per_group
    }

    pub fn train_transform(&self) -> Arc<dyn Transform> {
        Arc::clone(&self.train_transform)
    }

    pub fn test_transform(&self) -> Arc<dyn Transform> {
        Arc::clone(&self.test_transform)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// One-hot labels restricted to the newest `classes_per_group` outputs.
    ///
    /// Labels of earlier classes (replayed exemplars) encode as all-zero rows.
    pub fn onehot_encoding(&self, labels: &[usize]) -> Array2<f32> {
        let width = self.classes_per_group();
        let offset = self.net.num_outputs().saturating_sub(width);
        let shifted: Vec<usize> = labels
            .iter()
            .map(|&label| label.checked_sub(offset).unwrap_or(width))
            .collect();
        one_hot(&shifted, width)
    }

    /// Distillation loss of `output` for a batch with `labels`.
    pub fn criterion(
        &self,
        output: &Array2<f32>,
        labels: &[usize],
        old_logits: Option<&Array2<f32>>,
    ) -> LossOutput {
        self.criterion
            .compute(output, &self.onehot_encoding(labels), old_logits)
    }

    /// Fresh optimizer and schedule for a new group.
    pub fn optimizer(&self) -> (Sgd, MultiStepLr) {
        let c = &self.config;
        (
            Sgd::new(c.lr, c.momentum, c.weight_decay),
            MultiStepLr::new(c.lr, c.milestones.clone(), c.gamma),
        )
    }

    /// Widen the classification layer by one group of classes.
    pub fn add_output_nodes(&mut self) {
        let n = self.classes_per_group();
        self.net.add_output_nodes(n, &mut self.rng);
    }

    /// Shuffled, drop-last loader over `samples` with the train transform.
    pub fn train_loader(&mut self, samples: Vec<Sample>) -> SampleLoader {
        let seed = self.rng.r#gen();
        SampleLoader::new(
            samples,
            self.train_transform(),
            LoaderConfig::train(self.config.batch_size),
            seed,
        )
    }

    /// One optimisation pass over `loader`.
    pub fn train_epoch<S: BatchSource<Vec<usize>>>(
        &mut self,
        loader: &mut S,
        old: Option<&Frozen<N>>,
        sgd: &mut Sgd,
        scheduler: &MultiStepLr,
    ) -> Result<EpochStats, LearnError> {
        sgd.set_lr(scheduler.get_lr());
        let batches = loader.epoch_batches();
        if batches.is_empty() {
            return Err(LearnError::training(
                "training set is smaller than one batch",
            ));
        }

        let mut running_loss = 0.0;
        let mut correct = 0usize;
        let mut total = 0usize;
        for batch in &batches {
            let old_logits = old.map(|frozen| frozen.forward(&batch.inputs));
            let (output, cache) = self.net.forward_train(&batch.inputs);
            let LossOutput { loss, grad } =
                self.criterion(&output, &batch.targets, old_logits.as_ref());

            running_loss += loss;
            correct += count_correct(&output, &batch.targets);
            total += batch.len();

            let grads = self.net.backward(&cache, &grad);
            sgd.step(self.net.parameters_mut(), &grads);
        }

        Ok(EpochStats {
            loss: running_loss / batches.len() as f32,
            accuracy: correct as f32 / total.max(1) as f32,
        })
    }

    /// BCE loss and accuracy of the live network on `samples`.
    pub fn validate(&self, samples: &[Sample]) -> EpochStats {
        let batches = eval_batches(samples, self.test_transform(), self.config.batch_size);
        let mut running_loss = 0.0;
        let mut correct = 0usize;
        let mut total = 0usize;
        for batch in &batches {
            let output = self.net.forward(&batch.inputs);
            let targets = one_hot(&batch.targets, output.ncols());
            running_loss += bce_with_logits(&output, &targets).loss;
            correct += count_correct(&output, &batch.targets);
            total += batch.len();
        }
        EpochStats {
            loss: running_loss / batches.len().max(1) as f32,
            accuracy: correct as f32 / total.max(1) as f32,
        }
    }

    /// Network argmax predictions of `net` on `samples`.
    pub fn test(&self, net: &N, samples: &[Sample]) -> TestOutcome {
        let mut labels = Vec::with_capacity(samples.len());
        let mut predictions = Vec::with_capacity(samples.len());
        for batch in eval_batches(samples, self.test_transform(), self.config.batch_size) {
            predictions.extend(argmax_rows(&net.forward(&batch.inputs)));
            labels.extend(batch.targets);
        }
        TestOutcome::from_predictions(labels, predictions)
    }
}

fn count_correct(output: &Array2<f32>, labels: &[usize]) -> usize {
    argmax_rows(output)
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Identity;
    use crate::data::synthetic::{BlobConfig, gaussian_blobs};
    use crate::model::Mlp;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn trainer(outputs: usize) -> Trainer<Mlp> {
        let config = TrainerConfig {
            lr: 0.5,
            classes_per_group: 2,
            batch_size: 4,
            epochs: 5,
            ..TrainerConfig::default()
        };
        let net = Mlp::new(4, 8, outputs, &mut StdRng::seed_from_u64(0));
        Trainer::new(net, config, Arc::new(Identity), Arc::new(Identity))
    }

    #[test]
    fn test_onehot_encoding_targets_newest_group() {
        let t = trainer(4);
        let encoded = t.onehot_encoding(&[3, 2, 0]);
        assert_eq!(encoded, array![[0.0, 1.0], [1.0, 0.0], [0.0, 0.0]]);
    }

    #[test]
    fn test_add_output_nodes_widens_by_group() {
        let mut t = trainer(2);
        t.add_output_nodes();
        assert_eq!(t.net().num_outputs(), 4);
    }

    #[test]
    fn test_train_epoch_lowers_loss() {
        let data = gaussian_blobs(&BlobConfig {
            num_groups: 1,
            classes_per_group: 2,
            input_dim: 4,
            train_per_class: 16,
            ..BlobConfig::default()
        });
        let mut t = trainer(2);
        let (mut sgd, scheduler) = t.optimizer();
        let mut loader = t.train_loader(data.groups[0].train.clone());

        let first = t.train_epoch(&mut loader, None, &mut sgd, &scheduler).unwrap();
        let mut last = first;
        for _ in 0..10 {
            last = t.train_epoch(&mut loader, None, &mut sgd, &scheduler).unwrap();
        }
        assert!(last.loss < first.loss);
        assert!(t.validate(&data.groups[0].validation).accuracy > 0.5);
        let outcome = t.test(t.net(), &data.groups[0].test);
        assert_eq!(outcome.true_labels.len(), data.groups[0].test.len());
    }

    #[test]
    fn test_train_epoch_without_full_batch_fails() {
        let mut t = trainer(2);
        let (mut sgd, scheduler) = t.optimizer();
        let samples = vec![Sample::new(0, array![0.0, 0.0, 0.0, 0.0], 0)];
        let mut loader = t.train_loader(samples);
        let err = t.train_epoch(&mut loader, None, &mut sgd, &scheduler).unwrap_err();
        assert!(matches!(err, LearnError::Training(_)));
    }
}
