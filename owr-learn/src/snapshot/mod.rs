//! Snapshot ensembles for class-incremental learning.
//!
//! A single member is trained under a cyclic cosine learning rate that
//! restarts `n_estimators` times; at the end of every cycle a copy of the
//! member is added to the ensemble. The ensemble output is the mean of the
//! members' raw outputs. Once `fit` returns, the members are frozen as the
//! distillation target of the next call.

pub mod objective;

pub use objective::{Classification, EvalAccumulator, EvalReport, Objective, Regression};

use crate::config::SnapshotConfig;
use crate::data::BatchSource;
use crate::error::LearnError;
use crate::model::{Frozen, Network};
use crate::ops::mean_of;
use crate::optim::{LrScheduler, Sgd, SnapshotCosineLr, clip_lr};
use crate::training::{Checkpoint, CheckpointManager};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info};

/// Builds a fresh member with the given number of outputs.
pub type EstimatorFactory<N> = Box<dyn Fn(usize, &mut StdRng) -> N + Send + Sync>;

/// Per-call training options.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    /// Accepted `(low, high)` range of the learning rate.
    pub lr_clip: Option<(f32, f32)>,
    pub epochs: usize,
    /// Batches between two training status lines.
    pub log_interval: usize,
    pub save_model: bool,
    /// Defaults to the current directory.
    pub save_dir: Option<PathBuf>,
    pub max_checkpoints: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self::from(&SnapshotConfig::default())
    }
}

impl From<&SnapshotConfig> for FitOptions {
    fn from(config: &SnapshotConfig) -> Self {
        Self {
            lr_clip: config.lr_clip,
            epochs: config.epochs,
            log_interval: config.log_interval,
            save_model: config.save_model,
            save_dir: config.save_dir.clone(),
            max_checkpoints: 20,
        }
    }
}

/// Reject options the training loop cannot honour.
pub fn validate_parameters(options: &FitOptions, n_estimators: usize) -> Result<(), LearnError> {
    let fail = |msg: String| {
        error!("{msg}");
        Err(LearnError::config(msg))
    };

    if let Some((low, high)) = options.lr_clip {
        if low.is_nan() || high.is_nan() || low >= high {
            return fail(format!(
                "The first element = {low} should be smaller than the second element = {high} in lr_clip."
            ));
        }
    }
    if options.epochs == 0 {
        return fail(format!(
            "The number of training epochs = {} should be strictly positive.",
            options.epochs
        ));
    }
    if options.log_interval == 0 {
        return fail(
            "The number of batches to wait before logging the training status should be strictly positive."
                .to_string(),
        );
    }
    if n_estimators == 0 {
        return fail("n_estimators should be strictly positive.".to_string());
    }
    if options.epochs % n_estimators != 0 {
        return fail(format!(
            "The number of training epochs = {} should be a multiple of n_estimators = {}.",
            options.epochs, n_estimators
        ));
    }
    Ok(())
}

/// Optimizer settings of the trained member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerSettings {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl From<&SnapshotConfig> for OptimizerSettings {
    fn from(config: &SnapshotConfig) -> Self {
        Self {
            lr: config.lr,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
        }
    }
}

/// Summary of one `fit` call.
#[derive(Debug, Clone, Default)]
pub struct FitReport {
    /// Iteration count at which each snapshot was taken.
    pub snapshot_iterations: Vec<usize>,
    /// Held-out evaluation after each snapshot, when a test loader was given.
    pub evaluations: Vec<EvalReport>,
    /// Best held-out evaluation, when a test loader was given.
    pub best: Option<EvalReport>,
    pub saved: Vec<Checkpoint>,
}

pub struct SnapshotEnsemble<N: Network, O: Objective> {
    factory: EstimatorFactory<N>,
    objective: O,
    n_estimators: usize,
    optimizer: OptimizerSettings,
    estimators: Vec<N>,
    old_ensemble: Option<Frozen<Vec<N>>>,
    rng: StdRng,
    run_id: String,
}

impl<N: Network, O: Objective> fmt::Debug for SnapshotEnsemble<N, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotEnsemble")
            .field("n_estimators", &self.n_estimators)
            .field("optimizer", &self.optimizer)
            .field("members", &self.estimators.len())
            .field("has_old_ensemble", &self.old_ensemble.is_some())
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl<N: Network, O: Objective> SnapshotEnsemble<N, O> {
    pub fn new(
        factory: EstimatorFactory<N>,
        objective: O,
        n_estimators: usize,
        optimizer: OptimizerSettings,
        seed: u64,
    ) -> Self {
        Self {
            factory,
            objective,
            n_estimators,
            optimizer,
            estimators: Vec::new(),
            old_ensemble: None,
            rng: StdRng::seed_from_u64(seed),
            run_id: format!("snapshot-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn n_estimators(&self) -> usize {
        self.n_estimators
    }

    pub fn estimators(&self) -> &[N] {
        &self.estimators
    }

    /// Members of the previous `fit`, used as the distillation target.
    pub fn old_ensemble(&self) -> Option<&Frozen<Vec<N>>> {
        self.old_ensemble.as_ref()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Train a new ensemble for `group`.
    ///
    /// A snapshot is taken every `epochs * batches / n_estimators`
    /// iterations. With a `test` loader the ensemble is evaluated after every
    /// snapshot and saved on strict improvement; without one it is saved once
    /// at the end.
    pub fn fit(
        &mut self,
        train: &mut dyn BatchSource<O::Target>,
        options: &FitOptions,
        mut test: Option<&mut dyn BatchSource<O::Target>>,
        group: usize,
    ) -> Result<FitReport, LearnError> {
        validate_parameters(options, self.n_estimators)?;
        let n_batches = train.num_batches();
        if n_batches == 0 {
            return Err(LearnError::dataset("training loader yields no batches"));
        }

        self.estimators.clear();
        let n_outputs = self.objective.n_outputs(group);
        let mut estimator = (self.factory)(n_outputs, &mut self.rng);

        let total_iters = options.epochs * n_batches;
        let mut sgd = Sgd::new(
            self.optimizer.lr,
            self.optimizer.momentum,
            self.optimizer.weight_decay,
        );
        let mut scheduler = SnapshotCosineLr::new(self.optimizer.lr, total_iters, self.n_estimators);
        let n_iters_per_estimator = (total_iters / self.n_estimators).max(1);

        let mut report = FitReport::default();
        let mut counter = 0usize;

        for epoch in 0..options.epochs {
            for (batch_idx, batch) in train.epoch_batches().into_iter().enumerate() {
                let lr = clip_lr(scheduler.get_lr(), options.lr_clip);
                sgd.set_lr(lr);

                self.objective.check_target(&batch.targets, n_outputs)?;
                let old_output = match &self.old_ensemble {
                    Some(old) if self.objective.distills() => {
                        Some(self.objective.finalize(average_output(old, &batch.inputs)?))
                    }
                    _ => None,
                };
                let (output, cache) = estimator.forward_train(&batch.inputs);
                let loss = self
                    .objective
                    .loss(&output, &batch.targets, old_output.as_ref());
                let grads = estimator.backward(&cache, &loss.grad);
                sgd.step(estimator.parameters_mut(), &grads);

                if batch_idx % options.log_interval == 0 {
                    match self.objective.train_status(&output, &batch.targets) {
                        Some((correct, size)) => info!(
                            lr,
                            epoch,
                            batch = batch_idx,
                            loss = loss.loss,
                            correct,
                            batch_size = size,
                            "Training status"
                        ),
                        None => info!(lr, epoch, batch = batch_idx, loss = loss.loss, "Training status"),
                    }
                }

                scheduler.step();
                counter += 1;

                if counter % n_iters_per_estimator == 0 {
                    self.estimators.push(estimator.clone());
                    report.snapshot_iterations.push(counter);
                    info!(index = self.estimators.len() - 1, "Save the snapshot model");

                    if let Some(loader) = test.as_deref_mut() {
                        let eval = self.evaluate(loader)?;
                        report.evaluations.push(eval);
                        if self.objective.improves(&eval, report.best.as_ref()) {
                            report.best = Some(eval);
                            if options.save_model {
                                report.saved.push(self.save(options, group, eval.score())?);
                            }
                        }
                        info!(
                            n_estimators = self.estimators.len(),
                            score = eval.score(),
                            best = report.best.map(|b| b.score()),
                            "Validation"
                        );
                    }
                }
            }
        }

        self.old_ensemble = Some(Frozen::capture(&self.estimators));
        if options.save_model && test.is_none() {
            report.saved.push(self.save(options, group, 0.0)?);
        }
        Ok(report)
    }

    /// Mean of the members' raw outputs.
    fn averaged(&self, x: &Array2<f32>) -> Result<Array2<f32>, LearnError> {
        average_output(&self.estimators, x)
    }

    /// Ensemble output: the finalized mean of the members' raw outputs.
    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>, LearnError> {
        Ok(self.objective.finalize(self.averaged(x)?))
    }

    pub fn predict(&self, x: &Array2<f32>) -> Result<Array2<f32>, LearnError> {
        self.forward(x)
    }

    /// Mean and per-element variance of the members' raw outputs.
    ///
    /// The variance is `mean(out^2) - mean(out)^2`, clamped at zero against
    /// rounding.
    pub fn predict_with_variance(
        &self,
        x: &Array2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>), LearnError> {
        let outputs = self.member_outputs(x)?;
        let squares: Vec<Array2<f32>> = outputs.iter().map(|o| o.mapv(|v| v * v)).collect();
        let (Some(mean), Some(mean_sq)) = (mean_of(&outputs), mean_of(&squares)) else {
            return Err(empty_ensemble());
        };
        let variance = (mean_sq - mean.mapv(|v| v * v)).mapv(|v| v.max(0.0));
        Ok((mean, variance))
    }

    /// Score the current ensemble on every batch of `loader`.
    pub fn evaluate(&self, loader: &mut dyn BatchSource<O::Target>) -> Result<EvalReport, LearnError> {
        let mut acc = EvalAccumulator::default();
        for batch in loader.epoch_batches() {
            let averaged = self.averaged(&batch.inputs)?;
            self.objective.check_target(&batch.targets, averaged.ncols())?;
            self.objective.eval_batch(&averaged, &batch.targets, &mut acc);
        }
        Ok(self.objective.report(&acc))
    }

    fn member_outputs(&self, x: &Array2<f32>) -> Result<Vec<Array2<f32>>, LearnError> {
        if self.estimators.is_empty() {
            return Err(empty_ensemble());
        }
        Ok(self.estimators.iter().map(|e| e.forward(x)).collect())
    }

    fn save(&self, options: &FitOptions, group: usize, score: f64) -> Result<Checkpoint, LearnError> {
        let dir = options.save_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        let manager = CheckpointManager::new(dir, options.max_checkpoints);
        let checkpoint = manager.save_state(
            &self.run_id,
            &format!("group-{group}-ensemble-{}", self.estimators.len()),
            self.estimators.len(),
            score,
            &self.estimators,
        )?;
        info!(path = %checkpoint.path.display(), "Saved snapshot ensemble");
        Ok(checkpoint)
    }
}

fn average_output<N: Network>(members: &[N], x: &Array2<f32>) -> Result<Array2<f32>, LearnError> {
    let outputs: Vec<Array2<f32>> = members.iter().map(|m| m.forward(x)).collect();
    mean_of(&outputs).ok_or_else(empty_ensemble)
}

fn empty_ensemble() -> LearnError {
    LearnError::precondition("the ensemble has no members yet; call fit first")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::model::Mlp;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn mlp_factory() -> EstimatorFactory<Mlp> {
        Box::new(|n_outputs: usize, rng: &mut StdRng| Mlp::new(2, 8, n_outputs, rng))
    }

    fn settings() -> OptimizerSettings {
        OptimizerSettings {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }

    fn class_batches(labels: [usize; 4]) -> Vec<Batch<Vec<usize>>> {
        vec![
            Batch {
                indices: vec![0, 1],
                inputs: array![[1.0, 0.0], [0.0, 1.0]],
                targets: vec![labels[0], labels[1]],
            },
            Batch {
                indices: vec![2, 3],
                inputs: array![[0.9, 0.1], [0.1, 0.9]],
                targets: vec![labels[2], labels[3]],
            },
        ]
    }

    fn options(epochs: usize) -> FitOptions {
        FitOptions {
            epochs,
            save_model: false,
            ..FitOptions::default()
        }
    }

    #[test]
    fn test_validate_parameters() {
        assert!(validate_parameters(&options(10), 5).is_ok());
        let cases = [
            FitOptions { lr_clip: Some((0.1, 0.01)), ..options(10) },
            FitOptions { lr_clip: Some((0.1, 0.1)), ..options(10) },
            options(0),
            FitOptions { log_interval: 0, ..options(10) },
            options(7),
        ];
        for case in cases {
            let err = validate_parameters(&case, 5).unwrap_err();
            assert!(matches!(err, LearnError::Config(_)), "{case:?}");
        }
    }

    #[test]
    fn test_invalid_options_fail_before_training() {
        let mut ensemble = SnapshotEnsemble::new(mlp_factory(), Classification::new(2), 5, settings(), 0);
        let mut train = class_batches([0, 1, 0, 1]);
        assert!(ensemble.fit(&mut train, &options(7), None, 0).is_err());
        assert!(ensemble.estimators().is_empty());
        assert!(ensemble.old_ensemble().is_none());
    }

    #[test]
    fn test_snapshot_cadence() {
        let mut ensemble = SnapshotEnsemble::new(mlp_factory(), Classification::new(2), 5, settings(), 0);
        let mut train = class_batches([0, 1, 0, 1]);
        let report = ensemble.fit(&mut train, &options(10), None, 0).unwrap();
        assert_eq!(report.snapshot_iterations, vec![4, 8, 12, 16, 20]);
        assert_eq!(ensemble.estimators().len(), 5);
        assert_eq!(ensemble.old_ensemble().unwrap().len(), 5);
    }

    #[test]
    fn test_second_group_distills_and_resets_members() {
        let mut ensemble = SnapshotEnsemble::new(mlp_factory(), Classification::new(2), 2, settings(), 1);
        let mut first = class_batches([0, 1, 0, 1]);
        ensemble.fit(&mut first, &options(4), None, 0).unwrap();

        let mut second = class_batches([2, 3, 2, 3]);
        ensemble.fit(&mut second, &options(4), None, 1).unwrap();
        assert_eq!(ensemble.estimators().len(), 2);
        assert_eq!(ensemble.estimators()[0].fc.out_features(), 4);
        let probs = ensemble.predict(&array![[1.0, 0.0]]).unwrap();
        assert!((probs.sum() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_variance_is_non_negative() {
        let mut ensemble = SnapshotEnsemble::new(mlp_factory(), Classification::new(2), 5, settings(), 2);
        assert!(matches!(
            ensemble.predict_with_variance(&array![[0.0, 0.0]]),
            Err(LearnError::Precondition(_))
        ));
        let mut train = class_batches([0, 1, 0, 1]);
        ensemble.fit(&mut train, &options(10), None, 0).unwrap();
        let (mean, variance) = ensemble
            .predict_with_variance(&array![[1.0, 0.0], [0.3, 0.7]])
            .unwrap();
        assert_eq!(mean.shape(), variance.shape());
        assert!(variance.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_saves_on_improvement_or_once_at_end() {
        let dir = TempDir::new().unwrap();
        let save = FitOptions {
            save_model: true,
            save_dir: Some(dir.path().to_path_buf()),
            ..options(10)
        };

        let mut ensemble = SnapshotEnsemble::new(mlp_factory(), Classification::new(2), 5, settings(), 3);
        let mut train = class_batches([0, 1, 0, 1]);
        let report = ensemble.fit(&mut train, &save, None, 0).unwrap();
        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.saved[0].step, 5);

        let mut held_out = class_batches([0, 1, 0, 1]);
        let report = ensemble
            .fit(&mut train, &save, Some(&mut held_out), 0)
            .unwrap();
        assert_eq!(report.evaluations.len(), 5);
        let mut best = 0.0;
        let mut improved = Vec::new();
        for (k, eval) in report.evaluations.iter().enumerate() {
            let acc = eval.accuracy().unwrap();
            if acc > best {
                best = acc;
                improved.push(k + 1);
            }
        }
        let steps: Vec<usize> = report.saved.iter().map(|c| c.step).collect();
        assert_eq!(steps, improved);
        assert_eq!(report.best.and_then(|b| b.accuracy()), improved.last().map(|_| best));
    }

    #[test]
    fn test_flat_held_out_accuracy_saves_only_first_snapshot() {
        let dir = TempDir::new().unwrap();
        let save = FitOptions {
            save_model: true,
            save_dir: Some(dir.path().to_path_buf()),
            ..options(10)
        };
        // Identical inputs with different labels: every ensemble scores 50%.
        let mut held_out = vec![Batch {
            indices: vec![0, 1],
            inputs: array![[0.5, 0.5], [0.5, 0.5]],
            targets: vec![0, 1],
        }];

        let mut ensemble = SnapshotEnsemble::new(mlp_factory(), Classification::new(2), 5, settings(), 5);
        let mut train = class_batches([0, 1, 0, 1]);
        let report = ensemble
            .fit(&mut train, &save, Some(&mut held_out), 0)
            .unwrap();

        assert_eq!(report.evaluations.len(), 5);
        assert!(report.evaluations.iter().all(|e| e.accuracy() == Some(50.0)));
        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.saved[0].step, 1);
    }

    #[test]
    fn test_labels_beyond_group_outputs_are_rejected() {
        let mut ensemble = SnapshotEnsemble::new(mlp_factory(), Classification::new(2), 2, settings(), 6);
        // Group 0 has 2 outputs; labels 2 and 3 belong to the next group.
        let mut train = class_batches([0, 1, 2, 3]);
        let err = ensemble.fit(&mut train, &options(4), None, 0).unwrap_err();
        assert!(matches!(err, LearnError::InvalidInput(_)));

        let mut train = class_batches([0, 1, 0, 1]);
        ensemble.fit(&mut train, &options(4), None, 0).unwrap();
        let mut held_out = class_batches([2, 3, 2, 3]);
        assert!(matches!(
            ensemble.evaluate(&mut held_out),
            Err(LearnError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_regression_reports_mse() {
        let factory: EstimatorFactory<Mlp> = Box::new(|n: usize, rng: &mut StdRng| Mlp::new(1, 8, n, rng));
        let mut ensemble = SnapshotEnsemble::new(factory, Regression::new(1), 2, settings(), 4);
        let mut train: Vec<Batch<Array2<f32>>> = vec![Batch {
            indices: vec![0, 1, 2],
            inputs: array![[0.0], [0.5], [1.0]],
            targets: array![[0.0], [1.0], [2.0]],
        }];
        let mut held_out = train.clone();
        let report = ensemble
            .fit(&mut train, &options(20), Some(&mut held_out), 0)
            .unwrap();
        assert!(report.best.is_some());
        let eval = ensemble.evaluate(&mut held_out).unwrap();
        assert!(eval.mse().unwrap().is_finite());
        assert_eq!(eval.accuracy(), None);
    }
}
