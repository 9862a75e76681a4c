//! What a snapshot ensemble optimises and how it is scored.

use crate::error::LearnError;
use crate::ops::{LossOutput, argmax_rows, cosine_embedding, cross_entropy, mse, sigmoid, softmax_rows};
use ndarray::{Array2, s};
use serde::{Deserialize, Serialize};

/// Held-out evaluation of an ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalReport {
    /// `accuracy` is a percentage in `[0, 100]`.
    Classification { accuracy: f32, loss: f32 },
    Regression { mse: f32 },
}

impl EvalReport {
    pub fn accuracy(&self) -> Option<f32> {
        match self {
            EvalReport::Classification { accuracy, .. } => Some(*accuracy),
            EvalReport::Regression { .. } => None,
        }
    }

    pub fn mse(&self) -> Option<f32> {
        match self {
            EvalReport::Classification { .. } => None,
            EvalReport::Regression { mse } => Some(*mse),
        }
    }

    pub fn loss(&self) -> f32 {
        match self {
            EvalReport::Classification { loss, .. } => *loss,
            EvalReport::Regression { mse } => *mse,
        }
    }

    /// Higher is better.
    pub fn score(&self) -> f64 {
        match self {
            EvalReport::Classification { accuracy, .. } => f64::from(*accuracy),
            EvalReport::Regression { mse } => -f64::from(*mse),
        }
    }
}

/// Running sums of an evaluation pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalAccumulator {
    pub loss_sum: f32,
    pub correct: usize,
    pub total: usize,
    pub batches: usize,
}

/// Loss, output head and scoring of an ensemble.
pub trait Objective {
    /// Per-batch targets.
    type Target: Clone;

    /// Output width of the members trained for `group`.
    fn n_outputs(&self, group: usize) -> usize;

    /// Reject targets the loss cannot score against `n_outputs` columns.
    fn check_target(&self, target: &Self::Target, n_outputs: usize) -> Result<(), LearnError>;

    /// Ensemble output from the averaged raw member outputs.
    fn finalize(&self, averaged: Array2<f32>) -> Array2<f32>;

    /// Whether the previous fit's ensemble takes part in the loss.
    fn distills(&self) -> bool {
        false
    }

    /// Loss of a member's raw `output`. `old_output` is the finalized output
    /// of the previous ensemble on the same inputs, when one exists.
    fn loss(
        &self,
        output: &Array2<f32>,
        target: &Self::Target,
        old_output: Option<&Array2<f32>>,
    ) -> LossOutput;

    /// `(correct, batch_size)` for training status lines, when meaningful.
    fn train_status(&self, _output: &Array2<f32>, _target: &Self::Target) -> Option<(usize, usize)> {
        None
    }

    fn eval_batch(&self, averaged: &Array2<f32>, target: &Self::Target, acc: &mut EvalAccumulator);

    fn report(&self, acc: &EvalAccumulator) -> EvalReport;

    /// Whether `candidate` beats the best report so far.
    fn improves(&self, candidate: &EvalReport, best: Option<&EvalReport>) -> bool;
}

/// Class-incremental classification: cross-entropy over every class seen so
/// far plus cosine-embedding distillation on the earlier classes.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub classes_per_group: usize,
}

impl Classification {
    pub fn new(classes_per_group: usize) -> Self {
        Self { classes_per_group }
    }
}

impl Objective for Classification {
    type Target = Vec<usize>;

    fn n_outputs(&self, group: usize) -> usize {
        (group + 1) * self.classes_per_group
    }

    fn check_target(&self, target: &Vec<usize>, n_outputs: usize) -> Result<(), LearnError> {
        match target.iter().find(|&&label| label >= n_outputs) {
            Some(label) => Err(LearnError::invalid_input(format!(
                "label {label} is outside the {n_outputs} classes seen so far"
            ))),
            None => Ok(()),
        }
    }

    fn finalize(&self, averaged: Array2<f32>) -> Array2<f32> {
        softmax_rows(&averaged)
    }

    fn distills(&self) -> bool {
        true
    }

    fn loss(
        &self,
        output: &Array2<f32>,
        target: &Vec<usize>,
        old_output: Option<&Array2<f32>>,
    ) -> LossOutput {
        let class_loss = cross_entropy(output, target);
        let Some(old) = old_output else {
            return class_loss;
        };

        let prior = output
            .ncols()
            .saturating_sub(self.classes_per_group)
            .min(old.ncols());
        if prior == 0 {
            return class_loss;
        }

        let soft = sigmoid(old).slice(s![.., ..prior]).to_owned();
        let current = output.slice(s![.., ..prior]).to_owned();
        let dist = cosine_embedding(&current, &soft);

        let mut grad = Array2::zeros(output.raw_dim());
        grad.slice_mut(s![.., ..prior]).assign(&dist.grad);
        class_loss.combine(LossOutput {
            loss: dist.loss,
            grad,
        })
    }

    fn train_status(&self, output: &Array2<f32>, target: &Vec<usize>) -> Option<(usize, usize)> {
        let correct = argmax_rows(output)
            .iter()
            .zip(target)
            .filter(|(p, t)| p == t)
            .count();
        Some((correct, target.len()))
    }

    fn eval_batch(&self, averaged: &Array2<f32>, target: &Vec<usize>, acc: &mut EvalAccumulator) {
        acc.loss_sum += cross_entropy(averaged, target).loss;
        acc.correct += argmax_rows(averaged)
            .iter()
            .zip(target)
            .filter(|(p, t)| p == t)
            .count();
        acc.total += target.len();
        acc.batches += 1;
    }

    fn report(&self, acc: &EvalAccumulator) -> EvalReport {
        EvalReport::Classification {
            accuracy: 100.0 * acc.correct as f32 / acc.total.max(1) as f32,
            loss: acc.loss_sum / acc.batches.max(1) as f32,
        }
    }

    fn improves(&self, candidate: &EvalReport, best: Option<&EvalReport>) -> bool {
        let best = best.and_then(EvalReport::accuracy).unwrap_or(0.0);
        candidate.accuracy().is_some_and(|acc| acc > best)
    }
}

/// Plain regression with mean squared error.
#[derive(Debug, Clone, Copy)]
pub struct Regression {
    pub n_outputs: usize,
}

impl Regression {
    pub fn new(n_outputs: usize) -> Self {
        Self { n_outputs }
    }
}

impl Objective for Regression {
    type Target = Array2<f32>;

    fn n_outputs(&self, _group: usize) -> usize {
        self.n_outputs
    }

    fn check_target(&self, target: &Array2<f32>, n_outputs: usize) -> Result<(), LearnError> {
        if target.ncols() != n_outputs {
            return Err(LearnError::invalid_input(format!(
                "targets have {} columns but the ensemble predicts {n_outputs}",
                target.ncols()
            )));
        }
        Ok(())
    }

    fn finalize(&self, averaged: Array2<f32>) -> Array2<f32> {
        averaged
    }

    fn loss(&self, output: &Array2<f32>, target: &Array2<f32>, _old: Option<&Array2<f32>>) -> LossOutput {
        mse(output, target)
    }

    fn eval_batch(&self, averaged: &Array2<f32>, target: &Array2<f32>, acc: &mut EvalAccumulator) {
        acc.loss_sum += mse(averaged, target).loss;
        acc.total += target.nrows();
        acc.batches += 1;
    }

    fn report(&self, acc: &EvalAccumulator) -> EvalReport {
        EvalReport::Regression {
            mse: acc.loss_sum / acc.batches.max(1) as f32,
        }
    }

    fn improves(&self, candidate: &EvalReport, best: Option<&EvalReport>) -> bool {
        let best = best.and_then(EvalReport::mse).unwrap_or(f32::INFINITY);
        candidate.mse().is_some_and(|mse| mse < best)
    }
}
