//! Distillation loss for class-incremental training.
//!
//! Outputs of the live network for classes learned in earlier groups are
//! pulled toward the sigmoid outputs of the frozen previous network, while the
//! current group's outputs are trained against one-hot labels. Both halves use
//! binary cross-entropy on logits.

use crate::ops::{LossOutput, bce_with_logits, sigmoid};
use ndarray::{Array2, s};

/// BCE against one-hot labels, with soft targets for earlier classes once a
/// previous-group snapshot exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistillationLoss;

impl DistillationLoss {
    pub fn new() -> Self {
        Self
    }

    /// Build the target matrix for one batch.
    ///
    /// Without `old_logits` this is `one_hot_current` itself. With them, the
    /// first `prior = old_logits.ncols()` columns hold `sigmoid(old_logits)`
    /// and the rest the one-hot labels of the current group.
    ///
    /// # Panics
    ///
    /// Panics if the batch sizes differ.
    pub fn targets(
        &self,
        one_hot_current: &Array2<f32>,
        old_logits: Option<&Array2<f32>>,
    ) -> Array2<f32> {
        match old_logits {
            None => one_hot_current.clone(),
            Some(old) => {
                assert_eq!(
                    old.nrows(),
                    one_hot_current.nrows(),
                    "Snapshot output and labels must have same batch size"
                );
                let prior = old.ncols();
                let mut target =
                    Array2::zeros((old.nrows(), prior + one_hot_current.ncols()));
                target.slice_mut(s![.., ..prior]).assign(&sigmoid(old));
                target.slice_mut(s![.., prior..]).assign(one_hot_current);
                target
            }
        }
    }

    /// Loss and logit gradient of `output` for one batch.
    ///
    /// `output` spans every class seen so far; `one_hot_current` spans the
    /// current group. When a snapshot output is given, only its first
    /// `output.ncols() - one_hot_current.ncols()` columns are used.
    ///
    /// # Panics
    ///
    /// Panics if the widths do not line up.
    pub fn compute(
        &self,
        output: &Array2<f32>,
        one_hot_current: &Array2<f32>,
        old_logits: Option<&Array2<f32>>,
    ) -> LossOutput {
        let prior = output.ncols().saturating_sub(one_hot_current.ncols());
        let old_prior = old_logits.map(|old| old.slice(s![.., ..prior]).to_owned());
        let target = self.targets(one_hot_current, old_prior.as_ref());
        bce_with_logits(output, &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::one_hot;
    use ndarray::{Axis, array, concatenate};

    #[test]
    fn test_first_group_is_plain_bce() {
        let output = array![[0.3, -1.2], [2.0, 0.1]];
        let labels = one_hot(&[1, 0], 2);
        let distilled = DistillationLoss::new().compute(&output, &labels, None);
        let plain = bce_with_logits(&output, &labels);
        assert_eq!(distilled.loss, plain.loss);
        assert_eq!(distilled.grad, plain.grad);
    }

    #[test]
    fn test_targets_concatenate_soft_and_hard() {
        let old = array![[0.0, 100.0]];
        let labels = one_hot(&[0], 2);
        let target = DistillationLoss::new().targets(&labels, Some(&old));
        assert_eq!(target.shape(), &[1, 4]);
        assert!((target[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((target[[0, 1]] - 1.0).abs() < 1e-6);
        assert_eq!(target.slice(s![.., 2..]), labels);
    }

    #[test]
    fn test_snapshot_changes_loss_when_soft_targets_differ() {
        let output = array![[0.5, -0.5, 1.0, -1.0]];
        let labels = one_hot(&[0], 2);
        let old = array![[3.0, -2.0]];
        let loss = DistillationLoss::new();

        let with_snapshot = loss.compute(&output, &labels, Some(&old));
        let hard = concatenate(Axis(1), &[Array2::zeros((1, 2)).view(), labels.view()]).unwrap();
        let without = bce_with_logits(&output, &hard);
        assert!((with_snapshot.loss - without.loss).abs() > 1e-4);
    }

    #[test]
    fn test_wider_snapshot_output_is_sliced_to_prior_classes() {
        let output = array![[0.5, -0.5, 1.0]];
        let labels = one_hot(&[0], 1);
        let old = array![[1.0, 2.0, 7.0]];
        let out = DistillationLoss::new().compute(&output, &labels, Some(&old));
        let soft = sigmoid(&array![[1.0, 2.0]]);
        let expected = bce_with_logits(&output, &array![[soft[[0, 0]], soft[[0, 1]], 1.0]]);
        assert!((out.loss - expected.loss).abs() < 1e-6);
    }
}
