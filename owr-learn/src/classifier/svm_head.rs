//! SVM head on frozen, unit-normalised embeddings.

use crate::config::SvmConfig;
use crate::data::Sample;
use crate::error::LearnError;
use crate::ops::l2_normalize_rows;
use crate::svm::{GridSearchOutcome, KernelSvm, ParamGrid, SvmProblem, grid_search};
use crate::training::TestOutcome;
use ndarray::Array2;

/// Retrains a grid-searched SVM from scratch at every evaluation.
#[derive(Debug, Clone)]
pub struct SvmHead {
    grid: ParamGrid,
    epochs: usize,
    seed: u64,
    last: Option<GridSearchOutcome>,
}

impl SvmHead {
    pub fn new(config: &SvmConfig) -> Self {
        Self {
            grid: config.grid.clone(),
            epochs: config.epochs,
            seed: config.seed,
            last: None,
        }
    }

    /// Outcome of the most recent grid search.
    pub fn last_search(&self) -> Option<&GridSearchOutcome> {
        self.last.as_ref()
    }

    /// Fit on `train`, select on `validation`, predict `test`.
    pub fn evaluate<F>(
        &mut self,
        mut embed: F,
        train: &[Sample],
        validation: &[Sample],
        test: &[Sample],
    ) -> Result<TestOutcome, LearnError>
    where
        F: FnMut(&[Sample]) -> Result<Array2<f32>, LearnError>,
    {
        let (x_train, y_train) = separate(&mut embed, train)?;
        let (x_val, y_val) = separate(&mut embed, validation)?;
        let problem = SvmProblem::new(&x_train, &y_train)?;
        let outcome = grid_search(&self.grid, &problem, (&x_val, &y_val), self.epochs, self.seed)?;

        let settings = problem.settings(outcome.params, self.epochs, self.seed)?;
        let model = KernelSvm::fit(outcome.params, &problem, &settings)?;
        let (x_test, y_test) = separate(&mut embed, test)?;
        let predictions = model.predict(&x_test)?;
        self.last = Some(outcome);
        Ok(TestOutcome::from_predictions(y_test, predictions))
    }
}

/// Unit-norm embeddings and labels of `samples`.
fn separate<F>(embed: &mut F, samples: &[Sample]) -> Result<(Array2<f32>, Vec<usize>), LearnError>
where
    F: FnMut(&[Sample]) -> Result<Array2<f32>, LearnError>,
{
    let features = l2_normalize_rows(&embed(samples)?);
    let labels = samples.iter().map(|s| s.label).collect();
    Ok((features, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Identity, stack};
    use ndarray::array;

    #[test]
    fn test_svm_head_separates_directions() {
        let samples = vec![
            Sample::new(0, array![1.0, 0.1], 0),
            Sample::new(1, array![2.0, 0.0], 0),
            Sample::new(2, array![1.5, 0.2], 0),
            Sample::new(3, array![0.1, 1.0], 1),
            Sample::new(4, array![0.0, 2.0], 1),
            Sample::new(5, array![0.2, 1.5], 1),
        ];
        let mut head = SvmHead::new(&SvmConfig::default());
        let outcome = head
            .evaluate(|s| Ok(stack(s, &Identity)), &samples, &samples, &samples)
            .unwrap();
        assert_eq!(outcome.predictions, outcome.true_labels);
        assert_eq!(outcome.accuracy, 1.0);
        assert!(head.last_search().is_some());
    }
}
