//! Classification heads used for the test pass of each group.
//!
//! - [`NearestMeanClassifier`] - nearest mean of exemplars in feature space
//! - [`SvmHead`] - kernel SVM grid-searched on the group's validation split
//! - network argmax over the classification layer

pub mod nme;
pub mod svm_head;

pub use nme::{NearestMeanClassifier, PrototypeCache, compute_prototypes, nearest_prototype};
pub use svm_head::SvmHead;

use crate::config::OwrConfig;
use crate::data::{GroupSplit, Sample, Transform, stack};
use crate::error::LearnError;
use crate::exemplar::ExemplarMemory;
use crate::model::{FeatureInput, Network, extract_features};
use crate::ops::argmax_rows;
use crate::training::{TestOutcome, eval_batches};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which head classifies the test split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadKind {
    #[default]
    NearestMean,
    Svm,
    Network,
}

/// Everything a head may look at when evaluating one group.
pub struct EvalContext<'a, N: Network> {
    /// Best network of the group.
    pub net: &'a N,
    pub transform: Arc<dyn Transform>,
    pub memory: &'a ExemplarMemory,
    pub group: &'a GroupSplit,
    pub classes_per_group: usize,
    pub batch_size: usize,
}

impl<N: Network> EvalContext<'_, N> {
    /// Embeddings of raw samples through the test transform.
    pub fn embed(&self, samples: &[Sample]) -> Result<Array2<f32>, LearnError> {
        let inputs = stack(samples, self.transform.as_ref());
        extract_features(self.net, FeatureInput::Batch(&inputs), None)
    }

    /// Exemplars of earlier classes plus the current group's training set.
    fn augmented_train(&self) -> Vec<Sample> {
        let newest = self
            .memory
            .num_classes()
            .saturating_sub(self.classes_per_group);
        let mut samples: Vec<Sample> = self.memory.class_sets()[..newest]
            .iter()
            .flatten()
            .cloned()
            .collect();
        samples.extend(self.group.train.iter().cloned());
        samples
    }
}

/// Configured classification head.
#[derive(Debug, Clone)]
pub enum ClassifierHead {
    NearestMean(NearestMeanClassifier),
    Svm(SvmHead),
    Network,
}

impl ClassifierHead {
    pub fn from_config(config: &OwrConfig) -> Self {
        match config.classifier.head {
            HeadKind::NearestMean => ClassifierHead::NearestMean(NearestMeanClassifier::new(
                config.classifier.include_current_in_means,
            )),
            HeadKind::Svm => ClassifierHead::Svm(SvmHead::new(&config.svm)),
            HeadKind::Network => ClassifierHead::Network,
        }
    }

    pub fn kind(&self) -> HeadKind {
        match self {
            ClassifierHead::NearestMean(_) => HeadKind::NearestMean,
            ClassifierHead::Svm(_) => HeadKind::Svm,
            ClassifierHead::Network => HeadKind::Network,
        }
    }

    /// Classify the group's test split (every class seen so far).
    pub fn evaluate<N: Network>(
        &mut self,
        ctx: &EvalContext<'_, N>,
    ) -> Result<TestOutcome, LearnError> {
        match self {
            ClassifierHead::NearestMean(nme) => {
                nme.invalidate();
                let pool = nme.include_current().then_some(ctx.group.train.as_slice());

                let mut labels = Vec::with_capacity(ctx.group.test.len());
                let mut predictions = Vec::with_capacity(ctx.group.test.len());
                for batch in eval_batches(&ctx.group.test, Arc::clone(&ctx.transform), ctx.batch_size) {
                    let features = extract_features(ctx.net, FeatureInput::Batch(&batch.inputs), None)?;
                    predictions.extend(nme.classify(&features, || {
                        compute_prototypes(ctx.memory, |s| ctx.embed(s), pool, ctx.classes_per_group)
                    })?);
                    labels.extend(batch.targets);
                }
                Ok(TestOutcome::from_predictions(labels, predictions))
            }
            ClassifierHead::Svm(head) => head.evaluate(
                |s| ctx.embed(s),
                &ctx.augmented_train(),
                &ctx.group.validation,
                &ctx.group.test,
            ),
            ClassifierHead::Network => {
                let mut labels = Vec::with_capacity(ctx.group.test.len());
                let mut predictions = Vec::with_capacity(ctx.group.test.len());
                for batch in eval_batches(&ctx.group.test, Arc::clone(&ctx.transform), ctx.batch_size) {
                    predictions.extend(argmax_rows(&ctx.net.forward(&batch.inputs)));
                    labels.extend(batch.targets);
                }
                Ok(TestOutcome::from_predictions(labels, predictions))
            }
        }
    }
}
