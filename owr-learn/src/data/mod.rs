//! Data plumbing: raw samples, per-group splits, transforms and batch loaders.
//!
//! Datasets themselves are supplied by the caller. The types here only carry
//! raw (pre-transform) samples through the learners, which is what the
//! exemplar buffer stores.

pub mod loader;
pub mod synthetic;
pub mod transform;

pub use loader::{Batch, BatchSource, LoaderConfig, SampleLoader};
pub use transform::{Identity, Standardize, Transform};

use crate::error::LearnError;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// A single raw sample with its global class label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub index: usize,
    pub raw: Array1<f32>,
    pub label: usize,
}

impl Sample {
    pub fn new(index: usize, raw: Array1<f32>, label: usize) -> Self {
        Self { index, raw, label }
    }
}

/// Train / validation / test samples of one class group.
///
/// `test` is expected to cover every class seen up to and including this
/// group, since the learners report accuracy on all classes seen so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupSplit {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
    pub test: Vec<Sample>,
}

/// The full sequence of class groups presented to a learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalDataset {
    pub classes_per_group: usize,
    pub groups: Vec<GroupSplit>,
}

impl IncrementalDataset {
    pub fn new(classes_per_group: usize, groups: Vec<GroupSplit>) -> Self {
        Self {
            classes_per_group,
            groups,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, idx: usize) -> Result<&GroupSplit, LearnError> {
        self.groups
            .get(idx)
            .ok_or_else(|| LearnError::dataset(format!("group {idx} out of range")))
    }
}

/// Bucket samples by their position inside the group (`label % classes_per_group`).
pub fn by_class(samples: &[Sample], classes_per_group: usize) -> Vec<Vec<Sample>> {
    let mut buckets = vec![Vec::new(); classes_per_group];
    for sample in samples {
        buckets[sample.label % classes_per_group].push(sample.clone());
    }
    buckets
}

/// Apply `transform` to every sample and stack the results row-wise.
pub fn stack(samples: &[Sample], transform: &dyn Transform) -> Array2<f32> {
    let dim = samples.first().map(|s| s.raw.len()).unwrap_or(0);
    let mut out = Array2::zeros((samples.len(), dim));
    for (i, sample) in samples.iter().enumerate() {
        out.row_mut(i).assign(&transform.apply(sample.raw.view()));
    }
    out
}
