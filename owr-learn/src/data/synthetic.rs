//! Synthetic class-incremental data: one noisy blob per class.
//!
//! Used by the CLI demo and the integration tests; real datasets are wired in
//! by the caller.

use super::{GroupSplit, IncrementalDataset, Sample};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Shape of the generated dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    #[serde(default = "default_num_groups")]
    pub num_groups: usize,
    #[serde(default = "default_classes_per_group")]
    pub classes_per_group: usize,
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,
    #[serde(default = "default_train_per_class")]
    pub train_per_class: usize,
    #[serde(default = "default_val_per_class")]
    pub val_per_class: usize,
    #[serde(default = "default_test_per_class")]
    pub test_per_class: usize,
    /// Standard deviation of the per-sample noise, relative to the center scale.
    #[serde(default = "default_spread")]
    pub spread: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            num_groups: default_num_groups(),
            classes_per_group: default_classes_per_group(),
            input_dim: default_input_dim(),
            train_per_class: default_train_per_class(),
            val_per_class: default_val_per_class(),
            test_per_class: default_test_per_class(),
            spread: default_spread(),
            seed: default_seed(),
        }
    }
}

fn default_num_groups() -> usize {
    10
}

fn default_classes_per_group() -> usize {
    10
}

fn default_input_dim() -> usize {
    32
}

fn default_train_per_class() -> usize {
    50
}

fn default_val_per_class() -> usize {
    10
}

fn default_test_per_class() -> usize {
    20
}

fn default_spread() -> f32 {
    0.35
}

fn default_seed() -> u64 {
    42
}

/// Approximately normal noise (sum of three uniforms), unit variance.
fn noise(rng: &mut StdRng) -> f32 {
    (0..3).map(|_| rng.gen_range(-1.0f32..1.0)).sum()
}

/// Generate a dataset of `num_groups * classes_per_group` blobs.
///
/// The test split of group `g` holds the test samples of every class in
/// groups `0..=g`.
pub fn gaussian_blobs(config: &BlobConfig) -> IncrementalDataset {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let num_classes = config.num_groups * config.classes_per_group;
    let centers: Vec<Array1<f32>> = (0..num_classes)
        .map(|_| Array1::from_shape_fn(config.input_dim, |_| rng.gen_range(-1.0f32..1.0)))
        .collect();

    let mut next_index = 0usize;
    let mut draw = |class: usize, count: usize, rng: &mut StdRng| -> Vec<Sample> {
        (0..count)
            .map(|_| {
                let raw = centers[class].mapv(|c| c + config.spread * noise(rng));
                let sample = Sample::new(next_index, raw, class);
                next_index += 1;
                sample
            })
            .collect()
    };

    let mut groups = Vec::with_capacity(config.num_groups);
    let mut cumulative_test = Vec::new();
    for g in 0..config.num_groups {
        let mut split = GroupSplit::default();
        for c in 0..config.classes_per_group {
            let class = g * config.classes_per_group + c;
            split.train.extend(draw(class, config.train_per_class, &mut rng));
            split.validation.extend(draw(class, config.val_per_class, &mut rng));
            cumulative_test.extend(draw(class, config.test_per_class, &mut rng));
        }
        split.test = cumulative_test.clone();
        groups.push(split);
    }

    IncrementalDataset::new(config.classes_per_group, groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_layout() {
        let config = BlobConfig {
            num_groups: 3,
            classes_per_group: 2,
            input_dim: 4,
            train_per_class: 5,
            val_per_class: 2,
            test_per_class: 3,
            ..BlobConfig::default()
        };
        let data = gaussian_blobs(&config);
        assert_eq!(data.num_groups(), 3);
        assert_eq!(data.groups[1].train.len(), 10);
        assert!(data.groups[1].train.iter().all(|s| (2..4).contains(&s.label)));
        // Test splits accumulate every class seen so far.
        assert_eq!(data.groups[0].test.len(), 6);
        assert_eq!(data.groups[2].test.len(), 18);
    }
}
