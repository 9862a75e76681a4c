//! Batch loaders.

use super::{Sample, Transform};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Batching behaviour of a [`SampleLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl LoaderConfig {
    /// Shuffled, incomplete trailing batch dropped.
    pub fn train(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: true,
            drop_last: true,
        }
    }

    /// Ordered, every sample kept.
    pub fn eval(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
        }
    }
}

/// A batch of transformed inputs with their targets.
#[derive(Debug, Clone)]
pub struct Batch<T = Vec<usize>> {
    pub indices: Vec<usize>,
    pub inputs: Array2<f32>,
    pub targets: T,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }
}

/// Anything that yields the batches of one epoch, in order.
pub trait BatchSource<T> {
    fn num_batches(&self) -> usize;

    fn epoch_batches(&mut self) -> Vec<Batch<T>>;
}

/// Pre-built batches replayed identically every epoch.
impl<T: Clone> BatchSource<T> for Vec<Batch<T>> {
    fn num_batches(&self) -> usize {
        self.len()
    }

    fn epoch_batches(&mut self) -> Vec<Batch<T>> {
        self.clone()
    }
}

/// Batches raw samples through a transform, reshuffling every epoch.
pub struct SampleLoader {
    samples: Vec<Sample>,
    transform: Arc<dyn Transform>,
    config: LoaderConfig,
    rng: StdRng,
}

impl SampleLoader {
    pub fn new(
        samples: Vec<Sample>,
        transform: Arc<dyn Transform>,
        config: LoaderConfig,
        seed: u64,
    ) -> Self {
        Self {
            samples,
            transform,
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    fn build(&self, order: &[usize]) -> Batch<Vec<usize>> {
        let dim = self.samples.first().map(|s| s.raw.len()).unwrap_or(0);
        let mut inputs = Array2::zeros((order.len(), dim));
        let mut indices = Vec::with_capacity(order.len());
        let mut labels = Vec::with_capacity(order.len());
        for (row, &i) in order.iter().enumerate() {
            let sample = &self.samples[i];
            inputs
                .row_mut(row)
                .assign(&self.transform.apply(sample.raw.view()));
            indices.push(sample.index);
            labels.push(sample.label);
        }
        Batch {
            indices,
            inputs,
            targets: labels,
        }
    }
}

impl BatchSource<Vec<usize>> for SampleLoader {
    fn num_batches(&self) -> usize {
        let n = self.samples.len();
        let bs = self.batch_size();
        if self.config.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    fn epoch_batches(&mut self) -> Vec<Batch<Vec<usize>>> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut self.rng);
        }
        let bs = self.batch_size();
        order
            .chunks(bs)
            .filter(|chunk| !self.config.drop_last || chunk.len() == bs)
            .map(|chunk| self.build(chunk))
            .collect()
    }
}
