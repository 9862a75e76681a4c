//! Input transforms applied between raw samples and the network.

use ndarray::{Array1, ArrayView1};

/// Maps a raw sample to a network input.
pub trait Transform: Send + Sync {
    fn apply(&self, raw: ArrayView1<f32>) -> Array1<f32>;
}

/// Pass-through transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform for Identity {
    fn apply(&self, raw: ArrayView1<f32>) -> Array1<f32> {
        raw.to_owned()
    }
}

/// `(x - mean) / std` with scalar statistics.
#[derive(Debug, Clone, Copy)]
pub struct Standardize {
    mean: f32,
    std: f32,
}

impl Standardize {
    pub fn new(mean: f32, std: f32) -> Self {
        Self {
            mean,
            std: if std > 0.0 { std } else { 1.0 },
        }
    }
}

impl Transform for Standardize {
    fn apply(&self, raw: ArrayView1<f32>) -> Array1<f32> {
        raw.mapv(|v| (v - self.mean) / self.std)
    }
}
