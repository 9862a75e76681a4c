//! Networks trained by the learners.
//!
//! A network exposes two views of an input batch: the embedding produced by
//! its feature extractor and the logits of its classification layer. The
//! learners never look inside the layers; they only need a forward pass, a
//! backward pass against a loss gradient, and mutable access to the
//! parameters for the optimizer.

pub mod frozen;
pub mod mlp;

pub use frozen::Frozen;
pub use mlp::{Linear, Mlp};

use crate::data::Transform;
use crate::error::LearnError;
use ndarray::{Array2, ArrayView1, Axis};
use rand::Rng;
use serde::Serialize;
use std::fmt;

/// A trainable classifier with a separable feature extractor.
pub trait Network: Clone + fmt::Debug + Serialize + Send + Sync {
    /// Intermediate activations kept by [`Network::forward_train`].
    type Cache;

    fn num_outputs(&self) -> usize;

    fn feature_dim(&self) -> usize;

    /// Embeddings of a batch, `[batch, feature_dim]`.
    fn features(&self, inputs: &Array2<f32>) -> Array2<f32>;

    /// Logits of a batch, `[batch, num_outputs]`.
    fn forward(&self, inputs: &Array2<f32>) -> Array2<f32>;

    /// Forward pass that keeps what [`Network::backward`] needs.
    fn forward_train(&self, inputs: &Array2<f32>) -> (Array2<f32>, Self::Cache);

    /// Parameter gradients given the gradient of the loss w.r.t. the logits.
    /// The order matches [`Network::parameters_mut`].
    fn backward(&self, cache: &Self::Cache, grad_output: &Array2<f32>) -> Vec<Array2<f32>>;

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>>;

    /// Widen the classification layer by `n` outputs, keeping existing weights.
    fn add_output_nodes<R: Rng + ?Sized>(&mut self, n: usize, rng: &mut R);
}

/// Input to [`extract_features`].
#[derive(Debug, Clone, Copy)]
pub enum FeatureInput<'a> {
    /// A batch already passed through its transform.
    Batch(&'a Array2<f32>),
    /// A single raw sample; requires a transform.
    Single(ArrayView1<'a, f32>),
}

/// Run the feature extractor of `net`.
///
/// A single raw sample must be transformed first, so passing one without a
/// transform is a contract violation reported as [`LearnError::Precondition`].
pub fn extract_features<N: Network>(
    net: &N,
    input: FeatureInput<'_>,
    transform: Option<&dyn Transform>,
) -> Result<Array2<f32>, LearnError> {
    match input {
        FeatureInput::Batch(inputs) => Ok(net.features(inputs)),
        FeatureInput::Single(raw) => {
            let transform = transform.ok_or_else(|| {
                LearnError::precondition(
                    "a single raw sample was passed to feature extraction without a transform",
                )
            })?;
            let inputs = transform.apply(raw).insert_axis(Axis(0));
            Ok(net.features(&inputs))
        }
    }
}
