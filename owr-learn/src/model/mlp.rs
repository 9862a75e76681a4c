//! Two-layer perceptron: a ReLU feature extractor followed by a linear
//! classification layer (`fc`).

use super::Network;
use ndarray::{Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fully connected layer, `y = x W + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    /// `[in_features, out_features]`
    pub weight: Array2<f32>,
    /// `[1, out_features]`
    pub bias: Array2<f32>,
}

impl Linear {
    /// Uniform init in `±1/sqrt(in_features)`.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        Self {
            weight: Array2::from_shape_fn((in_features, out_features), |_| {
                rng.gen_range(-bound..=bound)
            }),
            bias: Array2::from_shape_fn((1, out_features), |_| rng.gen_range(-bound..=bound)),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }

    /// A copy with `n` extra freshly initialised outputs appended.
    pub fn widened<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Self {
        let fresh = Linear::new(self.in_features(), n, rng);
        let out = self.out_features() + n;
        let mut weight = Array2::zeros((self.in_features(), out));
        let mut bias = Array2::zeros((1, out));
        let old = self.out_features();
        weight
            .slice_mut(ndarray::s![.., ..old])
            .assign(&self.weight);
        weight.slice_mut(ndarray::s![.., old..]).assign(&fresh.weight);
        bias.slice_mut(ndarray::s![.., ..old]).assign(&self.bias);
        bias.slice_mut(ndarray::s![.., old..]).assign(&fresh.bias);
        Self { weight, bias }
    }
}

/// Activations kept for the backward pass.
#[derive(Debug, Clone)]
pub struct MlpCache {
    inputs: Array2<f32>,
    pre_activation: Array2<f32>,
    features: Array2<f32>,
}

/// `fc(relu(hidden(x)))`; `relu(hidden(x))` is the feature embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    pub hidden: Linear,
    pub fc: Linear,
}

impl Mlp {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        feature_dim: usize,
        num_outputs: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            hidden: Linear::new(input_dim, feature_dim, rng),
            fc: Linear::new(feature_dim, num_outputs, rng),
        }
    }
}

impl Network for Mlp {
    type Cache = MlpCache;

    fn num_outputs(&self) -> usize {
        self.fc.out_features()
    }

    fn feature_dim(&self) -> usize {
        self.hidden.out_features()
    }

    fn features(&self, inputs: &Array2<f32>) -> Array2<f32> {
        self.hidden.forward(inputs).mapv(|v| v.max(0.0))
    }

    fn forward(&self, inputs: &Array2<f32>) -> Array2<f32> {
        self.fc.forward(&self.features(inputs))
    }

    fn forward_train(&self, inputs: &Array2<f32>) -> (Array2<f32>, MlpCache) {
        let pre_activation = self.hidden.forward(inputs);
        let features = pre_activation.mapv(|v| v.max(0.0));
        let logits = self.fc.forward(&features);
        (
            logits,
            MlpCache {
                inputs: inputs.clone(),
                pre_activation,
                features,
            },
        )
    }

    fn backward(&self, cache: &MlpCache, grad_output: &Array2<f32>) -> Vec<Array2<f32>> {
        let d_fc_weight = cache.features.t().dot(grad_output);
        let d_fc_bias = grad_output.sum_axis(Axis(0)).insert_axis(Axis(0));

        let d_features = grad_output.dot(&self.fc.weight.t());
        let relu_mask = cache
            .pre_activation
            .mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let d_pre = d_features * relu_mask;

        let d_hidden_weight = cache.inputs.t().dot(&d_pre);
        let d_hidden_bias = d_pre.sum_axis(Axis(0)).insert_axis(Axis(0));

        vec![d_hidden_weight, d_hidden_bias, d_fc_weight, d_fc_bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        vec![
            &mut self.hidden.weight,
            &mut self.hidden.bias,
            &mut self.fc.weight,
            &mut self.fc.bias,
        ]
    }

    fn add_output_nodes<R: Rng + ?Sized>(&mut self, n: usize, rng: &mut R) {
        self.fc = self.fc.widened(n, rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::bce_with_logits;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_shapes() {
        let net = Mlp::new(5, 8, 3, &mut StdRng::seed_from_u64(1));
        let x = Array2::zeros((4, 5));
        assert_eq!(net.features(&x).shape(), &[4, 8]);
        assert_eq!(net.forward(&x).shape(), &[4, 3]);
        assert_eq!(net.feature_dim(), 8);
    }

    #[test]
    fn test_add_output_nodes_keeps_old_weights() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut net = Mlp::new(3, 4, 2, &mut rng);
        let before = net.clone();
        net.add_output_nodes(5, &mut rng);
        assert_eq!(net.num_outputs(), 7);
        let x = array![[0.3, -0.2, 0.9]];
        let old = before.forward(&x);
        let new = net.forward(&x);
        for j in 0..2 {
            assert!((old[[0, j]] - new[[0, j]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let net = Mlp::new(3, 4, 2, &mut rng);
        let x = array![[0.5, -1.0, 0.25], [1.5, 0.3, -0.7]];
        let targets = array![[1.0, 0.0], [0.2, 0.8]];

        let (logits, cache) = net.forward_train(&x);
        let grads = net.backward(&cache, &bce_with_logits(&logits, &targets).grad);

        let loss_of = |n: &Mlp| bce_with_logits(&n.forward(&x), &targets).loss;
        let h = 1e-3;
        for (p, grad) in grads.iter().enumerate() {
            for idx in [[0usize, 0usize], [0, 1]] {
                if idx[1] >= grad.ncols() {
                    continue;
                }
                let mut plus = net.clone();
                plus.parameters_mut()[p][idx] += h;
                let mut minus = net.clone();
                minus.parameters_mut()[p][idx] -= h;
                let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
                assert!(
                    (numeric - grad[idx]).abs() < 1e-2,
                    "param {p} {idx:?}: numeric {numeric} vs analytic {}",
                    grad[idx]
                );
            }
        }
    }
}
