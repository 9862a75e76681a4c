//! Numeric kernels shared by the learners.
//!
//! Every loss returns its value together with the gradient with respect to the
//! first argument (the live network's output), which is all the hand-written
//! backward passes in [`crate::model`] need.

use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

/// Denominator guard used by the cosine similarity, same as torch's default.
const COSINE_EPS: f32 = 1e-8;

/// A scalar loss and its gradient with respect to the network output.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f32,
    pub grad: Array2<f32>,
}

impl LossOutput {
    /// Sum of two losses computed on the same output.
    pub fn combine(self, other: LossOutput) -> LossOutput {
        LossOutput {
            loss: self.loss + other.loss,
            grad: self.grad + other.grad,
        }
    }
}

fn sigmoid_scalar(v: f32) -> f32 {
    if v >= 0.0 {
        1.0 / (1.0 + (-v).exp())
    } else {
        let e = v.exp();
        e / (1.0 + e)
    }
}

/// Element-wise logistic function.
pub fn sigmoid(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(sigmoid_scalar)
}

/// Row-wise softmax.
pub fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut result = x.clone();

    for mut row in result.axis_iter_mut(Axis(0)) {
        // Subtract max for numerical stability
        let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }

    result
}

/// Scale a vector to unit Euclidean length. Zero vectors are returned as-is.
pub fn l2_normalize(v: ArrayView1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 {
        v.mapv(|x| x / norm)
    } else {
        v.to_owned()
    }
}

/// Scale every row of `x` to unit Euclidean length.
pub fn l2_normalize_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
    out
}

/// Euclidean distance between two vectors.
pub fn euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    Zip::from(&a)
        .and(&b)
        .fold(0.0f32, |acc, &x, &y| acc + (x - y) * (x - y))
        .sqrt()
}

/// Index of the first minimum. NaN entries are skipped.
pub fn argmin<I: IntoIterator<Item = f32>>(values: I) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in values.into_iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v >= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Index of the first maximum in every row.
pub fn argmax_rows(x: &Array2<f32>) -> Vec<usize> {
    x.rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            let mut best_val = f32::NEG_INFINITY;
            for (j, &v) in row.iter().enumerate() {
                if v > best_val {
                    best_val = v;
                    best = j;
                }
            }
            best
        })
        .collect()
}

/// One-hot encode `labels` into `width` columns. Labels outside the width
/// produce an all-zero row.
pub fn one_hot(labels: &[usize], width: usize) -> Array2<f32> {
    let mut out = Array2::zeros((labels.len(), width));
    for (i, &label) in labels.iter().enumerate() {
        if label < width {
            out[[i, label]] = 1.0;
        }
    }
    out
}

/// Mean binary cross-entropy on logits against soft or hard targets.
///
/// ```text
/// l = max(x, 0) - x * t + ln(1 + exp(-|x|))
/// ```
///
/// # Panics
///
/// Panics if `logits` and `targets` differ in shape.
pub fn bce_with_logits(logits: &Array2<f32>, targets: &Array2<f32>) -> LossOutput {
    assert_eq!(
        logits.shape(),
        targets.shape(),
        "Logits and targets must have same shape"
    );
    let n = logits.len().max(1) as f32;
    let total = Zip::from(logits).and(targets).fold(0.0f32, |acc, &x, &t| {
        acc + x.max(0.0) - x * t + (1.0 + (-x.abs()).exp()).ln()
    });
    let grad = (sigmoid(logits) - targets) / n;
    LossOutput {
        loss: total / n,
        grad,
    }
}

/// Mean softmax cross-entropy with hard labels.
///
/// # Panics
///
/// Panics if the batch sizes differ or a label indexes past the last column.
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> LossOutput {
    assert_eq!(
        logits.nrows(),
        labels.len(),
        "Batch size must match number of labels"
    );
    let probs = softmax_rows(logits);
    let batch = labels.len().max(1) as f32;

    let mut loss = 0.0;
    let mut grad = probs.clone();
    for (i, &label) in labels.iter().enumerate() {
        loss -= probs[[i, label]].max(1e-10).ln();
        grad[[i, label]] -= 1.0;
    }
    grad /= batch;

    LossOutput {
        loss: loss / batch,
        grad,
    }
}

/// Cosine embedding loss with every pair labelled as similar (target `1`):
/// the mean of `1 - cos(x1_i, x2_i)`. `x2` is treated as a constant.
pub fn cosine_embedding(x1: &Array2<f32>, x2: &Array2<f32>) -> LossOutput {
    assert_eq!(
        x1.shape(),
        x2.shape(),
        "Cosine embedding inputs must have same shape"
    );
    let batch = x1.nrows().max(1) as f32;
    let mut loss = 0.0;
    let mut grad = Array2::zeros(x1.raw_dim());

    for (i, (a, b)) in x1.rows().into_iter().zip(x2.rows()).enumerate() {
        let sq_a = a.dot(&a) + COSINE_EPS;
        let sq_b = b.dot(&b) + COSINE_EPS;
        let denom = (sq_a * sq_b).sqrt();
        let cos = a.dot(&b) / denom;
        loss += 1.0 - cos;

        // d(1 - cos)/da = -(b / denom - cos * a / |a|^2)
        let d_cos = &b / denom - &a * (cos / sq_a);
        grad.row_mut(i).assign(&(d_cos * (-1.0 / batch)));
    }

    LossOutput {
        loss: loss / batch,
        grad,
    }
}

/// Mean squared error over every element.
pub fn mse(output: &Array2<f32>, target: &Array2<f32>) -> LossOutput {
    assert_eq!(
        output.shape(),
        target.shape(),
        "Output and target must have same shape"
    );
    let n = output.len().max(1) as f32;
    let diff = output - target;
    let loss = diff.mapv(|d| d * d).sum() / n;
    LossOutput {
        loss,
        grad: diff * (2.0 / n),
    }
}

/// Element-wise arithmetic mean of equally shaped matrices.
pub fn mean_of(arrays: &[Array2<f32>]) -> Option<Array2<f32>> {
    let first = arrays.first()?;
    let mut sum = Array2::<f32>::zeros(first.raw_dim());
    for a in arrays {
        sum += a;
    }
    Some(sum / arrays.len() as f32)
}
