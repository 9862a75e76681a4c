//! Exemplar replay buffer.
//!
//! Holds up to `m` raw samples per class seen so far under a fixed total
//! budget. After every group the per-class quota is recomputed, the existing
//! lists are prefix-truncated, and one new list per class of the finished
//! group is appended.

use crate::data::Sample;
use crate::error::LearnError;
use crate::ops::{argmin, euclidean};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How exemplars are picked from a class's candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Greedy mean matching in feature space.
    #[default]
    Herding,
    /// Uniform sampling without replacement.
    Random,
}

/// Class-balanced exemplar buffer, one list per class in label order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExemplarMemory {
    budget: usize,
    sets: Vec<Vec<Sample>>,
}

impl ExemplarMemory {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            sets: Vec::new(),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Number of classes with an exemplar list.
    pub fn num_classes(&self) -> usize {
        self.sets.len()
    }

    pub fn class_sets(&self) -> &[Vec<Sample>] {
        &self.sets
    }

    /// Total number of stored exemplars.
    pub fn total(&self) -> usize {
        self.sets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Every stored exemplar, class by class, for replay.
    pub fn samples(&self) -> Vec<Sample> {
        self.sets.iter().flatten().cloned().collect()
    }

    /// Recompute the per-class quota `m = floor(budget / num_classes_seen)`
    /// and keep only the first `m` exemplars of every stored class.
    pub fn reduce(&mut self, num_classes_seen: usize) -> Result<usize, LearnError> {
        if num_classes_seen == 0 {
            return Err(LearnError::invalid_input(
                "cannot compute an exemplar quota for zero classes",
            ));
        }
        let m = self.budget / num_classes_seen;
        info!(m, "Target number of exemplars");

        for set in &mut self.sets {
            set.truncate(m);
        }
        Ok(m)
    }

    /// Select up to `m` exemplars for every class of the current group and
    /// append them.
    ///
    /// `embed` maps a class's candidates to their feature embeddings; it is
    /// only called for herding. Classes with fewer than `m` candidates keep
    /// all of them.
    pub fn construct<F, R>(
        &mut self,
        samples_by_class: Vec<Vec<Sample>>,
        m: usize,
        strategy: SelectionStrategy,
        mut embed: F,
        rng: &mut R,
    ) -> Result<(), LearnError>
    where
        F: FnMut(&[Sample]) -> Result<Array2<f32>, LearnError>,
        R: Rng + ?Sized,
    {
        let mut new_sets = Vec::with_capacity(samples_by_class.len());
        for (class, candidates) in samples_by_class.into_iter().enumerate() {
            let chosen = match strategy {
                SelectionStrategy::Herding if candidates.is_empty() => Vec::new(),
                SelectionStrategy::Herding => prioritized_selection(&embed(&candidates)?, m),
                SelectionStrategy::Random => random_selection(candidates.len(), m, rng),
            };
            let exemplars: Vec<Sample> = chosen.iter().map(|&i| candidates[i].clone()).collect();
            debug!(
                class,
                ?strategy,
                extracted = exemplars.len(),
                "Extracted exemplars from class of current split"
            );
            new_sets.push(exemplars);
        }
        self.sets.extend(new_sets);
        Ok(())
    }
}

/// Herding selection over the rows of `phi`.
///
/// With `mu` the mean embedding, step `k` picks the not-yet-chosen row `c`
/// minimising `|mu - (1/k) * (sum of chosen rows + phi_c)|`, ties going to the
/// lowest index. Returns `min(m, rows)` indices in selection order.
pub fn prioritized_selection(phi: &Array2<f32>, m: usize) -> Vec<usize> {
    let n = phi.nrows();
    let Some(mu) = phi.mean_axis(Axis(0)) else {
        return Vec::new();
    };

    let target = m.min(n);
    let mut chosen = Vec::with_capacity(target);
    let mut taken = vec![false; n];
    let mut running_sum = Array1::<f32>::zeros(phi.ncols());

    for k in 1..=target {
        let inv_k = 1.0 / k as f32;
        let distances = phi.rows().into_iter().enumerate().map(|(i, row)| {
            if taken[i] {
                f32::INFINITY
            } else {
                let candidate_mean = (&running_sum + &row) * inv_k;
                euclidean(mu.view(), candidate_mean.view())
            }
        });
        let Some(best) = argmin(distances) else {
            break;
        };
        taken[best] = true;
        running_sum += &phi.row(best);
        chosen.push(best);
    }

    chosen
}

/// Uniformly sample `min(m, n)` distinct indices out of `0..n`.
pub fn random_selection<R: Rng + ?Sized>(n: usize, m: usize, rng: &mut R) -> Vec<usize> {
    rand::seq::index::sample(rng, n, m.min(n)).into_vec()
}
