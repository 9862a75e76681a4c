//! Nearest-mean-of-exemplars classification.
//!
//! Every class is represented by the re-normalised mean of the unit-norm
//! embeddings of its exemplars. A sample gets the label of the closest
//! prototype in Euclidean distance.

use crate::data::Sample;
use crate::error::LearnError;
use crate::exemplar::ExemplarMemory;
use crate::ops::{argmin, euclidean, l2_normalize, l2_normalize_rows};
use ndarray::{Array1, Array2, ArrayView1};
use tracing::debug;

/// Class prototypes, computed at most once per classification context.
#[derive(Debug, Clone, Default)]
pub enum PrototypeCache {
    #[default]
    Unset,
    Ready(Array2<f32>),
}

impl PrototypeCache {
    pub fn invalidate(&mut self) {
        *self = PrototypeCache::Unset;
    }

    pub fn prototypes(&self) -> Option<&Array2<f32>> {
        match self {
            PrototypeCache::Ready(p) => Some(p),
            PrototypeCache::Unset => None,
        }
    }

    /// Return the cached prototypes, computing them with `init` if unset.
    pub fn get_or_try_init<F>(&mut self, init: F) -> Result<&Array2<f32>, LearnError>
    where
        F: FnOnce() -> Result<Array2<f32>, LearnError>,
    {
        if let PrototypeCache::Unset = self {
            *self = PrototypeCache::Ready(init()?);
        }
        match &*self {
            PrototypeCache::Ready(p) => Ok(p),
            PrototypeCache::Unset => Err(LearnError::precondition("prototype cache is unset")),
        }
    }
}

#[derive(Default)]
struct RunningMean {
    sum: Option<Array1<f32>>,
    count: usize,
}

impl RunningMean {
    fn add(&mut self, row: ArrayView1<f32>) {
        match &mut self.sum {
            Some(sum) => *sum += &row,
            None => self.sum = Some(row.to_owned()),
        }
        self.count += 1;
    }

    fn finish(self) -> Option<Array1<f32>> {
        let count = self.count as f32;
        self.sum.map(|sum| sum / count)
    }
}

/// Compute one unit-norm prototype per stored class, `[classes, feature_dim]`.
///
/// When `current_pool` is given, the unit-norm embeddings of its samples are
/// added to the means of the newest `classes_per_group` classes.
pub fn compute_prototypes<F>(
    memory: &ExemplarMemory,
    mut embed: F,
    current_pool: Option<&[Sample]>,
    classes_per_group: usize,
) -> Result<Array2<f32>, LearnError>
where
    F: FnMut(&[Sample]) -> Result<Array2<f32>, LearnError>,
{
    let num_classes = memory.num_classes();
    if num_classes == 0 {
        return Err(LearnError::precondition(
            "class prototypes requested before any exemplars were stored",
        ));
    }
    let newest = num_classes.saturating_sub(classes_per_group);

    let pool = match current_pool {
        Some(samples) if !samples.is_empty() => {
            Some((samples, l2_normalize_rows(&embed(samples)?)))
        }
        _ => None,
    };

    let mut means = Vec::with_capacity(num_classes);
    for (class, exemplars) in memory.class_sets().iter().enumerate() {
        let mut mean = RunningMean::default();

        if class >= newest {
            if let Some((samples, features)) = &pool {
                for (sample, row) in samples.iter().zip(features.rows()) {
                    if sample.label == class {
                        mean.add(row);
                    }
                }
            }
        }

        if !exemplars.is_empty() {
            let features = l2_normalize_rows(&embed(exemplars)?);
            for row in features.rows() {
                mean.add(row);
            }
        }

        let mean = mean.finish().ok_or_else(|| {
            LearnError::dataset(format!("class {class} has no samples to build a prototype from"))
        })?;
        means.push(l2_normalize(mean.view()));
    }

    let dim = means.first().map(|m| m.len()).unwrap_or(0);
    let mut prototypes = Array2::zeros((means.len(), dim));
    for (mut row, mean) in prototypes.rows_mut().into_iter().zip(&means) {
        row.assign(mean);
    }
    debug!(classes = num_classes, "Computed mean of exemplars");
    Ok(prototypes)
}

/// Label of the closest prototype for every row of `features`.
///
/// Rows are unit-normalised first; ties go to the lowest class index.
pub fn nearest_prototype(features: &Array2<f32>, prototypes: &Array2<f32>) -> Vec<usize> {
    l2_normalize_rows(features)
        .rows()
        .into_iter()
        .map(|row| {
            argmin(prototypes.rows().into_iter().map(|p| euclidean(row, p))).unwrap_or(0)
        })
        .collect()
}

/// Nearest-mean-of-exemplars head with a lazily filled prototype cache.
#[derive(Debug, Clone)]
pub struct NearestMeanClassifier {
    cache: PrototypeCache,
    include_current: bool,
}

impl NearestMeanClassifier {
    pub fn new(include_current: bool) -> Self {
        Self {
            cache: PrototypeCache::Unset,
            include_current,
        }
    }

    /// Whether the current group's training samples join the newest means.
    pub fn include_current(&self) -> bool {
        self.include_current
    }

    pub fn cache(&self) -> &PrototypeCache {
        &self.cache
    }

    pub fn invalidate(&mut self) {
        self.cache.invalidate();
    }

    /// Classify embedded samples, computing prototypes with `compute` on
    /// first use since the last [`NearestMeanClassifier::invalidate`].
    pub fn classify<F>(&mut self, features: &Array2<f32>, compute: F) -> Result<Vec<usize>, LearnError>
    where
        F: FnOnce() -> Result<Array2<f32>, LearnError>,
    {
        let prototypes = self.cache.get_or_try_init(compute)?;
        Ok(nearest_prototype(features, prototypes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Identity, stack};
    use crate::exemplar::SelectionStrategy;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn identity_embed(samples: &[Sample]) -> Result<Array2<f32>, LearnError> {
        Ok(stack(samples, &Identity))
    }

    fn memory_with(classes: Vec<Vec<Sample>>) -> ExemplarMemory {
        let mut memory = ExemplarMemory::new(100);
        let m = classes.iter().map(Vec::len).max().unwrap_or(0);
        memory
            .construct(
                classes,
                m,
                SelectionStrategy::Random,
                identity_embed,
                &mut StdRng::seed_from_u64(0),
            )
            .unwrap();
        memory
    }

    #[test]
    fn test_prototypes_are_unit_norm() {
        let memory = memory_with(vec![
            vec![Sample::new(0, array![3.0, 4.0], 0), Sample::new(1, array![1.0, 0.0], 0)],
            vec![Sample::new(2, array![0.0, 2.0], 1)],
        ]);
        let prototypes = compute_prototypes(&memory, identity_embed, None, 2).unwrap();
        assert_eq!(prototypes.nrows(), 2);
        for row in prototypes.rows() {
            assert!((row.dot(&row).sqrt() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_pool_only_joins_newest_classes() {
        let memory = memory_with(vec![
            vec![Sample::new(0, array![1.0, 0.0], 0)],
            vec![Sample::new(1, array![0.0, 1.0], 1)],
        ]);
        // classes_per_group = 1, so only class 1 takes pool samples.
        let pool = vec![
            Sample::new(5, array![1.0, 1.0], 1),
            Sample::new(6, array![0.0, 5.0], 0),
        ];
        let prototypes = compute_prototypes(&memory, identity_embed, Some(&pool), 1).unwrap();
        assert!((prototypes[[0, 0]] - 1.0).abs() < 1e-6);
        assert!(prototypes[[1, 0]] > 0.0);
    }

    #[test]
    fn test_classify_nearest_and_cached() {
        let memory = memory_with(vec![
            vec![Sample::new(0, array![1.0, 0.0], 0)],
            vec![Sample::new(1, array![0.0, 1.0], 1)],
        ]);
        let mut nme = NearestMeanClassifier::new(false);
        let features = array![[0.9, 0.1], [0.2, 3.0]];
        let preds = nme
            .classify(&features, || compute_prototypes(&memory, identity_embed, None, 2))
            .unwrap();
        assert_eq!(preds, vec![0, 1]);
        assert!(nme.cache().prototypes().is_some());

        // A cached context never recomputes.
        let again = nme
            .classify(&features, || Err(LearnError::training("recomputed")))
            .unwrap();
        assert_eq!(again, preds);

        nme.invalidate();
        assert!(nme.classify(&features, || Err(LearnError::training("x"))).is_err());
    }

    #[test]
    fn test_empty_memory_is_precondition_error() {
        let memory = ExemplarMemory::new(10);
        let err = compute_prototypes(&memory, identity_embed, None, 2).unwrap_err();
        assert!(matches!(err, LearnError::Precondition(_)));
    }
}
