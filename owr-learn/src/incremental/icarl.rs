//! iCaRL: distillation plus a bounded exemplar replay buffer, tested with a
//! nearest-mean-of-exemplars (or SVM) head on the learned embedding.

use super::{GroupCheckpoints, check_run, record_group, run_group};
use crate::classifier::{ClassifierHead, EvalContext, NearestMeanClassifier, compute_prototypes};
use crate::config::OwrConfig;
use crate::data::{IncrementalDataset, Sample, Transform, by_class, stack};
use crate::error::LearnError;
use crate::exemplar::{ExemplarMemory, SelectionStrategy};
use crate::model::{FeatureInput, Frozen, Network, extract_features};
use crate::training::{CheckpointManager, RunLogs, Trainer};
use ndarray::Array2;
use std::sync::Arc;
use tracing::info;

pub struct Icarl<N: Network> {
    trainer: Trainer<N>,
    old_net: Option<Frozen<N>>,
    best_net: Option<N>,
    memory: ExemplarMemory,
    strategy: SelectionStrategy,
    head: ClassifierHead,
    nme: NearestMeanClassifier,
    checkpoints: GroupCheckpoints,
}

impl<N: Network> Icarl<N> {
    pub fn new(trainer: Trainer<N>, memory: ExemplarMemory, head: ClassifierHead) -> Self {
        Self {
            trainer,
            old_net: None,
            best_net: None,
            memory,
            strategy: SelectionStrategy::default(),
            head,
            nme: NearestMeanClassifier::new(true),
            checkpoints: GroupCheckpoints::new("icarl"),
        }
    }

    /// Learner with the memory budget, selection strategy and head taken
    /// from `config`.
    pub fn from_config(trainer: Trainer<N>, config: &OwrConfig) -> Self {
        Self::new(
            trainer,
            ExemplarMemory::new(config.memory.budget),
            ClassifierHead::from_config(config),
        )
        .with_strategy(config.memory.strategy)
    }

    /// Exemplar selection used when the memory is rebuilt after each group.
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Save the best network of every group through `manager`.
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints.enable(manager);
        self
    }

    pub fn run_id(&self) -> &str {
        self.checkpoints.run_id()
    }

    pub fn memory(&self) -> &ExemplarMemory {
        &self.memory
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    pub fn best_net(&self) -> Option<&N> {
        self.best_net.as_ref()
    }

    /// Train every group of `data` in order.
    ///
    /// `classify` tests with the configured head instead of the network's own
    /// outputs. The budget must leave at least one exemplar per class once
    /// every group has been seen.
    pub fn train_model(
        &mut self,
        data: &IncrementalDataset,
        epochs: usize,
        classify: bool,
    ) -> Result<RunLogs, LearnError> {
        check_run(&self.trainer, data, epochs)?;
        let num_groups = data.num_groups();
        let cpg = self.trainer.classes_per_group();
        let total_classes = num_groups * cpg;
        if self.memory.budget() < total_classes {
            return Err(LearnError::config(format!(
                "exemplar budget {} is smaller than the {} classes of the run",
                self.memory.budget(),
                total_classes
            )));
        }
        let strategy = self.strategy;
        let mut logs = RunLogs::with_capacity(self.checkpoints.run_id(), num_groups);

        for g in 0..num_groups {
            let group = data.group(g)?;

            info!(exemplars = self.memory.total(), "Length of exemplars set");
            let mut samples = self.memory.samples();
            samples.extend(group.train.iter().cloned());

            let outcome = run_group(
                &mut self.trainer,
                samples,
                &group.validation,
                self.old_net.as_ref(),
                epochs,
                g,
            )?;

            let transform = self.trainer.test_transform();
            let seen = self.trainer.net().num_outputs();
            let m = self.memory.reduce(seen)?;
            self.memory.construct(
                by_class(&group.train, cpg),
                m,
                strategy,
                |s| embed(&outcome.best_net, transform.as_ref(), s),
                self.trainer.rng(),
            )?;
            self.nme.invalidate();

            let test = if classify {
                let ctx = EvalContext {
                    net: &outcome.best_net,
                    transform: Arc::clone(&transform),
                    memory: &self.memory,
                    group,
                    classes_per_group: cpg,
                    batch_size: self.trainer.config().batch_size,
                };
                self.head.evaluate(&ctx)?
            } else {
                self.trainer.test(&outcome.best_net, &group.test)
            };
            info!(group = g + 1, accuracy = test.accuracy, "Testing classes seen so far");
            record_group(&mut logs, &outcome, &test);
            self.checkpoints.save(g, &outcome)?;

            if g + 1 < num_groups {
                self.trainer.add_output_nodes();
                self.old_net = Some(Frozen::capture(&outcome.best_net));
            }
            self.best_net = Some(outcome.best_net);
            logs.true_labels = test.true_labels;
            logs.predictions = test.predictions;
        }

        Ok(logs)
    }

    /// Nearest-mean-of-exemplars labels for a transformed input batch.
    ///
    /// Prototypes are computed on first use after each group and cached;
    /// `pool` adds raw samples of the newest group to their class means.
    pub fn classify(
        &mut self,
        batch: &Array2<f32>,
        pool: Option<&[Sample]>,
    ) -> Result<Vec<usize>, LearnError> {
        let net = match &self.best_net {
            Some(net) => net,
            None => self.trainer.net(),
        };
        let transform = self.trainer.test_transform();
        let cpg = self.trainer.classes_per_group();
        let memory = &self.memory;

        let features = extract_features(net, FeatureInput::Batch(batch), None)?;
        self.nme.classify(&features, || {
            compute_prototypes(memory, |s| embed(net, transform.as_ref(), s), pool, cpg)
        })
    }
}

/// Embeddings of raw samples under `transform`.
fn embed<N: Network>(
    net: &N,
    transform: &dyn Transform,
    samples: &[Sample],
) -> Result<Array2<f32>, LearnError> {
    let inputs = stack(samples, transform);
    extract_features(net, FeatureInput::Batch(&inputs), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainerConfig;
    use crate::data::Identity;
    use crate::data::synthetic::{BlobConfig, gaussian_blobs};
    use crate::model::Mlp;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn small_icarl(budget: usize) -> (Icarl<Mlp>, IncrementalDataset) {
        let data = gaussian_blobs(&BlobConfig {
            num_groups: 3,
            classes_per_group: 2,
            input_dim: 6,
            train_per_class: 12,
            val_per_class: 4,
            test_per_class: 6,
            ..BlobConfig::default()
        });
        let config = TrainerConfig {
            lr: 0.5,
            milestones: vec![3],
            classes_per_group: 2,
            batch_size: 8,
            ..TrainerConfig::default()
        };
        let net = Mlp::new(6, 16, 2, &mut StdRng::seed_from_u64(5));
        let trainer = Trainer::new(net, config, Arc::new(Identity), Arc::new(Identity));
        let icarl = Icarl::new(
            trainer,
            ExemplarMemory::new(budget),
            ClassifierHead::NearestMean(NearestMeanClassifier::new(true)),
        );
        (icarl, data)
    }

    #[test]
    fn test_train_model_respects_budget_and_logs_every_group() {
        let (mut icarl, data) = small_icarl(12);
        let logs = icarl.train_model(&data, 2, true).unwrap();

        assert_eq!(logs.num_groups(), 3);
        assert_eq!(logs.true_labels.len(), data.groups[2].test.len());
        assert_eq!(icarl.memory().num_classes(), 6);
        // m = floor(12 / 6) after the last group.
        assert!(icarl.memory().class_sets().iter().all(|s| s.len() <= 2));
        assert!(icarl.memory().total() <= 12);
    }

    #[test]
    fn test_classify_uses_cached_prototypes() {
        let (icarl, data) = small_icarl(20);
        let mut icarl = icarl.with_strategy(SelectionStrategy::Random);
        icarl.train_model(&data, 1, false).unwrap();
        let batch = stack(&data.groups[2].test, &Identity);
        let first = icarl.classify(&batch, None).unwrap();
        assert_eq!(first.len(), batch.nrows());
        assert!(first.iter().all(|&c| c < 6));
        assert_eq!(icarl.classify(&batch, None).unwrap(), first);
    }

    #[test]
    fn test_zero_epochs_is_config_error() {
        let (mut icarl, data) = small_icarl(10);
        let err = icarl.train_model(&data, 0, true).unwrap_err();
        assert!(matches!(err, LearnError::Config(_)));
    }

    #[test]
    fn test_budget_below_class_count_is_config_error() {
        // 3 groups of 2 classes need at least 6 slots.
        let (mut icarl, data) = small_icarl(4);
        let err = icarl.train_model(&data, 1, true).unwrap_err();
        assert!(matches!(err, LearnError::Config(_)));
        assert!(icarl.memory().is_empty());
        assert!(icarl.best_net().is_none());

        let (mut icarl, data) = small_icarl(6);
        icarl.train_model(&data, 1, true).unwrap();
        assert!(icarl.memory().class_sets().iter().all(|s| s.len() == 1));
    }

    #[test]
    fn test_from_config_carries_selection_strategy() {
        let (icarl, _) = small_icarl(12);
        assert_eq!(icarl.strategy(), SelectionStrategy::Herding);

        let mut config = OwrConfig::default();
        config.trainer.classes_per_group = 2;
        config.memory.strategy = SelectionStrategy::Random;
        let net = Mlp::new(6, 16, 2, &mut StdRng::seed_from_u64(5));
        let trainer = Trainer::new(net, config.trainer.clone(), Arc::new(Identity), Arc::new(Identity));
        let icarl = Icarl::from_config(trainer, &config);
        assert_eq!(icarl.strategy(), SelectionStrategy::Random);
        assert_eq!(icarl.memory().budget(), config.memory.budget);
    }
}
