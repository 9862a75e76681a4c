//! End-to-end runs of the incremental learners on small synthetic blobs.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

use owr_learn::classifier::{ClassifierHead, SvmHead};
use owr_learn::config::{SvmConfig, TrainerConfig};
use owr_learn::data::synthetic::{BlobConfig, gaussian_blobs};
use owr_learn::data::{Identity, IncrementalDataset, LoaderConfig, SampleLoader, Transform};
use owr_learn::snapshot::{Classification, FitOptions, OptimizerSettings, SnapshotEnsemble};
use owr_learn::training::CheckpointManager;
use owr_learn::{ExemplarMemory, Icarl, LearningWithoutForgetting, Mlp, Network, Trainer};

const INPUT_DIM: usize = 8;
const CPG: usize = 2;

fn dataset() -> IncrementalDataset {
    gaussian_blobs(&BlobConfig {
        num_groups: 3,
        classes_per_group: CPG,
        input_dim: INPUT_DIM,
        train_per_class: 16,
        val_per_class: 6,
        test_per_class: 8,
        spread: 0.1,
        seed: 11,
    })
}

fn trainer(seed: u64) -> Trainer<Mlp> {
    let config = TrainerConfig {
        lr: 0.5,
        milestones: vec![4],
        classes_per_group: CPG,
        batch_size: 8,
        seed,
        ..TrainerConfig::default()
    };
    let net = Mlp::new(INPUT_DIM, 16, CPG, &mut StdRng::seed_from_u64(seed));
    Trainer::new(net, config, Arc::new(Identity), Arc::new(Identity))
}

#[test]
fn lwf_grows_outputs_and_logs_every_group() {
    let data = dataset();
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path(), 10);
    let mut lwf = LearningWithoutForgetting::new(trainer(1)).with_checkpoints(manager.clone());

    let logs = lwf.train_model(&data, 3).unwrap();

    assert_eq!(logs.num_groups(), 3);
    assert_eq!(logs.predictions.len(), data.groups[2].test.len());
    assert_eq!(lwf.trainer().net().num_outputs(), 3 * CPG);
    assert_eq!(lwf.best_net().unwrap().num_outputs(), 3 * CPG);
    assert_eq!(lwf.old_net().unwrap().num_outputs(), 2 * CPG);
    assert!(logs.test_accuracies.iter().all(|a| (0.0..=1.0).contains(a)));

    assert_eq!(logs.run_id, lwf.run_id());
    let saved = manager.list(&logs.run_id).unwrap();
    assert_eq!(saved.len(), 3);
    let restored: Mlp = manager.load_state(&saved[2]).unwrap();
    assert_eq!(restored.num_outputs(), 3 * CPG);
}

#[test]
fn icarl_with_svm_head_tests_on_all_seen_classes() {
    let data = dataset();
    let head = ClassifierHead::Svm(SvmHead::new(&SvmConfig {
        epochs: 5,
        ..SvmConfig::default()
    }));
    let mut icarl = Icarl::new(trainer(2), ExemplarMemory::new(18), head);

    let logs = icarl.train_model(&data, 3, true).unwrap();

    assert_eq!(logs.num_groups(), 3);
    assert_eq!(icarl.memory().num_classes(), 3 * CPG);
    assert!(icarl.memory().total() <= 18);
    assert!(logs.predictions.iter().all(|&p| p < 3 * CPG));
    match icarl.head() {
        ClassifierHead::Svm(svm) => assert!(svm.last_search().is_some()),
        other => panic!("unexpected head {:?}", other.kind()),
    }
}

#[test]
fn icarl_nearest_mean_beats_chance_on_separated_blobs() {
    let data = dataset();
    let mut icarl = Icarl::new(
        trainer(3),
        ExemplarMemory::new(30),
        ClassifierHead::NearestMean(owr_learn::NearestMeanClassifier::new(true)),
    );
    let logs = icarl.train_model(&data, 4, true).unwrap();
    let chance = 1.0 / (3 * CPG) as f32;
    assert!(logs.test_accuracies[0] > chance, "{:?}", logs.test_accuracies);
}

#[test]
fn snapshot_ensemble_over_groups() {
    let data = dataset();
    let dir = TempDir::new().unwrap();
    let transform: Arc<dyn Transform> = Arc::new(Identity);
    let mut ensemble = SnapshotEnsemble::new(
        Box::new(|n: usize, rng: &mut StdRng| Mlp::new(INPUT_DIM, 16, n, rng)),
        Classification::new(CPG),
        2,
        OptimizerSettings {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
        },
        7,
    );
    let options = FitOptions {
        epochs: 4,
        save_dir: Some(dir.path().to_path_buf()),
        ..FitOptions::default()
    };

    for (g, group) in data.groups.iter().enumerate() {
        let mut train = SampleLoader::new(
            group.train.clone(),
            Arc::clone(&transform),
            LoaderConfig::train(8),
            g as u64,
        );
        let mut test = SampleLoader::new(
            group.test.clone(),
            Arc::clone(&transform),
            LoaderConfig::eval(16),
            0,
        );
        let report = ensemble.fit(&mut train, &options, Some(&mut test), g).unwrap();
        assert_eq!(report.snapshot_iterations.len(), 2);
        assert_eq!(ensemble.estimators()[0].num_outputs(), (g + 1) * CPG);

        let eval = ensemble.evaluate(&mut test).unwrap();
        assert!(eval.accuracy().is_some());
    }
    assert!(ensemble.old_ensemble().is_some());
}
