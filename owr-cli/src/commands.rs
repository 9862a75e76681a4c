//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::Strategy;
use anyhow::Context;
use owr_learn::classifier::HeadKind;
use owr_learn::data::synthetic::gaussian_blobs;
use owr_learn::data::{Identity, IncrementalDataset, LoaderConfig, SampleLoader, Transform};
use owr_learn::persistence::{atomic_write_json, load_json};
use owr_learn::snapshot::{Classification, EvalReport, FitOptions, OptimizerSettings, SnapshotEnsemble};
use owr_learn::training::{Checkpoint, CheckpointManager};
use owr_learn::{Icarl, LearningWithoutForgetting, Mlp, OwrConfig, RunLogs, SelectionStrategy, Trainer};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Handle a CLI subcommand.
pub fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Train {
            strategy,
            random,
            no_classify,
            epochs,
        } => {
            let config = load(workspace, config_file)?;
            handle_train(config, workspace, strategy, random, !no_classify, epochs)
        }
        Commands::Snapshot {
            epochs,
            n_estimators,
        } => {
            let mut config = load(workspace, config_file)?;
            if let Some(n) = n_estimators {
                config.snapshot.n_estimators = n;
            }
            if let Some(e) = epochs {
                config.snapshot.epochs = e;
            }
            handle_snapshot(config, workspace)
        }
        Commands::Report { checkpoint } => {
            let config = load(workspace, config_file)?;
            handle_report(&config, workspace, checkpoint.as_deref())
        }
        Commands::Config { action } => handle_config(action, workspace, config_file),
    }
}

/// Resolved configuration; an explicit file replaces the layered sources.
fn load(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<OwrConfig> {
    let overrides = match config_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Some(toml::from_str::<OwrConfig>(&text).context("Invalid config file")?)
        }
        None => None,
    };
    let mut config = owr_learn::load_config(Some(workspace), overrides.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    // The data source always follows the learner's group size.
    config.data.classes_per_group = config.trainer.classes_per_group;
    Ok(config)
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn dataset(config: &OwrConfig) -> IncrementalDataset {
    info!(
        groups = config.data.num_groups,
        classes_per_group = config.data.classes_per_group,
        input_dim = config.data.input_dim,
        "Generating synthetic dataset"
    );
    gaussian_blobs(&config.data)
}

/// Exemplar selection for a run; `--random` overrides the configured one.
fn selection(config: &OwrConfig, random: bool) -> SelectionStrategy {
    if random {
        SelectionStrategy::Random
    } else {
        config.memory.strategy
    }
}

fn handle_train(
    mut config: OwrConfig,
    workspace: &Path,
    strategy: Strategy,
    random: bool,
    classify: bool,
    epochs: Option<usize>,
) -> anyhow::Result<()> {
    let data = dataset(&config);
    let epochs = epochs.unwrap_or(config.trainer.epochs);
    let cpg = config.trainer.classes_per_group;
    let mut rng = StdRng::seed_from_u64(config.trainer.seed);
    let net = Mlp::new(config.data.input_dim, config.network.feature_dim, cpg, &mut rng);
    let transform: Arc<dyn Transform> = Arc::new(Identity);
    let trainer = Trainer::new(net, config.trainer.clone(), Arc::clone(&transform), transform);
    let checkpoints = config
        .output
        .checkpoint_dir
        .as_deref()
        .map(|dir| CheckpointManager::new(resolve(workspace, dir), config.output.max_checkpoints));

    let logs: RunLogs = match strategy {
        Strategy::Lwf => {
            let mut lwf = LearningWithoutForgetting::new(trainer);
            if let Some(manager) = checkpoints {
                lwf = lwf.with_checkpoints(manager);
            }
            info!(run_id = lwf.run_id(), "Starting LwF");
            lwf.train_model(&data, epochs)?
        }
        Strategy::Icarl | Strategy::Svm => {
            if strategy == Strategy::Svm {
                config.classifier.head = HeadKind::Svm;
            }
            let mut icarl =
                Icarl::from_config(trainer, &config).with_strategy(selection(&config, random));
            if let Some(manager) = checkpoints {
                icarl = icarl.with_checkpoints(manager);
            }
            info!(
                run_id = icarl.run_id(),
                head = ?config.classifier.head,
                selection = ?icarl.strategy(),
                "Starting iCaRL"
            );
            icarl.train_model(&data, epochs, classify)?
        }
    };

    let logs_path = resolve(workspace, &config.output.logs_path);
    atomic_write_json(&logs_path, &logs)
        .with_context(|| format!("Failed to write run logs to {}", logs_path.display()))?;

    for (g, acc) in logs.test_accuracies.iter().enumerate() {
        println!("  group {:>2}: {:6.2}%", g + 1, 100.0 * acc);
    }
    if let Some(avg) = logs.average_incremental_accuracy() {
        println!("Average incremental accuracy: {:.2}%", 100.0 * avg);
    }
    println!("Run logs written to {}", logs_path.display());
    Ok(())
}

/// Per-group results of a snapshot ensemble run.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotLogs {
    test: Vec<EvalReport>,
    best: Vec<Option<EvalReport>>,
    /// Held-out evaluation after every snapshot, per group.
    evaluations: Vec<Vec<EvalReport>>,
    snapshot_iterations: Vec<Vec<usize>>,
}

fn handle_snapshot(config: OwrConfig, workspace: &Path) -> anyhow::Result<()> {
    let data = dataset(&config);
    let snap = &config.snapshot;
    let input_dim = config.data.input_dim;
    let feature_dim = config.network.feature_dim;
    let transform: Arc<dyn Transform> = Arc::new(Identity);

    let mut ensemble = SnapshotEnsemble::new(
        Box::new(move |n: usize, rng: &mut StdRng| Mlp::new(input_dim, feature_dim, n, rng)),
        Classification::new(config.trainer.classes_per_group),
        snap.n_estimators,
        OptimizerSettings::from(snap),
        config.trainer.seed,
    );
    let options = FitOptions {
        save_dir: snap
            .save_dir
            .as_deref()
            .or(config.output.checkpoint_dir.as_deref())
            .map(|dir| resolve(workspace, dir)),
        max_checkpoints: config.output.max_checkpoints,
        ..FitOptions::from(snap)
    };

    let mut logs = SnapshotLogs::default();
    for (g, group) in data.groups.iter().enumerate() {
        let mut train = SampleLoader::new(
            group.train.clone(),
            Arc::clone(&transform),
            LoaderConfig::train(snap.batch_size),
            config.trainer.seed.wrapping_add(g as u64),
        );
        let mut test = SampleLoader::new(
            group.test.clone(),
            Arc::clone(&transform),
            LoaderConfig::eval(snap.batch_size),
            0,
        );
        let report = ensemble.fit(&mut train, &options, Some(&mut test), g)?;
        let eval = ensemble.evaluate(&mut test)?;
        info!(group = g + 1, score = eval.score(), "Testing classes seen so far");

        logs.test.push(eval);
        logs.best.push(report.best);
        logs.evaluations.push(report.evaluations);
        logs.snapshot_iterations.push(report.snapshot_iterations);
    }

    let logs_path = resolve(workspace, &config.output.logs_path).with_file_name("snapshot_logs.json");
    atomic_write_json(&logs_path, &logs)
        .with_context(|| format!("Failed to write run logs to {}", logs_path.display()))?;

    for (g, eval) in logs.test.iter().enumerate() {
        if let Some(acc) = eval.accuracy() {
            println!("  group {:>2}: {:6.2}%", g + 1, acc);
        }
    }
    println!("Run logs written to {}", logs_path.display());
    Ok(())
}

/// Logs of the last run and the checkpoint to show alongside them.
fn summarize(
    config: &OwrConfig,
    workspace: &Path,
    checkpoint_id: Option<&str>,
) -> anyhow::Result<(RunLogs, Option<Checkpoint>)> {
    let logs_path = resolve(workspace, &config.output.logs_path);
    let logs: RunLogs = load_json(&logs_path)
        .with_context(|| format!("Failed to read run logs from {}", logs_path.display()))?
        .with_context(|| format!("No run logs at {}; run `owr train` first", logs_path.display()))?;

    let Some(dir) = config.output.checkpoint_dir.as_deref() else {
        return Ok((logs, None));
    };
    let manager = CheckpointManager::new(resolve(workspace, dir), config.output.max_checkpoints);
    let checkpoint = match checkpoint_id {
        Some(id) => Some(manager.get(&logs.run_id, id)?),
        None => manager.best(&logs.run_id)?,
    };
    Ok((logs, checkpoint))
}

fn handle_report(config: &OwrConfig, workspace: &Path, checkpoint_id: Option<&str>) -> anyhow::Result<()> {
    let (logs, checkpoint) = summarize(config, workspace, checkpoint_id)?;

    println!("Run {}", logs.run_id);
    for (g, acc) in logs.test_accuracies.iter().enumerate() {
        println!("  group {:>2}: {:6.2}%", g + 1, 100.0 * acc);
    }
    if let Some(avg) = logs.average_incremental_accuracy() {
        println!("Average incremental accuracy: {:.2}%", 100.0 * avg);
    }
    match checkpoint {
        Some(c) => println!(
            "Checkpoint {} (group {}, validation {:.2}%): {}",
            c.id,
            c.step + 1,
            100.0 * c.score,
            c.path.display()
        ),
        None => println!("No checkpoints recorded"),
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".owr");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&OwrConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_file)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
