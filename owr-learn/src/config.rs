//! Configuration system for OWR experiments.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> environment -> explicit overrides. Files are
//! `~/.config/owr/config.toml` and `.owr/config.toml` in the workspace.

use crate::classifier::HeadKind;
use crate::data::synthetic::BlobConfig;
use crate::exemplar::SelectionStrategy;
use crate::svm::ParamGrid;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level experiment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwrConfig {
    /// Per-group optimisation of the LwF / iCaRL learners.
    #[serde(default)]
    pub trainer: TrainerConfig,
    /// Network shape.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Exemplar replay buffer.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Head used for the test pass.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// SVM head grid search.
    #[serde(default)]
    pub svm: SvmConfig,
    /// Snapshot ensemble pipeline.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Synthetic data source used by the CLI.
    #[serde(default)]
    pub data: BlobConfig,
    /// Where checkpoints and run logs go.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Optimisation settings, rebuilt at the start of every group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_lr")]
    pub lr: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    /// Epochs at which the learning rate is multiplied by `gamma`.
    #[serde(default = "default_milestones")]
    pub milestones: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_classes_per_group")]
    pub classes_per_group: usize,
    /// Keep the epoch with the best validation accuracy instead of the last one.
    #[serde(default = "default_true")]
    pub select_best_on_validation: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            milestones: default_milestones(),
            gamma: default_gamma(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            classes_per_group: default_classes_per_group(),
            select_best_on_validation: true,
            seed: default_seed(),
        }
    }
}

fn default_lr() -> f32 {
    2.0
}

fn default_momentum() -> f32 {
    0.9
}

fn default_weight_decay() -> f32 {
    1e-5
}

fn default_milestones() -> Vec<usize> {
    vec![49, 63]
}

fn default_gamma() -> f32 {
    0.2
}

fn default_batch_size() -> usize {
    128
}

fn default_epochs() -> usize {
    70
}

fn default_classes_per_group() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

/// Network shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Width of the feature embedding.
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            feature_dim: default_feature_dim(),
        }
    }
}

fn default_feature_dim() -> usize {
    64
}

/// Exemplar replay buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Total number of exemplars kept across all classes.
    #[serde(default = "default_memory_budget")]
    pub budget: usize,
    #[serde(default)]
    pub strategy: SelectionStrategy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget: default_memory_budget(),
            strategy: SelectionStrategy::default(),
        }
    }
}

fn default_memory_budget() -> usize {
    2000
}

/// Head used to classify the test split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub head: HeadKind,
    /// Add the current group's raw training samples to the newest class means.
    #[serde(default = "default_true")]
    pub include_current_in_means: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            head: HeadKind::default(),
            include_current_in_means: true,
        }
    }
}

/// SVM head grid search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvmConfig {
    #[serde(default)]
    pub grid: ParamGrid,
    /// Solver passes over the training set for each one-vs-rest machine.
    #[serde(default = "default_svm_epochs")]
    pub epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            grid: ParamGrid::default(),
            epochs: default_svm_epochs(),
            seed: default_seed(),
        }
    }
}

fn default_svm_epochs() -> usize {
    2
}

/// Snapshot ensemble pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,
    /// Must be a multiple of `n_estimators`.
    #[serde(default = "default_snapshot_epochs")]
    pub epochs: usize,
    #[serde(default = "default_snapshot_lr")]
    pub lr: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_snapshot_weight_decay")]
    pub weight_decay: f32,
    /// Accepted `(low, high)` learning-rate range.
    #[serde(default)]
    pub lr_clip: Option<(f32, f32)>,
    /// Batches between two training status lines.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_true")]
    pub save_model: bool,
    /// Defaults to the current directory.
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            n_estimators: default_n_estimators(),
            epochs: default_snapshot_epochs(),
            lr: default_snapshot_lr(),
            momentum: default_momentum(),
            weight_decay: default_snapshot_weight_decay(),
            lr_clip: None,
            log_interval: default_log_interval(),
            save_model: true,
            save_dir: None,
            batch_size: default_batch_size(),
        }
    }
}

fn default_n_estimators() -> usize {
    5
}

fn default_snapshot_epochs() -> usize {
    10
}

fn default_snapshot_lr() -> f32 {
    0.1
}

fn default_snapshot_weight_decay() -> f32 {
    5e-4
}

fn default_log_interval() -> usize {
    100
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Checkpoint directory; `None` disables per-group checkpoints.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: Option<PathBuf>,
    /// Oldest manifest entries beyond this count are dropped.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    /// Where the CLI writes the run logs.
    #[serde(default = "default_logs_path")]
    pub logs_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            max_checkpoints: default_max_checkpoints(),
            logs_path: default_logs_path(),
        }
    }
}

fn default_checkpoint_dir() -> Option<PathBuf> {
    Some(PathBuf::from(".owr/checkpoints"))
}

fn default_max_checkpoints() -> usize {
    20
}

fn default_logs_path() -> PathBuf {
    PathBuf::from(".owr/run_logs.json")
}

fn default_true() -> bool {
    true
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `OWR_`, `__` between sections)
/// 3. Workspace-local config (`.owr/config.toml`)
/// 4. User config (`~/.config/owr/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&OwrConfig>,
) -> Result<OwrConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(OwrConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "owr", "owr") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".owr").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // OWR_TRAINER__EPOCHS, OWR_MEMORY__BUDGET, ...
    figment = figment.merge(Env::prefixed("OWR_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
