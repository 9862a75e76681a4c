//! # owr-learn: class-incremental learning
//!
//! A network learns a sequence of disjoint class groups one at a time. The
//! crate provides the pieces that keep it from forgetting earlier groups:
//!
//! 1. **Distillation** from a frozen copy of the previous group's best network
//! 2. **Exemplar replay** from a bounded, class-balanced buffer filled by
//!    herding or random selection
//! 3. **Nearest-mean-of-exemplars** and **kernel SVM** heads on the learned
//!    embedding
//! 4. **Snapshot ensembles** trained under a restarting cosine schedule, with
//!    cosine-embedding distillation from the previous group's ensemble

// Foundation
pub mod config;
pub mod error;
pub mod ops;
pub mod persistence;

// Data & models
pub mod data;
pub mod model;
pub mod optim;
pub mod training;

// Forgetting mitigation
pub mod distill;
pub mod exemplar;

// Heads
pub mod classifier;
pub mod svm;

// Learners
pub mod incremental;
pub mod snapshot;

// Re-exports
pub use classifier::{ClassifierHead, HeadKind, NearestMeanClassifier};
pub use config::{OwrConfig, load_config};
pub use data::{IncrementalDataset, Sample};
pub use error::LearnError;
pub use exemplar::{ExemplarMemory, SelectionStrategy};
pub use incremental::{Icarl, LearningWithoutForgetting};
pub use model::{Frozen, Mlp, Network};
pub use snapshot::{FitOptions, SnapshotEnsemble};
pub use training::{RunLogs, Trainer};
