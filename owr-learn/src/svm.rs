//! Kernel support vector machine and validation grid search.
//!
//! Multi-class problems are decomposed one-vs-rest; each binary machine is a
//! smartcore `SVC` solved on the same feature matrix.

use crate::error::LearnError;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::svm::Kernels;
use smartcore::svm::svc::{SVC, SVCParameters};
use tracing::{debug, info};

/// Kernel function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    /// `x·y`
    Linear,
    /// `exp(-gamma * |x - y|^2)`
    #[default]
    Rbf,
}

/// RBF bandwidth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gamma {
    /// `1 / (n_features * var(X))` of the training features.
    #[default]
    Scale,
    #[serde(untagged)]
    Value(f32),
}

/// `1 / (n_features * var(X))`, or 1 for constant features.
fn scale_gamma(x: &Array2<f32>) -> f32 {
    let denom = x.ncols() as f32 * x.var(0.0);
    if denom > 0.0 { 1.0 / denom } else { 1.0 }
}

/// One point of the hyperparameter grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SvmParams {
    /// Inverse regularisation strength.
    pub c: f32,
    pub gamma: Gamma,
    pub kernel: KernelKind,
}

impl Default for SvmParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            gamma: Gamma::Scale,
            kernel: KernelKind::Rbf,
        }
    }
}

/// Candidate values per hyperparameter.
///
/// Candidates are enumerated with the keys in sorted order (`c`, `gamma`,
/// `kernel`) and the last key varying fastest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    #[serde(default = "default_c")]
    pub c: Vec<f32>,
    #[serde(default = "default_gamma")]
    pub gamma: Vec<Gamma>,
    #[serde(default = "default_kernel")]
    pub kernel: Vec<KernelKind>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            c: default_c(),
            gamma: default_gamma(),
            kernel: default_kernel(),
        }
    }
}

fn default_c() -> Vec<f32> {
    vec![0.1, 1.0, 10.0]
}

fn default_gamma() -> Vec<Gamma> {
    vec![Gamma::Scale]
}

fn default_kernel() -> Vec<KernelKind> {
    vec![KernelKind::Rbf]
}

impl ParamGrid {
    pub fn candidates(&self) -> Vec<SvmParams> {
        let mut out = Vec::with_capacity(self.len());
        for &c in &self.c {
            for &gamma in &self.gamma {
                for &kernel in &self.kernel {
                    out.push(SvmParams { c, gamma, kernel });
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.c.len() * self.gamma.len() * self.kernel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Svc<'a> = SVC<'a, f64, i32, DenseMatrix<f64>, Vec<i32>>;

/// Solver settings shared by every one-vs-rest machine of a candidate.
pub type SvcSettings = SVCParameters<f64, i32, DenseMatrix<f64>, Vec<i32>>;

/// Training set in solver layout: `f64` rows plus one `±1` target per class.
#[derive(Debug)]
pub struct SvmProblem {
    x: DenseMatrix<f64>,
    classes: Vec<usize>,
    signs: Vec<Vec<i32>>,
    gamma_scale: f32,
}

impl SvmProblem {
    pub fn new(x: &Array2<f32>, y: &[usize]) -> Result<Self, LearnError> {
        if x.nrows() == 0 {
            return Err(LearnError::invalid_input("cannot fit an SVM on zero samples"));
        }
        if x.nrows() != y.len() {
            return Err(LearnError::invalid_input(format!(
                "{} feature rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }

        let mut classes = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let signs: Vec<Vec<i32>> = classes
            .iter()
            .map(|&class| y.iter().map(|&l| if l == class { 1 } else { -1 }).collect())
            .collect();

        Ok(Self {
            x: dense(x)?,
            classes,
            signs,
            gamma_scale: scale_gamma(x),
        })
    }

    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    /// Solver settings for `params` on this problem.
    pub fn settings(&self, params: SvmParams, epochs: usize, seed: u64) -> Result<SvcSettings, LearnError> {
        if params.c <= 0.0 {
            return Err(LearnError::config(format!("SVM C must be positive, got {}", params.c)));
        }
        let settings = SVCParameters::default()
            .with_c(f64::from(params.c))
            .with_epoch(epochs.max(1))
            .with_seed(Some(seed));
        Ok(match params.kernel {
            KernelKind::Linear => settings.with_kernel(Kernels::linear()),
            KernelKind::Rbf => {
                let gamma = match params.gamma {
                    Gamma::Scale => self.gamma_scale,
                    Gamma::Value(g) => g,
                };
                settings.with_kernel(Kernels::rbf().with_gamma(f64::from(gamma)))
            }
        })
    }
}

fn dense(x: &Array2<f32>) -> Result<DenseMatrix<f64>, LearnError> {
    let rows: Vec<Vec<f64>> = x
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|&v| f64::from(v)).collect())
        .collect();
    DenseMatrix::from_2d_vec(&rows)
        .map_err(|e| LearnError::invalid_input(format!("Failed to create feature matrix: {:?}", e)))
}

/// One-vs-rest kernel SVM over smartcore's binary `SVC`.
///
/// With a single class in the training set there is nothing to separate and
/// every query is assigned that class.
#[derive(Debug)]
pub struct KernelSvm<'a> {
    params: SvmParams,
    classes: &'a [usize],
    machines: Vec<Svc<'a>>,
}

impl<'a> KernelSvm<'a> {
    pub fn fit(
        params: SvmParams,
        problem: &'a SvmProblem,
        settings: &'a SvcSettings,
    ) -> Result<Self, LearnError> {
        let machines = if problem.classes.len() < 2 {
            Vec::new()
        } else {
            problem
                .signs
                .iter()
                .map(|signs| {
                    SVC::fit(&problem.x, signs, settings)
                        .map_err(|e| LearnError::training(format!("SVM training failed: {:?}", e)))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        debug!(
            c = params.c,
            kernel = ?params.kernel,
            classes = problem.classes.len(),
            samples = problem.signs.first().map_or(0, Vec::len),
            "Fitted kernel SVM"
        );

        Ok(Self {
            params,
            classes: &problem.classes,
            machines,
        })
    }

    pub fn params(&self) -> SvmParams {
        self.params
    }

    pub fn classes(&self) -> &[usize] {
        self.classes
    }

    /// Per-class margins, `[n, n_classes]`.
    pub fn decision_function(&self, x: &Array2<f32>) -> Result<Array2<f32>, LearnError> {
        let mut margins = Array2::zeros((x.nrows(), self.machines.len()));
        if self.machines.is_empty() || x.nrows() == 0 {
            return Ok(margins);
        }
        let query = dense(x)?;
        for (k, machine) in self.machines.iter().enumerate() {
            let values = machine
                .decision_function(&query)
                .map_err(|e| LearnError::model(format!("SVM prediction failed: {:?}", e)))?;
            for (i, v) in values.into_iter().enumerate() {
                margins[[i, k]] = v as f32;
            }
        }
        Ok(margins)
    }

    /// Label with the largest margin, ties going to the smaller label.
    pub fn predict(&self, x: &Array2<f32>) -> Result<Vec<usize>, LearnError> {
        if self.machines.is_empty() {
            return Ok(vec![self.classes[0]; x.nrows()]);
        }
        Ok(crate::ops::argmax_rows(&self.decision_function(x)?)
            .into_iter()
            .map(|k| self.classes[k])
            .collect())
    }

    /// Fraction of correct predictions in `[0, 1]`.
    pub fn score(&self, x: &Array2<f32>, y: &[usize]) -> Result<f32, LearnError> {
        Ok(accuracy(&self.predict(x)?, y))
    }
}

/// Fraction of positions where `predicted` equals `expected`.
pub fn accuracy(predicted: &[usize], expected: &[usize]) -> f32 {
    if expected.is_empty() {
        return 0.0;
    }
    let correct = predicted
        .iter()
        .zip(expected)
        .filter(|(p, e)| p == e)
        .count();
    correct as f32 / expected.len() as f32
}

/// Index of the best score. A later candidate only wins with a strictly
/// greater score, so ties keep the earliest one.
pub fn select_best(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        match best {
            Some((_, b)) if score <= b => {}
            _ if score.is_nan() => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i)
}

/// Result of [`grid_search`]. The winning machine is refitted by the caller
/// from `params`, since it borrows the problem it was solved on.
#[derive(Debug, Clone)]
pub struct GridSearchOutcome {
    pub params: SvmParams,
    /// Validation accuracy in `[0, 1]`.
    pub score: f32,
    /// Validation accuracy of every candidate, in grid order.
    pub scores: Vec<f32>,
}

/// Fit one machine per grid point and keep the best on validation.
pub fn grid_search(
    grid: &ParamGrid,
    problem: &SvmProblem,
    validation: (&Array2<f32>, &[usize]),
    epochs: usize,
    seed: u64,
) -> Result<GridSearchOutcome, LearnError> {
    if grid.is_empty() {
        return Err(LearnError::config("SVM parameter grid has no candidates"));
    }

    let candidates = grid.candidates();
    let mut scores = Vec::with_capacity(candidates.len());
    for &params in &candidates {
        let settings = problem.settings(params, epochs, seed)?;
        let model = KernelSvm::fit(params, problem, &settings)?;
        let score = model.score(validation.0, validation.1)?;
        debug!(?params, score, "Evaluated SVM candidate");
        scores.push(score);
    }

    let best = select_best(&scores).unwrap_or(0);
    let params = candidates[best];
    let score = scores[best];
    info!(?params, score, "Best classifier");

    Ok(GridSearchOutcome {
        params,
        score,
        scores,
    })
}
