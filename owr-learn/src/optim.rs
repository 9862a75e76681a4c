//! Optimizer and learning rate schedules.
//!
//! - [`Sgd`] - momentum SGD with L2 weight decay
//! - [`MultiStepLr`] - decay by `gamma` at each milestone epoch
//! - [`SnapshotCosineLr`] - cosine annealing restarted once per ensemble member

use ndarray::Array2;
use std::f32::consts::PI;

/// Learning rate scheduler
pub trait LrScheduler {
    /// Current learning rate
    fn get_lr(&self) -> f32;

    /// Advance one step (an epoch or an iteration, depending on the schedule)
    fn step(&mut self);
}

/// Stochastic gradient descent with momentum and weight decay.
///
/// ```text
/// g = grad + weight_decay * p
/// v = momentum * v + g        (v = g on the first step)
/// p = p - lr * v
/// ```
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocities: Vec<Option<Array2<f32>>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocities: Vec::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// Update `params` in place. `grads` must follow the same order.
    pub fn step(&mut self, params: Vec<&mut Array2<f32>>, grads: &[Array2<f32>]) {
        if self.velocities.len() != params.len() {
            self.velocities = vec![None; params.len()];
        }

        for ((param, grad), velocity) in params
            .into_iter()
            .zip(grads)
            .zip(self.velocities.iter_mut())
        {
            let mut g = grad.clone();
            if self.weight_decay != 0.0 {
                g.scaled_add(self.weight_decay, &*param);
            }

            if self.momentum != 0.0 {
                let v = match velocity.take() {
                    Some(mut v) if v.shape() == g.shape() => {
                        v *= self.momentum;
                        v += &g;
                        v
                    }
                    _ => g,
                };
                param.scaled_add(-self.lr, &v);
                *velocity = Some(v);
            } else {
                param.scaled_add(-self.lr, &g);
            }
        }
    }
}

/// Multiplies the base rate by `gamma` once per milestone reached.
///
/// Formula: lr_e = base * gamma^(number of milestones <= e)
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f32,
    milestones: Vec<usize>,
    gamma: f32,
    epoch: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f32, milestones: Vec<usize>, gamma: f32) -> Self {
        Self {
            base_lr,
            milestones,
            gamma,
            epoch: 0,
        }
    }
}

impl LrScheduler for MultiStepLr {
    fn get_lr(&self) -> f32 {
        let passed = self.milestones.iter().filter(|&&m| m <= self.epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    fn step(&mut self) {
        self.epoch += 1;
    }
}

/// Cyclic cosine annealing for snapshot ensembles.
///
/// Formula: lr_t = base * 0.5 * (cos(π * (t mod T_M) / T_M) + 1),
/// with T_M = ceil(total_iterations / n_estimators). Stepped once per
/// optimizer update, so the rate restarts at `base` for every member.
#[derive(Debug, Clone)]
pub struct SnapshotCosineLr {
    base_lr: f32,
    cycle: usize,
    iteration: usize,
}

impl SnapshotCosineLr {
    pub fn new(base_lr: f32, total_iterations: usize, n_estimators: usize) -> Self {
        Self {
            base_lr,
            cycle: total_iterations.div_ceil(n_estimators.max(1)).max(1),
            iteration: 0,
        }
    }

    /// T_M, the length of one annealing cycle in iterations.
    pub fn cycle(&self) -> usize {
        self.cycle
    }

    /// Multiplier applied to the base rate at iteration `t`.
    pub fn factor(&self, t: usize) -> f32 {
        let phase = (t % self.cycle) as f32 / self.cycle as f32;
        0.5 * ((PI * phase).cos() + 1.0)
    }
}

impl LrScheduler for SnapshotCosineLr {
    fn get_lr(&self) -> f32 {
        self.base_lr * self.factor(self.iteration)
    }

    fn step(&mut self) {
        self.iteration += 1;
    }
}

/// Clamp `lr` into `[low, high]` when bounds are given.
pub fn clip_lr(lr: f32, bounds: Option<(f32, f32)>) -> f32 {
    match bounds {
        Some((low, high)) => lr.max(low).min(high),
        None => lr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_sgd_plain_step() {
        let mut p = array![[1.0, 2.0]];
        let mut sgd = Sgd::new(0.5, 0.0, 0.0);
        sgd.step(vec![&mut p], &[array![[2.0, -2.0]]]);
        assert_eq!(p, array![[0.0, 3.0]]);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut p = array![[0.0]];
        let mut sgd = Sgd::new(1.0, 0.9, 0.0);
        sgd.step(vec![&mut p], &[array![[1.0]]]);
        assert!((p[[0, 0]] + 1.0).abs() < 1e-6);
        sgd.step(vec![&mut p], &[array![[1.0]]]);
        // v = 0.9 * 1 + 1 = 1.9
        assert!((p[[0, 0]] + 2.9).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let mut p = array![[2.0]];
        let mut sgd = Sgd::new(0.1, 0.0, 0.5);
        sgd.step(vec![&mut p], &[array![[0.0]]]);
        assert!((p[[0, 0]] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_multistep_lr() {
        let mut sched = MultiStepLr::new(2.0, vec![2, 4], 0.5);
        let mut lrs = Vec::new();
        for _ in 0..5 {
            lrs.push(sched.get_lr());
            sched.step();
        }
        assert_eq!(lrs, vec![2.0, 2.0, 1.0, 1.0, 0.5]);
    }

    #[test]
    fn test_snapshot_cosine_restarts_every_cycle() {
        let mut sched = SnapshotCosineLr::new(0.1, 20, 5);
        assert_eq!(sched.cycle(), 4);
        let mut lrs = Vec::new();
        for _ in 0..8 {
            lrs.push(sched.get_lr());
            sched.step();
        }
        assert!((lrs[0] - 0.1).abs() < 1e-7);
        assert!((lrs[2] - 0.05).abs() < 1e-6);
        assert!(lrs[3] < lrs[2]);
        assert!((lrs[4] - 0.1).abs() < 1e-7);
    }

    #[test]
    fn test_snapshot_cosine_cycle_rounds_up() {
        assert_eq!(SnapshotCosineLr::new(1.0, 21, 5).cycle(), 5);
    }

    #[test]
    fn test_clip_lr() {
        assert_eq!(clip_lr(0.5, Some((0.01, 0.1))), 0.1);
        assert_eq!(clip_lr(0.001, Some((0.01, 0.1))), 0.01);
        assert_eq!(clip_lr(0.05, None), 0.05);
    }
}
