//! Controller optimizer and loss scaler.
//!
//! The controllers hold a few hundred logits at most, so the update runs on a
//! flat host-side `f32` buffer: gradients are gathered from the arch store,
//! averaged across replicas through [`GradientSync`], clipped and applied by
//! AdamW, then written back. The same flat layout makes the moment buffers
//! trivial to checkpoint.

use ndarray::{ArrayD, IxDyn};
use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, warn};

use diffrate_core::checkpoint::{LossScalerState, OptimizerState};
use diffrate_core::dist::GradientSync;
use diffrate_core::state_dict::StateDict;

use crate::error::{TrainError, TrainResult};

// ---------------------------------------------------------------------------
// ArchAdamW
// ---------------------------------------------------------------------------

/// AdamW over every variable of one [`nn::VarStore`].
#[derive(Debug)]
pub struct ArchAdamW {
    names: Vec<String>,
    params: Vec<Tensor>,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
    step: u64,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
}

impl ArchAdamW {
    /// Optimizer for the variables of `vs`, ordered by name.
    pub fn new(vs: &nn::VarStore, lr: f64, betas: (f64, f64), eps: f64, weight_decay: f64) -> Self {
        let mut vars: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        let (names, params): (Vec<_>, Vec<_>) = vars.into_iter().unzip();
        let numel = params.iter().map(|p| p.numel()).sum();
        ArchAdamW {
            names,
            params,
            exp_avg: vec![0.0; numel],
            exp_avg_sq: vec![0.0; numel],
            step: 0,
            lr,
            beta1: betas.0,
            beta2: betas.1,
            eps,
            weight_decay,
        }
    }

    /// Total number of optimised scalars.
    pub fn numel(&self) -> usize {
        self.exp_avg.len()
    }

    /// Current learning rate.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Set the learning rate (scheduler hook).
    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Number of updates applied.
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Clear accumulated gradients.
    pub fn zero_grad(&mut self) {
        for p in self.params.iter_mut() {
            p.zero_grad();
        }
    }

    /// Flattened gradients; variables without one contribute zeros.
    pub fn gradients(&self) -> TrainResult<Vec<f32>> {
        let mut out = Vec::with_capacity(self.numel());
        for p in &self.params {
            let g = p.grad();
            if g.defined() {
                out.extend(Vec::<f32>::try_from(&flat_host(&g))?);
            } else {
                out.extend(std::iter::repeat(0.0).take(p.numel()));
            }
        }
        Ok(out)
    }

    /// Flattened parameter values.
    pub fn parameters(&self) -> TrainResult<Vec<f32>> {
        let mut out = Vec::with_capacity(self.numel());
        for p in &self.params {
            out.extend(Vec::<f32>::try_from(&flat_host(p))?);
        }
        Ok(out)
    }

    /// One AdamW update with `grads` (flattened, already unscaled and reduced).
    pub fn step(&mut self, grads: &[f32]) -> TrainResult<()> {
        if grads.len() != self.numel() {
            return Err(TrainError::shape_mismatch("arch gradients", vec![self.numel() as i64], vec![grads.len() as i64]));
        }
        let mut values = self.parameters()?;
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);
        let (b1, b2) = (self.beta1 as f32, self.beta2 as f32);

        for (i, (v, &g)) in values.iter_mut().zip(grads).enumerate() {
            if self.weight_decay > 0.0 {
                *v *= (1.0 - self.lr * self.weight_decay) as f32;
            }
            self.exp_avg[i] = b1 * self.exp_avg[i] + (1.0 - b1) * g;
            self.exp_avg_sq[i] = b2 * self.exp_avg_sq[i] + (1.0 - b2) * g * g;
            let m_hat = self.exp_avg[i] as f64 / bias1;
            let v_hat = self.exp_avg_sq[i] as f64 / bias2;
            *v -= (self.lr * m_hat / (v_hat.sqrt() + self.eps)) as f32;
        }
        self.write_parameters(&values);
        Ok(())
    }

    fn write_parameters(&mut self, values: &[f32]) {
        let mut offset = 0;
        for p in self.params.iter_mut() {
            let n = p.numel();
            let src = Tensor::from_slice(&values[offset..offset + n])
                .reshape(p.size().as_slice())
                .to_device(p.device())
                .to_kind(p.kind());
            tch::no_grad(|| p.copy_(&src));
            offset += n;
        }
    }

    fn split(&self, flat: &[f32]) -> StateDict {
        let mut offset = 0;
        let mut sd = StateDict::new();
        for (name, p) in self.names.iter().zip(&self.params) {
            let shape: Vec<usize> = p.size().iter().map(|&d| d as usize).collect();
            let n = p.numel();
            let data = flat[offset..offset + n].to_vec();
            if let Ok(array) = ArrayD::from_shape_vec(IxDyn(&shape), data) {
                sd.insert(name.as_str(), array);
            }
            offset += n;
        }
        sd
    }

    fn join(&self, sd: &StateDict, field: &str) -> TrainResult<Vec<f32>> {
        let mut out = Vec::with_capacity(self.numel());
        for (name, p) in self.names.iter().zip(&self.params) {
            match sd.get(name) {
                Some(a) if a.len() == p.numel() => out.extend(a.iter().copied()),
                Some(a) => {
                    return Err(TrainError::shape_mismatch(
                        format!("{field}.{name}"),
                        vec![p.numel() as i64],
                        vec![a.len() as i64],
                    ))
                }
                None => {
                    warn!("optimizer state has no `{field}` entry for {name}; starting from zero");
                    out.extend(std::iter::repeat(0.0).take(p.numel()));
                }
            }
        }
        Ok(out)
    }

    /// Checkpointable state.
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            lr: self.lr,
            exp_avg: self.split(&self.exp_avg),
            exp_avg_sq: self.split(&self.exp_avg_sq),
        }
    }

    /// Restore from a checkpoint.
    pub fn load_state(&mut self, state: &OptimizerState) -> TrainResult<()> {
        self.exp_avg = self.join(&state.exp_avg, "exp_avg")?;
        self.exp_avg_sq = self.join(&state.exp_avg_sq, "exp_avg_sq")?;
        self.step = state.step;
        self.lr = state.lr;
        Ok(())
    }
}

fn flat_host(t: &Tensor) -> Tensor {
    t.detach().to_device(Device::Cpu).to_kind(Kind::Float).reshape([-1])
}

/// Scale `grads` so their global L2 norm is at most `max_norm`; returns the
/// norm before clipping.
pub fn clip_grad_norm(grads: &mut [f32], max_norm: f64) -> f64 {
    let norm = grads.iter().map(|&g| (g as f64) * (g as f64)).sum::<f64>().sqrt();
    if norm > max_norm && norm > 0.0 {
        let factor = (max_norm / (norm + 1e-6)) as f32;
        grads.iter_mut().for_each(|g| *g *= factor);
    }
    norm
}

// ---------------------------------------------------------------------------
// LossScaler
// ---------------------------------------------------------------------------

/// What happened to one optimisation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// The update was applied.
    Applied {
        /// Gradient norm before clipping.
        grad_norm: f64,
    },
    /// Gradients were not finite; the update was dropped.
    Skipped,
}

/// Dynamic loss scaling around backward and the optimizer step.
///
/// When disabled the scale stays at 1 but non-finite gradients still skip
/// the step.
#[derive(Debug, Clone)]
pub struct LossScaler {
    state: LossScalerState,
    enabled: bool,
}

impl LossScaler {
    /// Scaler with default growth parameters.
    pub fn new(enabled: bool) -> Self {
        LossScaler { state: LossScalerState::default(), enabled }
    }

    /// Current multiplier applied to the loss.
    pub fn scale(&self) -> f64 {
        if self.enabled {
            self.state.scale
        } else {
            1.0
        }
    }

    /// Checkpointable state.
    pub fn state(&self) -> LossScalerState {
        self.state
    }

    /// Restore from a checkpoint.
    pub fn load_state(&mut self, state: LossScalerState) {
        self.state = state;
    }

    fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        let s = &mut self.state;
        if found_inf {
            s.scale *= s.backoff_factor;
            s.growth_tracker = 0;
        } else {
            s.growth_tracker += 1;
            if s.growth_tracker >= s.growth_interval {
                s.scale *= s.growth_factor;
                s.growth_tracker = 0;
            }
        }
    }

    /// Backward `loss`, reduce gradients across replicas and step `optimizer`.
    pub fn backward_and_step(
        &mut self,
        loss: &Tensor,
        optimizer: &mut ArchAdamW,
        sync: &dyn GradientSync,
        clip_grad: Option<f64>,
    ) -> TrainResult<StepOutcome> {
        optimizer.zero_grad();
        let scale = self.scale();
        (loss * scale).backward();

        let mut grads = optimizer.gradients()?;
        let inv = (1.0 / scale) as f32;
        grads.iter_mut().for_each(|g| *g *= inv);
        sync.all_reduce_mean(&mut grads)?;

        if grads.iter().any(|g| !g.is_finite()) {
            self.update(true);
            warn!("non-finite controller gradients, skipping step (scale now {})", self.scale());
            return Ok(StepOutcome::Skipped);
        }
        let grad_norm = match clip_grad {
            Some(max) => clip_grad_norm(&mut grads, max),
            None => grads.iter().map(|&g| (g as f64).powi(2)).sum::<f64>().sqrt(),
        };
        optimizer.step(&grads)?;
        self.update(false);
        debug!("controller step {} (grad norm {grad_norm:.4e})", optimizer.steps());
        Ok(StepOutcome::Applied { grad_norm })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use diffrate_core::dist::LocalSync;

    fn store() -> (nn::VarStore, Tensor) {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("logits", &[3]);
        (vs, w)
    }

    #[test]
    fn first_step_moves_by_lr_against_gradient_sign() {
        let (vs, w) = store();
        let mut opt = ArchAdamW::new(&vs, 0.01, (0.9, 0.999), 1e-8, 0.0);
        opt.step(&[1.0, -2.0, 0.0]).unwrap();
        let v = Vec::<f32>::try_from(&w).unwrap();
        assert_relative_eq!(v[0], -0.01, epsilon = 1e-5);
        assert_relative_eq!(v[1], 0.01, epsilon = 1e-5);
        assert_relative_eq!(v[2], 0.0, epsilon = 1e-7);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn state_restores_moments() {
        let (vs, _w) = store();
        let mut opt = ArchAdamW::new(&vs, 0.01, (0.9, 0.999), 1e-8, 0.0);
        opt.step(&[1.0, 1.0, 1.0]).unwrap();
        let state = opt.state();
        assert_eq!(state.exp_avg.shape("logits"), Some(&[3usize][..]));

        let mut fresh = ArchAdamW::new(&vs, 0.5, (0.9, 0.999), 1e-8, 0.0);
        fresh.load_state(&state).unwrap();
        assert_eq!(fresh.steps(), 1);
        assert_eq!(fresh.lr(), 0.01);
        assert_eq!(fresh.state(), state);
    }

    #[test]
    fn clipping_bounds_norm() {
        let mut g = vec![3.0f32, 4.0];
        let norm = clip_grad_norm(&mut g, 1.0);
        assert_relative_eq!(norm, 5.0);
        assert_relative_eq!((g[0] * g[0] + g[1] * g[1]).sqrt(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn non_finite_loss_skips_and_backs_off() {
        let (vs, w) = store();
        let mut opt = ArchAdamW::new(&vs, 0.01, (0.9, 0.999), 1e-8, 0.0);
        let mut scaler = LossScaler::new(true);
        let before = scaler.scale();
        let loss = (&w * f64::NAN).sum(Kind::Float);
        let outcome = scaler.backward_and_step(&loss, &mut opt, &LocalSync, None).unwrap();
        assert_eq!(outcome, StepOutcome::Skipped);
        assert_eq!(scaler.scale(), before * 0.5);
        assert_eq!(opt.steps(), 0);

        let loss = w.sum(Kind::Float);
        let outcome = scaler.backward_and_step(&loss, &mut opt, &LocalSync, Some(1.0)).unwrap();
        assert!(matches!(outcome, StepOutcome::Applied { .. }));
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn growth_after_interval() {
        let mut scaler = LossScaler::new(true);
        scaler.state.growth_interval = 2;
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 65536.0 * 2.0);
        assert_eq!(LossScaler::new(false).scale(), 1.0);
    }
}
