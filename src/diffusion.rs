//! Gaussian diffusion over waveforms.
//!
//! Continuous-time formulation: `x_t = alpha_t * x_0 + sigma_t * ε` with
//! `(alpha_t, sigma_t)` from a [`Schedule`].
//!
//! - [`Diffusion::sample_q`] — forward noising
//! - [`Diffusion::ddpm_sample`] — reverse ancestral sampling
//!
//! ## Ancestral step
//!
//! From time `t` to the earlier time `s`, with `a = ᾱ_t / ᾱ_s` and `β = 1 - a`:
//! ```text
//! x̂_0  = (x_t - sigma_t * ε̂) / alpha_t
//! mean = (alpha_s β / sigma_t²) x̂_0 + (sqrt(a) sigma_s² / sigma_t²) x_t
//! x_s  = mean + sqrt(var) * z      // z suppressed on the final step
//! ```

pub mod schedule;

use candle_core::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::noise;
use crate::{Error, Result};
use schedule::Schedule;

/// Largest time on the sampling grid; the grid is scaled into `[0, MAX_TIME]`
/// so `1 / alpha_t` stays finite for schedules whose `alpha` reaches zero at
/// `t = 1`.
pub const MAX_TIME: f64 = 0.999;

/// Variance of the stochastic term in each reverse step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceKind {
    /// True posterior variance `β sigma_s² / sigma_t²`.
    #[default]
    Posterior,
    /// Upper bound `β`.
    Beta,
}

/// Options for [`Diffusion::ddpm_sample`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleOptions {
    /// Number of reverse steps.
    #[serde(default = "default_steps")]
    pub steps: usize,

    /// Log each step at info level.
    #[serde(default)]
    pub progress: bool,

    /// Clamp the clean-signal estimate to `[-1, 1]` at every step.
    #[serde(default)]
    pub constrain: bool,

    #[serde(default)]
    pub variance: VarianceKind,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            progress: false,
            constrain: false,
            variance: VarianceKind::default(),
        }
    }
}

impl SampleOptions {
    pub fn with_steps(steps: usize) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }
}

fn default_steps() -> usize {
    100
}

/// Coefficients of a single reverse transition `t → s`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCoefficients {
    pub alpha_t: f64,
    pub sigma_t: f64,
    /// Weight of `x̂_0` in the posterior mean.
    pub x0_coef: f64,
    /// Weight of `x_t` in the posterior mean.
    pub xt_coef: f64,
    pub variance: f64,
}

/// Forward and reverse diffusion processes for a fixed schedule.
pub struct Diffusion {
    schedule: Box<dyn Schedule>,
}

impl Diffusion {
    pub fn new(schedule: Box<dyn Schedule>) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &dyn Schedule {
        self.schedule.as_ref()
    }

    /// Noise `x0` to per-row times `ts`.
    ///
    /// - `x0`: [N, ...]
    /// - `ts`: [N] times in `[0, 1]`
    /// - `epsilon`: noise with the shape of `x0`, or `None` to draw it from `rng`
    pub fn sample_q<R: Rng + ?Sized>(
        &self,
        x0: &Tensor,
        ts: &Tensor,
        epsilon: Option<&Tensor>,
        rng: &mut R,
    ) -> Result<Tensor> {
        let epsilon = match epsilon {
            Some(eps) => {
                if eps.dims() != x0.dims() {
                    return Err(Error::Shape(format!(
                        "epsilon shape {:?} does not match x0 shape {:?}",
                        eps.dims(),
                        x0.dims()
                    )));
                }
                eps.clone()
            }
            None => noise::gaussian_like(x0, rng)?,
        };
        let (alphas, sigmas) = self.batch_coefficients(x0, ts)?;
        Ok((x0.broadcast_mul(&alphas)? + epsilon.broadcast_mul(&sigmas)?)?)
    }

    /// Per-row `(alpha, sigma)` shaped `[N, 1, ..., 1]` to broadcast against `like`.
    fn batch_coefficients(&self, like: &Tensor, ts: &Tensor) -> Result<(Tensor, Tensor)> {
        let n = like.dim(0)?;
        let ts = ts.flatten_all()?.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?;
        if ts.len() != n {
            return Err(Error::Shape(format!(
                "expected {n} timesteps, got {}",
                ts.len()
            )));
        }
        let (alphas, sigmas): (Vec<f32>, Vec<f32>) = ts
            .iter()
            .map(|&t| {
                let (alpha, sigma) = self.schedule.coefficients(t);
                (alpha as f32, sigma as f32)
            })
            .unzip();

        let mut shape = vec![1usize; like.rank()];
        shape[0] = n;
        let dtype = like.dtype();
        let alphas = Tensor::from_vec(alphas, shape.as_slice(), like.device())?.to_dtype(dtype)?;
        let sigmas = Tensor::from_vec(sigmas, shape.as_slice(), like.device())?.to_dtype(dtype)?;
        Ok((alphas, sigmas))
    }

    /// Decreasing evaluation times `t_steps, ..., t_0` with `t_0 = 0` and
    /// `t_steps = MAX_TIME`, evenly spaced.
    pub fn timesteps(steps: usize) -> Vec<f64> {
        (0..=steps)
            .rev()
            .map(|k| k as f64 / steps as f64 * MAX_TIME)
            .collect()
    }

    /// Coefficients of the ancestral transition from `t` down to `s`.
    pub fn step_coefficients(&self, t: f64, s: f64, variance: VarianceKind) -> StepCoefficients {
        let alpha_bar_t = self.schedule.alpha_bar(t).clamp(0.0, 1.0);
        let alpha_bar_s = self.schedule.alpha_bar(s).clamp(0.0, 1.0);
        let (alpha_t, sigma_t) = self.schedule.coefficients(t);
        let (alpha_s, sigma_s) = self.schedule.coefficients(s);

        let step_alpha = if alpha_bar_s > 0.0 {
            (alpha_bar_t / alpha_bar_s).min(1.0)
        } else {
            1.0
        };
        let beta = 1.0 - step_alpha;
        let sigma_t_sq = (sigma_t * sigma_t).max(f64::MIN_POSITIVE);
        let sigma_s_sq = sigma_s * sigma_s;

        let variance = match variance {
            VarianceKind::Posterior => beta * sigma_s_sq / sigma_t_sq,
            VarianceKind::Beta => beta,
        };
        StepCoefficients {
            alpha_t,
            sigma_t,
            x0_coef: alpha_s * beta / sigma_t_sq,
            xt_coef: step_alpha.sqrt() * sigma_s_sq / sigma_t_sq,
            variance,
        }
    }

    /// Reverse ancestral sampling from `x_t` (pure noise) to a clean signal.
    ///
    /// `predict_fn(x_t, ts)` returns the noise estimate for the batch, where
    /// `ts` is an [N] tensor filled with the current time.
    pub fn ddpm_sample<F, R>(
        &self,
        x_t: &Tensor,
        mut predict_fn: F,
        options: &SampleOptions,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        F: FnMut(&Tensor, &Tensor) -> Result<Tensor>,
        R: Rng + ?Sized,
    {
        if options.steps == 0 {
            return Err(Error::Config("ddpm_sample needs at least one step".into()));
        }
        let n = x_t.dim(0)?;
        let grid = Self::timesteps(options.steps);
        let mut x = x_t.clone();

        for (i, pair) in grid.windows(2).enumerate() {
            let (t, s) = (pair[0], pair[1]);
            let ts = Tensor::full(t as f32, n, x.device())?.to_dtype(x.dtype())?;
            let eps = predict_fn(&x, &ts)?;
            if eps.dims() != x.dims() {
                return Err(Error::Shape(format!(
                    "predictor returned {:?} for input {:?}",
                    eps.dims(),
                    x.dims()
                )));
            }

            let coefs = self.step_coefficients(t, s, options.variance);
            let mut x0 = ((&x - (&eps * coefs.sigma_t)?)? / coefs.alpha_t)?;
            if options.constrain {
                x0 = x0.clamp(-1f32, 1f32)?;
            }
            let mean = ((&x0 * coefs.x0_coef)? + (&x * coefs.xt_coef)?)?;

            let is_last = i + 2 == grid.len();
            x = if is_last || coefs.variance <= 0.0 {
                mean
            } else {
                let z = noise::gaussian_like(&x, rng)?;
                (mean + (z * coefs.variance.sqrt())?)?
            };

            if options.progress {
                tracing::info!(step = i + 1, steps = options.steps, t, "ddpm sampling");
            }
        }

        Ok(x)
    }
}
