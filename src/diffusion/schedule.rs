//! Noise schedules.
//!
//! A schedule maps continuous diffusion time `t ∈ [0, 1]` to the cumulative
//! signal fraction `ᾱ(t)`. The mixing coefficients follow as
//! `alpha = sqrt(ᾱ)` and `sigma = sqrt(1 - ᾱ)`, so `alpha² + sigma² = 1`.
//!
//! - [`ExpSchedule`] — `ᾱ(t) = ᾱ_final^t`
//! - [`CosSchedule`] — the improved-diffusion cosine schedule

use std::f64::consts::FRAC_PI_2;

use crate::{Error, Result};

/// Common interface for all noise schedules.
pub trait Schedule: Send + Sync {
    /// Cumulative signal fraction `ᾱ(t)`, strictly decreasing from ~1 to ~0.
    fn alpha_bar(&self, t: f64) -> f64;

    /// Mixing coefficients `(alpha, sigma)` at time `t`.
    fn coefficients(&self, t: f64) -> (f64, f64) {
        let alpha_bar = self.alpha_bar(t).clamp(0.0, 1.0);
        (alpha_bar.sqrt(), (1.0 - alpha_bar).sqrt())
    }
}

/// Exponential decay of `ᾱ`.
#[derive(Debug, Clone, Copy)]
pub struct ExpSchedule {
    /// `ᾱ(1)`.
    pub alpha_final: f64,
}

impl Default for ExpSchedule {
    fn default() -> Self {
        Self { alpha_final: 1e-5 }
    }
}

impl Schedule for ExpSchedule {
    fn alpha_bar(&self, t: f64) -> f64 {
        (self.alpha_final.ln() * t).exp().clamp(0.0, 1.0)
    }
}

/// Cosine schedule from "Improved Denoising Diffusion Probabilistic Models".
#[derive(Debug, Clone, Copy)]
pub struct CosSchedule {
    /// Small offset keeping `beta` from vanishing near `t = 0`.
    pub s: f64,
}

impl Default for CosSchedule {
    fn default() -> Self {
        Self { s: 0.008 }
    }
}

impl CosSchedule {
    fn f(&self, t: f64) -> f64 {
        (((t + self.s) / (1.0 + self.s)) * FRAC_PI_2).cos().powi(2)
    }
}

impl Schedule for CosSchedule {
    fn alpha_bar(&self, t: f64) -> f64 {
        (self.f(t) / self.f(0.0)).clamp(0.0, 1.0)
    }
}

/// Named schedule variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Exp,
    Cos,
}

impl ScheduleKind {
    /// Resolve a human-readable name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "exp" => Ok(Self::Exp),
            "cos" => Ok(Self::Cos),
            other => Err(Error::UnknownSchedule(other.to_string())),
        }
    }

    pub fn build(self) -> Box<dyn Schedule> {
        match self {
            Self::Exp => Box::new(ExpSchedule::default()),
            Self::Cos => Box::new(CosSchedule::default()),
        }
    }
}

/// Create a schedule from a human-readable name.
pub fn make_schedule(name: &str) -> Result<Box<dyn Schedule>> {
    Ok(ScheduleKind::from_name(name)?.build())
}
