//! Model configuration.
//!
//! [`VqVaeConfig`] is deliberately flat: every field is a primitive, so the
//! whole struct can be stored as JSON next to the parameters in a checkpoint
//! and used to rebuild an uninitialized model before the weights are restored.

use serde::{Deserialize, Serialize};

use crate::diffusion::schedule::ScheduleKind;
use crate::model::{EncoderKind, PredictorKind};
use crate::{Error, Result};

/// Which orchestration of predictors to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorKind {
    /// A single code-conditioned predictor.
    Single,
    /// Base, label and code-conditioned predictors with learned gates.
    Cascade,
}

impl OrchestratorKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "single" => Ok(Self::Single),
            "cascade" => Ok(Self::Cascade),
            other => Err(Error::Config(format!("unknown orchestrator: {other}"))),
        }
    }
}

/// Constructor configuration for [`crate::vqvae::VqVae`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VqVaeConfig {
    /// `"single"` or `"cascade"`.
    #[serde(default = "default_orchestrator")]
    pub orchestrator: String,

    /// Encoder architecture name (`"wavegrad"` or `"unet"`).
    #[serde(default = "default_encoder")]
    pub encoder: String,

    /// Predictor architecture name (`"wavegrad"` or `"unet"`).
    #[serde(default = "default_predictor")]
    pub predictor: String,

    /// Noise schedule name (`"exp"` or `"cos"`).
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Number of class labels (speakers).
    pub num_labels: usize,

    #[serde(default = "default_base_channels")]
    pub base_channels: usize,

    /// Conditioning channels as a multiple of `base_channels`.
    #[serde(default = "default_cond_mult")]
    pub cond_mult: usize,

    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,

    /// Weight of the commitment term in the quantization loss.
    #[serde(default = "default_commitment")]
    pub commitment: f64,

    /// Predictor dropout probability (unet only).
    #[serde(default)]
    pub dropout: f64,

    #[serde(default = "default_time_scale_channels")]
    pub time_scale_channels: usize,

    /// Value of the cascade gates at initialization.
    #[serde(default = "default_time_scale_initial")]
    pub time_scale_initial: f64,

    /// Log-space multiplier applied to the gate's linear output.
    #[serde(default = "default_time_scale_scale")]
    pub time_scale_scale: f64,
}

impl VqVaeConfig {
    /// Default configuration for the given number of labels.
    pub fn new(num_labels: usize) -> Self {
        Self {
            orchestrator: default_orchestrator(),
            encoder: default_encoder(),
            predictor: default_predictor(),
            schedule: default_schedule(),
            num_labels,
            base_channels: default_base_channels(),
            cond_mult: default_cond_mult(),
            codebook_size: default_codebook_size(),
            commitment: default_commitment(),
            dropout: 0.0,
            time_scale_channels: default_time_scale_channels(),
            time_scale_initial: default_time_scale_initial(),
            time_scale_scale: default_time_scale_scale(),
        }
    }

    /// Channel count of the conditioning sequence (codebook dimension).
    pub fn cond_channels(&self) -> usize {
        self.base_channels * self.cond_mult
    }

    pub fn orchestrator_kind(&self) -> Result<OrchestratorKind> {
        OrchestratorKind::from_name(&self.orchestrator)
    }

    pub fn encoder_kind(&self) -> Result<EncoderKind> {
        EncoderKind::from_name(&self.encoder)
    }

    pub fn predictor_kind(&self) -> Result<PredictorKind> {
        PredictorKind::from_name(&self.predictor)
    }

    pub fn schedule_kind(&self) -> Result<ScheduleKind> {
        ScheduleKind::from_name(&self.schedule)
    }

    /// Resolve every name and check numeric ranges.
    pub fn validate(&self) -> Result<()> {
        self.orchestrator_kind()?;
        self.encoder_kind()?;
        let predictor = self.predictor_kind()?;
        self.schedule_kind()?;

        if self.num_labels == 0 {
            return Err(Error::Config("num_labels must be positive".into()));
        }
        if self.base_channels == 0 || self.cond_mult == 0 {
            return Err(Error::Config(
                "base_channels and cond_mult must be positive".into(),
            ));
        }
        if self.codebook_size == 0 {
            return Err(Error::Config("codebook_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.dropout > 0.0 && predictor == PredictorKind::WaveGrad {
            return Err(Error::Config(
                "dropout not supported for wavegrad predictor".into(),
            ));
        }
        if self.time_scale_initial <= 0.0 || self.time_scale_scale <= 0.0 {
            return Err(Error::Config(
                "time_scale_initial and time_scale_scale must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_orchestrator() -> String {
    "cascade".to_string()
}

fn default_encoder() -> String {
    "wavegrad".to_string()
}

fn default_predictor() -> String {
    "unet".to_string()
}

fn default_schedule() -> String {
    "exp".to_string()
}

fn default_base_channels() -> usize {
    32
}

fn default_cond_mult() -> usize {
    16
}

fn default_codebook_size() -> usize {
    512
}

fn default_commitment() -> f64 {
    0.25
}

fn default_time_scale_channels() -> usize {
    256
}

fn default_time_scale_initial() -> f64 {
    0.05
}

fn default_time_scale_scale() -> f64 {
    3.0
}
