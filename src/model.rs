//! Encoder and predictor capabilities.
//!
//! The orchestrator only depends on the two traits below. Concrete networks
//! are chosen by name through [`make_encoder`] / [`make_predictor`]:
//!
//! | name       | encoder rate | predictor rate |
//! |------------|--------------|----------------|
//! | `wavegrad` | 64           | 64             |
//! | `unet`     | 256          | 256            |
//!
//! ## Components
//!
//! - [`wavegrad`] — downsampling encoder, FiLM-modulated predictor
//! - [`unet`] — residual encoder, skip-connection predictor
//! - [`time_scale`] — learned time-conditioned gate for the cascade
//! - [`cascade`] — single-stage and cascaded predictor orchestration

pub mod cascade;
pub mod layers;
pub mod time_scale;
pub mod timestep;
pub mod unet;
pub mod wavegrad;

use candle_core::Tensor;
use candle_nn::{Embedding, Module, VarBuilder};

use crate::{Error, Result};
use timestep::TimeEmbedding;

/// Maps audio to a continuous conditioning sequence.
pub trait Encoder {
    /// `audio`: [N, 1, T] → [N, cond_channels, T / downsample_rate]
    fn encode(&self, audio: &Tensor) -> Result<Tensor>;

    /// Audio samples per conditioning frame.
    fn downsample_rate(&self) -> usize;

    fn cond_channels(&self) -> usize;
}

/// Estimates the noise in a diffused waveform.
pub trait Predictor {
    /// - `xs`: noisy audio [N, 1, T]
    /// - `ts`: diffusion times [N]
    /// - `cond`: conditioning [N, D, T / downsample_rate], for code-conditioned predictors
    /// - `labels`: class labels [N] (u32), for label-conditioned predictors
    /// - `train`: enables dropout
    ///
    /// Returns the noise estimate [N, 1, T].
    fn predict(
        &self,
        xs: &Tensor,
        ts: &Tensor,
        cond: Option<&Tensor>,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor>;

    /// The audio length must be a multiple of this.
    fn downsample_rate(&self) -> usize;
}

/// Named encoder architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    WaveGrad,
    UNet,
}

impl EncoderKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "wavegrad" => Ok(Self::WaveGrad),
            "unet" => Ok(Self::UNet),
            other => Err(Error::UnknownEncoder(other.to_string())),
        }
    }
}

/// Named predictor architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorKind {
    WaveGrad,
    UNet,
}

impl PredictorKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "wavegrad" => Ok(Self::WaveGrad),
            "unet" => Ok(Self::UNet),
            other => Err(Error::UnknownPredictor(other.to_string())),
        }
    }

    pub fn downsample_rate(self) -> usize {
        match self {
            Self::WaveGrad => wavegrad::DOWNSAMPLE_RATE,
            Self::UNet => unet::DOWNSAMPLE_RATE,
        }
    }
}

/// Optional inputs a predictor is built to consume.
#[derive(Debug, Clone, Copy, Default)]
pub struct PredictorSpec {
    pub base_channels: usize,
    /// Channels of the code conditioning, `None` for unconditional stages.
    pub cond_channels: Option<usize>,
    /// Number of class labels, `None` for label-free stages.
    pub num_labels: Option<usize>,
    pub dropout: f64,
}

/// Create an encoder from a human-readable name.
pub fn make_encoder(
    name: &str,
    base_channels: usize,
    cond_channels: usize,
    vb: VarBuilder,
) -> Result<Box<dyn Encoder>> {
    Ok(match EncoderKind::from_name(name)? {
        EncoderKind::WaveGrad => Box::new(wavegrad::WaveGradEncoder::new(
            base_channels,
            cond_channels,
            vb,
        )?),
        EncoderKind::UNet => Box::new(unet::UNetEncoder::new(base_channels, cond_channels, vb)?),
    })
}

/// Create a predictor from a human-readable name.
pub fn make_predictor(name: &str, spec: PredictorSpec, vb: VarBuilder) -> Result<Box<dyn Predictor>> {
    Ok(match PredictorKind::from_name(name)? {
        PredictorKind::WaveGrad => {
            if spec.dropout > 0.0 {
                return Err(Error::Config(
                    "dropout not supported for wavegrad predictor".into(),
                ));
            }
            Box::new(wavegrad::WaveGradPredictor::new(spec, vb)?)
        }
        PredictorKind::UNet => Box::new(unet::UNetPredictor::new(spec, vb)?),
    })
}

/// Downsample rate of a named predictor, without building it.
pub fn predictor_downsample_rate(name: &str) -> Result<usize> {
    Ok(PredictorKind::from_name(name)?.downsample_rate())
}

pub fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Least common multiple; the minimum audio length divisor of two components.
pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

// ---------------------------------------------------------------------------
// Helpers shared by the predictors
// ---------------------------------------------------------------------------

/// Time embedding plus optional label embedding, summed.
#[derive(Debug, Clone)]
pub(crate) struct StepEmbedding {
    time: TimeEmbedding,
    label: Option<Embedding>,
}

/// Width of the sinusoidal time encoding fed to predictors.
const TIME_FREQ_CHANNELS: usize = 128;

impl StepEmbedding {
    pub fn new(dim: usize, num_labels: Option<usize>, vb: VarBuilder) -> Result<Self> {
        let time = TimeEmbedding::new(TIME_FREQ_CHANNELS, dim, vb.pp("time"))?;
        let label = match num_labels {
            Some(n) => Some(candle_nn::embedding(n, dim, vb.pp("label"))?),
            None => None,
        };
        Ok(Self { time, label })
    }

    pub fn forward(&self, ts: &Tensor, labels: Option<&Tensor>) -> Result<Tensor> {
        let emb = self.time.forward(ts)?;
        match (&self.label, labels) {
            (Some(table), Some(labels)) => Ok((emb + table.forward(labels)?)?),
            (Some(_), None) => Err(Error::Config(
                "label-conditioned predictor called without labels".into(),
            )),
            (None, Some(_)) => Err(Error::Config(
                "predictor without a label table called with labels".into(),
            )),
            (None, None) => Ok(emb),
        }
    }
}

/// Validate the optional conditioning against what a predictor was built for
/// and bring it to the predictor's bottleneck length `audio_len / rate`.
///
/// The conditioning may come from an encoder with a different downsample
/// rate; any length that relates to the bottleneck by an integer factor is
/// accepted.
pub(crate) fn check_cond(
    cond: Option<&Tensor>,
    expected_channels: Option<usize>,
    audio_len: usize,
    rate: usize,
) -> Result<Option<Tensor>> {
    match (cond, expected_channels) {
        (Some(cond), Some(channels)) => {
            let (_, c, t) = cond.dims3()?;
            let target = audio_len / rate;
            let compatible = t > 0
                && target > 0
                && audio_len % t == 0
                && (t % target == 0 || target % t == 0);
            if c != channels || !compatible {
                return Err(Error::Shape(format!(
                    "conditioning [_, {c}, {t}] does not fit [_, {channels}, _] for audio length {audio_len}"
                )));
            }
            Ok(Some(layers::match_length(cond, target)?))
        }
        (None, Some(_)) => Err(Error::Config(
            "code-conditioned predictor called without conditioning".into(),
        )),
        (Some(_), None) => Err(Error::Config(
            "unconditional predictor called with conditioning".into(),
        )),
        (None, None) => Ok(None),
    }
}

/// Check that `audio` is [N, 1, T] with `T` divisible by `rate`.
pub(crate) fn check_audio(audio: &Tensor, rate: usize) -> Result<usize> {
    let (_, c, t) = audio.dims3()?;
    if c != 1 {
        return Err(Error::Shape(format!("expected mono audio, got {c} channels")));
    }
    if t % rate != 0 {
        return Err(Error::Shape(format!(
            "audio length {t} is not divisible by downsample rate {rate}"
        )));
    }
    Ok(t)
}

/// Channel width at resampling level `level`, doubling up to 8× the base.
pub(crate) fn level_channels(base: usize, level: usize) -> usize {
    base * (1 << level.min(3))
}
