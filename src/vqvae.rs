//! Class-conditional waveform VQ-VAE.
//!
//! ```text
//! audio ─→ encoder ─→ quantizer ─→ codes
//!                         │
//!                         └─ passthrough ─→ predictor stages ─→ ε̂
//! ```
//!
//! Training minimizes `vq_loss + mse`, where `mse` averages the noise
//! prediction error of every predictor stage. Decoding embeds codes and runs
//! the reverse diffusion with the final stage's prediction, under any label.

use std::path::Path;

use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::Rng;

use crate::checkpoint;
use crate::config::{OrchestratorKind, VqVaeConfig};
use crate::diffusion::{Diffusion, SampleOptions};
use crate::model::cascade::{Cascade, Stage, Stages};
use crate::model::time_scale::{TimeScale, TimeScaleConfig};
use crate::model::{self, Encoder, PredictorSpec};
use crate::noise;
use crate::quantizer::{VectorQuantizer, VqLoss};
use crate::{Error, Result};

/// Training losses for one batch.
#[derive(Debug, Clone)]
pub struct Losses {
    /// Scalar quantization loss.
    pub vq_loss: Tensor,
    /// Scalar mean of `mses`.
    pub mse: Tensor,
    /// Diffusion times drawn for each row, [N].
    pub ts: Tensor,
    /// Per-row MSE averaged over stages, [N].
    pub mses: Tensor,
    /// Per-row MSE of each stage, [N] each.
    pub stage_mses: Vec<(Stage, Tensor)>,
}

impl Losses {
    /// `vq_loss + mse`, the quantity to minimize.
    pub fn total(&self) -> Result<Tensor> {
        Ok((&self.vq_loss + &self.mse)?)
    }

    pub fn stage_mse(&self, stage: Stage) -> Option<&Tensor> {
        self.stage_mses
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, t)| t)
    }
}

pub struct VqVae {
    config: VqVaeConfig,
    varmap: VarMap,
    device: Device,
    encoder: Box<dyn Encoder>,
    vq: VectorQuantizer,
    vq_loss: VqLoss,
    diffusion: Diffusion,
    stages: Stages,
}

impl VqVae {
    /// Build a freshly initialized model.
    pub fn new(config: VqVaeConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let encoder = model::make_encoder(
            &config.encoder,
            config.base_channels,
            config.cond_channels(),
            vb.pp("encoder"),
        )?;
        // The codebook and the conditioned predictor follow the encoder's width.
        let cond_channels = encoder.cond_channels();
        let vq = VectorQuantizer::new(config.codebook_size, cond_channels, vb.pp("vq"))?;
        let diffusion = Diffusion::new(config.schedule_kind()?.build());

        let spec = PredictorSpec {
            base_channels: config.base_channels,
            cond_channels: None,
            num_labels: None,
            dropout: config.dropout,
        };
        let cond_spec = PredictorSpec {
            cond_channels: Some(cond_channels),
            num_labels: Some(config.num_labels),
            ..spec
        };
        let cond = model::make_predictor(&config.predictor, cond_spec, vb.pp("cond_predictor"))?;

        let stages = match config.orchestrator_kind()? {
            OrchestratorKind::Single => Stages::Single { cond },
            OrchestratorKind::Cascade => {
                let base = model::make_predictor(&config.predictor, spec, vb.pp("base_predictor"))?;
                let label_spec = PredictorSpec {
                    num_labels: Some(config.num_labels),
                    ..spec
                };
                let label =
                    model::make_predictor(&config.predictor, label_spec, vb.pp("label_predictor"))?;
                let scale_cfg = TimeScaleConfig {
                    channels: config.time_scale_channels,
                    initial: config.time_scale_initial,
                    scale: config.time_scale_scale,
                };
                Stages::Cascade(Cascade::new(
                    base,
                    label,
                    cond,
                    TimeScale::new(scale_cfg, vb.pp("scale_label"))?,
                    TimeScale::new(scale_cfg, vb.pp("scale_cond"))?,
                ))
            }
        };

        tracing::debug!(
            orchestrator = %config.orchestrator,
            encoder = %config.encoder,
            predictor = %config.predictor,
            schedule = %config.schedule,
            num_labels = config.num_labels,
            tensors = varmap.all_vars().len(),
            "built vq-vae"
        );

        Ok(Self {
            vq_loss: VqLoss::new(config.commitment),
            config,
            varmap,
            device: device.clone(),
            encoder,
            vq,
            diffusion,
            stages,
        })
    }

    /// Restore a model saved with [`VqVae::save`].
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        checkpoint::load(path.as_ref(), device)
    }

    /// Atomically write parameters and configuration to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::save(self, path.as_ref())
    }

    pub fn config(&self) -> &VqVaeConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Every trainable variable, for an optimizer.
    pub fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_labels(&self) -> usize {
        self.config.num_labels
    }

    pub fn quantizer(&self) -> &VectorQuantizer {
        &self.vq
    }

    pub fn diffusion(&self) -> &Diffusion {
        &self.diffusion
    }

    /// Fail unless this model was built for `expected` labels.
    pub fn ensure_num_labels(&self, expected: usize) -> Result<()> {
        if self.config.num_labels != expected {
            return Err(Error::LabelMismatch {
                expected,
                found: self.config.num_labels,
            });
        }
        Ok(())
    }

    /// Audio samples per latent code; every audio length must be a multiple.
    pub fn downsample_rate(&self) -> usize {
        model::lcm(self.encoder.downsample_rate(), self.stages.downsample_rate())
    }

    /// Compute training losses for a batch of `audio` [N, 1, T] with
    /// `labels` [N].
    pub fn losses<R: Rng + ?Sized>(
        &self,
        audio: &Tensor,
        labels: &Tensor,
        rng: &mut R,
    ) -> Result<Losses> {
        let n = self.check_audio(audio)?;
        let labels = self.check_labels(labels, n)?;

        let encoded = self.run_encoder(audio)?;
        let vq_out = self.vq.quantize(&encoded)?;
        let vq_loss = self.vq_loss.loss(&encoded, &vq_out.embedded)?;

        let ts = noise::uniform(n, audio.device(), rng)?.to_dtype(audio.dtype())?;
        let epsilon = noise::gaussian_like(audio, rng)?;
        let noised = self.diffusion.sample_q(audio, &ts, Some(&epsilon), rng)?;

        let predictions = self
            .stages
            .predictions(&noised, &ts, &vq_out.passthrough, &labels, true)?;
        let stage_mses = predictions
            .iter()
            .map(|(stage, pred)| Ok((stage, row_mse(pred, &epsilon)?)))
            .collect::<Result<Vec<_>>>()?;

        let per_stage: Vec<&Tensor> = stage_mses.iter().map(|(_, m)| m).collect();
        let mses = Tensor::stack(&per_stage, 0)?.mean(0)?;
        let mse = mses.mean_all()?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let vq: f32 = vq_loss.to_dtype(DType::F32)?.to_scalar()?;
            let total: f32 = mse.to_dtype(DType::F32)?.to_scalar()?;
            tracing::debug!(vq_loss = vq, mse = total, "losses");
        }

        Ok(Losses {
            vq_loss,
            mse,
            ts,
            mses,
            stage_mses,
        })
    }

    /// Encode `audio` [N, 1, T] to codes [N, T / rate] (u32).
    pub fn encode(&self, audio: &Tensor) -> Result<Tensor> {
        self.check_audio(audio)?;
        let encoded = self.run_encoder(&audio.detach())?.detach();
        Ok(self.vq.quantize(&encoded)?.idxs)
    }

    /// Sample audio [N, 1, T1 · rate] from codes [N, T1] under `labels` [N].
    pub fn decode<R: Rng + ?Sized>(
        &self,
        codes: &Tensor,
        labels: &Tensor,
        options: &SampleOptions,
        rng: &mut R,
    ) -> Result<Tensor> {
        let (n, frames) = codes.dims2()?;
        let labels = self.check_labels(labels, n)?;
        let cond = self.vq.embed(codes)?.detach();

        // Codes map to audio at the encoder's rate.
        let len = frames * self.encoder.downsample_rate();
        let rate = self.downsample_rate();
        if len % rate != 0 {
            return Err(Error::Shape(format!(
                "{frames} codes give {len} samples, not a multiple of {rate}"
            )));
        }

        let x_t = noise::gaussian((n, 1, len), &self.device, rng)?;
        tracing::debug!(batch = n, samples = len, steps = options.steps, "decoding");
        self.diffusion.ddpm_sample(
            &x_t,
            |xs, ts| {
                let eps = self
                    .stages
                    .predictions(xs, ts, &cond, &labels, false)?
                    .into_output()?;
                Ok(eps.detach())
            },
            options,
            rng,
        )
    }

    /// Encode and check the output against the encoder's declared contract.
    fn run_encoder(&self, audio: &Tensor) -> Result<Tensor> {
        let encoded = self.encoder.encode(audio)?;
        let (_, channels, frames) = encoded.dims3()?;
        let expected = audio.dim(2)? / self.encoder.downsample_rate();
        if channels != self.vq.dim() || frames != expected {
            return Err(Error::Config(format!(
                "encoder produced [_, {channels}, {frames}], expected [_, {}, {expected}]",
                self.vq.dim()
            )));
        }
        Ok(encoded)
    }

    fn check_audio(&self, audio: &Tensor) -> Result<usize> {
        let (n, c, t) = audio.dims3()?;
        if c != 1 {
            return Err(Error::Shape(format!("expected mono audio, got {c} channels")));
        }
        let rate = self.downsample_rate();
        if t % rate != 0 {
            return Err(Error::Shape(format!(
                "audio length {t} is not a multiple of downsample rate {rate}"
            )));
        }
        Ok(n)
    }

    fn check_labels(&self, labels: &Tensor, n: usize) -> Result<Tensor> {
        let labels = labels.to_dtype(DType::U32)?;
        let count = labels.dims1()?;
        if count != n {
            return Err(Error::Shape(format!(
                "expected {n} labels, got {count}"
            )));
        }
        if let Some(&bad) = labels
            .to_vec1::<u32>()?
            .iter()
            .find(|&&l| l as usize >= self.config.num_labels)
        {
            return Err(Error::Shape(format!(
                "label {bad} out of range for {} labels",
                self.config.num_labels
            )));
        }
        Ok(labels)
    }
}

/// `mean((pred - target)²)` over all but the batch dimension, [N].
fn row_mse(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok((pred - target)?.sqr()?.flatten_from(1)?.mean(D::Minus1)?)
}
