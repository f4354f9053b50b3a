//! WaveGrad-style encoder and predictor (downsample rate 64).
//!
//! The predictor runs a downsampling path over the noisy audio and an
//! upsampling path from the bottleneck back to waveform resolution. Each
//! upsampling level is FiLM-modulated by the matching downsampling feature
//! map, as in WaveGrad. Code conditioning, time and label embeddings enter
//! at the bottleneck.

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, VarBuilder};

use super::layers::{Downsample, Film, ResBlock, Upsample, add_channel_bias, conv1x1, conv3};
use super::{
    Encoder, Predictor, PredictorSpec, StepEmbedding, check_audio, check_cond, level_channels,
};
use crate::Result;

/// Resampling factor per level.
const FACTORS: [usize; 3] = [4, 4, 4];

/// Product of [`FACTORS`].
pub const DOWNSAMPLE_RATE: usize = 64;

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WaveGradEncoder {
    conv_in: Conv1d,
    downs: Vec<Downsample>,
    blocks: Vec<ResBlock>,
    conv_out: Conv1d,
    cond_channels: usize,
}

impl WaveGradEncoder {
    pub fn new(base_channels: usize, cond_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv_in = conv3(1, base_channels, vb.pp("conv_in"))?;
        let mut downs = Vec::with_capacity(FACTORS.len());
        let mut blocks = Vec::with_capacity(FACTORS.len());
        for (i, &factor) in FACTORS.iter().enumerate() {
            let in_c = level_channels(base_channels, i);
            let out_c = level_channels(base_channels, i + 1);
            downs.push(Downsample::new(in_c, out_c, factor, vb.pp(format!("downs.{i}")))?);
            blocks.push(ResBlock::new(out_c, None, 0.0, vb.pp(format!("blocks.{i}")))?);
        }
        let top = level_channels(base_channels, FACTORS.len());
        let conv_out = conv1x1(top, cond_channels, vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            downs,
            blocks,
            conv_out,
            cond_channels,
        })
    }
}

impl Encoder for WaveGradEncoder {
    fn encode(&self, audio: &Tensor) -> Result<Tensor> {
        check_audio(audio, DOWNSAMPLE_RATE)?;
        let mut h = audio.apply(&self.conv_in)?;
        for (down, block) in self.downs.iter().zip(&self.blocks) {
            h = block.forward(&down.forward(&h)?, None, false)?;
        }
        Ok(h.gelu()?.apply(&self.conv_out)?)
    }

    fn downsample_rate(&self) -> usize {
        DOWNSAMPLE_RATE
    }

    fn cond_channels(&self) -> usize {
        self.cond_channels
    }
}

// ---------------------------------------------------------------------------
// Predictor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WaveGradPredictor {
    conv_in: Conv1d,
    downs: Vec<(Downsample, Conv1d)>,
    embedding: StepEmbedding,
    emb_proj: candle_nn::Linear,
    cond_proj: Option<Conv1d>,
    ups: Vec<(Upsample, Film, Conv1d)>,
    conv_out: Conv1d,
    cond_channels: Option<usize>,
}

impl WaveGradPredictor {
    pub fn new(spec: PredictorSpec, vb: VarBuilder) -> Result<Self> {
        let base = spec.base_channels;
        let levels = FACTORS.len();
        let top = level_channels(base, levels);
        let emb_dim = base * 4;

        let conv_in = conv3(1, base, vb.pp("conv_in"))?;
        let mut downs = Vec::with_capacity(levels);
        for (i, &factor) in FACTORS.iter().enumerate() {
            let in_c = level_channels(base, i);
            let out_c = level_channels(base, i + 1);
            let vb = vb.pp(format!("downs.{i}"));
            downs.push((
                Downsample::new(in_c, out_c, factor, vb.pp("resample"))?,
                conv3(out_c, out_c, vb.pp("conv"))?,
            ));
        }

        let embedding = StepEmbedding::new(emb_dim, spec.num_labels, vb.pp("embedding"))?;
        let emb_proj = candle_nn::linear(emb_dim, top, vb.pp("emb_proj"))?;
        let cond_proj = match spec.cond_channels {
            Some(c) => Some(conv1x1(c, top, vb.pp("cond_proj"))?),
            None => None,
        };

        // Upsampling levels run from the bottleneck back to full resolution.
        let mut ups = Vec::with_capacity(levels);
        for i in (0..levels).rev() {
            let in_c = level_channels(base, i + 1);
            let out_c = level_channels(base, i);
            let vb = vb.pp(format!("ups.{i}"));
            ups.push((
                Upsample::new(in_c, out_c, FACTORS[i], vb.pp("resample"))?,
                Film::new(out_c, out_c, vb.pp("film"))?,
                conv3(out_c, out_c, vb.pp("conv"))?,
            ));
        }
        let conv_out = conv3(base, 1, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            downs,
            embedding,
            emb_proj,
            cond_proj,
            ups,
            conv_out,
            cond_channels: spec.cond_channels,
        })
    }
}

impl Predictor for WaveGradPredictor {
    fn predict(
        &self,
        xs: &Tensor,
        ts: &Tensor,
        cond: Option<&Tensor>,
        labels: Option<&Tensor>,
        _train: bool,
    ) -> Result<Tensor> {
        let len = check_audio(xs, DOWNSAMPLE_RATE)?;
        let cond = check_cond(cond, self.cond_channels, len, DOWNSAMPLE_RATE)?;

        // Downsampling path; keep every resolution for FiLM.
        let mut h = xs.apply(&self.conv_in)?;
        let mut features = vec![h.clone()];
        for (down, conv) in &self.downs {
            h = down.forward(&h)?.apply(conv)?.gelu()?;
            features.push(h.clone());
        }

        let emb = self.embedding.forward(ts, labels)?;
        let mut z = add_channel_bias(&h, &emb.silu()?.apply(&self.emb_proj)?)?;
        if let (Some(proj), Some(cond)) = (&self.cond_proj, &cond) {
            z = (z + cond.apply(proj)?)?;
        }

        for ((up, film, conv), skip) in self.ups.iter().zip(features.iter().rev().skip(1)) {
            z = up.forward(&z)?;
            z = film.forward(&z, skip)?.gelu()?;
            z = z.apply(conv)?.gelu()?;
        }
        Ok(z.apply(&self.conv_out)?)
    }

    fn downsample_rate(&self) -> usize {
        DOWNSAMPLE_RATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_rate_matches_factors() {
        assert_eq!(FACTORS.iter().product::<usize>(), DOWNSAMPLE_RATE);
    }

    #[test]
    fn test_encoder_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let encoder = WaveGradEncoder::new(4, 16, vb).unwrap();
        let audio = Tensor::randn(0f32, 1.0, (2, 1, 256), &dev).unwrap();
        assert_eq!(encoder.encode(&audio).unwrap().dims(), &[2, 16, 4]);
    }

    #[test]
    fn test_predictor_shapes_and_conditioning_contract() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let spec = PredictorSpec {
            base_channels: 4,
            cond_channels: Some(16),
            num_labels: Some(3),
            dropout: 0.0,
        };
        let predictor = WaveGradPredictor::new(spec, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 1, 128), &dev).unwrap();
        let ts = Tensor::new(&[0.2f32, 0.7], &dev).unwrap();
        let cond = Tensor::randn(0f32, 1.0, (2, 16, 2), &dev).unwrap();
        let labels = Tensor::new(&[0u32, 2], &dev).unwrap();

        let eps = predictor
            .predict(&xs, &ts, Some(&cond), Some(&labels), false)
            .unwrap();
        assert_eq!(eps.dims(), &[2, 1, 128]);

        // Missing conditioning and an incompatible length are rejected.
        assert!(predictor.predict(&xs, &ts, None, Some(&labels), false).is_err());
        let short = Tensor::randn(0f32, 1.0, (2, 16, 3), &dev).unwrap();
        assert!(
            predictor
                .predict(&xs, &ts, Some(&short), Some(&labels), false)
                .is_err()
        );
    }
}
