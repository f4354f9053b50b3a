//! UNet-style encoder and predictor (downsample rate 256).
//!
//! Four resampling levels with residual blocks. The predictor carries skip
//! connections from each downsampling level to the matching upsampling level
//! and injects the time/label embedding into every residual block.

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, VarBuilder};

use super::layers::{Downsample, ResBlock, Upsample, conv1x1, conv3};
use super::{
    Encoder, Predictor, PredictorSpec, StepEmbedding, check_audio, check_cond, level_channels,
};
use crate::Result;

const FACTORS: [usize; 4] = [4, 4, 4, 4];

/// Product of [`FACTORS`].
pub const DOWNSAMPLE_RATE: usize = 256;

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UNetEncoder {
    conv_in: Conv1d,
    levels: Vec<(ResBlock, Downsample)>,
    mid: ResBlock,
    conv_out: Conv1d,
    cond_channels: usize,
}

impl UNetEncoder {
    pub fn new(base_channels: usize, cond_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv_in = conv3(1, base_channels, vb.pp("conv_in"))?;
        let mut levels = Vec::with_capacity(FACTORS.len());
        for (i, &factor) in FACTORS.iter().enumerate() {
            let in_c = level_channels(base_channels, i);
            let out_c = level_channels(base_channels, i + 1);
            let vb = vb.pp(format!("levels.{i}"));
            levels.push((
                ResBlock::new(in_c, None, 0.0, vb.pp("block"))?,
                Downsample::new(in_c, out_c, factor, vb.pp("down"))?,
            ));
        }
        let top = level_channels(base_channels, FACTORS.len());
        Ok(Self {
            conv_in,
            levels,
            mid: ResBlock::new(top, None, 0.0, vb.pp("mid"))?,
            conv_out: conv1x1(top, cond_channels, vb.pp("conv_out"))?,
            cond_channels,
        })
    }
}

impl Encoder for UNetEncoder {
    fn encode(&self, audio: &Tensor) -> Result<Tensor> {
        check_audio(audio, DOWNSAMPLE_RATE)?;
        let mut h = audio.apply(&self.conv_in)?;
        for (block, down) in &self.levels {
            h = down.forward(&block.forward(&h, None, false)?)?;
        }
        let h = self.mid.forward(&h, None, false)?;
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
struct UpLevel {
    up: Upsample,
    merge: Conv1d,
    block: ResBlock,
}

#[derive(Debug, Clone)]
pub struct UNetPredictor {
    conv_in: Conv1d,
    embedding: StepEmbedding,
    downs: Vec<(ResBlock, Downsample)>,
    cond_proj: Option<Conv1d>,
    mid: ResBlock,
    ups: Vec<UpLevel>,
    conv_out: Conv1d,
    cond_channels: Option<usize>,
}

impl UNetPredictor {
    pub fn new(spec: PredictorSpec, vb: VarBuilder) -> Result<Self> {
        let base = spec.base_channels;
        let levels = FACTORS.len();
        let top = level_channels(base, levels);
        let emb_dim = base * 4;
        let dropout = spec.dropout as f32;

        let conv_in = conv3(1, base, vb.pp("conv_in"))?;
        let embedding = StepEmbedding::new(emb_dim, spec.num_labels, vb.pp("embedding"))?;

        let mut downs = Vec::with_capacity(levels);
        for (i, &factor) in FACTORS.iter().enumerate() {
            let in_c = level_channels(base, i);
            let out_c = level_channels(base, i + 1);
            let vb = vb.pp(format!("downs.{i}"));
            downs.push((
                ResBlock::new(in_c, Some(emb_dim), dropout, vb.pp("block"))?,
                Downsample::new(in_c, out_c, factor, vb.pp("resample"))?,
            ));
        }

        let cond_proj = match spec.cond_channels {
            Some(c) => Some(conv1x1(c, top, vb.pp("cond_proj"))?),
            None => None,
        };
        let mid = ResBlock::new(top, Some(emb_dim), dropout, vb.pp("mid"))?;

        let mut ups = Vec::with_capacity(levels);
        for i in (0..levels).rev() {
            let in_c = level_channels(base, i + 1);
            let out_c = level_channels(base, i);
            let vb = vb.pp(format!("ups.{i}"));
            ups.push(UpLevel {
                up: Upsample::new(in_c, out_c, FACTORS[i], vb.pp("resample"))?,
                merge: conv1x1(out_c * 2, out_c, vb.pp("merge"))?,
                block: ResBlock::new(out_c, Some(emb_dim), dropout, vb.pp("block"))?,
            });
        }

        Ok(Self {
            conv_in,
            embedding,
            downs,
            cond_proj,
            mid,
            ups,
            conv_out: conv3(base, 1, vb.pp("conv_out"))?,
            cond_channels: spec.cond_channels,
        })
    }
}

impl Predictor for UNetPredictor {
    fn predict(
        &self,
        xs: &Tensor,
        ts: &Tensor,
        cond: Option<&Tensor>,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let len = check_audio(xs, DOWNSAMPLE_RATE)?;
        let cond = check_cond(cond, self.cond_channels, len, DOWNSAMPLE_RATE)?;
        let emb = self.embedding.forward(ts, labels)?;

        let mut h = xs.apply(&self.conv_in)?;
        let mut skips = Vec::with_capacity(self.downs.len());
        for (block, down) in &self.downs {
            h = block.forward(&h, Some(&emb), train)?;
            skips.push(h.clone());
            h = down.forward(&h)?;
        }

        if let (Some(proj), Some(cond)) = (&self.cond_proj, &cond) {
            h = (h + cond.apply(proj)?)?;
        }
        h = self.mid.forward(&h, Some(&emb), train)?;

        for (level, skip) in self.ups.iter().zip(skips.iter().rev()) {
            h = level.up.forward(&h)?;
            h = Tensor::cat(&[&h, skip], 1)?.apply(&level.merge)?;
            h = level.block.forward(&h, Some(&emb), train)?;
        }
        Ok(h.gelu()?.apply(&self.conv_out)?)
    }

    fn downsample_rate(&self) -> usize {
        DOWNSAMPLE_RATE
    }
}
