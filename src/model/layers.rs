//! Shared building blocks for the reference encoders and predictors.
//!
//! Resampling uses pixel (un)shuffle: folding `factor` neighbouring samples
//! into channels (or back) followed by a 1×1 convolution. Lengths change by
//! exactly `factor`, and every op on the path has candle backprop support.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Dropout, Linear, VarBuilder};

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// [N, C, L] → [N, C·f, L/f]
pub fn pixel_unshuffle(xs: &Tensor, factor: usize) -> Result<Tensor> {
    let (n, c, l) = xs.dims3()?;
    if l % factor != 0 {
        candle_core::bail!("length {l} not divisible by downsample factor {factor}");
    }
    xs.reshape((n, c, l / factor, factor))?
        .permute((0, 1, 3, 2))?
        .reshape((n, c * factor, l / factor))
}

/// [N, C·f, L] → [N, C, L·f]
pub fn pixel_shuffle(xs: &Tensor, factor: usize) -> Result<Tensor> {
    let (n, cf, l) = xs.dims3()?;
    if cf % factor != 0 {
        candle_core::bail!("channels {cf} not divisible by upsample factor {factor}");
    }
    let c = cf / factor;
    xs.reshape((n, c, factor, l))?
        .permute((0, 1, 3, 2))?
        .reshape((n, c, l * factor))
}

/// Strided downsampling by `factor`.
#[derive(Debug, Clone)]
pub struct Downsample {
    proj: Conv1d,
    factor: usize,
}

impl Downsample {
    pub fn new(in_c: usize, out_c: usize, factor: usize, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::conv1d(in_c * factor, out_c, 1, Default::default(), vb.pp("proj"))?;
        Ok(Self { proj, factor })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        pixel_unshuffle(xs, self.factor)?.apply(&self.proj)
    }
}

/// Sub-pixel upsampling by `factor`.
#[derive(Debug, Clone)]
pub struct Upsample {
    proj: Conv1d,
    factor: usize,
}

impl Upsample {
    pub fn new(in_c: usize, out_c: usize, factor: usize, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::conv1d(in_c, out_c * factor, 1, Default::default(), vb.pp("proj"))?;
        Ok(Self { proj, factor })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        pixel_shuffle(&xs.apply(&self.proj)?, self.factor)
    }
}

/// Bring [N, C, L] to length `target` by an integer factor: average
/// pooling when shrinking, sample repetition when growing.
pub fn match_length(xs: &Tensor, target: usize) -> Result<Tensor> {
    let (n, c, l) = xs.dims3()?;
    if l == target {
        Ok(xs.clone())
    } else if target > 0 && l > target && l % target == 0 {
        xs.reshape((n, c, target, l / target))?.mean(3)
    } else if l > 0 && target > l && target % l == 0 {
        xs.unsqueeze(3)?
            .broadcast_as((n, c, l, target / l))?
            .reshape((n, c, target))
    } else {
        candle_core::bail!("cannot resample length {l} to {target}")
    }
}

/// Length-preserving convolution with kernel 3.
pub fn conv3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv1d> {
    let cfg = Conv1dConfig {
        padding: 1,
        ..Default::default()
    };
    candle_nn::conv1d(in_c, out_c, 3, cfg, vb)
}

/// Pointwise convolution.
pub fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv1d> {
    candle_nn::conv1d(in_c, out_c, 1, Default::default(), vb)
}

/// Broadcast a per-row vector [N, C] over the time axis of [N, C, L].
pub fn add_channel_bias(xs: &Tensor, bias: &Tensor) -> Result<Tensor> {
    xs.broadcast_add(&bias.unsqueeze(2)?)
}

// ---------------------------------------------------------------------------
// Residual block: GELU → Conv3 (+ emb) → GELU → Dropout → Conv3 + residual
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResBlock {
    conv1: Conv1d,
    conv2: Conv1d,
    emb_proj: Option<Linear>,
    dropout: Dropout,
}

impl ResBlock {
    /// `emb_dim`: dimension of the conditioning embedding, if any.
    pub fn new(
        channels: usize,
        emb_dim: Option<usize>,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let emb_proj = match emb_dim {
            Some(dim) => Some(candle_nn::linear(dim, channels, vb.pp("emb_proj"))?),
            None => None,
        };
        Ok(Self {
            conv1: conv3(channels, channels, vb.pp("conv1"))?,
            conv2: conv3(channels, channels, vb.pp("conv2"))?,
            emb_proj,
            dropout: Dropout::new(dropout),
        })
    }

    /// - `xs`: [N, C, L]
    /// - `emb`: [N, emb_dim], required when the block was built with `emb_dim`
    pub fn forward(&self, xs: &Tensor, emb: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut h = xs.gelu()?.apply(&self.conv1)?;
        match (&self.emb_proj, emb) {
            (Some(proj), Some(emb)) => h = add_channel_bias(&h, &emb.apply(proj)?)?,
            (Some(_), None) => candle_core::bail!("residual block expects a step embedding"),
            (None, _) => {}
        }
        let h = self.dropout.forward(&h.gelu()?, train)?.apply(&self.conv2)?;
        xs + h
    }
}

// ---------------------------------------------------------------------------
// FiLM: per-channel scale and shift predicted from a feature map
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Film {
    conv: Conv1d,
    channels: usize,
}

impl Film {
    pub fn new(in_c: usize, channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv3(in_c, channels * 2, vb.pp("conv"))?,
            channels,
        })
    }

    /// `xs * (1 + scale) + shift`, with `(scale, shift)` computed from `features`.
    pub fn forward(&self, xs: &Tensor, features: &Tensor) -> Result<Tensor> {
        let params = features.apply(&self.conv)?;
        let scale = params.narrow(1, 0, self.channels)?;
        let shift = params.narrow(1, self.channels, self.channels)?;
        (xs + (xs * scale)?)? + shift
    }
}
