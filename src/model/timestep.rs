//! Sinusoidal time embedding for diffusion conditioning.
//!
//! Converts continuous diffusion times `t ∈ [0, 1]` to embeddings:
//! sinusoidal encoding of `1000 t` → Linear → SiLU → Linear.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{self as nn, Module, VarBuilder};

/// Time embedding module: `[B]` times → `[B, out_dim]`.
#[derive(Debug, Clone)]
pub struct TimeEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    in_channels: usize,
    scale: f64,
}

impl TimeEmbedding {
    /// - `in_channels`: dimension of the sinusoidal encoding (even)
    /// - `out_dim`: output dimension
    pub fn new(in_channels: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear_1 = nn::linear(in_channels, out_dim, vb.pp("linear_1"))?;
        let linear_2 = nn::linear(out_dim, out_dim, vb.pp("linear_2"))?;
        Ok(Self {
            linear_1,
            linear_2,
            in_channels,
            scale: 1000.0,
        })
    }

    /// `t`: [B] → [B, in_channels] as `cat[cos(t·f), sin(t·f)]`.
    fn sinusoidal(&self, t: &Tensor, dev: &Device) -> Result<Tensor> {
        let t = (t.to_dtype(DType::F32)? * self.scale)?;
        let half = self.in_channels / 2;
        let max_period: f64 = 10000.0;

        let freqs: Vec<f32> = (0..half)
            .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
            .collect();
        let freqs = Tensor::new(freqs.as_slice(), dev)?;

        let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
        Tensor::cat(&[&args.cos()?, &args.sin()?], 1)
    }

    pub fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let dtype = self.linear_1.weight().dtype();
        let emb = self.sinusoidal(t, t.device())?.to_dtype(dtype)?;
        self.linear_2.forward(&self.linear_1.forward(&emb)?.silu()?)
    }
}
