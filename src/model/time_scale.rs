//! Learned, time-conditioned multiplicative gate.
//!
//! ```text
//! gate(t) = exp(clamp(scale * Linear(GELU(emb(t))), ±LOG_GATE_LIMIT))
//! ```
//! The linear weight starts at zero and its bias at `ln(initial) / scale`, so
//! a fresh gate is exactly `initial` for every `t`.

use candle_core::{Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder};

use super::timestep::TimeEmbedding;
use crate::Result;

/// Bound on the log of the gate.
pub const LOG_GATE_LIMIT: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeScaleConfig {
    pub channels: usize,
    pub initial: f64,
    pub scale: f64,
}

impl Default for TimeScaleConfig {
    fn default() -> Self {
        Self {
            channels: 256,
            initial: 0.05,
            scale: 3.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeScale {
    time_emb: TimeEmbedding,
    out: Linear,
    scale: f64,
}

impl TimeScale {
    pub fn new(cfg: TimeScaleConfig, vb: VarBuilder) -> Result<Self> {
        let time_emb = TimeEmbedding::new(cfg.channels, cfg.channels, vb.pp("time_emb"))?;
        let vb = vb.pp("out");
        let weight = vb.get_with_hints((1, cfg.channels), "weight", Init::Const(0.0))?;
        let bias = vb.get_with_hints(1, "bias", Init::Const(cfg.initial.ln() / cfg.scale))?;
        Ok(Self {
            time_emb,
            out: Linear::new(weight, Some(bias)),
            scale: cfg.scale,
        })
    }

    /// Gate values [N] for times `ts` [N].
    pub fn gate(&self, ts: &Tensor) -> Result<Tensor> {
        let logits = self.out.forward(&self.time_emb.forward(ts)?.gelu()?)?;
        let log_gate = (logits.squeeze(D::Minus1)? * self.scale)?
            .clamp(-LOG_GATE_LIMIT, LOG_GATE_LIMIT)?;
        Ok(log_gate.exp()?)
    }

    /// Scale each row of `xs` [N, ...] by its gate.
    pub fn forward(&self, xs: &Tensor, ts: &Tensor) -> Result<Tensor> {
        let mut shape = vec![1usize; xs.rank()];
        shape[0] = xs.dim(0)?;
        let gate = self.gate(ts)?.reshape(shape)?;
        Ok(xs.broadcast_mul(&gate)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn time_scale(cfg: TimeScaleConfig) -> (VarMap, TimeScale) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ts = TimeScale::new(cfg, vb.pp("scale")).unwrap();
        (varmap, ts)
    }

    #[test]
    fn test_initial_gate_is_constant() {
        let (_varmap, scale) = time_scale(TimeScaleConfig::default());
        let ts = Tensor::new(&[0.0f32, 0.3, 0.99], &Device::Cpu).unwrap();
        for g in scale.gate(&ts).unwrap().to_vec1::<f32>().unwrap() {
            assert!((g - 0.05).abs() < 1e-6, "gate = {g}");
        }
    }

    #[test]
    fn test_forward_broadcasts_per_row() {
        let (_varmap, scale) = time_scale(TimeScaleConfig {
            channels: 16,
            initial: 0.5,
            scale: 2.0,
        });
        let dev = Device::Cpu;
        let xs = Tensor::ones((2, 1, 4), DType::F32, &dev).unwrap();
        let ts = Tensor::new(&[0.1f32, 0.8], &dev).unwrap();
        let ys = scale.forward(&xs, &ts).unwrap();
        assert_eq!(ys.dims(), &[2, 1, 4]);
        for row in ys.to_vec3::<f32>().unwrap() {
            assert!(row[0].iter().all(|&v| (v - 0.5).abs() < 1e-6));
        }
    }

    #[test]
    fn test_gate_is_trainable() {
        let (varmap, scale) = time_scale(TimeScaleConfig {
            channels: 8,
            ..Default::default()
        });
        let dev = Device::Cpu;
        let xs = Tensor::ones((1, 1, 4), DType::F32, &dev).unwrap();
        let ts = Tensor::new(&[0.4f32], &dev).unwrap();
        let loss = scale.forward(&xs, &ts).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let data = varmap.data().lock().unwrap();
        let bias = data.get("scale.out.bias").unwrap();
        assert!(grads.get(bias.as_tensor()).is_some());
    }
}
