//! Codebook and commitment losses.
//!
//! ```text
//! loss = mse(sg(e), q) + commitment * mse(e, sg(q))
//! ```
//! where `e` is the continuous encoder output, `q` the gathered codebook
//! vectors and `sg` a stop-gradient.

use candle_core::Tensor;

use crate::Result;

#[derive(Debug, Clone, Copy)]
pub struct VqLoss {
    pub commitment: f64,
}

impl Default for VqLoss {
    fn default() -> Self {
        Self { commitment: 0.25 }
    }
}

impl VqLoss {
    pub fn new(commitment: f64) -> Self {
        Self { commitment }
    }

    /// Scalar loss for encoder output `encoded` and its quantization `embedded`.
    pub fn loss(&self, encoded: &Tensor, embedded: &Tensor) -> Result<Tensor> {
        let codebook = (encoded.detach() - embedded)?.sqr()?.mean_all()?;
        let commit = (encoded - embedded.detach())?.sqr()?.mean_all()?;
        Ok((codebook + (commit * self.commitment)?)?)
    }
}
