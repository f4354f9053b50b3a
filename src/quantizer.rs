//! Vector quantization bottleneck.
//!
//! Maps each position of a `[N, D, T1]` conditioning sequence to its nearest
//! codebook vector. Three views of the result are returned:
//!
//! - `idxs` — the discrete codes `[N, T1]`
//! - `embedded` — gathered codebook vectors; gradient reaches the codebook only
//! - `passthrough` — forward value of `embedded`, identity gradient back to the
//!   input (straight-through estimator)

pub mod loss;

use candle_core::{D, DType, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::{Error, Result};

pub use loss::VqLoss;

/// The three views produced by [`VectorQuantizer::quantize`].
#[derive(Debug, Clone)]
pub struct VqOutput {
    /// Code indices [N, T1], u32.
    pub idxs: Tensor,
    /// Codebook vectors [N, D, T1], detached from the input.
    pub embedded: Tensor,
    /// Same values as `embedded`, gradient routed to the input.
    pub passthrough: Tensor,
}

/// Nearest-neighbour quantizer over a learned codebook.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    /// [K, D]
    codebook: Tensor,
    codebook_size: usize,
    dim: usize,
}

impl VectorQuantizer {
    pub fn new(codebook_size: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let codebook = vb.get_with_hints(
            (codebook_size, dim),
            "codebook",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Self::from_codebook(codebook)
    }

    /// Wrap an existing [K, D] codebook tensor.
    pub fn from_codebook(codebook: Tensor) -> Result<Self> {
        let (codebook_size, dim) = codebook.dims2()?;
        Ok(Self {
            codebook,
            codebook_size,
            dim,
        })
    }

    pub fn codebook(&self) -> &Tensor {
        &self.codebook
    }

    pub fn codebook_size(&self) -> usize {
        self.codebook_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Quantize a [N, D, T1] sequence.
    pub fn quantize(&self, xs: &Tensor) -> Result<VqOutput> {
        let (b, d, t) = xs.dims3()?;
        if d != self.dim {
            return Err(Error::Shape(format!(
                "expected {} channels for quantization, got {d}",
                self.dim
            )));
        }

        // [N*T1, D], nearest neighbour search runs without gradient tracking.
        let flat = xs.detach().transpose(1, 2)?.reshape((b * t, d))?;
        let codebook = self.codebook.detach();

        // ||x - c||² = ||x||² + ||c||² - 2 x·c
        let x_sq = flat.sqr()?.sum_keepdim(D::Minus1)?;
        let c_sq = codebook.sqr()?.sum(D::Minus1)?.unsqueeze(0)?;
        let xc = flat.matmul(&codebook.t()?)?;
        let distances = x_sq.broadcast_add(&c_sq)?.broadcast_sub(&(xc * 2.0)?)?;

        // First minimum wins, so ties resolve to the lowest index.
        let idxs = distances.argmin(D::Minus1)?.to_dtype(DType::U32)?;
        let embedded = self.gather(&idxs, b, t)?;
        let idxs = idxs.reshape((b, t))?;

        // Forward value is exactly `embedded`; the gradient flows to `xs` unchanged.
        let passthrough = ((xs - xs.detach())? + embedded.detach())?;

        Ok(VqOutput {
            idxs,
            embedded,
            passthrough,
        })
    }

    /// Look up codebook vectors for [N, T1] codes, returning [N, D, T1].
    pub fn embed(&self, idxs: &Tensor) -> Result<Tensor> {
        let (b, t) = idxs.dims2()?;
        let idxs = idxs.flatten_all()?.to_dtype(DType::U32)?;
        if idxs.elem_count() > 0 {
            let max = idxs.max(0)?.to_scalar::<u32>()?;
            if max as usize >= self.codebook_size {
                return Err(Error::CodeOutOfRange {
                    index: max,
                    codebook_size: self.codebook_size,
                });
            }
        }
        self.gather(&idxs, b, t)
    }

    fn gather(&self, flat_idxs: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        Ok(self
            .codebook
            .index_select(flat_idxs, 0)?
            .reshape((b, t, self.dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Histogram of code usage, length K.
    ///
    /// Codes that never appear over a few batches are dead entries that the
    /// encoder has stopped committing to.
    pub fn code_usage(&self, idxs: &Tensor) -> Result<Vec<u32>> {
        let mut counts = vec![0u32; self.codebook_size];
        for idx in idxs.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()? {
            let slot = counts
                .get_mut(idx as usize)
                .ok_or(Error::CodeOutOfRange {
                    index: idx,
                    codebook_size: self.codebook_size,
                })?;
            *slot += 1;
        }
        Ok(counts)
    }
}
