//! Seeded random tensors.
//!
//! Candle's CPU backend draws from a thread-local RNG that cannot be seeded,
//! so every random tensor in training and sampling is generated on the host
//! from a caller-supplied [`rand::Rng`] (usually `ChaCha8Rng`) and then
//! moved to the target device.

use candle_core::{Device, Shape, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::Result;

/// Standard-normal f32 tensor of the given shape.
pub fn gaussian<S: Into<Shape>, R: Rng + ?Sized>(
    shape: S,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Standard-normal tensor with the same shape and device as `like`.
pub fn gaussian_like<R: Rng + ?Sized>(like: &Tensor, rng: &mut R) -> Result<Tensor> {
    gaussian(like.shape().clone(), like.device(), rng)?
        .to_dtype(like.dtype())
        .map_err(Into::into)
}

/// Uniform f32 samples in `[0, 1)`, shape `[n]`.
pub fn uniform<R: Rng + ?Sized>(n: usize, device: &Device, rng: &mut R) -> Result<Tensor> {
    let data: Vec<f32> = (0..n).map(|_| rng.random::<f32>()).collect();
    Ok(Tensor::from_vec(data, n, device)?)
}
