//! Class-conditional waveform VQ-VAE with a diffusion decoder, in pure Rust.
//!
//! An encoder compresses mono audio into a short sequence of continuous
//! vectors, a vector quantizer snaps each vector to a learned codebook, and a
//! diffusion model reconstructs the waveform from the codes plus a class
//! label. Decoding the codes of one speaker under another speaker's label
//! swaps the voice while keeping the content.
//!
//! ## Architecture
//!
//! ```text
//! audio [N,1,T] → encoder → [N,D,T1] → quantizer → codes [N,T1]
//!                                          │
//!                          embed / passthrough
//!                                          ↓
//! noise [N,1,T] → predictor stages (base → label → cond) → ε̂ → DDPM → audio
//! ```
//!
//! ## Modules
//!
//! - [`vqvae`] — orchestrator: losses, encode, decode
//! - [`quantizer`] — nearest-codebook quantization and its loss
//! - [`diffusion`] — noise schedules, forward noising, ancestral sampling
//! - [`model`] — encoder/predictor traits, reference networks, cascade
//! - [`checkpoint`] — atomic safetensors checkpoints with embedded config
//! - [`config`] — serializable model configuration
//! - [`audio`] — mono WAV I/O
//! - [`data`] — restartable endless iteration for training loops
//! - [`noise`] — seeded random tensors

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod diffusion;
pub mod model;
pub mod noise;
pub mod quantizer;
pub mod vqvae;

mod error;

pub use config::VqVaeConfig;
pub use error::{Error, Result};
pub use vqvae::{Losses, VqVae};
