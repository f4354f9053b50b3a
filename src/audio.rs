//! Audio I/O utilities.
//!
//! Waveforms enter and leave the model as mono `[N, 1, T]` f32 tensors in
//! `[-1, 1]`. WAV files of any channel count are mixed down on read.

mod wav;

pub use wav::{MonoWav, peak_normalize, read_mono, read_mono_tensor, write_mono, write_tensor};
