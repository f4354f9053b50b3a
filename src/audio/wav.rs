//! Mono WAV I/O.

use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Mono samples in `[-1, 1]` and their sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct MonoWav {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Read a WAV file, averaging all channels into one.
pub fn read_mono(path: impl AsRef<Path>) -> Result<MonoWav> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(Error::Audio("wav file has no channels".into()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(MonoWav {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Read a WAV file as a `[1, 1, T]` tensor on `device`.
pub fn read_mono_tensor(path: impl AsRef<Path>, device: &Device) -> Result<(Tensor, u32)> {
    let wav = read_mono(path)?;
    let len = wav.samples.len();
    let tensor = Tensor::from_vec(wav.samples, (1, 1, len), device)?;
    Ok((tensor, wav.sample_rate))
}

/// Write mono f32 samples as a 16-bit PCM WAV file, clipping to `[-1, 1]`.
pub fn write_mono(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Write row `0` of an `[N, 1, T]` (or `[T]`) tensor as a mono WAV file.
pub fn write_tensor(path: impl AsRef<Path>, audio: &Tensor, sample_rate: u32) -> Result<()> {
    let samples = match audio.rank() {
        1 => audio.to_dtype(DType::F32)?.to_vec1::<f32>()?,
        3 => audio.get(0)?.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?,
        rank => {
            return Err(Error::Shape(format!(
                "expected [T] or [N, 1, T] audio, got rank {rank}"
            )));
        }
    };
    write_mono(path, &samples, sample_rate)
}

/// Scale each row of `[N, 1, T]` audio so its loudest sample sits at ±1.
///
/// Rows whose peak is below `1e-8` are returned unchanged.
pub fn peak_normalize(audio: &Tensor) -> Result<Tensor> {
    let (n, c, t) = audio.dims3()?;
    if c != 1 {
        return Err(Error::Shape(format!("expected mono audio, got {c} channels")));
    }
    let peak = audio.abs()?.reshape((n, t))?.max_keepdim(1)?;
    let audible = peak.gt(1e-8)?;
    let gain = audible.where_cond(&peak.recip()?, &peak.ones_like()?)?;
    Ok(audio.broadcast_mul(&gain.reshape((n, 1, 1))?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_normalize_per_row() {
        let dev = Device::Cpu;
        let audio = Tensor::new(
            &[[[0.2f32, -0.4, 0.1]], [[0.0, 0.0, 0.0]], [[-2.0, 1.0, 0.5]]],
            &dev,
        )
        .unwrap();
        let rows = peak_normalize(&audio).unwrap().to_vec3::<f32>().unwrap();
        let expected = [[0.5f32, -1.0, 0.25], [0.0, 0.0, 0.0], [-1.0, 0.5, 0.25]];
        for (row, want) in rows.iter().zip(expected.iter()) {
            for (a, b) in row[0].iter().zip(want.iter()) {
                assert!((a - b).abs() < 1e-6, "{a} vs {b}");
            }
        }

        let stereo = Tensor::zeros((1, 2, 3), DType::F32, &dev).unwrap();
        assert!(matches!(peak_normalize(&stereo), Err(Error::Shape(_))));
    }

    #[test]
    fn test_mono_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let original = vec![0.0f32, 0.5, -0.5, 1.0, -1.0, 0.25];
        write_mono(&path, &original, 16000).unwrap();
        let wav = read_mono(&path).unwrap();
        assert_eq!(wav.sample_rate, 16000);
        assert_eq!(wav.samples.len(), original.len());
        for (a, b) in wav.samples.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_stereo_is_mixed_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [0.2f32, 0.4, -1.0, 0.0] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let (tensor, rate) = read_mono_tensor(&path, &Device::Cpu).unwrap();
        assert_eq!(rate, 22050);
        assert_eq!(tensor.dims(), &[1, 1, 2]);
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.3).abs() < 1e-6);
        assert!((values[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_write_tensor_clips_and_checks_rank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let audio = Tensor::new(&[[[2.0f32, -0.5]]], &Device::Cpu).unwrap();
        write_tensor(&path, &audio, 8000).unwrap();
        let wav = read_mono(&path).unwrap();
        assert!((wav.samples[0] - 1.0).abs() < 1e-3);
        assert!((wav.samples[1] + 0.5).abs() < 1e-3);

        let bad = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(write_tensor(&path, &bad, 8000), Err(Error::Shape(_))));
    }
}
