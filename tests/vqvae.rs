//! Integration tests for the VQ-VAE.
//!
//! Models use tiny channel widths so a full forward/backward pass over a
//! realistic batch stays fast on CPU.

use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use vq_voice_swap::{Error, VqVae, VqVaeConfig};

fn tiny_config(num_labels: usize) -> VqVaeConfig {
    VqVaeConfig {
        base_channels: 2,
        cond_mult: 4,
        codebook_size: 32,
        time_scale_channels: 16,
        ..VqVaeConfig::new(num_labels)
    }
}

fn sine_batch(n: usize, len: usize, device: &Device) -> Tensor {
    let samples: Vec<f32> = (0..n)
        .flat_map(|row| {
            let freq = 0.01 + 0.005 * row as f32;
            (0..len).map(move |i| 0.5 * (i as f32 * freq).sin())
        })
        .collect();
    Tensor::from_vec(samples, (n, 1, len), device).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

mod training_tests {
    use super::*;
    use candle_nn::{AdamW, Optimizer, ParamsAdamW};
    use vq_voice_swap::model::cascade::Stage;

    #[test]
    fn test_cascade_losses_for_speaker_batch() {
        let dev = Device::Cpu;
        let model = VqVae::new(tiny_config(10), &dev).unwrap();
        assert_eq!(model.downsample_rate(), 256);

        let audio = sine_batch(4, 16384, &dev);
        let labels = Tensor::new(&[0u32, 3, 7, 9], &dev).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let losses = model.losses(&audio, &labels, &mut rng).unwrap();

        assert_eq!(losses.vq_loss.rank(), 0);
        assert_eq!(losses.mse.rank(), 0);
        assert_eq!(losses.ts.dims(), &[4]);
        assert_eq!(losses.mses.dims(), &[4]);
        let stages: Vec<Stage> = losses.stage_mses.iter().map(|(s, _)| *s).collect();
        assert_eq!(stages, vec![Stage::Base, Stage::Label, Stage::Cond]);

        for t in losses.ts.to_vec1::<f32>().unwrap() {
            assert!((0.0..1.0).contains(&t));
        }
        let vq: f32 = losses.vq_loss.to_scalar().unwrap();
        let mse: f32 = losses.mse.to_scalar().unwrap();
        assert!(vq.is_finite() && vq >= 0.0);
        assert!(mse.is_finite() && mse >= 0.0);

        // mse is the mean of the per-row stage averages.
        let mean: f32 = losses.mses.mean_all().unwrap().to_scalar().unwrap();
        assert!((mean - mse).abs() < 1e-5);
    }

    #[test]
    fn test_optimizer_step_updates_codebook() {
        let dev = Device::Cpu;
        let model = VqVae::new(tiny_config(2), &dev).unwrap();
        let before = model.quantizer().codebook().copy().unwrap();

        let mut opt = AdamW::new(
            model.parameters(),
            ParamsAdamW {
                lr: 1e-2,
                ..Default::default()
            },
        )
        .unwrap();
        let audio = sine_batch(2, 512, &dev);
        let labels = Tensor::new(&[0u32, 1], &dev).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let losses = model.losses(&audio, &labels, &mut rng).unwrap();
        opt.backward_step(&losses.total().unwrap()).unwrap();

        assert!(max_abs_diff(&before, model.quantizer().codebook()) > 0.0);
    }

    #[test]
    fn test_single_stage_orchestrator() {
        let dev = Device::Cpu;
        let cfg = VqVaeConfig {
            orchestrator: "single".into(),
            predictor: "wavegrad".into(),
            ..tiny_config(3)
        };
        let model = VqVae::new(cfg, &dev).unwrap();
        assert_eq!(model.downsample_rate(), 64);

        let audio = sine_batch(2, 256, &dev);
        let labels = Tensor::new(&[1u32, 2], &dev).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let losses = model.losses(&audio, &labels, &mut rng).unwrap();
        assert_eq!(losses.stage_mses.len(), 1);
        assert!(losses.stage_mse(Stage::Cond).is_some());
    }

    #[test]
    fn test_bad_audio_length_is_shape_error() {
        let dev = Device::Cpu;
        let model = VqVae::new(tiny_config(2), &dev).unwrap();
        let audio = Tensor::zeros((1, 1, 300), DType::F32, &dev).unwrap();
        let labels = Tensor::new(&[0u32], &dev).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert!(matches!(
            model.losses(&audio, &labels, &mut rng),
            Err(Error::Shape(_))
        ));
        assert!(matches!(model.encode(&audio), Err(Error::Shape(_))));
    }
}

mod codec_tests {
    use super::*;
    use vq_voice_swap::diffusion::SampleOptions;

    #[test]
    fn test_encode_decode_shapes_and_determinism() {
        let dev = Device::Cpu;
        let model = VqVae::new(tiny_config(4), &dev).unwrap();
        let audio = sine_batch(2, 512, &dev);

        let codes = model.encode(&audio).unwrap();
        assert_eq!(codes.dims(), &[2, 8]);
        assert_eq!(codes.dtype(), DType::U32);
        for code in codes.flatten_all().unwrap().to_vec1::<u32>().unwrap() {
            assert!(code < 32);
        }
        let again = model.encode(&audio).unwrap();
        assert_eq!(
            codes.to_vec2::<u32>().unwrap(),
            again.to_vec2::<u32>().unwrap()
        );

        let labels = Tensor::new(&[3u32, 0], &dev).unwrap();
        let options = SampleOptions::with_steps(4);
        let a = model
            .decode(&codes, &labels, &options, &mut ChaCha8Rng::seed_from_u64(9))
            .unwrap();
        let b = model
            .decode(&codes, &labels, &options, &mut ChaCha8Rng::seed_from_u64(9))
            .unwrap();
        assert_eq!(a.dims(), &[2, 1, 512]);
        assert_eq!(max_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn test_decode_rejects_unknown_label() {
        let dev = Device::Cpu;
        let model = VqVae::new(tiny_config(2), &dev).unwrap();
        let codes = Tensor::zeros((1, 4), DType::U32, &dev).unwrap();
        let labels = Tensor::new(&[2u32], &dev).unwrap();
        let result = model.decode(
            &codes,
            &labels,
            &SampleOptions::with_steps(2),
            &mut ChaCha8Rng::seed_from_u64(0),
        );
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn test_decode_rejects_out_of_range_codes() {
        let dev = Device::Cpu;
        let model = VqVae::new(tiny_config(2), &dev).unwrap();
        let codes = Tensor::new(&[[0u32, 1, 32, 0]], &dev).unwrap();
        let labels = Tensor::new(&[0u32], &dev).unwrap();
        let result = model.decode(
            &codes,
            &labels,
            &SampleOptions::with_steps(2),
            &mut ChaCha8Rng::seed_from_u64(0),
        );
        assert!(matches!(
            result,
            Err(Error::CodeOutOfRange {
                index: 32,
                codebook_size: 32
            })
        ));
    }
}

mod checkpoint_tests {
    use super::*;

    #[test]
    fn test_save_load_round_trip() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vqvae.safetensors");

        let model = VqVae::new(tiny_config(10), &dev).unwrap();
        model.save(&path).unwrap();
        let restored = VqVae::load(&path, &dev).unwrap();
        assert_eq!(restored.config(), model.config());

        let original = model.varmap().data().lock().unwrap();
        let loaded = restored.varmap().data().lock().unwrap();
        assert_eq!(original.len(), loaded.len());
        for (name, var) in original.iter() {
            let other = loaded.get(name).unwrap();
            assert_eq!(max_abs_diff(var.as_tensor(), other.as_tensor()), 0.0, "{name}");
        }
        drop((original, loaded));

        let audio = sine_batch(2, 1024, &dev);
        let labels = Tensor::new(&[4u32, 8], &dev).unwrap();
        let a = model
            .losses(&audio, &labels, &mut ChaCha8Rng::seed_from_u64(5))
            .unwrap();
        let b = restored
            .losses(&audio, &labels, &mut ChaCha8Rng::seed_from_u64(5))
            .unwrap();
        assert_eq!(max_abs_diff(&a.mses, &b.mses), 0.0);
        assert_eq!(max_abs_diff(&a.vq_loss, &b.vq_loss), 0.0);
    }

    #[test]
    fn test_label_count_mismatch_on_resume() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vqvae.safetensors");
        VqVae::new(tiny_config(10), &dev).unwrap().save(&path).unwrap();

        let restored = VqVae::load(&path, &dev).unwrap();
        restored.ensure_num_labels(10).unwrap();
        assert!(matches!(
            restored.ensure_num_labels(5),
            Err(Error::LabelMismatch {
                expected: 5,
                found: 10
            })
        ));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = VqVae::load(dir.path().join("absent.safetensors"), &Device::Cpu);
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
