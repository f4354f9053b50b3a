//! vq-voice-swap CLI — re-synthesize a recording under another speaker label.
//!
//! Encodes a WAV file to latent codes with a trained checkpoint, then decodes
//! those codes with the diffusion decoder conditioned on `--label`.
//!
//! # Output
//!
//! Writes a mono 16-bit WAV file to --output and prints a one-line JSON
//! summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/swapped.wav","codes":256,"samples":16384,"sample_rate":16000,"label":3}
//! ```

use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use vq_voice_swap::audio::{peak_normalize, read_mono_tensor, write_tensor};
use vq_voice_swap::diffusion::{SampleOptions, VarianceKind};
use vq_voice_swap::vqvae::VqVae;

#[derive(Parser, Debug)]
#[command(
    name = "vq-voice-swap",
    about = "Voice swapping with a class-conditional VQ-VAE",
    long_about = "Encode a recording to discrete codes and decode it under a different label.\n\
                  The input is mixed down to mono and trimmed to a multiple of the\n\
                  model's downsample rate."
)]
struct Args {
    /// Checkpoint written by VqVae::save.
    #[arg(long, short = 'm')]
    checkpoint: String,

    /// Input WAV file.
    #[arg(long, short = 'i')]
    input: String,

    /// Output WAV file.
    #[arg(long, short = 'o')]
    output: String,

    /// Target label (speaker index).
    #[arg(long, short = 'l')]
    label: u32,

    /// Number of reverse diffusion steps.
    #[arg(long, default_value_t = 100)]
    steps: usize,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Clamp the clean-signal estimate to [-1, 1] during sampling.
    #[arg(long)]
    constrain: bool,

    /// Use the β upper bound instead of the posterior variance.
    #[arg(long)]
    beta_variance: bool,

    /// Peak-normalize the decoded audio before writing.
    #[arg(long)]
    normalize: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.steps == 0 {
        anyhow::bail!("--steps must be at least 1");
    }

    let output_path = std::path::Path::new(&args.output);
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let device = candle_core::Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let model = VqVae::load(&args.checkpoint, &device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint: {e}"))?;
    if args.label as usize >= model.num_labels() {
        anyhow::bail!(
            "label {} out of range, checkpoint has {} labels",
            args.label,
            model.num_labels()
        );
    }

    let (audio, sample_rate) = read_mono_tensor(&args.input, &device)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", args.input))?;
    let rate = model.downsample_rate();
    let len = audio.dim(2)?;
    let usable = len - len % rate;
    if usable == 0 {
        anyhow::bail!("input has {len} samples, need at least {rate}");
    }
    let audio = if usable != len {
        tracing::warn!(
            samples = len,
            kept = usable,
            "trimming input to a multiple of {rate}"
        );
        audio.narrow(2, 0, usable)?
    } else {
        audio
    };

    let codes = model.encode(&audio)?;
    tracing::info!(codes = codes.dim(1)?, label = args.label, "encoded input");

    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let labels = candle_core::Tensor::new(&[args.label], &device)?;
    let options = SampleOptions {
        steps: args.steps,
        progress: true,
        constrain: args.constrain,
        variance: if args.beta_variance {
            VarianceKind::Beta
        } else {
            VarianceKind::Posterior
        },
    };
    let swapped = model
        .decode(&codes, &labels, &options, &mut rng)
        .map_err(|e| anyhow::anyhow!("decoding failed: {e}"))?;
    let swapped = if args.normalize {
        peak_normalize(&swapped)?
    } else {
        swapped
    };

    write_tensor(&args.output, &swapped, sample_rate)
        .map_err(|e| anyhow::anyhow!("failed to write audio: {e}"))?;

    println!(
        r#"{{"path":"{path}","codes":{codes},"samples":{samples},"sample_rate":{sr},"label":{label}}}"#,
        path = args.output,
        codes = codes.dim(1)?,
        samples = swapped.dim(2)?,
        sr = sample_rate,
        label = args.label,
    );

    Ok(())
}
