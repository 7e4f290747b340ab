//! osu-dreamer CLI: create model checkpoints and sample signals from audio.
//!
//! # Subcommands
//!
//! - `init` writes a JSON config (defaults unless one already exists) and a
//!   safetensors checkpoint of freshly initialised weights.
//! - `sample` loads a config + checkpoint, reads audio features from the
//!   `audio` tensor (`[A, L]`) of a safetensors file, and writes the generated
//!   signals (`[num_samples, X, L]`) to the `samples` tensor of `--output`.
//!
//! # Output
//!
//! Each subcommand prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/samples.safetensors","num_samples":2,"x_dim":9,"length":4096,"num_steps":32}
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use osu_dreamer_rs::{
    config::ModelConfig,
    diffusion::{noise::NoiseSource, schedule::SamplerOptions},
    training::Model,
};

#[derive(Parser, Debug)]
#[command(
    name = "osu-dreamer",
    about = "Audio-conditioned diffusion for beatmap signals"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a config and randomly initialised weights.
    Init {
        /// Model config (JSON). Created with defaults if missing.
        #[arg(long)]
        config: PathBuf,

        /// Output checkpoint (safetensors).
        #[arg(long)]
        weights: PathBuf,
    },

    /// Generate signals for one audio feature file.
    Sample {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        weights: PathBuf,

        /// Safetensors file holding an `audio` tensor of shape [A, L].
        #[arg(long, short = 'a')]
        audio: PathBuf,

        /// Output safetensors file.
        #[arg(long, short = 'o')]
        output: PathBuf,

        #[arg(long, short = 'n', default_value_t = 1)]
        num_samples: usize,

        /// Solver steps. 0 uses the config's `val_steps`.
        #[arg(long, default_value_t = 0)]
        steps: usize,

        /// Random seed. Omit for a random seed each run.
        #[arg(long, short = 's')]
        seed: Option<u64>,

        /// Stochasticity of the solver (0 = deterministic).
        #[arg(long, default_value_t = 0.0)]
        churn: f64,

        /// Disable feeding each estimate back to the next denoiser call.
        #[arg(long)]
        no_self_condition: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Args::parse().command {
        Command::Init { config, weights } => init(&config, &weights),
        Command::Sample {
            config,
            weights,
            audio,
            output,
            num_samples,
            steps,
            seed,
            churn,
            no_self_condition,
        } => {
            let opts = SamplerOptions {
                s_churn: churn,
                self_condition: !no_self_condition,
                ..Default::default()
            };
            sample(
                &config,
                &weights,
                &audio,
                &output,
                num_samples,
                steps,
                seed,
                &opts,
            )
        }
    }
}

fn init(config_path: &Path, weights_path: &Path) -> anyhow::Result<()> {
    let cfg = if config_path.exists() {
        tracing::info!("Using existing config {}", config_path.display());
        ModelConfig::from_json_file(config_path)?
    } else {
        let cfg = ModelConfig::default();
        cfg.to_json_file(config_path)?;
        tracing::info!("Wrote default config to {}", config_path.display());
        cfg
    };

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    Model::new(&cfg, vb)?;
    varmap.save(weights_path)?;

    let num_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
    tracing::info!("Saved {num_params} parameters to {}", weights_path.display());

    println!(
        "{}",
        serde_json::json!({
            "config": config_path,
            "weights": weights_path,
            "num_params": num_params,
        })
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn sample(
    config_path: &Path,
    weights_path: &Path,
    audio_path: &Path,
    output_path: &Path,
    num_samples: usize,
    num_steps: usize,
    seed: Option<u64>,
    opts: &SamplerOptions,
) -> anyhow::Result<()> {
    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let cfg = ModelConfig::from_json_file(config_path)?;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Model::new(&cfg, vb)?;
    varmap
        .load(weights_path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", weights_path.display()))?;

    let mut tensors = candle_core::safetensors::load(audio_path, &device)?;
    let audio = tensors
        .remove("audio")
        .ok_or_else(|| anyhow::anyhow!("{} has no `audio` tensor", audio_path.display()))?
        .to_dtype(DType::F32)?;

    let mut noise = match seed {
        Some(seed) => NoiseSource::seeded(seed),
        None => NoiseSource::from_os_rng(),
    };
    let steps = if num_steps > 0 {
        num_steps
    } else {
        cfg.training.val_steps
    };

    let started = std::time::Instant::now();
    let samples = model.sample(&audio, num_samples, steps, opts, &mut noise)?;
    tracing::info!("Sampled in {:.2}s", started.elapsed().as_secs_f64());

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let (n, x_dim, len) = samples.dims3()?;
    let out = HashMap::from([("samples".to_string(), samples)]);
    candle_core::safetensors::save(&out, output_path)?;

    println!(
        "{}",
        serde_json::json!({
            "path": output_path,
            "num_samples": n,
            "x_dim": x_dim,
            "length": len,
            "num_steps": steps,
        })
    );
    Ok(())
}
