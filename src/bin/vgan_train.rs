//! Train the video GAN on synthetic clips.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin vgan_train -- \
//!     --config vgan.json \
//!     --iterations 100 \
//!     --output weights
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use tracing::{info, warn};

use candle_vgan::{
    ExecutionContext, StateDict, Trainer, VganConfig,
    train::{CheckpointStore, SafetensorsCheckpoint, TracingSink, save_and_sample},
    utils::{LatentSampler, Pcg32},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a class-conditional video GAN on synthetic clips")]
struct Args {
    /// JSON configuration (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of training iterations
    #[arg(long, default_value = "10")]
    iterations: usize,

    /// Checkpoint root directory
    #[arg(short, long, default_value = "weights")]
    output: PathBuf,

    /// Save weights every N iterations (0 disables)
    #[arg(long, default_value = "0")]
    save_every: usize,

    /// Resume from the latest checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Override the configured seed
    #[arg(long)]
    seed: Option<u64>,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_vgan=info".parse()?)
                .add_directive("vgan_train=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => VganConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => VganConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate().context("invalid configuration")?;

    let device = if args.cpu {
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };
    info!(
        resolution = config.resolution,
        time_steps = config.time_steps,
        n_classes = config.n_classes,
        device = ?device,
        "starting training"
    );

    let ctx = ExecutionContext::new(device.clone(), DType::F32);
    let mut trainer = Trainer::new(config.clone(), ctx).context("building models")?;
    let mut store = SafetensorsCheckpoint::new(&args.output, &config.experiment_name);
    let mut sink = TracingSink;

    let mut state = if args.resume {
        let state = store
            .load_weights(&trainer.checkpoint_models(), None)
            .context("resuming from checkpoint")?;
        info!(itr = state.itr, "resumed");
        state
    } else {
        StateDict::new(config.clone())
    };

    let mut data = SyntheticClips::new(&config, &device);
    for _ in 0..args.iterations {
        state.itr += 1;
        let (real, labels) = data.next_batch(config.real_clips_per_iteration())?;
        let metrics = trainer.train_step(&real, &labels, state.itr, &mut sink)?;
        info!(
            itr = state.itr,
            g_loss = metrics.g_loss,
            d_loss_real = metrics.d_loss_real,
            d_loss_fake = metrics.d_loss_fake,
            "iteration"
        );
        if args.save_every > 0 && state.itr % args.save_every == 0 {
            save_and_sample(&trainer, &mut state, &mut store, &mut sink)?;
        }
    }
    save_and_sample(&trainer, &mut state, &mut store, &mut sink)?;
    info!(dir = %store.dir().display(), "done");
    Ok(())
}

/// Smooth random clips in [-1, 1] with uniformly drawn labels.
struct SyntheticClips {
    labels: LatentSampler,
    rng: Pcg32,
    device: Device,
    shape: (usize, usize, usize, usize),
}

impl SyntheticClips {
    fn new(config: &VganConfig, device: &Device) -> Self {
        Self {
            labels: LatentSampler::new(1, config.n_classes, 1.0, config.seed ^ 0xda7a),
            rng: Pcg32::stream(config.seed, 0xda7a),
            device: device.clone(),
            shape: (config.time_steps, 3, config.resolution, config.resolution),
        }
    }

    fn next_batch(&mut self, n: usize) -> Result<(Tensor, Tensor)> {
        let (t, c, h, w) = self.shape;
        // one colour per clip and frame, plus low-amplitude noise
        let base = self.rng.randn((n, t, c, 1, 1), &self.device)?;
        let noise = self.rng.randn((n, t, c, h, w), &self.device)?.affine(0.1, 0.0)?;
        let clips = base.broadcast_add(&noise)?.tanh()?;
        let labels = self.labels.sample_labels(n, &self.device)?;
        Ok((clips, labels))
    }
}
