//! Adversarial training
//!
//! - **losses**: hinge / non-saturating losses, frame aggregation, pixel loss
//! - **ortho**: orthogonal regularisation on gradients
//! - **ema**: moving average of generator weights
//! - **step**: the per-iteration D-phase / G-phase driver
//! - **eval**: checkpointing and inception-style evaluation
//! - **sinks**: metrics and checkpoint collaborators
//! - **state**: persisted training progress

pub mod ema;
pub mod eval;
pub mod losses;
pub mod ortho;
pub mod sinks;
pub mod state;
pub mod step;

pub use ema::Ema;
pub use eval::{InceptionMetrics, InceptionScores, evaluate, save_and_sample};
pub use losses::{
    AdversarialLoss, aggregate_frames, average_frames, loss_dcgan_dis, loss_dcgan_gen, loss_hinge_dis, loss_hinge_gen,
    mean_intensity, pixel_loss,
};
pub use ortho::apply_ortho;
pub use sinks::{CheckpointStore, MetricsSink, RecordingSink, SafetensorsCheckpoint, TracingSink};
pub use state::StateDict;
pub use step::{TrainMetrics, Trainer};
