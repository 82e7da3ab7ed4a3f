//! Candle-VGAN: a class-conditional video GAN on the Candle framework.
//!
//! A generator maps `(z, class)` to a clip `[B, T, 3, H, W]`; a per-frame
//! projection discriminator scores sub-sampled frames and a clip-level
//! discriminator scores whole clips. [`train::Trainer`] runs the
//! alternating discriminator/generator updates with gradient accumulation,
//! orthogonal regularisation and an EMA generator.

pub mod arch;
pub mod common;
pub mod config;
pub mod error;
pub mod models;
pub mod train;
pub mod utils;

pub use config::{ExecutionContext, VganConfig};
pub use error::{Result, VganError};
pub use models::{GD, Generator, ImageDiscriminator, VideoDiscriminator};
pub use train::{StateDict, TrainMetrics, Trainer};
