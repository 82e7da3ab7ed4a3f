//! Configuration for the video GAN and its training loop.
//!
//! Every option is resolved once, validated, and handed to model
//! construction. Nothing reads ambient configuration during a forward pass.

use std::path::Path;
use std::str::FromStr;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::arch::SUPPORTED_RESOLUTIONS;
use crate::error::{Result, VganError};

/// Adversarial loss family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    #[default]
    Hinge,
    /// Non-saturating softplus loss.
    Dcgan,
}

/// Where per-frame scores are reduced relative to the hinge nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SumSequence {
    /// Sum the k scores of a clip, then apply the loss per clip.
    Before,
    /// Apply the loss to every score, then average.
    #[default]
    After,
}

/// How the generator produces its initial `[B, T, C0, w, w]` features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemporalCore {
    #[default]
    ConvGru,
    Linear,
}

/// Attention layout used by the generator at attention-enabled stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenAttention {
    /// Width, height and time attention applied one after the other.
    #[default]
    Separable,
    /// A single 2D self-attention layer per frame.
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BestMetric {
    #[default]
    #[serde(rename = "IS")]
    Is,
    #[serde(rename = "FID")]
    Fid,
}

/// Weight initialisation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStyle {
    Ortho,
    N02,
    Xavier,
}

impl FromStr for InitStyle {
    type Err = VganError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ortho" => Ok(Self::Ortho),
            "N02" => Ok(Self::N02),
            "glorot" | "xavier" => Ok(Self::Xavier),
            other => Err(VganError::config(format!(
                "unrecognized init style '{other}' (expected ortho, N02, glorot or xavier)"
            ))),
        }
    }
}

/// Device and precision binding for a run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub device: Device,
    pub dtype: DType,
}

impl ExecutionContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VganConfig {
    /// Output resolution (one of 32, 64, 128, 256, 512)
    pub resolution: usize,
    /// Frames per generated clip
    pub time_steps: usize,
    pub n_classes: usize,
    /// Optional display names for class ids, used in label logging
    pub class_names: Option<Vec<String>>,

    // Generator
    pub g_ch: usize,
    pub dim_z: usize,
    /// Spatial size of the temporal core output
    pub bottom_width: usize,
    /// Underscore-separated attention resolutions, e.g. "32_64"
    pub g_attn: String,
    pub g_kernel: String,
    pub g_dilation: String,
    /// Shared class embedding width; 0 means `dim_z`
    pub shared_dim: usize,
    /// Split z across the stages (hierarchical latents)
    pub hier: bool,
    pub temporal_core: TemporalCore,
    pub full_attention: bool,
    pub g_attention: GenAttention,
    pub g_init: String,
    pub bn_eps: f64,
    pub g_lr: f64,
    pub g_b1: f64,
    pub g_b2: f64,
    /// Batch size for the generator phase; 0 means `batch_size`
    pub g_batch_size: usize,

    // Discriminators
    pub d_ch: usize,
    pub d_wide: bool,
    pub d_attn: String,
    pub d_kernel: String,
    pub d_dilation: String,
    pub d_init: String,
    pub d_lr: f64,
    pub d_b1: f64,
    pub d_b2: f64,
    pub adam_eps: f64,
    /// Attach the temporal (video) discriminator
    pub video_discriminator: bool,
    /// Residual 3D blocks in the video discriminator (plain conv3d otherwise)
    pub dv_residual: bool,
    /// Keep one video score per surviving time step
    pub t_into_b: bool,
    /// Frames sampled per clip for the image discriminator
    pub frames_per_clip: usize,

    // Training
    pub batch_size: usize,
    pub num_d_steps: usize,
    pub num_d_accumulations: usize,
    pub num_g_accumulations: usize,
    pub split_d: bool,
    pub loss: LossKind,
    pub d_hinge_loss_sum: SumSequence,
    pub dv_hinge_loss_sum: SumSequence,
    pub d_loss_weight: f64,
    pub g_ortho: f64,
    pub d_ortho: f64,
    pub avg_pixel_loss: bool,
    pub avg_pixel_loss_weight: f64,
    /// Iteration from which the pixel loss joins the generator loss
    pub pixel_loss_kicksin: usize,
    pub z_var: f64,
    pub ema: bool,
    pub use_ema: bool,
    pub ema_decay: f64,
    pub ema_start: usize,
    pub seed: u64,
    pub log_results_every: usize,

    // Saving and evaluation
    pub experiment_name: String,
    pub num_save_copies: usize,
    pub num_best_copies: usize,
    pub which_best: BestMetric,
    pub num_inception_images: usize,
    pub num_inception_splits: usize,
}

impl Default for VganConfig {
    fn default() -> Self {
        Self {
            resolution: 64,
            time_steps: 12,
            n_classes: 101,
            class_names: None,
            g_ch: 64,
            dim_z: 128,
            bottom_width: 4,
            g_attn: "64".to_string(),
            g_kernel: "333333".to_string(),
            g_dilation: "111111".to_string(),
            shared_dim: 0,
            hier: false,
            temporal_core: TemporalCore::ConvGru,
            full_attention: true,
            g_attention: GenAttention::Separable,
            g_init: "ortho".to_string(),
            bn_eps: 1e-5,
            g_lr: 5e-5,
            g_b1: 0.0,
            g_b2: 0.999,
            g_batch_size: 0,
            d_ch: 64,
            d_wide: true,
            d_attn: "64".to_string(),
            d_kernel: "333333".to_string(),
            d_dilation: "111111".to_string(),
            d_init: "ortho".to_string(),
            d_lr: 2e-4,
            d_b1: 0.0,
            d_b2: 0.999,
            adam_eps: 1e-8,
            video_discriminator: true,
            dv_residual: true,
            t_into_b: false,
            frames_per_clip: 8,
            batch_size: 8,
            num_d_steps: 2,
            num_d_accumulations: 1,
            num_g_accumulations: 1,
            split_d: false,
            loss: LossKind::Hinge,
            d_hinge_loss_sum: SumSequence::After,
            dv_hinge_loss_sum: SumSequence::After,
            d_loss_weight: 1.0,
            g_ortho: 0.0,
            d_ortho: 0.0,
            avg_pixel_loss: false,
            avg_pixel_loss_weight: 0.1,
            pixel_loss_kicksin: 0,
            z_var: 1.0,
            ema: false,
            use_ema: false,
            ema_decay: 0.9999,
            ema_start: 0,
            seed: 0,
            log_results_every: 100,
            experiment_name: "vgan".to_string(),
            num_save_copies: 2,
            num_best_copies: 2,
            which_best: BestMetric::Is,
            num_inception_images: 50_000,
            num_inception_splits: 10,
        }
    }
}

impl VganConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-field constraint. Called before any model is built.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_RESOLUTIONS.contains(&self.resolution) {
            return Err(VganError::config(format!(
                "unsupported resolution {} (supported: {:?})",
                self.resolution, SUPPORTED_RESOLUTIONS
            )));
        }
        if self.time_steps == 0 {
            return Err(VganError::config("time_steps must be at least 1"));
        }
        if self.frames_per_clip == 0 || self.frames_per_clip > self.time_steps {
            return Err(VganError::config(format!(
                "frames_per_clip must be in 1..={} (got {})",
                self.time_steps, self.frames_per_clip
            )));
        }
        if self.n_classes == 0 {
            return Err(VganError::config("n_classes must be positive"));
        }
        if self.batch_size == 0 {
            return Err(VganError::config("batch_size must be positive"));
        }
        if self.num_d_steps == 0 || self.num_d_accumulations == 0 || self.num_g_accumulations == 0
        {
            return Err(VganError::config(
                "num_d_steps, num_d_accumulations and num_g_accumulations must be at least 1",
            ));
        }
        if self.dim_z == 0 || self.bottom_width == 0 {
            return Err(VganError::config("dim_z and bottom_width must be positive"));
        }
        if self.g_ortho < 0.0 || self.d_ortho < 0.0 {
            return Err(VganError::config("orthogonal regularization strength must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(VganError::config("ema_decay must lie in [0, 1]"));
        }
        if let Some(names) = &self.class_names {
            if names.len() != self.n_classes {
                return Err(VganError::config(format!(
                    "class_names has {} entries, expected {}",
                    names.len(),
                    self.n_classes
                )));
            }
        }
        self.g_init_style()?;
        self.d_init_style()?;
        Ok(())
    }

    pub fn g_init_style(&self) -> Result<InitStyle> {
        self.g_init.parse()
    }

    pub fn d_init_style(&self) -> Result<InitStyle> {
        self.d_init.parse()
    }

    /// Width of the shared class embedding.
    pub fn effective_shared_dim(&self) -> usize {
        if self.shared_dim > 0 { self.shared_dim } else { self.dim_z }
    }

    pub fn effective_g_batch_size(&self) -> usize {
        if self.g_batch_size > 0 { self.g_batch_size } else { self.batch_size }
    }

    /// Number of real clips one training iteration consumes.
    pub fn real_clips_per_iteration(&self) -> usize {
        self.batch_size * self.num_d_steps * self.num_d_accumulations
    }

    pub fn class_name(&self, class_id: u32) -> String {
        self.class_names
            .as_ref()
            .and_then(|names| names.get(class_id as usize).cloned())
            .unwrap_or_else(|| class_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(VganConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unsupported_resolution_rejected() {
        let config = VganConfig {
            resolution: 48,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VganError::Configuration(_))));
    }

    #[test]
    fn test_unknown_init_style_is_configuration_error() {
        let config = VganConfig {
            g_init: "kaiming".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VganError::Configuration(_))));
        assert_eq!("glorot".parse::<InitStyle>().unwrap(), InitStyle::Xavier);
        assert_eq!("N02".parse::<InitStyle>().unwrap(), InitStyle::N02);
    }

    #[test]
    fn test_frames_per_clip_bounded_by_time_steps() {
        let config = VganConfig {
            time_steps: 4,
            frames_per_clip: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_enums_round_trip_through_serde() {
        let json = r#"{"loss":"dcgan","d_hinge_loss_sum":"before","which_best":"FID","temporal_core":"linear"}"#;
        let config: VganConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.loss, LossKind::Dcgan);
        assert_eq!(config.d_hinge_loss_sum, SumSequence::Before);
        assert_eq!(config.which_best, BestMetric::Fid);
        assert_eq!(config.temporal_core, TemporalCore::Linear);
        assert_eq!(config.resolution, 64);
    }
}
