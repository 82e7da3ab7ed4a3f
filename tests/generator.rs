//! End-to-end generator behaviour.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_vgan::config::{GenAttention, InitStyle, TemporalCore};
use candle_vgan::models::build_model;
use candle_vgan::utils::{LatentSampler, Pcg32};
use candle_vgan::{ExecutionContext, Generator, VganConfig, VganError};

fn small_config() -> VganConfig {
    VganConfig {
        resolution: 32,
        time_steps: 4,
        frames_per_clip: 2,
        n_classes: 3,
        g_ch: 4,
        dim_z: 128,
        ..Default::default()
    }
}

fn value_range(video: &Tensor) -> Result<(f32, f32)> {
    let flat = video.flatten_all()?;
    Ok((flat.min(0)?.to_scalar::<f32>()?, flat.max(0)?.to_scalar::<f32>()?))
}

#[test]
fn test_generates_bounded_clips_of_configured_shape() -> Result<()> {
    let ctx = ExecutionContext::cpu();
    let config = small_config();
    let mut rng = Pcg32::new(0, 1);
    let (g, _vars) = build_model(&ctx, InitStyle::Ortho, &mut rng, |vb| Generator::new(&config, vb))?;

    let z = Tensor::randn(0f32, 1.0, (2, 128), &ctx.device)?;
    let y = Tensor::new(&[0u32, 2], &ctx.device)?;
    let video = g.generate(&z, &g.embed_labels(&y)?)?;
    assert_eq!(video.dims(), &[2, 4, 3, 32, 32]);
    let (lo, hi) = value_range(&video)?;
    assert!(lo >= -1.0 && hi <= 1.0, "range [{lo}, {hi}]");
    Ok(())
}

#[test]
fn test_extreme_latents_stay_bounded() -> Result<()> {
    let ctx = ExecutionContext::cpu();
    let config = VganConfig {
        temporal_core: TemporalCore::Linear,
        full_attention: false,
        g_attn: "16".into(),
        g_attention: GenAttention::Combined,
        ..small_config()
    };
    let mut rng = Pcg32::new(1, 1);
    let (g, _vars) = build_model(&ctx, InitStyle::N02, &mut rng, |vb| Generator::new(&config, vb))?;
    let z = Tensor::full(1e3f32, (3, 128), &ctx.device)?;
    let y = Tensor::new(&[1u32, 1, 0], &ctx.device)?;
    let video = g.generate(&z, &g.embed_labels(&y)?)?;
    assert_eq!(video.dims(), &[3, 4, 3, 32, 32]);
    let (lo, hi) = value_range(&video)?;
    assert!(lo >= -1.0 && hi <= 1.0);
    Ok(())
}

#[test]
fn test_hierarchical_latents_use_adjusted_width() -> Result<()> {
    let ctx = ExecutionContext::cpu();
    let config = VganConfig {
        hier: true,
        shared_dim: 8,
        g_attention: GenAttention::Separable,
        g_attn: "16_32".into(),
        ..small_config()
    };
    let mut rng = Pcg32::new(2, 1);
    let (g, _vars) = build_model(&ctx, InitStyle::Xavier, &mut rng, |vb| Generator::new(&config, vb))?;

    // three stages -> four slots of 32
    let layout = g.latent_layout();
    assert_eq!(layout.num_slots, 4);
    assert_eq!(g.dim_z(), 128);
    assert_eq!(layout.chunk_size, 32);

    let mut latents = LatentSampler::new(g.dim_z(), 3, 1.0, 5);
    let (z, y) = latents.sample(2, &ctx.device)?;
    let video = g.generate(&z, &g.embed_labels(&y)?)?;
    assert_eq!(video.dims(), &[2, 4, 3, 32, 32]);
    Ok(())
}

#[test]
fn test_wrong_latent_width_is_shape_mismatch() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let config = VganConfig {
        hier: true,
        dim_z: 130,
        ..small_config()
    };
    let g = Generator::new(&config, vb)?;
    assert_eq!(g.dim_z(), 128);

    let z = Tensor::zeros((2, 130), DType::F32, &device)?;
    let y = g.embed_labels(&Tensor::new(&[0u32, 1], &device)?)?;
    assert!(matches!(g.generate(&z, &y), Err(VganError::ShapeMismatch { .. })));

    let bad_label = Tensor::new(&[3u32], &device)?;
    assert!(matches!(g.embed_labels(&bad_label), Err(VganError::ShapeMismatch { .. })));
    Ok(())
}

#[test]
fn test_bottom_width_must_reach_resolution() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let config = VganConfig {
        bottom_width: 2,
        ..small_config()
    };
    assert!(matches!(Generator::new(&config, vb), Err(VganError::Configuration(_))));
}
