//! Generator/discriminator composition and frame sampling.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_vgan::config::InitStyle;
use candle_vgan::models::{GD, StepMode, build_model};
use candle_vgan::utils::{FrameSampler, LatentSampler, Pcg32};
use candle_vgan::{ExecutionContext, Generator, ImageDiscriminator, VganConfig, VideoDiscriminator};

fn config(t_into_b: bool) -> VganConfig {
    VganConfig {
        resolution: 32,
        time_steps: 6,
        frames_per_clip: 3,
        n_classes: 5,
        g_ch: 2,
        d_ch: 2,
        dim_z: 16,
        d_attn: "8".into(),
        t_into_b,
        ..Default::default()
    }
}

fn build(config: &VganConfig) -> Result<GD> {
    let ctx = ExecutionContext::cpu();
    let mut rng = Pcg32::new(9, 3);
    let (g, _) = build_model(&ctx, InitStyle::Ortho, &mut rng, |vb| Generator::new(config, vb))?;
    let (d, _) = build_model(&ctx, InitStyle::Ortho, &mut rng, |vb| ImageDiscriminator::new(config, vb))?;
    let (dv, _) = build_model(&ctx, InitStyle::Ortho, &mut rng, |vb| VideoDiscriminator::new(config, vb))?;
    Ok(GD::new(g, d, Some(dv), FrameSampler::new(config.frames_per_clip, 11)))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

fn assert_close(a: &Option<Tensor>, b: &Option<Tensor>) -> Result<()> {
    match (a, b) {
        (Some(a), Some(b)) => {
            assert_eq!(a.dims(), b.dims());
            assert!(max_abs_diff(a, b)? < 1e-4);
        }
        (None, None) => {}
        _ => panic!("score presence differs"),
    }
    Ok(())
}

#[test]
fn test_concat_and_split_modes_agree() -> Result<()> {
    for t_into_b in [false, true] {
        let config = config(t_into_b);
        let mut gd = build(&config)?;
        let device = Device::Cpu;
        let mut latents = LatentSampler::new(gd.generator().dim_z(), config.n_classes, 1.0, 4);
        let (z, y) = latents.sample(2, &device)?;
        let real = Tensor::randn(0f32, 0.5, (3, 6, 3, 32, 32), &device)?.tanh()?;
        let y_real = Tensor::new(&[4u32, 0, 2], &device)?;

        let run = |gd: &mut GD, split_d: bool| {
            gd.sampler_mut().reseed(21);
            let mode = StepMode {
                train_g: false,
                return_generated: true,
                split_d,
            };
            gd.step(&z, &y, Some((&real, &y_real)), mode)
        };
        let split = run(&mut gd, true)?;
        let concat = run(&mut gd, false)?;

        assert_eq!(split.d_fake.dims(), &[2 * 3, 1]);
        assert_eq!(split.d_real.as_ref().map(|t| t.dims().to_vec()), Some(vec![3 * 3, 1]));
        let width = if t_into_b { 2 } else { 1 };
        assert_eq!(split.video_width, width);
        assert_eq!(split.dv_fake.as_ref().map(|t| t.dims().to_vec()), Some(vec![2 * width, 1]));
        assert_eq!(split.dv_real.as_ref().map(|t| t.dims().to_vec()), Some(vec![3 * width, 1]));

        assert!(max_abs_diff(&split.d_fake, &concat.d_fake)? < 1e-4);
        assert_close(&split.d_real, &concat.d_real)?;
        assert_close(&split.dv_fake, &concat.dv_fake)?;
        assert_close(&split.dv_real, &concat.dv_real)?;
        assert_close(&split.generated, &concat.generated)?;
    }
    Ok(())
}

#[test]
fn test_generator_only_step_returns_fake_scores() -> Result<()> {
    let config = config(false);
    let mut gd = build(&config)?;
    let z = Tensor::randn(0f32, 1.0, (3, gd.generator().dim_z()), &Device::Cpu)?;
    let y = Tensor::new(&[1u32, 2, 3], &Device::Cpu)?;
    let scores = gd.step(&z, &y, None, StepMode { train_g: true, ..Default::default() })?;
    assert_eq!(scores.d_fake.dims(), &[9, 1]);
    assert!(scores.d_real.is_none() && scores.dv_real.is_none());
    assert!(scores.generated.is_none());
    Ok(())
}

#[test]
fn test_real_clip_length_must_match() -> Result<()> {
    let config = config(false);
    let mut gd = build(&config)?;
    let device = Device::Cpu;
    let z = Tensor::randn(0f32, 1.0, (1, gd.generator().dim_z()), &device)?;
    let y = Tensor::new(&[0u32], &device)?;
    let real = Tensor::zeros((1, 4, 3, 32, 32), DType::F32, &device)?;
    assert!(gd.step(&z, &y, Some((&real, &y)), StepMode::default()).is_err());
    Ok(())
}

#[test]
fn test_full_width_sampling_is_a_permutation() -> Result<()> {
    let device = Device::Cpu;
    let (b, t) = (3, 5);
    let data: Vec<f32> = (0..b * t).map(|i| i as f32).collect();
    let clips = Tensor::from_vec(data, (b, t, 1), &device)?;
    let labels = Tensor::new(&[7u32, 8, 9], &device)?;
    let mut sampler = FrameSampler::new(t, 1);
    let (frames, frame_labels) = sampler.sample(&clips, &labels)?;
    assert_eq!(frames.dims(), &[b, t, 1]);
    for clip in 0..b {
        let mut got: Vec<f32> = frames.i(clip)?.flatten_all()?.to_vec1()?;
        got.sort_by(f32::total_cmp);
        let expected: Vec<f32> = (0..t).map(|f| (clip * t + f) as f32).collect();
        assert_eq!(got, expected);
        assert_eq!(frame_labels.i(clip)?.to_vec1::<u32>()?, vec![7 + clip as u32; t]);
    }
    Ok(())
}

#[test]
fn test_single_frame_sampling_is_seeded() -> Result<()> {
    let device = Device::Cpu;
    let clips = Tensor::arange(0f32, 24.0, &device)?.reshape((4, 6, 1))?;
    let labels = Tensor::new(&[0u32, 1, 2, 3], &device)?;
    let pick = |seed| -> Result<Vec<f32>> {
        let (frames, _) = FrameSampler::new(1, seed).sample(&clips, &labels)?;
        Ok(frames.flatten_all()?.to_vec1()?)
    };
    assert_eq!(pick(3)?, pick(3)?);
    let picked = pick(3)?;
    for (clip, v) in picked.iter().enumerate() {
        let frame = *v as usize - clip * 6;
        assert!(frame < 6);
    }
    Ok(())
}
