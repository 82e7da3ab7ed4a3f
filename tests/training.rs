//! Training step, checkpointing and evaluation.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_vgan::common::{is_running_stat, named_vars};
use candle_vgan::config::{BestMetric, LossKind, SumSequence};
use candle_vgan::train::{
    CheckpointStore, InceptionMetrics, InceptionScores, RecordingSink, SafetensorsCheckpoint, evaluate,
    save_and_sample,
};
use candle_vgan::utils::Pcg32;
use candle_vgan::{ExecutionContext, StateDict, Trainer, VganConfig, VganError};

fn tiny_config() -> VganConfig {
    VganConfig {
        resolution: 32,
        time_steps: 4,
        frames_per_clip: 2,
        n_classes: 3,
        g_ch: 2,
        d_ch: 2,
        dim_z: 16,
        g_attn: "16".into(),
        d_attn: "".into(),
        batch_size: 2,
        num_d_steps: 1,
        num_d_accumulations: 1,
        num_g_accumulations: 1,
        g_ortho: 1e-4,
        d_ortho: 1e-4,
        avg_pixel_loss: true,
        ema: true,
        use_ema: true,
        ema_start: 0,
        ema_decay: 0.9,
        log_results_every: 1,
        seed: 17,
        ..Default::default()
    }
}

fn real_batch(config: &VganConfig, seed: u64) -> Result<(Tensor, Tensor)> {
    let n = config.real_clips_per_iteration();
    let mut rng = Pcg32::new(seed, 5);
    let shape = (n, config.time_steps, 3, config.resolution, config.resolution);
    let clips = rng.randn(shape, &Device::Cpu)?.tanh()?;
    let labels: Vec<u32> = (0..n).map(|i| (i % config.n_classes) as u32).collect();
    Ok((clips, Tensor::from_vec(labels, n, &Device::Cpu)?))
}

#[test]
fn test_single_step_is_deterministic() -> Result<()> {
    let config = tiny_config();
    let (real, labels) = real_batch(&config, 1)?;
    let run = || -> Result<_> {
        let mut trainer = Trainer::new(config.clone(), ExecutionContext::cpu())?;
        let mut sink = RecordingSink::default();
        let metrics = trainer.train_step(&real, &labels, 1, &mut sink)?;
        Ok((metrics, sink))
    };
    let (a, sink) = run()?;
    let (b, _) = run()?;
    assert_eq!(a, b);
    assert!(a.g_loss.is_finite() && a.d_loss_real.is_finite() && a.d_loss_fake.is_finite());
    assert!(a.dv_loss_real.is_some() && a.dv_loss_fake.is_some());

    assert_eq!(sink.scalar("Loss/G_loss"), vec![f64::from(a.g_loss)]);
    assert_eq!(sink.scalar("Data/real_R").len(), 1);
    assert!(sink.videos.iter().any(|(name, dims, _)| name == "Videos/fake" && dims == &[2, 4, 3, 32, 32]));
    assert!(sink.texts.iter().any(|(name, text, _)| name == "Labels/real" && text == "0, 1"));
    assert_eq!(sink.scalar("Gradient/G_grad_l1").len(), 1);
    assert!(!sink.scalar("Gradient/G_grad_gates").is_empty());
    Ok(())
}

#[test]
fn test_accumulation_and_sum_policies_run() -> Result<()> {
    let config = VganConfig {
        num_d_steps: 2,
        num_d_accumulations: 2,
        num_g_accumulations: 2,
        g_batch_size: 3,
        loss: LossKind::Dcgan,
        d_hinge_loss_sum: SumSequence::Before,
        dv_hinge_loss_sum: SumSequence::Before,
        t_into_b: true,
        time_steps: 6,
        split_d: true,
        ema: false,
        use_ema: false,
        ..tiny_config()
    };
    let (real, labels) = real_batch(&config, 2)?;
    assert_eq!(real.dim(0)?, 8);
    let mut trainer = Trainer::new(config, ExecutionContext::cpu())?;
    let mut sink = RecordingSink::default();
    let first = trainer.train_step(&real, &labels, 1, &mut sink)?;
    let second = trainer.train_step(&real, &labels, 2, &mut sink)?;
    assert!(first.g_loss.is_finite() && second.g_loss.is_finite());
    // two D optimizer steps per iteration
    assert_eq!(sink.scalar("Gradient/D_grad_l1").len(), 4);
    assert_eq!(sink.scalar("Loss/D_loss_real").len(), 2);
    Ok(())
}

#[test]
fn test_wrong_real_batch_size_is_configuration_error() -> Result<()> {
    let config = tiny_config();
    let mut trainer = Trainer::new(config.clone(), ExecutionContext::cpu())?;
    let real = Tensor::zeros((3, 4, 3, 32, 32), DType::F32, &Device::Cpu)?;
    let labels = Tensor::zeros(3, DType::U32, &Device::Cpu)?;
    let err = trainer.train_step(&real, &labels, 1, &mut RecordingSink::default());
    assert!(matches!(err, Err(VganError::Configuration(_))));
    Ok(())
}

struct FixedScores(Vec<InceptionScores>);

impl InceptionMetrics for FixedScores {
    fn compute(
        &mut self,
        sample: &mut dyn FnMut() -> candle_vgan::Result<(Tensor, Tensor)>,
        _num_images: usize,
        _num_splits: usize,
    ) -> candle_vgan::Result<InceptionScores> {
        let (video, labels) = sample()?;
        assert_eq!(video.dims()[1..], [4, 3, 32, 32]);
        assert_eq!(labels.dims(), &[video.dims()[0]]);
        Ok(self.0.remove(0))
    }
}

#[test]
fn test_save_evaluate_and_resume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = VganConfig {
        num_save_copies: 2,
        num_best_copies: 2,
        which_best: BestMetric::Fid,
        ..tiny_config()
    };
    let mut trainer = Trainer::new(config.clone(), ExecutionContext::cpu())?;
    let mut store = SafetensorsCheckpoint::new(dir.path(), "run");
    let mut sink = RecordingSink::default();
    let mut state = StateDict::new(config.clone());
    state.itr = 5;

    save_and_sample(&trainer, &mut state, &mut store, &mut sink)?;
    save_and_sample(&trainer, &mut state, &mut store, &mut sink)?;
    assert_eq!(state.save_num, 0);
    for name in ["G", "D", "Dv", "G_ema", "G_copy0", "G_copy1", "state_dict"] {
        let ext = if name == "state_dict" { "json" } else { "safetensors" };
        assert!(dir.path().join(format!("run/{name}.{ext}")).exists(), "{name}");
    }
    assert_eq!(sink.videos.len(), 2);

    let mut metrics = FixedScores(vec![
        InceptionScores { is_mean: 2.0, is_std: 0.1, fid: 80.0 },
        InceptionScores { is_mean: 3.0, is_std: 0.1, fid: 90.0 },
    ]);
    evaluate(&mut trainer, &mut state, &mut metrics, &mut store, &mut sink)?;
    assert_eq!(state.best_fid, 80.0);
    assert_eq!(state.save_best_num, 1);
    assert!(dir.path().join("run/G_best0.safetensors").exists());

    // worse FID: no new best copy, but IS still tracked
    evaluate(&mut trainer, &mut state, &mut metrics, &mut store, &mut sink)?;
    assert_eq!(state.best_fid, 80.0);
    assert_eq!(state.best_is, 3.0);
    assert_eq!(state.save_best_num, 1);
    assert!(!dir.path().join("run/G_best1.safetensors").exists());

    let resumed = Trainer::new(VganConfig { seed: 99, ..config }, ExecutionContext::cpu())?;
    let saved = trainable_weights(&trainer)?;
    assert_ne!(saved, trainable_weights(&resumed)?);
    let loaded = store.load_weights(&resumed.checkpoint_models(), None)?;
    assert_eq!(loaded.itr, 5);
    assert_eq!(saved, trainable_weights(&resumed)?);
    Ok(())
}

/// Every trainable weight of every checkpointed model, by qualified name.
fn trainable_weights(trainer: &Trainer) -> Result<Vec<(String, Vec<f32>)>> {
    let mut out = Vec::new();
    for (model, vars) in trainer.checkpoint_models() {
        for (name, var) in named_vars(vars)? {
            if is_running_stat(&name) {
                continue;
            }
            out.push((format!("{model}.{name}"), var.flatten_all()?.to_vec1::<f32>()?));
        }
    }
    Ok(out)
}

#[test]
fn test_pixel_loss_waits_for_kick_in() -> Result<()> {
    let config = VganConfig {
        pixel_loss_kicksin: 5,
        avg_pixel_loss_weight: 0.5,
        ..tiny_config()
    };
    let (real, labels) = real_batch(&config, 3)?;
    let mut trainer = Trainer::new(config, ExecutionContext::cpu())?;
    let mut sink = RecordingSink::default();
    let early = trainer.train_step(&real, &labels, 1, &mut sink)?;
    assert_eq!(early.pixel_loss, 0.0);
    let late = trainer.train_step(&real, &labels, 5, &mut sink)?;
    assert!(late.pixel_loss > 0.0);
    assert_eq!(sink.scalar("Loss/pixel_loss"), vec![0.0, f64::from(late.pixel_loss)]);
    Ok(())
}

#[test]
fn test_zero_generator_gradient_is_reported_not_fatal() -> Result<()> {
    let config = VganConfig {
        d_loss_weight: 0.0,
        video_discriminator: false,
        avg_pixel_loss: false,
        g_ortho: 0.0,
        ema: false,
        use_ema: false,
        ..tiny_config()
    };
    let (real, labels) = real_batch(&config, 4)?;
    let mut trainer = Trainer::new(config, ExecutionContext::cpu())?;
    let mut sink = RecordingSink::default();
    let metrics = trainer.train_step(&real, &labels, 1, &mut sink)?;
    assert!(metrics.dv_loss_real.is_none());
    assert_eq!(sink.scalar("Gradient/G_grad_l1"), vec![0.0]);
    assert!(sink.texts.iter().any(|(name, text, _)| name == "Warnings" && text.starts_with("G ")));
    assert!(sink.scalar("Gradient/D_grad_l1")[0] > 0.0);
    Ok(())
}
