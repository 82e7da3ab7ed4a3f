//! One outer training iteration: D-phase, G-phase, EMA update.

use std::collections::HashSet;

use candle_core::{DType, Tensor, TensorId, Var, backprop::GradStore};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use tracing::{debug, info, warn};

use super::ema::Ema;
use super::losses::{AdversarialLoss, aggregate_frames, average_frames, mean_intensity, pixel_loss};
use super::ortho::apply_ortho;
use super::sinks::MetricsSink;
use crate::common::trainable_vars;
use crate::config::{ExecutionContext, VganConfig};
use crate::error::{Result, VganError};
use crate::models::{
    DiscriminatorScores, GD, Generator, ImageDiscriminator, StepMode, VideoDiscriminator, build_model,
};
use crate::utils::{FrameSampler, LatentSampler, Pcg32};

/// Loss values of one iteration (last micro-batch of each phase).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainMetrics {
    pub g_loss: f32,
    pub d_loss_real: f32,
    pub d_loss_fake: f32,
    pub dv_loss_real: Option<f32>,
    pub dv_loss_fake: Option<f32>,
    pub pixel_loss: f32,
}

impl TrainMetrics {
    fn named(&self) -> Vec<(&'static str, f32)> {
        let mut out = vec![
            ("Loss/G_loss", self.g_loss),
            ("Loss/D_loss_real", self.d_loss_real),
            ("Loss/D_loss_fake", self.d_loss_fake),
            ("Loss/pixel_loss", self.pixel_loss),
        ];
        if let Some(v) = self.dv_loss_real {
            out.push(("Loss/Dv_loss_real", v));
        }
        if let Some(v) = self.dv_loss_fake {
            out.push(("Loss/Dv_loss_fake", v));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DiscriminatorLosses {
    real: f32,
    fake: f32,
    video_real: Option<f32>,
    video_fake: Option<f32>,
}

/// An optimizer together with the parameters it owns.
struct Optimized {
    opt: AdamW,
    params: Vec<Var>,
}

impl Optimized {
    fn new(vars: &VarMap, lr: f64, beta1: f64, beta2: f64, eps: f64) -> Result<Self> {
        let params = trainable_vars(vars)?;
        let opt = AdamW::new(
            params.clone(),
            ParamsAdamW {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay: 0.0,
            },
        )?;
        Ok(Self { opt, params })
    }
}

struct EmaGenerator {
    g: Generator,
    vars: VarMap,
    ema: Ema,
}

/// Owns the networks, their optimizers and the latent stream.
pub struct Trainer {
    config: VganConfig,
    ctx: ExecutionContext,
    gd: GD,
    g_vars: VarMap,
    d_vars: VarMap,
    dv_vars: Option<VarMap>,
    g_opt: Optimized,
    d_opt: Optimized,
    dv_opt: Option<Optimized>,
    g_ortho_skip: HashSet<TensorId>,
    g_ema: Option<EmaGenerator>,
    latents: LatentSampler,
    eval_latents: LatentSampler,
    fixed: (Tensor, Tensor),
    loss: AdversarialLoss,
}

impl Trainer {
    pub fn new(config: VganConfig, ctx: ExecutionContext) -> Result<Self> {
        config.validate()?;
        let mut rng = Pcg32::stream(config.seed, 0x1417);

        let (g, g_vars) = build_model(&ctx, config.g_init_style()?, &mut rng, |vb| {
            Generator::new(&config, vb)
        })?;
        let (d, d_vars) = build_model(&ctx, config.d_init_style()?, &mut rng, |vb| {
            ImageDiscriminator::new(&config, vb)
        })?;
        let (dv, dv_vars) = if config.video_discriminator {
            let (dv, vars) = build_model(&ctx, config.d_init_style()?, &mut rng, |vb| {
                VideoDiscriminator::new(&config, vb)
            })?;
            (Some(dv), Some(vars))
        } else {
            (None, None)
        };
        info!(
            g_params = param_count(&g_vars),
            d_params = param_count(&d_vars),
            dv_params = dv_vars.as_ref().map(param_count).unwrap_or(0),
            "built networks"
        );

        let g_ema = if config.ema {
            let (g_ema, vars) = build_model(&ctx, config.g_init_style()?, &mut rng, |vb| {
                Generator::new(&config, vb)
            })?;
            let ema = Ema::new(&g_vars, &vars, config.ema_decay, config.ema_start)?;
            Some(EmaGenerator { g: g_ema, vars, ema })
        } else {
            None
        };

        let g_opt = Optimized::new(&g_vars, config.g_lr, config.g_b1, config.g_b2, config.adam_eps)?;
        let d_opt = Optimized::new(&d_vars, config.d_lr, config.d_b1, config.d_b2, config.adam_eps)?;
        let dv_opt = match &dv_vars {
            Some(vars) => Some(Optimized::new(vars, config.d_lr, config.d_b1, config.d_b2, config.adam_eps)?),
            None => None,
        };

        let g_ortho_skip = [g.shared().embeddings().id()].into_iter().collect();
        let latents = LatentSampler::new(g.dim_z(), config.n_classes, config.z_var, config.seed);
        let mut eval_latents =
            LatentSampler::new(g.dim_z(), config.n_classes, config.z_var, config.seed.wrapping_add(1));
        let fixed = eval_latents.sample(config.effective_g_batch_size(), &ctx.device)?;
        let sampler = FrameSampler::new(config.frames_per_clip, config.seed);

        Ok(Self {
            loss: AdversarialLoss(config.loss),
            gd: GD::new(g, d, dv, sampler),
            config,
            ctx,
            g_vars,
            d_vars,
            dv_vars,
            g_opt,
            d_opt,
            dv_opt,
            g_ortho_skip,
            g_ema,
            latents,
            eval_latents,
            fixed,
        })
    }

    pub fn config(&self) -> &VganConfig {
        &self.config
    }

    pub fn gd(&self) -> &GD {
        &self.gd
    }

    /// Models to persist, by checkpoint name.
    pub fn checkpoint_models(&self) -> Vec<(&'static str, &VarMap)> {
        let mut models = vec![("G", &self.g_vars), ("D", &self.d_vars)];
        if let Some(vars) = &self.dv_vars {
            models.push(("Dv", vars));
        }
        if let Some(ema) = &self.g_ema {
            models.push(("G_ema", &ema.vars));
        }
        models
    }

    /// The generator used for sampling: the EMA copy when configured.
    fn sampling_generator(&self) -> &Generator {
        match &self.g_ema {
            Some(ema) if self.config.use_ema => &ema.g,
            _ => self.gd.generator(),
        }
    }

    fn render(&self, g: &Generator, z: &Tensor, y: &Tensor) -> Result<Tensor> {
        let z = z.to_dtype(self.ctx.dtype)?;
        let video = g.generate(&z, &g.embed_labels(y)?)?;
        Ok(video.detach())
    }

    /// Draw `batch` fresh clips `(B, T, 3, H, W)` and their labels.
    pub fn sample(&mut self, batch: usize) -> Result<(Tensor, Tensor)> {
        let (z, y) = self.eval_latents.sample(batch, &self.ctx.device)?;
        let video = self.render(self.sampling_generator(), &z, &y)?;
        Ok((video, y))
    }

    /// Clips generated from the noise fixed at construction.
    pub fn sample_fixed(&self) -> Result<(Tensor, Tensor)> {
        let (z, y) = &self.fixed;
        let video = self.render(self.sampling_generator(), z, y)?;
        Ok((video, y.clone()))
    }

    fn sample_latents(&mut self, batch: usize) -> Result<(Tensor, Tensor)> {
        let (z, y) = self.latents.sample(batch, &self.ctx.device)?;
        Ok((z.to_dtype(self.ctx.dtype)?, y))
    }

    fn check_real_batch(&self, real: &Tensor, labels: &Tensor) -> Result<()> {
        let expected = self.config.real_clips_per_iteration();
        let (n, t, c, h, w) = real.dims5()?;
        if n != expected {
            return Err(VganError::config(format!(
                "real batch holds {n} clips, expected batch_size * num_d_steps * num_d_accumulations = {expected}"
            )));
        }
        let res = self.config.resolution;
        if (t, c, h, w) != (self.config.time_steps, 3, res, res) {
            return Err(VganError::shape("real clip batch", [n, self.config.time_steps, 3, res, res], real.dims()));
        }
        if labels.dims() != [n] {
            return Err(VganError::shape("real labels", [n], labels.dims()));
        }
        Ok(())
    }

    fn discriminator_loss(&self, scores: &DiscriminatorScores) -> Result<(Tensor, DiscriminatorLosses)> {
        let d_real = scores
            .d_real
            .as_ref()
            .ok_or_else(|| VganError::config("discriminator phase ran without real clips"))?;
        let k = scores.frames_per_clip;
        let policy = self.config.d_hinge_loss_sum;
        let (real, fake) = self.loss.discriminator(
            &aggregate_frames(&scores.d_fake, k, policy)?,
            &aggregate_frames(d_real, k, policy)?,
        )?;
        let mut losses = DiscriminatorLosses {
            real: value(&real)?,
            fake: value(&fake)?,
            ..Default::default()
        };
        let mut total = (real + fake)?;
        if let (Some(dv_fake), Some(dv_real)) = (&scores.dv_fake, &scores.dv_real) {
            let width = scores.video_width;
            let policy = self.config.dv_hinge_loss_sum;
            let (real, fake) = self.loss.discriminator(
                &aggregate_frames(dv_fake, width, policy)?,
                &aggregate_frames(dv_real, width, policy)?,
            )?;
            losses.video_real = Some(value(&real)?);
            losses.video_fake = Some(value(&fake)?);
            total = ((total + real)? + fake)?;
        }
        let total = total.affine(1.0 / self.config.num_d_accumulations as f64, 0.0)?;
        Ok((total, losses))
    }

    /// Run one outer iteration on `real` clips `(N, T, 3, H, W)` in `[-1, 1]`
    /// with `labels` `(N,)`, where `N = batch_size * num_d_steps * num_d_accumulations`.
    pub fn train_step(
        &mut self,
        real: &Tensor,
        labels: &Tensor,
        itr: usize,
        sink: &mut dyn MetricsSink,
    ) -> Result<TrainMetrics> {
        self.check_real_batch(real, labels)?;
        let real = real.to_device(&self.ctx.device)?.to_dtype(self.ctx.dtype)?;
        let labels = labels.to_device(&self.ctx.device)?.to_dtype(DType::U32)?;
        let real_mean = mean_intensity(&real)?;
        let split_d = self.config.split_d;
        let bs = self.config.batch_size;

        // D-phase
        let mut d_losses = DiscriminatorLosses::default();
        let mut counter = 0;
        for _ in 0..self.config.num_d_steps {
            let mut acc: Option<GradStore> = None;
            for _ in 0..self.config.num_d_accumulations {
                let x = real.narrow(0, counter * bs, bs)?;
                let y = labels.narrow(0, counter * bs, bs)?;
                let (z, y_fake) = self.sample_latents(bs)?;
                let mode = StepMode {
                    train_g: false,
                    return_generated: false,
                    split_d,
                };
                let scores = self.gd.step(&z, &y_fake, Some((&x, &y)), mode)?;
                let (loss, losses) = self.discriminator_loss(&scores)?;
                d_losses = losses;
                let mut params = self.d_opt.params.clone();
                if let Some(dv) = &self.dv_opt {
                    params.extend(dv.params.iter().cloned());
                }
                acc = Some(accumulate(acc, loss.backward()?, &params)?);
                counter += 1;
            }
            let Some(mut grads) = acc else { continue };
            apply_ortho(&mut grads, &self.d_opt.params, self.config.d_ortho, &HashSet::new())?;
            self.report_gradients("D", &grads, &self.d_opt.params, itr, sink)?;
            self.d_opt.opt.step(&grads)?;
            if let Some(dv) = &mut self.dv_opt {
                apply_ortho(&mut grads, &dv.params, self.config.d_ortho, &HashSet::new())?;
                let l1 = grad_l1(&grads, &dv.params)?;
                report_l1("Dv", l1, itr, sink);
                dv.opt.step(&grads)?;
            }
        }

        // G-phase
        let g_batch = self.config.effective_g_batch_size();
        let n_g = self.config.num_g_accumulations as f64;
        let pixel_active = self.config.avg_pixel_loss && itr >= self.config.pixel_loss_kicksin;
        let log_now = self.config.log_results_every > 0 && itr % self.config.log_results_every == 0;
        let mut acc: Option<GradStore> = None;
        let mut g_loss_value = 0f32;
        let mut pixel_value = 0f32;
        let mut last_fake = None;
        for _ in 0..self.config.num_g_accumulations {
            let (z, y) = self.sample_latents(g_batch)?;
            let mode = StepMode {
                train_g: true,
                return_generated: pixel_active || log_now,
                split_d,
            };
            let scores = self.gd.step(&z, &y, None, mode)?;
            let mut loss =
                generator_loss(&self.loss, &scores, self.config.d_loss_weight)?.affine(1.0 / n_g, 0.0)?;
            if let (true, Some(fake)) = (pixel_active, &scores.generated) {
                let pixel =
                    pixel_loss(fake, &real_mean)?.affine(self.config.avg_pixel_loss_weight / n_g, 0.0)?;
                pixel_value = value(&pixel)?;
                loss = (loss + pixel)?;
            }
            g_loss_value = value(&loss)?;
            acc = Some(accumulate(acc, loss.backward()?, &self.g_opt.params)?);
            last_fake = scores.generated.map(|fake| (fake.detach(), y));
        }
        if let Some(mut grads) = acc {
            apply_ortho(&mut grads, &self.g_opt.params, self.config.g_ortho, &self.g_ortho_skip)?;
            self.report_gradients("G", &grads, &self.g_opt.params, itr, sink)?;
            self.report_probes(&grads, itr, sink)?;
            self.g_opt.opt.step(&grads)?;
        }

        if let Some(ema) = &self.g_ema {
            ema.ema.update(itr)?;
        }

        let metrics = TrainMetrics {
            g_loss: g_loss_value,
            d_loss_real: d_losses.real,
            d_loss_fake: d_losses.fake,
            dv_loss_real: d_losses.video_real,
            dv_loss_fake: d_losses.video_fake,
            pixel_loss: pixel_value,
        };
        for (name, v) in metrics.named() {
            if !v.is_finite() {
                warn!(itr, name, value = v, "non-finite loss");
                sink.log_text("Warnings", &format!("{name} is {v} at iteration {itr}"), itr);
            }
            sink.log_scalar(name, f64::from(v), itr);
        }
        debug!(itr, ?metrics, "train step");

        if log_now {
            let real_batch = real.narrow(0, 0, bs)?;
            let real_labels = labels.narrow(0, 0, bs)?;
            self.log_batch("real", &real_batch, &real_labels, itr, sink)?;
            if let Some((fake, y)) = &last_fake {
                self.log_batch("fake", fake, y, itr, sink)?;
            }
        }
        Ok(metrics)
    }

    fn report_gradients(
        &self,
        model: &str,
        grads: &GradStore,
        params: &[Var],
        itr: usize,
        sink: &mut dyn MetricsSink,
    ) -> Result<()> {
        let l1 = grad_l1(grads, params)?;
        report_l1(model, l1, itr, sink);
        Ok(())
    }

    fn report_probes(&self, grads: &GradStore, itr: usize, sink: &mut dyn MetricsSink) -> Result<()> {
        for (name, weight) in self.gd.generator().gradient_probes() {
            if let Some(g) = grads.get(&weight) {
                let l1 = g.abs()?.sum_all()?;
                sink.log_scalar(&format!("Gradient/G_grad_{name}"), f64::from(value(&l1)?), itr);
            }
            let magnitude = weight.abs()?.mean_all()?;
            sink.log_scalar(&format!("Weights/G_{name}"), f64::from(value(&magnitude)?), itr);
        }
        Ok(())
    }

    /// Mean RGB, the clips mapped to `[0, 1]`, and the label names.
    fn log_batch(&self, kind: &str, video: &Tensor, labels: &Tensor, itr: usize, sink: &mut dyn MetricsSink) -> Result<()> {
        let video01 = video.affine(0.5, 0.5)?;
        let means = video01
            .transpose(0, 2)?
            .flatten_from(1)?
            .mean(1)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        for (channel, mean) in ["R", "G", "B"].iter().zip(&means) {
            sink.log_scalar(&format!("Data/{kind}_{channel}"), f64::from(*mean), itr);
        }
        sink.log_video(&format!("Videos/{kind}"), &video01, itr);
        let names: Vec<String> = labels
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|id| self.config.class_name(id))
            .collect();
        sink.log_text(&format!("Labels/{kind}"), &names.join(", "), itr);
        Ok(())
    }
}

/// Generator adversarial loss: image scores averaged over the sampled frames
/// and video scores over their temporal width before the loss is applied.
fn generator_loss(loss: &AdversarialLoss, scores: &DiscriminatorScores, d_loss_weight: f64) -> Result<Tensor> {
    let d_fake = average_frames(&scores.d_fake, scores.frames_per_clip)?;
    let mut total = loss.generator(&d_fake)?.affine(d_loss_weight, 0.0)?;
    if let Some(dv_fake) = &scores.dv_fake {
        let dv_fake = average_frames(dv_fake, scores.video_width)?;
        total = (total + loss.generator(&dv_fake)?)?;
    }
    Ok(total)
}

fn param_count(vars: &VarMap) -> usize {
    vars.all_vars().iter().map(|v| v.elem_count()).sum()
}

fn value(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// Add the gradients of `params` from `grads` into `acc`.
fn accumulate(acc: Option<GradStore>, grads: GradStore, params: &[Var]) -> Result<GradStore> {
    let Some(mut acc) = acc else {
        return Ok(grads);
    };
    for param in params {
        let Some(g) = grads.get(param) else { continue };
        let sum = match acc.get(param) {
            Some(prev) => (prev + g)?,
            None => g.clone(),
        };
        acc.insert(param, sum);
    }
    Ok(acc)
}

fn grad_l1(grads: &GradStore, params: &[Var]) -> Result<f64> {
    let mut total = 0f64;
    for param in params {
        if let Some(g) = grads.get(param) {
            total += f64::from(value(&g.abs()?.sum_all()?)?);
        }
    }
    Ok(total)
}

fn report_l1(model: &str, l1: f64, itr: usize, sink: &mut dyn MetricsSink) {
    if l1 == 0.0 {
        warn!(itr, model, "all gradients are zero");
        sink.log_text("Warnings", &format!("{model} received no gradient at iteration {itr}"), itr);
    }
    sink.log_scalar(&format!("Gradient/{model}_grad_l1"), l1, itr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossKind;
    use candle_core::Device;

    fn scores(d_fake: &[f32], k: usize, dv_fake: Option<(&[f32], usize)>) -> candle_core::Result<DiscriminatorScores> {
        let device = Device::Cpu;
        let dv = match dv_fake {
            Some((v, _)) => Some(Tensor::from_slice(v, (v.len(), 1), &device)?),
            None => None,
        };
        Ok(DiscriminatorScores {
            d_fake: Tensor::from_slice(d_fake, (d_fake.len(), 1), &device)?,
            d_real: None,
            dv_fake: dv,
            dv_real: None,
            generated: None,
            frames_per_clip: k,
            video_width: dv_fake.map(|(_, w)| w).unwrap_or(1),
        })
    }

    #[test]
    fn test_dcgan_generator_loss_averages_before_softplus() -> anyhow::Result<()> {
        let ln2 = std::f32::consts::LN_2;
        let loss = AdversarialLoss(LossKind::Dcgan);

        // two clips, frames cancel out per clip
        let s = scores(&[2.0, -2.0, 1.0, -1.0], 2, None)?;
        let g = value(&generator_loss(&loss, &s, 0.5)?)?;
        assert!((g - 0.5 * ln2).abs() < 1e-6, "{g}");

        // video scores over a temporal width of 2 are averaged too
        let s = scores(&[3.0, -3.0], 2, Some((&[4.0, -4.0], 2)))?;
        let g = value(&generator_loss(&loss, &s, 1.0)?)?;
        assert!((g - 2.0 * ln2).abs() < 1e-6, "{g}");
        Ok(())
    }

    #[test]
    fn test_hinge_generator_loss_is_negative_mean() -> anyhow::Result<()> {
        let loss = AdversarialLoss(LossKind::Hinge);
        let s = scores(&[1.0, 3.0, -2.0, 2.0], 2, Some((&[0.5], 1)))?;
        let g = value(&generator_loss(&loss, &s, 2.0)?)?;
        assert!((g - (2.0 * -1.0 - 0.5)).abs() < 1e-6, "{g}");
        Ok(())
    }
}
