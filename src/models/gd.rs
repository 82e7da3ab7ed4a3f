//! Generator + discriminators composed behind a single entry point.

use candle_core::{DType, Tensor};

use crate::error::{Result, VganError};
use crate::utils::{FrameSampler, duplicate_labels};

use super::{Generator, ImageDiscriminator, VideoDiscriminator};

/// Scores produced by one [`GD::step`].
#[derive(Debug, Clone)]
pub struct DiscriminatorScores {
    /// `(B * k, 1)` image-discriminator scores on the sampled fake frames.
    pub d_fake: Tensor,
    pub d_real: Option<Tensor>,
    /// Video-discriminator scores; `(B, 1)` or `(B * reduced_t, 1)`.
    pub dv_fake: Option<Tensor>,
    pub dv_real: Option<Tensor>,
    /// The generated clip `(B, T, 3, H, W)` when requested.
    pub generated: Option<Tensor>,
    /// Frames sampled per clip for the image discriminator.
    pub frames_per_clip: usize,
    /// Effective temporal width of the video scores (1 when folded).
    pub video_width: usize,
}

/// Options for a single [`GD::step`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StepMode {
    /// Let gradients reach the generator.
    pub train_g: bool,
    pub return_generated: bool,
    /// Score fake and real inputs in separate forward passes.
    pub split_d: bool,
}

pub struct GD {
    g: Generator,
    d: ImageDiscriminator,
    dv: Option<VideoDiscriminator>,
    sampler: FrameSampler,
}

impl GD {
    pub fn new(
        g: Generator,
        d: ImageDiscriminator,
        dv: Option<VideoDiscriminator>,
        sampler: FrameSampler,
    ) -> Self {
        Self { g, d, dv, sampler }
    }

    pub fn generator(&self) -> &Generator {
        &self.g
    }

    pub fn discriminator(&self) -> &ImageDiscriminator {
        &self.d
    }

    pub fn video_discriminator(&self) -> Option<&VideoDiscriminator> {
        self.dv.as_ref()
    }

    pub fn sampler_mut(&mut self) -> &mut FrameSampler {
        &mut self.sampler
    }

    /// Generate from `(z, y_fake)`, then score the fake clips and, when given,
    /// the real ones with every attached discriminator.
    pub fn step(
        &mut self,
        z: &Tensor,
        y_fake: &Tensor,
        real: Option<(&Tensor, &Tensor)>,
        mode: StepMode,
    ) -> Result<DiscriminatorScores> {
        let y_fake = y_fake.to_dtype(DType::U32)?;
        let y_embed = self.g.embed_labels(&y_fake)?;
        let mut fake = self.g.generate(z, &y_embed)?;
        if !mode.train_g {
            fake = fake.detach();
        }

        let real = match real {
            Some((x, y)) => {
                let (_, t, c, h, w) = fake.dims5()?;
                let (b, ..) = x.dims5()?;
                if x.dims() != [b, t, c, h, w] {
                    return Err(VganError::shape("real clip batch", [b, t, c, h, w], x.dims()));
                }
                Some((x.clone(), y.to_dtype(DType::U32)?))
            }
            None => None,
        };

        let k = self.sampler.width();
        let fake_frames = self.sample_frames(&fake, &y_fake)?;
        let real_frames = match &real {
            Some((x, y)) => Some(self.sample_frames(x, y)?),
            None => None,
        };

        let (d_fake, d_real) = if mode.split_d {
            let d_fake = self.d.score_frame(&fake_frames.0, &fake_frames.1)?;
            let d_real = match &real_frames {
                Some((x, y)) => Some(self.d.score_frame(x, y)?),
                None => None,
            };
            (d_fake, d_real)
        } else {
            concat_scores(&fake_frames, real_frames.as_ref(), |x, y| self.d.score_frame(x, y))?
        };

        let (dv_fake, dv_real, video_width) = match &self.dv {
            Some(dv) => {
                let labels = |y: &Tensor| -> Result<Tensor> {
                    if dv.t_into_b() {
                        Ok(duplicate_labels(y, dv.reduced_t())?)
                    } else {
                        Ok(y.clone())
                    }
                };
                let fake_in = (fake.clone(), labels(&y_fake)?);
                let real_in = match &real {
                    Some((x, y)) => Some((x.clone(), labels(y)?)),
                    None => None,
                };
                let width = if dv.t_into_b() { dv.reduced_t() } else { 1 };
                let score = |x: &Tensor, y: &Tensor| dv.score_clip(x, y).map(|(s, _)| s);
                let (f, r) = if mode.split_d {
                    let f = score(&fake_in.0, &fake_in.1)?;
                    let r = match &real_in {
                        Some((x, y)) => Some(score(x, y)?),
                        None => None,
                    };
                    (f, r)
                } else {
                    concat_scores(&fake_in, real_in.as_ref(), score)?
                };
                (Some(f), r, width)
            }
            None => (None, None, 1),
        };

        Ok(DiscriminatorScores {
            d_fake,
            d_real,
            dv_fake,
            dv_real,
            generated: mode.return_generated.then_some(fake),
            frames_per_clip: k,
            video_width,
        })
    }

    /// `(B, T, ...)` clips -> `(B * k, ...)` frames and `(B * k,)` labels.
    fn sample_frames(&mut self, clips: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
        let (frames, labels) = self.sampler.sample(clips, labels)?;
        Ok((frames.flatten_to(1)?, labels.flatten_all()?))
    }
}

/// Score fake and real inputs in one batched pass and split the result at
/// the fake/real boundary.
fn concat_scores<F>(
    fake: &(Tensor, Tensor),
    real: Option<&(Tensor, Tensor)>,
    score: F,
) -> Result<(Tensor, Option<Tensor>)>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    let Some(real) = real else {
        return Ok((score(&fake.0, &fake.1)?, None));
    };
    let x = Tensor::cat(&[&fake.0, &real.0], 0)?;
    let y = Tensor::cat(&[&fake.1, &real.1], 0)?;
    let out = score(&x, &y)?;
    let n_fake = out.dim(0)? * fake.0.dim(0)? / x.dim(0)?;
    let n_real = out.dim(0)? - n_fake;
    Ok((out.narrow(0, 0, n_fake)?, Some(out.narrow(0, n_fake, n_real)?)))
}
