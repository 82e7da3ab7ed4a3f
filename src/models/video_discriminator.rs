//! Clip-level projection discriminator.
//!
//! Input clips are average-pooled by 2 spatially, pass through volumetric
//! stages that halve space and time, then continue as a frame stack
//! through 2D residual stages. The surviving temporal width is either
//! folded into the feature axis (one score per clip) or kept in the batch
//! axis (one score per surviving time step).

use candle_core::{DType, Module, Result as CandleResult, Tensor};
use candle_nn::VarBuilder;

use crate::arch::{ArchSpec, Architecture, video_discriminator_arch};
use crate::common::{BasicBlock3d, Conv3dBlock, DBlock, Initializable};
use crate::config::VganConfig;
use crate::error::{Result, VganError};

use super::check_class_ids;
use super::discriminator::ProjectionHead;

#[derive(Debug, Clone)]
enum VolumetricStage {
    Residual(BasicBlock3d),
    Plain(Conv3dBlock),
}

impl VolumetricStage {
    fn output_len(&self, t: usize) -> usize {
        match self {
            Self::Residual(b) => b.output_len(t),
            Self::Plain(b) => b.output_len(t),
        }
    }
}

impl Module for VolumetricStage {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        match self {
            Self::Residual(b) => b.forward(x),
            Self::Plain(b) => b.forward(x),
        }
    }
}

impl Initializable for VolumetricStage {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        match self {
            Self::Residual(b) => b.collect_weights(out),
            Self::Plain(b) => b.collect_weights(out),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoDiscriminator {
    arch: Architecture,
    volumetric: Vec<VolumetricStage>,
    planar: Vec<DBlock>,
    head: ProjectionHead,
    time_steps: usize,
    reduced_t: usize,
    t_into_b: bool,
    n_classes: usize,
}

impl VideoDiscriminator {
    pub fn new(config: &VganConfig, vb: VarBuilder) -> Result<Self> {
        let spec = ArchSpec {
            ch: config.d_ch,
            attention: "",
            kernel: &config.d_kernel,
            dilation: &config.d_dilation,
        };
        let arch = video_discriminator_arch(config.resolution, &spec)?;

        let mut volumetric = Vec::new();
        let mut planar = Vec::new();
        for (index, stage) in arch.stages().iter().enumerate() {
            let vb_stage = vb.pp(format!("blocks.{index}"));
            if stage.volumetric {
                volumetric.push(if config.dv_residual {
                    VolumetricStage::Residual(BasicBlock3d::new(stage, vb_stage)?)
                } else {
                    VolumetricStage::Plain(Conv3dBlock::new(stage, vb_stage)?)
                });
            } else {
                planar.push(DBlock::new(stage, config.d_wide, true, vb_stage)?);
            }
        }

        let reduced_t = volumetric
            .iter()
            .fold(config.time_steps, |t, stage| stage.output_len(t));
        let c_last = arch.stages()[arch.num_stages() - 1].out_channels;
        let features = if config.t_into_b { c_last } else { c_last * reduced_t };
        let head = ProjectionHead::new(features, config.n_classes, vb)?;
        Ok(Self {
            arch,
            volumetric,
            planar,
            head,
            time_steps: config.time_steps,
            reduced_t,
            t_into_b: config.t_into_b,
            n_classes: config.n_classes,
        })
    }

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    /// Temporal width left after the volumetric stages.
    pub fn reduced_t(&self) -> usize {
        self.reduced_t
    }

    pub fn t_into_b(&self) -> bool {
        self.t_into_b
    }

    /// x: `(B, T, 3, H, W)`. y: `(B,)`, or `(B * reduced_t,)` when time is
    /// kept in the batch axis.
    ///
    /// Returns the scores (`(B, 1)` or `(B * reduced_t, 1)`) and the
    /// effective temporal width (1 when folded).
    pub fn score_clip(&self, x: &Tensor, y: &Tensor) -> Result<(Tensor, usize)> {
        let (b, t, c, h, w) = x.dims5()?;
        let res = self.arch.resolution();
        if (t, c, h, w) != (self.time_steps, 3, res, res) {
            return Err(VganError::shape("clip batch", [b, self.time_steps, 3, res, res], x.dims()));
        }
        let (labels, width) = if self.t_into_b {
            (b * self.reduced_t, self.reduced_t)
        } else {
            (b, 1)
        };
        if y.dims() != [labels] {
            return Err(VganError::shape("clip labels", [labels], y.dims()));
        }
        check_class_ids(y, self.n_classes)?;
        let scores = self.forward_unchecked(x, &y.to_dtype(DType::U32)?)?;
        Ok((scores, width))
    }

    fn forward_unchecked(&self, x: &Tensor, y: &Tensor) -> CandleResult<Tensor> {
        let (b, t, c, h, w) = x.dims5()?;
        let pooled = x.reshape((b * t, c, h, w))?.avg_pool2d(2)?;
        let mut v = pooled
            .reshape((b, t, c, h / 2, w / 2))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?;
        for stage in &self.volumetric {
            v = stage.forward(&v)?;
        }

        // (B, C, T*, h, w) -> (B * T*, C, h, w)
        let (_, ch, tr, hh, ww) = v.dims5()?;
        let mut frames = v.permute((0, 2, 1, 3, 4))?.reshape((b * tr, ch, hh, ww))?;
        for block in &self.planar {
            frames = block.forward(&frames)?;
        }
        let features = frames.relu()?.sum((2, 3))?;
        let features = if self.t_into_b {
            features
        } else {
            let f = features.dim(1)?;
            features.reshape((b, tr * f))?
        };
        self.head.forward(&features, y)
    }
}

impl Initializable for VideoDiscriminator {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.volumetric.collect_weights(out);
        self.planar.collect_weights(out);
        self.head.collect_weights(out);
    }
}
