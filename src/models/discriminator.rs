//! Per-frame projection discriminator.

use candle_core::{DType, Module, Result as CandleResult, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder, embedding, linear};
use tracing::debug;

use crate::arch::{ArchSpec, Architecture, image_discriminator_arch};
use crate::common::{DBlock, Initializable, SelfAttention2d};
use crate::config::VganConfig;
use crate::error::{Result, VganError};

use super::check_class_ids;

#[derive(Debug, Clone)]
struct DiscriminatorStage {
    block: DBlock,
    attention: Option<SelfAttention2d>,
}

impl Initializable for DiscriminatorStage {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.block.collect_weights(out);
        self.attention.collect_weights(out);
    }
}

/// Projection head shared by both discriminators:
/// `score = linear(h) + sum(embed(y) * h)`.
#[derive(Debug, Clone)]
pub(crate) struct ProjectionHead {
    linear: Linear,
    embed: Embedding,
}

impl ProjectionHead {
    pub(crate) fn new(features: usize, n_classes: usize, vb: VarBuilder) -> CandleResult<Self> {
        Ok(Self {
            linear: linear(features, 1, vb.pp("linear"))?,
            embed: embedding(n_classes, features, vb.pp("embed"))?,
        })
    }

    /// h: (N, F), y: (N,) -> (N, 1)
    pub(crate) fn forward(&self, h: &Tensor, y: &Tensor) -> CandleResult<Tensor> {
        let out = self.linear.forward(h)?;
        let proj = (self.embed.forward(y)? * h)?.sum_keepdim(1)?;
        out + proj
    }
}

impl Initializable for ProjectionHead {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.linear.collect_weights(out);
        self.embed.collect_weights(out);
    }
}

#[derive(Debug, Clone)]
pub struct ImageDiscriminator {
    arch: Architecture,
    stages: Vec<DiscriminatorStage>,
    head: ProjectionHead,
    n_classes: usize,
}

impl ImageDiscriminator {
    pub fn new(config: &VganConfig, vb: VarBuilder) -> Result<Self> {
        let spec = ArchSpec {
            ch: config.d_ch,
            attention: &config.d_attn,
            kernel: &config.d_kernel,
            dilation: &config.d_dilation,
        };
        let arch = image_discriminator_arch(config.resolution, &spec)?;
        let mut stages = Vec::with_capacity(arch.num_stages());
        for (index, stage) in arch.stages().iter().enumerate() {
            let vb_stage = vb.pp(format!("blocks.{index}"));
            let block = DBlock::new(stage, config.d_wide, index > 0, vb_stage.pp("block"))?;
            let attention = if stage.attention {
                debug!(resolution = stage.resolution, "attention in D");
                Some(SelfAttention2d::new(stage.out_channels, vb_stage.pp("attn"))?)
            } else {
                None
            };
            stages.push(DiscriminatorStage { block, attention });
        }
        let c_last = arch.stages()[arch.num_stages() - 1].out_channels;
        let head = ProjectionHead::new(c_last, config.n_classes, vb)?;
        Ok(Self {
            arch,
            stages,
            head,
            n_classes: config.n_classes,
        })
    }

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    /// x: `(N, 3, H, W)` frames, y: `(N,)` class ids -> `(N, 1)` scores.
    pub fn score_frame(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (n, c, h, w) = x.dims4()?;
        let res = self.arch.resolution();
        if (c, h, w) != (3, res, res) {
            return Err(VganError::shape("frame batch", [n, 3, res, res], x.dims()));
        }
        if y.dims() != [n] {
            return Err(VganError::shape("frame labels", [n], y.dims()));
        }
        check_class_ids(y, self.n_classes)?;
        Ok(self.forward_unchecked(x, &y.to_dtype(DType::U32)?)?)
    }

    fn forward_unchecked(&self, x: &Tensor, y: &Tensor) -> CandleResult<Tensor> {
        let mut h = x.clone();
        for stage in &self.stages {
            h = stage.block.forward(&h)?;
            if let Some(attn) = &stage.attention {
                h = attn.forward(&h)?;
            }
        }
        let pooled = h.relu()?.sum((2, 3))?;
        self.head.forward(&pooled, y)
    }
}

impl Initializable for ImageDiscriminator {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.stages.collect_weights(out);
        self.head.collect_weights(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn config() -> VganConfig {
        VganConfig {
            resolution: 32,
            d_ch: 2,
            d_attn: "8".into(),
            n_classes: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_scores_one_value_per_frame() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let d = ImageDiscriminator::new(&config(), vb)?;
        assert_eq!(d.arch().attention_resolutions(), vec![8, 8, 8]);
        let x = Tensor::randn(0f32, 1.0, (5, 3, 32, 32), &device)?;
        let y = Tensor::new(&[0u32, 1, 2, 0, 1], &device)?;
        assert_eq!(d.score_frame(&x, &y)?.dims(), &[5, 1]);
        Ok(())
    }

    #[test]
    fn test_wrong_resolution_is_shape_mismatch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let d = ImageDiscriminator::new(&config(), vb)?;
        let x = Tensor::zeros((2, 3, 16, 16), DType::F32, &device)?;
        let y = Tensor::new(&[0u32, 1], &device)?;
        assert!(matches!(d.score_frame(&x, &y), Err(VganError::ShapeMismatch { .. })));
        let x = Tensor::zeros((2, 3, 32, 32), DType::F32, &device)?;
        let y = Tensor::new(&[0u32, 7], &device)?;
        assert!(matches!(d.score_frame(&x, &y), Err(VganError::ShapeMismatch { .. })));
        Ok(())
    }
}
