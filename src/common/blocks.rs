//! Residual blocks for the generator and both discriminators.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, conv2d};

use super::conv3d::{Conv3d, Conv3dConfig, conv3d};
use super::init::Initializable;
use super::norms::ConditionalBatchNorm;
use crate::arch::StageSpec;

fn stage_conv(in_channels: usize, out_channels: usize, stage: &StageSpec, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(
        in_channels,
        out_channels,
        stage.kernel_size,
        Conv2dConfig {
            padding: stage.padding(),
            dilation: stage.dilation,
            ..Default::default()
        },
        vb,
    )
}

fn upsample2(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    x.upsample_nearest2d(h * 2, w * 2)
}

/// Generator residual block: ccbn -> relu -> (up) -> conv -> ccbn -> relu -> conv,
/// plus a 1x1 shortcut when the block changes channels or resolution.
#[derive(Debug, Clone)]
pub struct GBlock {
    bn1: ConditionalBatchNorm,
    conv1: Conv2d,
    bn2: ConditionalBatchNorm,
    conv2: Conv2d,
    conv_sc: Option<Conv2d>,
    upsample: bool,
}

impl GBlock {
    pub fn new(stage: &StageSpec, cond_dim: usize, bn_eps: f64, vb: VarBuilder) -> Result<Self> {
        let (cin, cout) = (stage.in_channels, stage.out_channels);
        let conv_sc = if cin != cout || stage.resample {
            Some(conv2d(cin, cout, 1, Default::default(), vb.pp("conv_sc"))?)
        } else {
            None
        };
        Ok(Self {
            bn1: ConditionalBatchNorm::new(cin, cond_dim, bn_eps, vb.pp("bn1"))?,
            conv1: stage_conv(cin, cout, stage, vb.pp("conv1"))?,
            bn2: ConditionalBatchNorm::new(cout, cond_dim, bn_eps, vb.pp("bn2"))?,
            conv2: stage_conv(cout, cout, stage, vb.pp("conv2"))?,
            conv_sc,
            upsample: stage.resample,
        })
    }

    pub fn conv1(&self) -> &Conv2d {
        &self.conv1
    }

    /// x: (N, C, H, W), cond: (N, cond_dim)
    pub fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let mut h = self.bn1.forward(x, cond)?.relu()?;
        let mut x = x.clone();
        if self.upsample {
            h = upsample2(&h)?;
            x = upsample2(&x)?;
        }
        h = self.conv1.forward(&h)?;
        h = self.bn2.forward(&h, cond)?.relu()?;
        h = self.conv2.forward(&h)?;
        if let Some(sc) = &self.conv_sc {
            x = sc.forward(&x)?;
        }
        h + x
    }
}

impl Initializable for GBlock {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.bn1.collect_weights(out);
        self.conv1.collect_weights(out);
        self.bn2.collect_weights(out);
        self.conv2.collect_weights(out);
        self.conv_sc.collect_weights(out);
    }
}

/// Discriminator residual block with optional pre-activation and average-pool
/// downsampling.
#[derive(Debug, Clone)]
pub struct DBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    conv_sc: Option<Conv2d>,
    preactivation: bool,
    downsample: bool,
}

impl DBlock {
    pub fn new(stage: &StageSpec, wide: bool, preactivation: bool, vb: VarBuilder) -> Result<Self> {
        let (cin, cout) = (stage.in_channels, stage.out_channels);
        let hidden = if wide { cout } else { cin };
        let conv_sc = if cin != cout || stage.resample {
            Some(conv2d(cin, cout, 1, Default::default(), vb.pp("conv_sc"))?)
        } else {
            None
        };
        Ok(Self {
            conv1: stage_conv(cin, hidden, stage, vb.pp("conv1"))?,
            conv2: stage_conv(hidden, cout, stage, vb.pp("conv2"))?,
            conv_sc,
            preactivation,
            downsample: stage.resample,
        })
    }

    fn shortcut(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        if self.preactivation {
            if let Some(sc) = &self.conv_sc {
                x = sc.forward(&x)?;
            }
            if self.downsample {
                x = x.avg_pool2d(2)?;
            }
        } else {
            if self.downsample {
                x = x.avg_pool2d(2)?;
            }
            if let Some(sc) = &self.conv_sc {
                x = sc.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl Module for DBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = if self.preactivation { x.relu()? } else { x.clone() };
        let h = self.conv1.forward(&h)?;
        let mut h = self.conv2.forward(&h.relu()?)?;
        if self.downsample {
            h = h.avg_pool2d(2)?;
        }
        h + self.shortcut(x)?
    }
}

impl Initializable for DBlock {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.conv1.collect_weights(out);
        self.conv2.collect_weights(out);
        self.conv_sc.collect_weights(out);
    }
}

/// Volumetric residual block: strided conv3d -> relu -> conv3d, with a strided
/// pointwise shortcut. Operates on (B, C, T, H, W).
#[derive(Debug, Clone)]
pub struct BasicBlock3d {
    conv1: Conv3d,
    conv2: Conv3d,
    shortcut: Option<Conv3d>,
}

impl BasicBlock3d {
    pub fn new(stage: &StageSpec, vb: VarBuilder) -> Result<Self> {
        let (cin, cout) = (stage.in_channels, stage.out_channels);
        let stride = if stage.resample { 2 } else { 1 };
        let shortcut = if stage.resample || cin != cout {
            let cfg = Conv3dConfig {
                kernel: 1,
                stride: (stride, stride),
                padding: (0, 0),
                bias: false,
            };
            Some(conv3d(cin, cout, cfg, vb.pp("shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            conv1: conv3d(cin, cout, Conv3dConfig::same(3, stride), vb.pp("conv1"))?,
            conv2: conv3d(cout, cout, Conv3dConfig::same(3, 1), vb.pp("conv2"))?,
            shortcut,
        })
    }

    pub fn output_len(&self, t: usize) -> usize {
        self.conv2.output_len(self.conv1.output_len(t))
    }
}

impl Module for BasicBlock3d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv1.forward(x)?.relu()?;
        let h = self.conv2.forward(&h)?;
        let sc = match &self.shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        (h + sc)?.relu()
    }
}

impl Initializable for BasicBlock3d {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.conv1.collect_weights(out);
        self.conv2.collect_weights(out);
        self.shortcut.collect_weights(out);
    }
}

/// Plain strided conv3d + relu, used when the video discriminator runs
/// without residual 3D blocks.
#[derive(Debug, Clone)]
pub struct Conv3dBlock {
    conv: Conv3d,
}

impl Conv3dBlock {
    pub fn new(stage: &StageSpec, vb: VarBuilder) -> Result<Self> {
        let stride = if stage.resample { 2 } else { 1 };
        Ok(Self {
            conv: conv3d(
                stage.in_channels,
                stage.out_channels,
                Conv3dConfig::same(3, stride),
                vb.pp("conv"),
            )?,
        })
    }

    pub fn output_len(&self, t: usize) -> usize {
        self.conv.output_len(t)
    }
}

impl Module for Conv3dBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.conv.forward(x)?.relu()
    }
}

impl Initializable for Conv3dBlock {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.conv.collect_weights(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn stage(cin: usize, cout: usize, resample: bool) -> StageSpec {
        StageSpec {
            in_channels: cin,
            out_channels: cout,
            resample,
            resolution: 0,
            attention: false,
            volumetric: false,
            kernel_size: 3,
            dilation: 1,
        }
    }

    #[test]
    fn test_gblock_upsamples() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = GBlock::new(&stage(8, 4, true), 6, 1e-5, vb)?;
        let x = Tensor::randn(0f32, 1.0, (3, 8, 4, 4), &device)?;
        let cond = Tensor::randn(0f32, 1.0, (3, 6), &device)?;
        assert_eq!(block.forward(&x, &cond)?.dims(), &[3, 4, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_dblock_downsamples() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let first = DBlock::new(&stage(3, 8, true), true, false, vb.pp("d0"))?;
        let second = DBlock::new(&stage(8, 8, false), true, true, vb.pp("d1"))?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?;
        let h = first.forward(&x)?;
        assert_eq!(h.dims(), &[2, 8, 4, 4]);
        assert_eq!(second.forward(&h)?.dims(), &[2, 8, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_basic_block_3d_halves_time_and_space() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = BasicBlock3d::new(&stage(3, 4, true), vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 6, 8, 8), &device)?;
        assert_eq!(block.forward(&x)?.dims(), &[2, 4, 3, 4, 4]);
        assert_eq!(block.output_len(6), 3);
        Ok(())
    }
}
