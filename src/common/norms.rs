//! Batch normalisation layers used by the generator.
//!
//! - `ConditionalBatchNorm`: batch statistics without affine, followed by a
//!   per-sample gain and bias predicted from a conditioning vector
//! - `output_batch_norm`: plain affine batch norm for the output head

use candle_core::{D, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Linear, VarBuilder};

use super::init::Initializable;

/// Class-conditional batch norm:
/// `y = bn(x) * (1 + W_g c) + W_b c`
#[derive(Debug, Clone)]
pub struct ConditionalBatchNorm {
    bn: BatchNorm,
    gain: Linear,
    bias: Linear,
}

impl ConditionalBatchNorm {
    pub fn new(channels: usize, cond_dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let bn = candle_nn::batch_norm(
            channels,
            BatchNormConfig {
                eps,
                remove_mean: true,
                affine: false,
                momentum: 0.1,
            },
            vb.pp("bn"),
        )?;
        let gain = candle_nn::linear_no_bias(cond_dim, channels, vb.pp("gain"))?;
        let bias = candle_nn::linear_no_bias(cond_dim, channels, vb.pp("bias"))?;
        Ok(Self { bn, gain, bias })
    }

    /// x: (N, C, H, W), cond: (N, cond_dim)
    pub fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let normed = self.bn.forward_t(x, true)?;
        let gain = (cond.apply(&self.gain)? + 1.0)?.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?;
        let bias = cond.apply(&self.bias)?.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?;
        normed.broadcast_mul(&gain)?.broadcast_add(&bias)
    }
}

impl Initializable for ConditionalBatchNorm {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.gain.collect_weights(out);
        self.bias.collect_weights(out);
    }
}

pub fn output_batch_norm(channels: usize, eps: f64, vb: VarBuilder) -> Result<BatchNorm> {
    candle_nn::batch_norm(
        channels,
        BatchNormConfig {
            eps,
            remove_mean: true,
            affine: true,
            momentum: 0.1,
        },
        vb,
    )
}
