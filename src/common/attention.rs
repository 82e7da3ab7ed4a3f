//! Self-attention sub-layers.
//!
//! All variants share the SAGAN layout: 1x1 projections to query/key (C/8)
//! and value (C/2) channels, softmax attention, a 1x1 output projection, and
//! a learned residual gate initialised to zero so a freshly built layer is
//! the identity.
//!
//! - `SelfAttention2d`: attention over all positions of a frame, keys/values
//!   max-pooled by 2
//! - `AxialAttention`: attention along a single axis (width, height or time)
//! - `FullAttention`: joint attention over T x H x W for `[B, T, C, H, W]`

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Conv2d, Init, VarBuilder, conv2d_no_bias};

use super::init::Initializable;

/// `softmax(q k^T) v` on (N, L, c) sequences.
pub fn attend(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let scores = q.matmul(&k.t()?.contiguous()?)?;
    let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
    probs.matmul(v)
}

#[derive(Debug, Clone)]
struct Projections {
    theta: Conv2d,
    phi: Conv2d,
    g: Conv2d,
    o: Conv2d,
    gamma: Tensor,
}

impl Projections {
    fn new(ch: usize, vb: VarBuilder) -> Result<Self> {
        let qk = (ch / 8).max(1);
        let v = (ch / 2).max(1);
        Ok(Self {
            theta: conv2d_no_bias(ch, qk, 1, Default::default(), vb.pp("theta"))?,
            phi: conv2d_no_bias(ch, qk, 1, Default::default(), vb.pp("phi"))?,
            g: conv2d_no_bias(ch, v, 1, Default::default(), vb.pp("g"))?,
            o: conv2d_no_bias(v, ch, 1, Default::default(), vb.pp("o"))?,
            gamma: vb.get_with_hints(1, "gamma", Init::Const(0.))?,
        })
    }

    /// `x + gamma * o(attended)`
    fn gate(&self, x: &Tensor, attended: &Tensor) -> Result<Tensor> {
        let o = self.o.forward(attended)?;
        x + o.broadcast_mul(&self.gamma)?
    }
}

impl Initializable for Projections {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.theta.collect_weights(out);
        self.phi.collect_weights(out);
        self.g.collect_weights(out);
        self.o.collect_weights(out);
    }
}

/// (N, c, H, W) -> (N, H*W, c)
fn positions(x: &Tensor) -> Result<Tensor> {
    let (n, c, h, w) = x.dims4()?;
    x.reshape((n, c, h * w))?.transpose(1, 2)?.contiguous()
}

#[derive(Debug, Clone)]
pub struct SelfAttention2d {
    proj: Projections,
}

impl SelfAttention2d {
    pub fn new(ch: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: Projections::new(ch, vb)?,
        })
    }
}

impl Module for SelfAttention2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, _c, h, w) = x.dims4()?;
        let pool = h >= 2 && w >= 2 && h % 2 == 0 && w % 2 == 0;
        let maybe_pool = |t: Tensor| if pool { t.max_pool2d(2) } else { Ok(t) };

        let q = positions(&self.proj.theta.forward(x)?)?;
        let k = positions(&maybe_pool(self.proj.phi.forward(x)?)?)?;
        let v = positions(&maybe_pool(self.proj.g.forward(x)?)?)?;
        let attended = attend(&q, &k, &v)?; // (N, HW, c2)
        let c2 = attended.dim(2)?;
        let attended = attended.transpose(1, 2)?.reshape((n, c2, h, w))?;
        self.proj.gate(x, &attended)
    }
}

impl Initializable for SelfAttention2d {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.proj.collect_weights(out);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Width,
    Height,
    Time,
}

/// Attention restricted to one axis of a `(B*T, C, H, W)` frame stack.
#[derive(Debug, Clone)]
pub struct AxialAttention {
    proj: Projections,
    axis: Axis,
    time_steps: usize,
}

impl AxialAttention {
    pub fn new(ch: usize, axis: Axis, time_steps: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: Projections::new(ch, vb)?,
            axis,
            time_steps,
        })
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// (N, c, H, W) -> (S, L, c), one sequence per line along the axis.
    fn to_sequences(&self, t: &Tensor) -> Result<Tensor> {
        let (n, c, h, w) = t.dims4()?;
        match self.axis {
            Axis::Width => t.permute((0, 2, 3, 1))?.reshape((n * h, w, c)),
            Axis::Height => t.permute((0, 3, 2, 1))?.reshape((n * w, h, c)),
            Axis::Time => {
                let b = n / self.time_steps;
                t.reshape((b, self.time_steps, c, h, w))?
                    .permute((0, 3, 4, 1, 2))?
                    .reshape((b * h * w, self.time_steps, c))
            }
        }
    }

    /// Inverse of `to_sequences` for a frame stack of spatial size (h, w).
    fn from_sequences(&self, s: &Tensor, n: usize, h: usize, w: usize) -> Result<Tensor> {
        let c = s.dim(2)?;
        match self.axis {
            Axis::Width => s.reshape((n, h, w, c))?.permute((0, 3, 1, 2)),
            Axis::Height => s.reshape((n, w, h, c))?.permute((0, 3, 2, 1)),
            Axis::Time => {
                let b = n / self.time_steps;
                s.reshape((b, h, w, self.time_steps, c))?
                    .permute((0, 3, 4, 1, 2))?
                    .reshape((n, c, h, w))
            }
        }?
        .contiguous()
    }
}

impl Module for AxialAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, _c, h, w) = x.dims4()?;
        if self.axis == Axis::Time && n % self.time_steps != 0 {
            candle_core::bail!("frame stack of {n} is not a multiple of time_steps={}", self.time_steps)
        }
        let q = self.to_sequences(&self.proj.theta.forward(x)?)?.contiguous()?;
        let k = self.to_sequences(&self.proj.phi.forward(x)?)?.contiguous()?;
        let v = self.to_sequences(&self.proj.g.forward(x)?)?.contiguous()?;
        let attended = self.from_sequences(&attend(&q, &k, &v)?, n, h, w)?;
        self.proj.gate(x, &attended)
    }
}

impl Initializable for AxialAttention {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.proj.collect_weights(out);
    }
}

/// Joint attention over time and space for the generator's bottom features.
#[derive(Debug, Clone)]
pub struct FullAttention {
    proj: Projections,
}

impl FullAttention {
    pub fn new(ch: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: Projections::new(ch, vb)?,
        })
    }
}

impl Module for FullAttention {
    /// x: (B, T, C, H, W) -> (B, T, C, H, W)
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, c, h, w) = x.dims5()?;
        let frames = x.reshape((b * t, c, h, w))?;
        let tokens = |p: Tensor| -> Result<Tensor> {
            let cp = p.dim(1)?;
            p.reshape((b, t, cp, h, w))?
                .permute((0, 1, 3, 4, 2))?
                .reshape((b, t * h * w, cp))?
                .contiguous()
        };
        let q = tokens(self.proj.theta.forward(&frames)?)?;
        let k = tokens(self.proj.phi.forward(&frames)?)?;
        let v = tokens(self.proj.g.forward(&frames)?)?;
        let attended = attend(&q, &k, &v)?;
        let c2 = attended.dim(2)?;
        let attended = attended
            .reshape((b, t, h, w, c2))?
            .permute((0, 1, 4, 2, 3))?
            .reshape((b * t, c2, h, w))?;
        self.proj.gate(&frames, &attended)?.reshape((b, t, c, h, w))
    }
}

impl Initializable for FullAttention {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.proj.collect_weights(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_fresh_layers_are_identity() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let x = Tensor::randn(0f32, 1.0, (6, 16, 4, 4), &device)?;

        let sa = SelfAttention2d::new(16, vb.pp("sa"))?;
        assert!(max_abs_diff(&sa.forward(&x)?, &x)? < 1e-6);

        for (i, axis) in [Axis::Width, Axis::Height, Axis::Time].into_iter().enumerate() {
            let attn = AxialAttention::new(16, axis, 3, vb.pp(format!("axial{i}")))?;
            let y = attn.forward(&x)?;
            assert_eq!(y.dims(), x.dims());
            assert!(max_abs_diff(&y, &x)? < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_time_sequences_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = AxialAttention::new(8, Axis::Time, 2, vb)?;
        let x = Tensor::arange(0f32, (4 * 3 * 2 * 5) as f32, &device)?.reshape((4, 3, 2, 5))?;
        let seq = attn.to_sequences(&x)?;
        assert_eq!(seq.dims(), &[2 * 2 * 5, 2, 3]);
        let back = attn.from_sequences(&seq, 4, 2, 5)?;
        assert!(max_abs_diff(&back, &x)? == 0.0);
        Ok(())
    }

    #[test]
    fn test_full_attention_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = FullAttention::new(16, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 16, 4, 4), &device)?;
        assert_eq!(attn.forward(&x)?.dims(), &[2, 3, 16, 4, 4]);
        Ok(())
    }
}
