//! Volumetric convolution expressed as a sum of 2D convolutions over the
//! kernel's temporal slices.
//!
//! `y[t_out] = bias + sum_k conv2d(x[t_out * stride_t + k], w[:, :, k])`
//! with zero padding on the time axis.

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use super::init::Initializable;

#[derive(Debug, Clone, Copy)]
pub struct Conv3dConfig {
    pub kernel: usize,
    /// (temporal, spatial)
    pub stride: (usize, usize),
    /// (temporal, spatial)
    pub padding: (usize, usize),
    pub bias: bool,
}

impl Conv3dConfig {
    pub fn same(kernel: usize, stride: usize) -> Self {
        Self {
            kernel,
            stride: (stride, stride),
            padding: (kernel / 2, kernel / 2),
            bias: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conv3d {
    /// (out, in, kt, kh, kw)
    weight: Tensor,
    bias: Option<Tensor>,
    cfg: Conv3dConfig,
}

pub fn conv3d(in_channels: usize, out_channels: usize, cfg: Conv3dConfig, vb: VarBuilder) -> Result<Conv3d> {
    let k = cfg.kernel;
    let weight = vb.get_with_hints(
        (out_channels, in_channels, k, k, k),
        "weight",
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bias = if cfg.bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.))?)
    } else {
        None
    };
    Ok(Conv3d { weight, bias, cfg })
}

impl Conv3d {
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Temporal length after this convolution.
    pub fn output_len(&self, t: usize) -> usize {
        let (st, _) = self.cfg.stride;
        let (pt, _) = self.cfg.padding;
        (t + 2 * pt).saturating_sub(self.cfg.kernel) / st + 1
    }

    fn pad_time(&self, x: &Tensor) -> Result<Tensor> {
        let (pt, _) = self.cfg.padding;
        if pt == 0 {
            return Ok(x.clone());
        }
        let (b, c, _t, h, w) = x.dims5()?;
        let zeros = Tensor::zeros((b, c, pt, h, w), x.dtype(), x.device())?;
        Tensor::cat(&[&zeros, x, &zeros], 2)
    }

    /// x: (B, C, T, H, W) -> (B, Out, T', H', W')
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.pad_time(x)?;
        let (_b, _c, t_pad, _h, _w) = x.dims5()?;
        let kt = self.cfg.kernel;
        let (st, ss) = self.cfg.stride;
        let (_, ps) = self.cfg.padding;
        if t_pad < kt {
            candle_core::bail!("time dim too small after padding: t_pad={t_pad}, kernel={kt}")
        }
        let t_out = (t_pad - kt) / st + 1;

        let slices = (0..kt)
            .map(|k| self.weight.narrow(2, k, 1)?.squeeze(2)?.contiguous())
            .collect::<Result<Vec<_>>>()?;

        let mut ys = Vec::with_capacity(t_out);
        for to in 0..t_out {
            let mut acc: Option<Tensor> = None;
            for (k, w) in slices.iter().enumerate() {
                let xt = x.narrow(2, to * st + k, 1)?.squeeze(2)?.contiguous()?;
                let yt = xt.conv2d(w, ps, ss, 1, 1)?;
                acc = Some(match acc {
                    None => yt,
                    Some(prev) => (prev + yt)?,
                });
            }
            if let Some(yt) = acc {
                ys.push(yt.unsqueeze(2)?);
            }
        }
        let y = Tensor::cat(&ys, 2)?;

        match &self.bias {
            Some(bias) => y.broadcast_add(&bias.reshape((1, bias.dims1()?, 1, 1, 1))?),
            None => Ok(y),
        }
    }
}

impl Initializable for Conv3d {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        out.push(self.weight.clone());
    }
}
