//! Convolutional GRU that unrolls a single noise vector into a short
//! sequence of feature maps.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder, conv2d, linear};

use super::init::Initializable;

/// `noise (B, N)` -> linear -> `(B, C, w, w)` input, then a ConvGRU cell is
/// stepped `time_steps` times from a zero hidden state. Output: `(B, T, C, w, w)`.
#[derive(Debug, Clone)]
pub struct ConvGru {
    linear: Linear,
    conv_gates: Conv2d,
    conv_can: Conv2d,
    channels: usize,
    width: usize,
    time_steps: usize,
}

impl ConvGru {
    pub fn new(
        noise_size: usize,
        channels: usize,
        width: usize,
        time_steps: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            linear: linear(noise_size, channels * width * width, vb.pp("linear"))?,
            conv_gates: conv2d(2 * channels, 2 * channels, 3, cfg, vb.pp("conv_gates"))?,
            conv_can: conv2d(2 * channels, channels, 3, cfg, vb.pp("conv_can"))?,
            channels,
            width,
            time_steps,
        })
    }

    pub fn conv_gates(&self) -> &Conv2d {
        &self.conv_gates
    }

    pub fn conv_can(&self) -> &Conv2d {
        &self.conv_can
    }

    fn step(&self, input: &Tensor, hidden: &Tensor) -> Result<Tensor> {
        let combined = Tensor::cat(&[input, hidden], 1)?;
        let gates = self.conv_gates.forward(&combined)?;
        let reset = candle_nn::ops::sigmoid(&gates.narrow(1, 0, self.channels)?)?;
        let update = candle_nn::ops::sigmoid(&gates.narrow(1, self.channels, self.channels)?)?;
        let combined = Tensor::cat(&[input, &(reset * hidden)?], 1)?;
        let candidate = self.conv_can.forward(&combined)?.tanh()?;
        // h' = (1 - u) * h + u * c
        let keep = update.affine(-1.0, 1.0)?;
        (keep * hidden)? + (update * candidate)?
    }
}

impl Module for ConvGru {
    fn forward(&self, noise: &Tensor) -> Result<Tensor> {
        let b = noise.dim(0)?;
        let input = self
            .linear
            .forward(noise)?
            .reshape((b, self.channels, self.width, self.width))?;
        let mut hidden = input.zeros_like()?;
        let mut outputs = Vec::with_capacity(self.time_steps);
        for _ in 0..self.time_steps {
            hidden = self.step(&input, &hidden)?;
            outputs.push(hidden.clone());
        }
        Tensor::stack(&outputs, 1)
    }
}

impl Initializable for ConvGru {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.linear.collect_weights(out);
        self.conv_gates.collect_weights(out);
        self.conv_can.collect_weights(out);
    }
}
