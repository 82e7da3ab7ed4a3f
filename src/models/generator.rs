//! Conditional video generator.
//!
//! `(z, class embedding)` -> temporal core `[B, T, C0, w, w]` -> optional
//! full attention -> frame stack `[B*T, C0, w, w]` through residual
//! upsampling stages -> bn/relu/conv/tanh head -> `[B, T, 3, H, W]`.

use candle_core::{DType, Module, ModuleT, Result as CandleResult, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Embedding, Linear, VarBuilder, conv2d, embedding, linear};
use tracing::debug;

use crate::arch::{ArchSpec, Architecture, generator_arch};
use crate::common::{
    Axis, AxialAttention, ConvGru, FullAttention, GBlock, Initializable, SelfAttention2d,
    output_batch_norm,
};
use crate::config::{GenAttention, TemporalCore, VganConfig};
use crate::error::{Result, VganError};

use super::check_class_ids;

/// How the latent vector is divided between the temporal core and the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentLayout {
    /// Latent width after adjustment (a multiple of `num_slots`).
    pub dim_z: usize,
    pub num_slots: usize,
    /// Width of one chunk; 0 when latents are not hierarchical.
    pub chunk_size: usize,
}

impl LatentLayout {
    pub fn new(requested_dim_z: usize, num_stages: usize, hier: bool) -> Self {
        if hier {
            let num_slots = num_stages + 1;
            let chunk_size = requested_dim_z / num_slots;
            Self {
                dim_z: chunk_size * num_slots,
                num_slots,
                chunk_size,
            }
        } else {
            Self {
                dim_z: requested_dim_z,
                num_slots: 1,
                chunk_size: 0,
            }
        }
    }

    pub fn is_hierarchical(&self) -> bool {
        self.num_slots > 1
    }

    /// Width of the latent slice that seeds the temporal core.
    pub fn core_width(&self) -> usize {
        self.dim_z / self.num_slots
    }

    /// Split `(B, dim_z)` into `num_slots` chunks (a single chunk when flat).
    pub fn split(&self, z: &Tensor) -> CandleResult<Vec<Tensor>> {
        if !self.is_hierarchical() {
            return Ok(vec![z.clone()]);
        }
        (0..self.num_slots)
            .map(|i| z.narrow(1, i * self.chunk_size, self.chunk_size))
            .collect()
    }
}

#[derive(Debug, Clone)]
enum AttentionLayer {
    Axial(AxialAttention),
    Combined(SelfAttention2d),
}

impl Module for AttentionLayer {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        match self {
            Self::Axial(a) => a.forward(x),
            Self::Combined(a) => a.forward(x),
        }
    }
}

impl Initializable for AttentionLayer {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        match self {
            Self::Axial(a) => a.collect_weights(out),
            Self::Combined(a) => a.collect_weights(out),
        }
    }
}

/// A residual block followed by zero or more attention sub-layers.
#[derive(Debug, Clone)]
struct GeneratorStage {
    block: GBlock,
    attention: Vec<AttentionLayer>,
}

impl Initializable for GeneratorStage {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.block.collect_weights(out);
        self.attention.collect_weights(out);
    }
}

#[derive(Debug, Clone)]
enum TemporalCoreLayer {
    ConvGru(ConvGru),
    Linear(Linear),
}

#[derive(Debug, Clone)]
pub struct Generator {
    arch: Architecture,
    layout: LatentLayout,
    time_steps: usize,
    bottom_width: usize,
    shared_dim: usize,
    n_classes: usize,
    shared: Embedding,
    core: TemporalCoreLayer,
    full_attention: Option<FullAttention>,
    stages: Vec<GeneratorStage>,
    output_bn: BatchNorm,
    output_conv: Conv2d,
}

impl Generator {
    pub fn new(config: &VganConfig, vb: VarBuilder) -> Result<Self> {
        let spec = ArchSpec {
            ch: config.g_ch,
            attention: &config.g_attn,
            kernel: &config.g_kernel,
            dilation: &config.g_dilation,
        };
        let arch = generator_arch(config.resolution, &spec)?;
        let produced = config.bottom_width << arch.num_resampling();
        if produced != arch.output_resolution() {
            return Err(VganError::config(format!(
                "bottom_width {} upsampled {} times gives {produced}, expected {}",
                config.bottom_width,
                arch.num_resampling(),
                arch.output_resolution()
            )));
        }

        let layout = LatentLayout::new(config.dim_z, arch.num_stages(), config.hier);
        if layout.dim_z == 0 {
            return Err(VganError::config(format!(
                "dim_z {} is too small for {} latent slots",
                config.dim_z, layout.num_slots
            )));
        }
        let shared_dim = config.effective_shared_dim();
        let time_steps = config.time_steps;
        let c0 = arch.stages()[0].in_channels;

        let shared = embedding(config.n_classes, shared_dim, vb.pp("shared"))?;
        let core = match config.temporal_core {
            TemporalCore::ConvGru => TemporalCoreLayer::ConvGru(ConvGru::new(
                layout.core_width() + shared_dim,
                c0,
                config.bottom_width,
                time_steps,
                vb.pp("convgru"),
            )?),
            TemporalCore::Linear => TemporalCoreLayer::Linear(linear(
                layout.core_width(),
                c0 * config.bottom_width * config.bottom_width,
                vb.pp("linear"),
            )?),
        };
        let full_attention = if config.full_attention {
            Some(FullAttention::new(c0, vb.pp("full_attn"))?)
        } else {
            None
        };

        let cond_dim = shared_dim + layout.chunk_size;
        let mut stages = Vec::with_capacity(arch.num_stages());
        for (index, stage) in arch.stages().iter().enumerate() {
            let vb_stage = vb.pp(format!("blocks.{index}"));
            let block = GBlock::new(stage, cond_dim, config.bn_eps, vb_stage.pp("block"))?;
            let mut attention = Vec::new();
            if stage.attention {
                let ch = stage.out_channels;
                match config.g_attention {
                    GenAttention::Separable => {
                        debug!(resolution = stage.resolution, "separable attention in G");
                        for (name, axis) in [("attn_w", Axis::Width), ("attn_h", Axis::Height), ("attn_t", Axis::Time)] {
                            attention.push(AttentionLayer::Axial(AxialAttention::new(
                                ch,
                                axis,
                                time_steps,
                                vb_stage.pp(name),
                            )?));
                        }
                    }
                    GenAttention::Combined => {
                        debug!(resolution = stage.resolution, "attention in G");
                        attention.push(AttentionLayer::Combined(SelfAttention2d::new(ch, vb_stage.pp("attn"))?));
                    }
                }
            }
            stages.push(GeneratorStage { block, attention });
        }

        let c_last = arch.stages()[arch.num_stages() - 1].out_channels;
        let output_bn = output_batch_norm(c_last, config.bn_eps, vb.pp("output_bn"))?;
        let output_conv = conv2d(
            c_last,
            3,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("output_conv"),
        )?;

        Ok(Self {
            arch,
            layout,
            time_steps,
            bottom_width: config.bottom_width,
            shared_dim,
            n_classes: config.n_classes,
            shared,
            core,
            full_attention,
            stages,
            output_bn,
            output_conv,
        })
    }

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    pub fn latent_layout(&self) -> LatentLayout {
        self.layout
    }

    /// Latent width `generate` expects.
    pub fn dim_z(&self) -> usize {
        self.layout.dim_z
    }

    pub fn time_steps(&self) -> usize {
        self.time_steps
    }

    pub fn shared_dim(&self) -> usize {
        self.shared_dim
    }

    /// The shared class embedding (excluded from orthogonal regularisation).
    pub fn shared(&self) -> &Embedding {
        &self.shared
    }

    /// `(B,)` class ids -> `(B, shared_dim)` embedding.
    pub fn embed_labels(&self, y: &Tensor) -> Result<Tensor> {
        y.dims1()?;
        check_class_ids(y, self.n_classes)?;
        Ok(self.shared.forward(&y.to_dtype(DType::U32)?)?)
    }

    /// Weights whose gradients are reported each iteration.
    pub fn gradient_probes(&self) -> Vec<(&'static str, Tensor)> {
        let mut probes = Vec::new();
        if let TemporalCoreLayer::ConvGru(gru) = &self.core {
            probes.push(("gates", gru.conv_gates().weight().clone()));
            probes.push(("can", gru.conv_can().weight().clone()));
        }
        if let Some(stage) = self.stages.first() {
            probes.push(("first_layer", stage.block.conv1().weight().clone()));
        }
        probes
    }

    /// `(B, dim_z)`, `(B, shared_dim)` -> `(B, T, 3, H, W)` in [-1, 1].
    pub fn generate(&self, z: &Tensor, y_embed: &Tensor) -> Result<Tensor> {
        let (b, dz) = z.dims2()?;
        if dz != self.layout.dim_z {
            return Err(VganError::shape("latent width", self.layout.dim_z, dz));
        }
        let (by, dy) = y_embed.dims2()?;
        if by != b || dy != self.shared_dim {
            return Err(VganError::shape("class embedding", [b, self.shared_dim], [by, dy]));
        }
        Ok(self.forward_unchecked(z, y_embed)?)
    }

    fn forward_unchecked(&self, z: &Tensor, y: &Tensor) -> CandleResult<Tensor> {
        let b = z.dim(0)?;
        let t = self.time_steps;
        let w = self.bottom_width;

        let chunks = self.layout.split(z)?;
        let z0 = &chunks[0];
        let conds = if self.layout.is_hierarchical() {
            chunks[1..]
                .iter()
                .map(|chunk| Tensor::cat(&[y, chunk], 1))
                .collect::<CandleResult<Vec<_>>>()?
        } else {
            vec![y.clone(); self.stages.len()]
        };

        let mut h = match &self.core {
            TemporalCoreLayer::ConvGru(gru) => gru.forward(&Tensor::cat(&[z0, y], 1)?)?,
            TemporalCoreLayer::Linear(lin) => {
                let c0 = self.arch.stages()[0].in_channels;
                lin.forward(z0)?
                    .reshape((b, 1, c0, w, w))?
                    .repeat((1, t, 1, 1, 1))?
            }
        };
        if let Some(attn) = &self.full_attention {
            h = attn.forward(&h)?;
        }
        let (_, _, c0, _, _) = h.dims5()?;
        let mut h = h.reshape((b * t, c0, w, w))?;

        for (stage, cond) in self.stages.iter().zip(&conds) {
            // one conditioning row per frame, clip-major
            let d = cond.dim(1)?;
            let cond = cond.unsqueeze(1)?.repeat((1, t, 1))?.reshape((b * t, d))?;
            h = stage.block.forward(&h, &cond)?;
            for layer in &stage.attention {
                h = layer.forward(&h)?;
            }
        }

        let h = self.output_bn.forward_t(&h, true)?.relu()?;
        let h = self.output_conv.forward(&h)?.tanh()?;
        let (_, c, hh, ww) = h.dims4()?;
        h.reshape((b, t, c, hh, ww))
    }
}

impl Initializable for Generator {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        self.shared.collect_weights(out);
        match &self.core {
            TemporalCoreLayer::ConvGru(gru) => gru.collect_weights(out),
            TemporalCoreLayer::Linear(lin) => lin.collect_weights(out),
        }
        self.full_attention.collect_weights(out);
        self.stages.collect_weights(out);
        self.output_conv.collect_weights(out);
    }
}
