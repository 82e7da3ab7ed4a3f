//! Per-clip frame sub-sampling for the image discriminator.

use candle_core::{DType, Tensor};

use super::deterministic_rng::Pcg32;
use crate::error::{Result, VganError};

/// Draws `width` distinct frames from every clip of a `[B, T, ...]` batch.
///
/// Frames are chosen uniformly without replacement per clip from a seeded
/// PCG32 stream, so the same seed always picks the same frames.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    width: usize,
    rng: Pcg32,
}

impl FrameSampler {
    pub fn new(width: usize, seed: u64) -> Self {
        Self {
            width,
            rng: Pcg32::stream(seed, 0x5a4d),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = Pcg32::stream(seed, 0x5a4d);
    }

    /// Frame indices (within each clip) for a batch of `batch` clips of length `time_steps`.
    pub fn draw_indices(&mut self, batch: usize, time_steps: usize) -> Vec<Vec<usize>> {
        (0..batch)
            .map(|_| self.rng.choose_distinct(time_steps, self.width))
            .collect()
    }

    /// Returns `([B, k, ...], [B, k])`: the sampled frames and their labels.
    pub fn sample(&mut self, clips: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
        let dims = clips.dims().to_vec();
        if dims.len() < 3 {
            return Err(VganError::shape("clip batch", "[B, T, ...]", dims));
        }
        let (b, t) = (dims[0], dims[1]);
        if self.width > t {
            return Err(VganError::shape("frame sampling width", format!("<= {t}"), self.width));
        }
        if labels.dims() != [b] {
            return Err(VganError::shape("clip labels", [b], labels.dims()));
        }

        let ids: Vec<u32> = self
            .draw_indices(b, t)
            .into_iter()
            .enumerate()
            .flat_map(|(clip, frames)| frames.into_iter().map(move |f| (clip * t + f) as u32))
            .collect();
        let ids = Tensor::from_vec(ids, b * self.width, clips.device())?;

        let mut flat_dims = vec![b * t];
        flat_dims.extend_from_slice(&dims[2..]);
        let mut out_dims = vec![b, self.width];
        out_dims.extend_from_slice(&dims[2..]);

        let frames = clips
            .reshape(flat_dims)?
            .index_select(&ids, 0)?
            .reshape(out_dims)?;
        let labels = labels
            .to_dtype(DType::U32)?
            .unsqueeze(1)?
            .repeat((1, self.width))?;
        Ok((frames, labels))
    }
}

/// Repeat each label `times` times, clip-major: `[y0, y0, .., y1, y1, ..]`.
pub fn duplicate_labels(labels: &Tensor, times: usize) -> candle_core::Result<Tensor> {
    let b = labels.dim(0)?;
    labels.unsqueeze(1)?.repeat((1, times))?.reshape(b * times)
}
