//! Latent noise and class label sampling.

use candle_core::{Device, Result, Tensor};

use super::deterministic_rng::Pcg32;

/// Draws `z ~ N(0, z_var * I)` and uniform class ids from a seeded stream.
#[derive(Debug, Clone)]
pub struct LatentSampler {
    dim_z: usize,
    n_classes: usize,
    z_std: f64,
    rng: Pcg32,
}

impl LatentSampler {
    pub fn new(dim_z: usize, n_classes: usize, z_var: f64, seed: u64) -> Self {
        Self {
            dim_z,
            n_classes,
            z_std: z_var.sqrt(),
            rng: Pcg32::stream(seed, 0x1a7e),
        }
    }

    pub fn dim_z(&self) -> usize {
        self.dim_z
    }

    /// `[batch, dim_z]` f32 noise.
    pub fn sample_z(&mut self, batch: usize, device: &Device) -> Result<Tensor> {
        let z = self.rng.randn((batch, self.dim_z), device)?;
        if (self.z_std - 1.0).abs() > f64::EPSILON {
            z.affine(self.z_std, 0.0)
        } else {
            Ok(z)
        }
    }

    /// `[batch]` u32 class ids in `[0, n_classes)`.
    pub fn sample_labels(&mut self, batch: usize, device: &Device) -> Result<Tensor> {
        let ids: Vec<u32> = (0..batch)
            .map(|_| self.rng.next_below(self.n_classes as u32))
            .collect();
        Tensor::from_vec(ids, batch, device)
    }

    pub fn sample(&mut self, batch: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let z = self.sample_z(batch, device)?;
        let y = self.sample_labels(batch, device)?;
        Ok((z, y))
    }
}
