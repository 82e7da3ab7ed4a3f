use candle_core::{Device, Result, Tensor};

/// PCG32 Random Number Generator
///
/// Every stochastic choice in training (latents, labels, frame sub-sampling,
/// weight initialisation) draws from one of these so a fixed seed replays a
/// run exactly, independent of the device backend's own RNG.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, inc: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (inc << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Independent stream derived from the same seed.
    pub fn stream(seed: u64, stream: u64) -> Self {
        Self::new(seed, 0xda3e_39cb_94b9_5bdb ^ stream)
    }

    pub fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        // Output function (XSH-RR)
        let xorshifted = ((oldstate >> 18) ^ oldstate) >> 27;
        let rot = (oldstate >> 59) as u32;
        let xorshifted = xorshifted as u32;
        (xorshifted >> rot) | (xorshifted << ((0u32).wrapping_sub(rot) & 31))
    }

    /// Uniform float in [0, 1)
    pub fn next_f32(&mut self) -> f32 {
        // 2^{-24}
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// Uniform integer in [0, bound) without modulo bias.
    pub fn next_below(&mut self, bound: u32) -> u32 {
        debug_assert!(bound > 0);
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let r = self.next_u32();
            if r >= threshold {
                return r % bound;
            }
        }
    }

    /// Box-Muller: two standard normal samples
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let z0 = mag * (2.0 * std::f32::consts::PI * u2).cos();
        let z1 = mag * (2.0 * std::f32::consts::PI * u2).sin();

        (z0, z1)
    }

    pub fn gaussian_vec(&mut self, len: usize) -> Vec<f32> {
        let mut data = Vec::with_capacity(len + 1);
        while data.len() < len {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(len);
        data
    }

    /// `k` distinct indices from `0..n`, in draw order (partial Fisher-Yates).
    pub fn choose_distinct(&mut self, n: usize, k: usize) -> Vec<usize> {
        debug_assert!(k <= n);
        let mut pool: Vec<usize> = (0..n).collect();
        for i in 0..k {
            let j = i + self.next_below((n - i) as u32) as usize;
            pool.swap(i, j);
        }
        pool.truncate(k);
        pool
    }

    /// Create a Tensor of Gaussian noise with shape
    pub fn randn(
        &mut self,
        shape: impl Into<candle_core::Shape>,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let data = self.gaussian_vec(shape.elem_count());
        Tensor::from_vec(data, shape, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = Pcg32::new(7, 1);
        let mut b = Pcg32::new(7, 1);
        for _ in 0..16 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn test_next_below_in_range() {
        let mut rng = Pcg32::stream(3, 0);
        for _ in 0..1000 {
            assert!(rng.next_below(5) < 5);
        }
    }

    #[test]
    fn test_choose_distinct_full_is_permutation() {
        let mut rng = Pcg32::stream(11, 2);
        let mut picked = rng.choose_distinct(9, 9);
        picked.sort_unstable();
        assert_eq!(picked, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_gaussian_vec_odd_length() {
        let mut rng = Pcg32::new(0, 0);
        assert_eq!(rng.gaussian_vec(5).len(), 5);
    }
}
