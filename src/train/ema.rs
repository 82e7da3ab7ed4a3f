//! Exponential moving average of generator weights.

use candle_core::{Result, Var};
use candle_nn::VarMap;
use tracing::debug;

use crate::common::named_vars;

/// Keeps `target` as a running average of `source`. Variables are paired by
/// path, so both maps must come from identically configured networks.
pub struct Ema {
    pairs: Vec<(Var, Var)>,
    decay: f64,
    start_itr: usize,
}

impl Ema {
    /// Pairs the variables and copies `source` into `target`.
    pub fn new(source: &VarMap, target: &VarMap, decay: f64, start_itr: usize) -> Result<Self> {
        let source = named_vars(source)?;
        let target = named_vars(target)?;
        if source.len() != target.len() {
            candle_core::bail!(
                "EMA source has {} variables, target has {}",
                source.len(),
                target.len()
            )
        }
        let mut pairs = Vec::with_capacity(source.len());
        for ((src_name, src), (dst_name, dst)) in source.into_iter().zip(target) {
            if src_name != dst_name {
                candle_core::bail!("EMA variable mismatch: {src_name} vs {dst_name}")
            }
            dst.set(src.as_tensor())?;
            pairs.push((src, dst));
        }
        debug!(vars = pairs.len(), decay, start_itr, "initialised EMA");
        Ok(Self {
            pairs,
            decay,
            start_itr,
        })
    }

    /// Decay in effect at iteration `itr` (0 before `start_itr`).
    pub fn decay_at(&self, itr: usize) -> f64 {
        if itr < self.start_itr { 0.0 } else { self.decay }
    }

    /// `target = decay * target + (1 - decay) * source`
    pub fn update(&self, itr: usize) -> Result<()> {
        let decay = self.decay_at(itr);
        for (src, dst) in &self.pairs {
            let blended = (dst.as_tensor().affine(decay, 0.0)? + src.as_tensor().affine(1.0 - decay, 0.0)?)?;
            dst.set(&blended.detach())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn single(value: f64) -> Result<(VarMap, Tensor)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints((2, 2), "w", Init::Const(value))?;
        Ok((varmap, w))
    }

    fn first(t: &Tensor) -> f32 {
        t.flatten_all().and_then(|t| t.get(0)).and_then(|t| t.to_scalar::<f32>()).unwrap()
    }

    #[test]
    fn test_target_starts_as_copy_and_blends() -> Result<()> {
        let (src_map, src) = single(1.0)?;
        let (dst_map, dst) = single(5.0)?;
        let ema = Ema::new(&src_map, &dst_map, 0.75, 2)?;
        assert_eq!(first(&dst), 1.0);

        named_vars(&src_map)?[0].1.set(&Tensor::full(3f32, (2, 2), &Device::Cpu)?)?;
        // before start_itr the target tracks the source exactly
        ema.update(1)?;
        assert_eq!(first(&dst), 3.0);

        named_vars(&src_map)?[0].1.set(&Tensor::full(7f32, (2, 2), &Device::Cpu)?)?;
        ema.update(2)?;
        assert!((first(&dst) - (0.75 * 3.0 + 0.25 * 7.0)).abs() < 1e-6);
        assert_eq!(first(&src), 7.0);
        Ok(())
    }
}
