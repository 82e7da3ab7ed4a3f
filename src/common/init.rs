//! Weight initialisation over an explicit registry of initializable weights.
//!
//! Each parameterised layer reports its matrix-valued weight through
//! [`Initializable`]; initialisation then walks that flat list and rewrites the
//! matching `Var` in the model's `VarMap`.

use std::collections::HashMap;

use candle_core::{Result, Tensor, TensorId, Var};
use candle_nn::{Conv2d, Embedding, Linear, VarMap};
use tracing::debug;

use crate::config::InitStyle;
use crate::utils::Pcg32;

/// A layer (or composite of layers) that owns initializable weight tensors.
pub trait Initializable {
    fn collect_weights(&self, out: &mut Vec<Tensor>);

    fn weights(&self) -> Vec<Tensor> {
        let mut out = Vec::new();
        self.collect_weights(&mut out);
        out
    }
}

impl Initializable for Conv2d {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        out.push(self.weight().clone());
    }
}

impl Initializable for Linear {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        out.push(self.weight().clone());
    }
}

impl Initializable for Embedding {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        out.push(self.embeddings().clone());
    }
}

impl<T: Initializable> Initializable for Option<T> {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        if let Some(inner) = self {
            inner.collect_weights(out);
        }
    }
}

impl<T: Initializable> Initializable for Vec<T> {
    fn collect_weights(&self, out: &mut Vec<Tensor>) {
        for item in self {
            item.collect_weights(out);
        }
    }
}

/// Every variable of `varmap`, keyed by the id of its tensor.
pub fn vars_by_id(varmap: &VarMap) -> HashMap<TensorId, Var> {
    varmap
        .all_vars()
        .into_iter()
        .map(|var| (var.as_tensor().id(), var))
        .collect()
}

/// Every variable of `varmap` with its path, sorted by path.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("var map lock poisoned: {e}")))?;
    let mut vars: Vec<_> = data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Batch-norm running statistics are tracked state, not parameters.
pub fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

/// Variables an optimizer should update.
pub fn trainable_vars(varmap: &VarMap) -> Result<Vec<Var>> {
    Ok(named_vars(varmap)?
        .into_iter()
        .filter(|(name, _)| !is_running_stat(name))
        .map(|(_, var)| var)
        .collect())
}

/// Zero every bias so a seeded initialisation fully determines the model.
pub fn zero_biases(varmap: &VarMap) -> Result<()> {
    for (name, var) in named_vars(varmap)? {
        if name.ends_with("bias") {
            var.set(&var.as_tensor().zeros_like()?)?;
        }
    }
    Ok(())
}

/// Re-initialise every weight reported by `module`. Returns the number of
/// initialised parameters.
pub fn initialize(
    varmap: &VarMap,
    module: &impl Initializable,
    style: InitStyle,
    rng: &mut Pcg32,
) -> Result<usize> {
    let vars = vars_by_id(varmap);
    let mut count = 0;
    for weight in module.weights() {
        let Some(var) = vars.get(&weight.id()) else {
            candle_core::bail!("weight {:?} is not backed by the model's VarMap", weight.dims())
        };
        let dims = weight.dims().to_vec();
        let data = match style {
            InitStyle::Ortho => orthogonal(&dims, rng),
            InitStyle::N02 => rng.gaussian_vec(weight.elem_count()).into_iter().map(|v| v * 0.02).collect(),
            InitStyle::Xavier => xavier_uniform(&dims, rng),
        };
        let value = Tensor::from_vec(data, dims, weight.device())?.to_dtype(weight.dtype())?;
        var.set(&value)?;
        count += weight.elem_count();
    }
    debug!(?style, params = count, "initialised weights");
    Ok(count)
}

fn fans(dims: &[usize]) -> (usize, usize) {
    let receptive: usize = dims.iter().skip(2).product();
    let fan_out = dims.first().copied().unwrap_or(1) * receptive;
    let fan_in = dims.get(1).copied().unwrap_or(1) * receptive;
    (fan_in, fan_out)
}

fn xavier_uniform(dims: &[usize], rng: &mut Pcg32) -> Vec<f32> {
    let (fan_in, fan_out) = fans(dims);
    let bound = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    let n: usize = dims.iter().product();
    (0..n).map(|_| (rng.next_f32() * 2.0 - 1.0) * bound).collect()
}

/// Orthogonal matrix of shape `[dims[0], prod(dims[1..])]`: orthonormal rows
/// when wide, orthonormal columns when tall.
fn orthogonal(dims: &[usize], rng: &mut Pcg32) -> Vec<f32> {
    let rows = dims.first().copied().unwrap_or(1);
    let cols: usize = dims.iter().skip(1).product::<usize>().max(1);
    let (n, m) = if rows <= cols { (rows, cols) } else { (cols, rows) };

    // n vectors of length m, orthonormalised with modified Gram-Schmidt.
    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(n);
    while basis.len() < n {
        let mut v: Vec<f64> = rng.gaussian_vec(m).into_iter().map(f64::from).collect();
        for b in &basis {
            let dot: f64 = v.iter().zip(b).map(|(x, y)| x * y).sum();
            v.iter_mut().zip(b).for_each(|(x, y)| *x -= dot * y);
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 1e-8 {
            v.iter_mut().for_each(|x| *x /= norm);
            basis.push(v);
        }
    }

    let mut out = vec![0f32; rows * cols];
    for (i, b) in basis.iter().enumerate() {
        for (j, x) in b.iter().enumerate() {
            let (r, c) = if rows <= cols { (i, j) } else { (j, i) };
            out[r * cols + c] = *x as f32;
        }
    }
    out
}
