//! Orthogonal regularisation applied directly to accumulated gradients.

use std::collections::HashSet;

use candle_core::{DType, Result, Tensor, TensorId, Var, backprop::GradStore};

/// Add `strength * 2 * ((W W^T) * (1 - I)) W` to the gradient of every
/// parameter of rank >= 2 that is not in `skip`. `W` is the parameter
/// flattened to `(out, rest)`. Returns the number of regularised parameters.
pub fn apply_ortho(
    grads: &mut GradStore,
    vars: &[Var],
    strength: f64,
    skip: &HashSet<TensorId>,
) -> Result<usize> {
    if strength == 0.0 {
        return Ok(0);
    }
    let mut count = 0;
    for var in vars {
        let param = var.as_tensor();
        if param.rank() < 2 || skip.contains(&param.id()) {
            continue;
        }
        let penalty = ortho_gradient(param, strength)?;
        let grad = match grads.get(param) {
            Some(g) => (g + penalty)?,
            None => penalty,
        };
        grads.insert(param, grad);
        count += 1;
    }
    Ok(count)
}

fn ortho_gradient(param: &Tensor, strength: f64) -> Result<Tensor> {
    let w = param.detach().flatten_from(1)?;
    let rows = w.dim(0)?;
    let gram = w.matmul(&w.t()?)?;
    let off_diagonal = Tensor::eye(rows, DType::F32, w.device())?
        .to_dtype(w.dtype())?
        .affine(-1.0, 1.0)?;
    (gram * off_diagonal)?
        .matmul(&w)?
        .affine(2.0 * strength, 0.0)?
        .reshape(param.dims())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_orthonormal_rows_get_no_penalty() -> Result<()> {
        let var = Var::from_tensor(&Tensor::eye(3, DType::F32, &Device::Cpu)?)?;
        let loss = var.as_tensor().sum_all()?;
        let mut grads = loss.backward()?;
        let n = apply_ortho(&mut grads, &[var.clone()], 1e-2, &HashSet::new())?;
        assert_eq!(n, 1);
        let g = grads.get(var.as_tensor()).map(|g| g.to_vec2::<f32>()).transpose()?;
        assert_eq!(g, Some(vec![vec![1.0; 3]; 3]));
        Ok(())
    }

    #[test]
    fn test_penalty_matches_closed_form() -> Result<()> {
        // rows [1, 1] and [1, 0]: W W^T off-diagonal is 1
        let w = Tensor::new(&[[1f32, 1.0], [1.0, 0.0]], &Device::Cpu)?;
        let var = Var::from_tensor(&w)?;
        let other = Var::from_tensor(&Tensor::ones((2, 2), DType::F32, &Device::Cpu)?)?;
        let loss = (var.as_tensor().sum_all()? * 0.0)?;
        let mut grads = loss.backward()?;
        let skip: HashSet<_> = [other.as_tensor().id()].into_iter().collect();
        let n = apply_ortho(&mut grads, &[var.clone(), other.clone()], 0.5, &skip)?;
        assert_eq!(n, 1);
        // 2 * 0.5 * [[0, 1], [1, 0]] @ W = [[1, 0], [1, 1]]
        let g = grads.get(var.as_tensor()).map(|g| g.to_vec2::<f32>()).transpose()?;
        assert_eq!(g, Some(vec![vec![1.0, 0.0], vec![1.0, 1.0]]));
        assert!(grads.get(other.as_tensor()).is_none());
        Ok(())
    }
}
