//! Adversarial and auxiliary losses.

use candle_core::{Result, Tensor};

use crate::config::{LossKind, SumSequence};

/// `log(1 + exp(x))`, evaluated as `relu(x) + log(1 + exp(-|x|))`.
fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

/// Hinge discriminator loss. Returns `(loss_real, loss_fake)`.
pub fn loss_hinge_dis(dis_fake: &Tensor, dis_real: &Tensor) -> Result<(Tensor, Tensor)> {
    let loss_real = dis_real.neg()?.affine(1.0, 1.0)?.relu()?.mean_all()?;
    let loss_fake = dis_fake.affine(1.0, 1.0)?.relu()?.mean_all()?;
    Ok((loss_real, loss_fake))
}

pub fn loss_hinge_gen(dis_fake: &Tensor) -> Result<Tensor> {
    dis_fake.mean_all()?.neg()
}

/// Non-saturating discriminator loss. Returns `(loss_real, loss_fake)`.
pub fn loss_dcgan_dis(dis_fake: &Tensor, dis_real: &Tensor) -> Result<(Tensor, Tensor)> {
    let loss_real = softplus(&dis_real.neg()?)?.mean_all()?;
    let loss_fake = softplus(dis_fake)?.mean_all()?;
    Ok((loss_real, loss_fake))
}

pub fn loss_dcgan_gen(dis_fake: &Tensor) -> Result<Tensor> {
    softplus(&dis_fake.neg()?)?.mean_all()
}

/// Loss family selected by [`LossKind`].
#[derive(Debug, Clone, Copy)]
pub struct AdversarialLoss(pub LossKind);

impl AdversarialLoss {
    pub fn discriminator(&self, dis_fake: &Tensor, dis_real: &Tensor) -> Result<(Tensor, Tensor)> {
        match self.0 {
            LossKind::Hinge => loss_hinge_dis(dis_fake, dis_real),
            LossKind::Dcgan => loss_dcgan_dis(dis_fake, dis_real),
        }
    }

    pub fn generator(&self, dis_fake: &Tensor) -> Result<Tensor> {
        match self.0 {
            LossKind::Hinge => loss_hinge_gen(dis_fake),
            LossKind::Dcgan => loss_dcgan_gen(dis_fake),
        }
    }
}

/// Apply the multi-frame policy to `(B * k, 1)` scores.
///
/// `Before` sums the `k` scores of each clip into `(B, 1)`; `After` leaves
/// every frame score to be penalised on its own.
pub fn aggregate_frames(scores: &Tensor, k: usize, policy: SumSequence) -> Result<Tensor> {
    match policy {
        SumSequence::After => Ok(scores.clone()),
        SumSequence::Before => {
            let n = scores.dim(0)?;
            if k == 0 || n % k != 0 {
                candle_core::bail!("{n} scores do not split into clips of {k} frames")
            }
            scores.reshape((n / k, k, 1))?.sum(1)
        }
    }
}

/// Average `(B * width, 1)` scores over each clip's `width` rows into `(B, 1)`.
pub fn average_frames(scores: &Tensor, width: usize) -> Result<Tensor> {
    let n = scores.dim(0)?;
    if width == 0 || n % width != 0 {
        candle_core::bail!("{n} scores do not split into clips of {width} frames")
    }
    if width == 1 {
        return Ok(scores.clone());
    }
    scores.reshape((n / width, width, 1))?.mean(1)
}

/// Mean intensity of a `[-1, 1]` batch, mapped to `[0, 1]`.
pub fn mean_intensity(x: &Tensor) -> Result<Tensor> {
    x.affine(0.5, 0.5)?.mean_all()
}

/// `|mean((fake + 1) / 2) - real_mean|`.
pub fn pixel_loss(fake: &Tensor, real_mean: &Tensor) -> Result<Tensor> {
    (mean_intensity(fake)? - real_mean.detach())?.abs()
}
