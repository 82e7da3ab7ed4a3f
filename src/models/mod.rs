//! Networks of the video GAN
//!
//! - **generator**: conditional clip generator
//! - **discriminator**: per-frame projection discriminator
//! - **video_discriminator**: clip-level projection discriminator
//! - **gd**: generator + discriminators behind one `step`

pub mod discriminator;
pub mod gd;
pub mod generator;
pub mod video_discriminator;

pub use discriminator::ImageDiscriminator;
pub use gd::{DiscriminatorScores, GD, StepMode};
pub use generator::{Generator, LatentLayout};
pub use video_discriminator::VideoDiscriminator;

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::common::{Initializable, initialize, zero_biases};
use crate::config::{ExecutionContext, InitStyle};
use crate::error::{Result, VganError};
use crate::utils::Pcg32;

/// Every id in `y` must index one of `n_classes` classes.
pub(crate) fn check_class_ids(y: &Tensor, n_classes: usize) -> Result<()> {
    if y.elem_count() == 0 {
        return Ok(());
    }
    let max = y.to_dtype(DType::U32)?.flatten_all()?.max(0)?.to_scalar::<u32>()? as usize;
    if max >= n_classes {
        return Err(VganError::shape("class id", format!("< {n_classes}"), max));
    }
    Ok(())
}

/// Build a network on a fresh `VarMap`, then seed all of its weights.
pub fn build_model<M, F>(
    ctx: &ExecutionContext,
    style: InitStyle,
    rng: &mut Pcg32,
    build: F,
) -> Result<(M, VarMap)>
where
    M: Initializable,
    F: FnOnce(VarBuilder) -> Result<M>,
{
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, ctx.dtype, &ctx.device);
    let model = build(vb)?;
    zero_biases(&varmap)?;
    initialize(&varmap, &model, style, rng)?;
    Ok((model, varmap))
}
