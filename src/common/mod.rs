//! Building blocks shared by the generator and the discriminators
//!
//! - **attention**: SAGAN-style 2D, axial (width/height/time) and full
//!   spatio-temporal self-attention
//! - **blocks**: generator/discriminator residual blocks, 3D blocks
//! - **conv3d**: volumetric convolution as a sum of per-slice Conv2d
//! - **convgru**: recurrent temporal core
//! - **init**: initializable-weight registry and init styles
//! - **norms**: conditional batch norm

pub mod attention;
pub mod blocks;
pub mod conv3d;
pub mod convgru;
pub mod init;
pub mod norms;

pub use attention::{Axis, AxialAttention, FullAttention, SelfAttention2d, attend};
pub use blocks::{BasicBlock3d, Conv3dBlock, DBlock, GBlock};
pub use conv3d::{Conv3d, Conv3dConfig, conv3d};
pub use convgru::ConvGru;
pub use init::{
    Initializable, initialize, is_running_stat, named_vars, trainable_vars, vars_by_id, zero_biases,
};
pub use norms::{ConditionalBatchNorm, output_batch_norm};
