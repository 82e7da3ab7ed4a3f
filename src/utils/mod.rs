pub mod deterministic_rng;
pub mod frame_sampler;
pub mod latent;

pub use deterministic_rng::Pcg32;
pub use frame_sampler::{FrameSampler, duplicate_labels};
pub use latent::LatentSampler;
