//! Checkpointing and sample-quality evaluation between iterations.

use candle_core::Tensor;
use tracing::info;

use super::sinks::{CheckpointStore, MetricsSink};
use super::state::StateDict;
use super::step::Trainer;
use crate::config::BestMetric;
use crate::error::Result;

/// Inception score and Frechet distance of a sample stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InceptionScores {
    pub is_mean: f64,
    pub is_std: f64,
    pub fid: f64,
}

/// Draws clips from `sample` until `num_images` have been scored.
pub trait InceptionMetrics {
    fn compute(
        &mut self,
        sample: &mut dyn FnMut() -> Result<(Tensor, Tensor)>,
        num_images: usize,
        num_splits: usize,
    ) -> Result<InceptionScores>;
}

/// Save the current weights (plus a rotating copy when configured) and log
/// clips generated from the fixed noise.
pub fn save_and_sample(
    trainer: &Trainer,
    state: &mut StateDict,
    store: &mut dyn CheckpointStore,
    sink: &mut dyn MetricsSink,
) -> Result<()> {
    let models = trainer.checkpoint_models();
    store.save_weights(&models, state, None)?;

    let copies = trainer.config().num_save_copies;
    if copies > 0 {
        let tag = format!("copy{}", state.save_num);
        store.save_weights(&models, state, Some(&tag))?;
        state.save_num = (state.save_num + 1) % copies;
    }

    let (video, _) = trainer.sample_fixed()?;
    sink.log_video("Samples/fixed", &video.affine(0.5, 0.5)?, state.itr);
    Ok(())
}

/// Score the sampler, keep the best metrics in `state`, and save a rotating
/// `best{n}` checkpoint on improvement.
pub fn evaluate(
    trainer: &mut Trainer,
    state: &mut StateDict,
    metrics: &mut dyn InceptionMetrics,
    store: &mut dyn CheckpointStore,
    sink: &mut dyn MetricsSink,
) -> Result<InceptionScores> {
    let config = trainer.config().clone();
    let batch = config.effective_g_batch_size();
    let scores = {
        let mut sample = || trainer.sample(batch);
        metrics.compute(&mut sample, config.num_inception_images, config.num_inception_splits)?
    };
    info!(
        itr = state.itr,
        is_mean = scores.is_mean,
        is_std = scores.is_std,
        fid = scores.fid,
        "evaluated samples"
    );

    let improved = match config.which_best {
        BestMetric::Is => scores.is_mean > state.best_is,
        BestMetric::Fid => scores.fid < state.best_fid,
    };
    if improved {
        info!(itr = state.itr, which = ?config.which_best, "new best, saving");
        if config.num_best_copies > 0 {
            let tag = format!("best{}", state.save_best_num);
            store.save_weights(&trainer.checkpoint_models(), state, Some(&tag))?;
            state.save_best_num = (state.save_best_num + 1) % config.num_best_copies;
        }
    }
    state.best_is = state.best_is.max(scores.is_mean);
    state.best_fid = state.best_fid.min(scores.fid);

    sink.log_scalar("Eval/IS_mean", scores.is_mean, state.itr);
    sink.log_scalar("Eval/IS_std", scores.is_std, state.itr);
    sink.log_scalar("Eval/FID", scores.fid, state.itr);
    Ok(scores)
}
