//! Metrics and checkpoint collaborators used by the training loop.

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;
use tracing::{debug, info};

use super::state::StateDict;
use crate::common::named_vars;
use crate::error::{Result, VganError};

/// Receiver for training metrics.
pub trait MetricsSink {
    fn log_scalar(&mut self, name: &str, value: f64, itr: usize);

    fn log_text(&mut self, name: &str, text: &str, itr: usize);

    /// `video` is `(B, T, 3, H, W)` with values in `[0, 1]`.
    fn log_video(&mut self, name: &str, video: &Tensor, itr: usize);
}

/// Forwards every metric to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log_scalar(&mut self, name: &str, value: f64, itr: usize) {
        debug!(itr, name, value, "scalar");
    }

    fn log_text(&mut self, name: &str, text: &str, itr: usize) {
        info!(itr, name, "{text}");
    }

    fn log_video(&mut self, name: &str, video: &Tensor, itr: usize) {
        info!(itr, name, shape = ?video.dims(), "video");
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub scalars: Vec<(String, f64, usize)>,
    pub texts: Vec<(String, String, usize)>,
    pub videos: Vec<(String, Vec<usize>, usize)>,
}

impl RecordingSink {
    /// Values logged under `name`, in order.
    pub fn scalar(&self, name: &str) -> Vec<f64> {
        self.scalars
            .iter()
            .filter(|(n, ..)| n == name)
            .map(|(_, v, _)| *v)
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn log_scalar(&mut self, name: &str, value: f64, itr: usize) {
        self.scalars.push((name.to_string(), value, itr));
    }

    fn log_text(&mut self, name: &str, text: &str, itr: usize) {
        self.texts.push((name.to_string(), text.to_string(), itr));
    }

    fn log_video(&mut self, name: &str, video: &Tensor, itr: usize) {
        self.videos.push((name.to_string(), video.dims().to_vec(), itr));
    }
}

/// Persistent storage for model weights and training state.
pub trait CheckpointStore {
    /// Save every `(name, vars)` model and `state` under an optional tag.
    fn save_weights(&mut self, models: &[(&str, &VarMap)], state: &StateDict, tag: Option<&str>) -> Result<()>;

    /// Restore the named models in place and return the saved state.
    fn load_weights(&mut self, models: &[(&str, &VarMap)], tag: Option<&str>) -> Result<StateDict>;
}

/// Writes `{root}/{experiment}/{model}[_{tag}].safetensors` and
/// `state_dict[_{tag}].json`.
#[derive(Debug, Clone)]
pub struct SafetensorsCheckpoint {
    dir: PathBuf,
}

impl SafetensorsCheckpoint {
    pub fn new(root: impl AsRef<Path>, experiment: &str) -> Self {
        Self {
            dir: root.as_ref().join(experiment),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, stem: &str, tag: Option<&str>, ext: &str) -> PathBuf {
        match tag {
            Some(tag) => self.dir.join(format!("{stem}_{tag}.{ext}")),
            None => self.dir.join(format!("{stem}.{ext}")),
        }
    }
}

/// Write through a sibling temp file and rename into place.
fn replace_file(path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    write(&tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl CheckpointStore for SafetensorsCheckpoint {
    fn save_weights(&mut self, models: &[(&str, &VarMap)], state: &StateDict, tag: Option<&str>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        for (name, vars) in models {
            let path = self.file(name, tag, "safetensors");
            replace_file(&path, |tmp| Ok(vars.save(tmp)?))?;
        }
        let path = self.file("state_dict", tag, "json");
        replace_file(&path, |tmp| {
            let file = std::fs::File::create(tmp)?;
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), state)?;
            Ok(())
        })?;
        info!(dir = %self.dir.display(), tag = tag.unwrap_or(""), itr = state.itr, "saved weights");
        Ok(())
    }

    fn load_weights(&mut self, models: &[(&str, &VarMap)], tag: Option<&str>) -> Result<StateDict> {
        for (name, vars) in models {
            let path = self.file(name, tag, "safetensors");
            let mut tensors = candle_core::safetensors::load(&path, &candle_core::Device::Cpu)?;
            for (var_name, var) in named_vars(vars)? {
                let tensor = tensors.remove(&var_name).ok_or_else(|| {
                    VganError::config(format!("{var_name} missing from {}", path.display()))
                })?;
                let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
                var.set(&tensor)?;
            }
        }
        let file = std::fs::File::open(self.file("state_dict", tag, "json"))?;
        let state = serde_json::from_reader(std::io::BufReader::new(file))?;
        info!(dir = %self.dir.display(), tag = tag.unwrap_or(""), "loaded weights");
        Ok(state)
    }
}
