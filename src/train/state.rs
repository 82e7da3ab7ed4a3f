use serde::{Deserialize, Serialize};

use crate::config::VganConfig;

/// Training progress persisted next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDict {
    pub itr: usize,
    pub epoch: usize,
    /// Next rotating checkpoint slot.
    pub save_num: usize,
    /// Next rotating best-checkpoint slot.
    pub save_best_num: usize,
    pub best_is: f64,
    pub best_fid: f64,
    pub config: VganConfig,
}

impl Default for StateDict {
    fn default() -> Self {
        Self {
            itr: 0,
            epoch: 0,
            save_num: 0,
            save_best_num: 0,
            best_is: 0.0,
            best_fid: 999_999.0,
            config: VganConfig::default(),
        }
    }
}

impl StateDict {
    pub fn new(config: VganConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }
}
