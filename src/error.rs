//! Error taxonomy for model construction and training.

/// Errors surfaced by the video GAN.
///
/// `Configuration` and `ShapeMismatch` are fatal and raised at the boundary
/// where they are detected. Numeric instability (NaN/Inf losses) is not an
/// error: it is reported to the metrics sink and left to the caller.
#[derive(Debug, thiserror::Error)]
pub enum VganError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl VganError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape(what: &'static str, expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        Self::ShapeMismatch {
            what,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, VganError>;
