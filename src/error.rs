//! aft-candle error types

use std::path::PathBuf;

/// aft-candle result type
pub type Result<T> = std::result::Result<T, AftError>;

/// Errors raised by the AFT layers.
///
/// Every variant is raised synchronously and aborts the current forward call;
/// no partial output is ever returned.
#[derive(Debug, thiserror::Error)]
pub enum AftError {
    /// Tensor rank or dimension does not match what the layer was built for.
    #[error("shape error in {op}: {reason}")]
    Shape {
        /// Operation that rejected the input
        op: &'static str,
        /// What was wrong with the shape
        reason: String,
    },

    /// The local variant was called with an envelope that carries no mask.
    #[error("missing validity mask for {op}")]
    MissingMask {
        /// Operation that needed the mask
        op: &'static str,
    },

    /// Invalid layer configuration
    #[error("invalid config '{field}': {reason}")]
    Config {
        /// Offending field
        field: &'static str,
        /// Why it's invalid
        reason: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl AftError {
    pub(crate) fn shape(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Shape {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }

    /// True for rank/dimension errors, including the ones raised inside
    /// candle itself.
    pub fn is_shape_error(&self) -> bool {
        match self {
            Self::Shape { .. } => true,
            Self::Candle(err) => matches!(
                err,
                candle_core::Error::ShapeMismatchBinaryOp { .. }
                    | candle_core::Error::UnexpectedNumberOfDims { .. }
                    | candle_core::Error::DimOutOfRange { .. }
                    | candle_core::Error::NarrowInvalidArgs { .. }
            ),
            _ => false,
        }
    }
}
