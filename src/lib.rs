//! Attention Free Transformer layers on candle.
//!
//! [`AftFull`] aggregates a flat sequence with a learned pairwise position
//! bias; [`AftConv`] aggregates a 2-D feature map with one local convolution
//! kernel per head. Neither builds a per-query attention matrix.

pub mod error;
pub mod layers;
pub mod models;

pub use error::{AftError, Result};
pub use layers::mask::NestedTensor;
pub use layers::stability::ExpPolicy;
pub use models::{AftConv, AftConvConfig, AftFull, AftFullConfig};
