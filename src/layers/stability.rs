use candle_core::shape::Dim;
use candle_core::{D, Result, Tensor};
use serde::{Deserialize, Serialize};

/// How a layer exponentiates its keys (and, for the global variant, the
/// position bias).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpPolicy {
    /// Plain `exp(x)`. Overflows to `inf` for inputs above ~88 in f32.
    #[default]
    Raw,
    /// `exp(x - max(x))` with the max taken along the layer's reduction axis.
    MaxShifted,
}

/// `exp(x - max(x, dim))`, the max kept as a broadcastable singleton axis.
///
/// Every exponent is `<= 0` afterwards, so the result lies in `[0, 1]`
/// whenever `x` is finite and the max entry of each slice maps to exactly 1.
pub fn shifted_exp<I: Dim>(x: &Tensor, dim: I) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?;
    x.broadcast_sub(&max)?.exp()
}

impl ExpPolicy {
    pub fn exp<I: Dim>(self, x: &Tensor, dim: I) -> Result<Tensor> {
        match self {
            Self::Raw => x.exp(),
            Self::MaxShifted => shifted_exp(x, dim),
        }
    }

    /// Row-wise policy for a square bias matrix.
    pub fn exp_rows(self, x: &Tensor) -> Result<Tensor> {
        self.exp(x, D::Minus1)
    }
}
