//! Numerator/denominator terms of the AFT aggregation.
//!
//! Both variants reduce to `y = sigmoid(q) * num / den` where `num` and `den`
//! apply the same position weighting to `exp(k) * v` and to `exp(k)`. The
//! global variant weights with a dense `[t, t]` bias matrix, the local variant
//! with a convolution kernel plus an identity (distance zero) term.

use candle_core::{Module, Result, Tensor};
use candle_nn::Conv2d;

/// The two halves of an AFT aggregation, same shape as the values.
#[derive(Debug, Clone)]
pub struct AftTerms {
    pub num: Tensor,
    pub den: Tensor,
}

/// `exp_bias @ x` for every batch entry with a single GEMM.
///
/// `exp_bias`: `[t, t]`, `x`: `[b, t, d]`. The batch is folded into the
/// column axis so the bias is never broadcast to `[b, t, t]`.
fn bias_matmul(exp_bias: &Tensor, x: &Tensor) -> Result<Tensor> {
    let (b, t, d) = x.dims3()?;
    let cols = x.transpose(0, 1)?.contiguous()?.reshape((t, b * d))?;
    exp_bias
        .matmul(&cols)?
        .reshape((t, b, d))?
        .transpose(0, 1)?
        .contiguous()
}

/// Global (AFT-Full) terms.
///
/// * `exp_bias`: `[t, t]`, already exponentiated
/// * `exp_k`, `v`: `[b, t, d]`
pub fn global_terms(exp_bias: &Tensor, exp_k: &Tensor, v: &Tensor) -> Result<AftTerms> {
    let weighted = exp_k.mul(v)?;
    let num = bias_matmul(exp_bias, &weighted)?;
    let den = bias_matmul(exp_bias, exp_k)?;
    Ok(AftTerms { num, den })
}

/// Keeps the central `[h, w]` window of a `[b, c, H, W]` tensor.
pub fn center_crop(x: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (_, _, in_h, in_w) = x.dims4()?;
    if in_h == h && in_w == w {
        return Ok(x.clone());
    }
    if h > in_h || w > in_w {
        candle_core::bail!("center_crop: window {h}x{w} larger than input {in_h}x{in_w}");
    }
    x.narrow(2, (in_h - h) / 2, h)?.narrow(3, (in_w - w) / 2, w)
}

/// Local (AFT-Conv) terms for one head.
///
/// * `exp_k`, `v`: `[b, c, h, w]` for this head's channel slice
///
/// When the kernel shrinks the map, the identity term is center-cropped to
/// the kernel's output so both summands line up.
pub fn local_terms(kernel: &Conv2d, exp_k: &Tensor, v: &Tensor) -> Result<AftTerms> {
    let weighted = exp_k.mul(v)?;

    let conv_num = kernel.forward(&weighted)?;
    let (_, _, out_h, out_w) = conv_num.dims4()?;
    let num = conv_num.add(&center_crop(&weighted, out_h, out_w)?)?;

    let conv_den = kernel.forward(exp_k)?;
    let den = conv_den.add(&center_crop(exp_k, out_h, out_w)?)?;

    Ok(AftTerms { num, den })
}
