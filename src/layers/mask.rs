use candle_core::{DType, Result, Tensor};

/// A feature map paired with its validity mask.
///
/// `tensors` is the feature map; `mask` is `[b, h, w]` of `u8` where nonzero
/// marks a valid (non-padded) position.
#[derive(Debug, Clone)]
pub struct NestedTensor {
    pub tensors: Tensor,
    pub mask: Option<Tensor>,
}

impl NestedTensor {
    pub fn new(tensors: Tensor, mask: Option<Tensor>) -> Self {
        Self { tensors, mask }
    }

    /// Wraps `tensors` with an all-valid mask covering dims 0..3.
    pub fn all_valid(tensors: Tensor) -> Result<Self> {
        let (b, h, w) = match tensors.dims() {
            [b, h, w, ..] => (*b, *h, *w),
            dims => candle_core::bail!("all_valid: expected rank >= 3, got {dims:?}"),
        };
        let mask = Tensor::ones((b, h, w), DType::U8, tensors.device())?;
        Ok(Self::new(tensors, Some(mask)))
    }

    pub fn decompose(self) -> (Tensor, Option<Tensor>) {
        (self.tensors, self.mask)
    }
}

/// Nearest-neighbour resize of a `[b, h, w]` mask to `[b, out_h, out_w]`,
/// cast back to `u8` booleans.
pub fn resize_mask(mask: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_, h, w) = mask.dims3()?;
    let mask = mask.to_dtype(DType::F32)?;
    if (h, w) == (out_h, out_w) {
        return mask.ne(0f32);
    }
    mask.unsqueeze(1)?
        .upsample_nearest2d(out_h, out_w)?
        .squeeze(1)?
        .ne(0f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_resize_identity_all_true() -> Result<()> {
        let device = Device::Cpu;
        let mask = Tensor::ones((3, 32, 32), DType::U8, &device)?;
        let out = resize_mask(&mask, 32, 32)?;

        assert_eq!(out.dims(), &[3, 32, 32]);
        assert_eq!(out.dtype(), DType::U8);
        assert_eq!(out.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()?, 3 * 32 * 32);
        Ok(())
    }

    #[test]
    fn test_resize_downsample_nearest() -> Result<()> {
        let device = Device::Cpu;
        // left half valid, right half padding
        let mask = Tensor::new(&[[[1u8, 1, 0, 0], [1, 1, 0, 0], [1, 1, 0, 0], [1, 1, 0, 0]]], &device)?;
        let out = resize_mask(&mask, 2, 2)?;

        assert_eq!(out.dims(), &[1, 2, 2]);
        assert_eq!(out.get(0)?.to_vec2::<u8>()?, vec![vec![1, 0], vec![1, 0]]);
        Ok(())
    }

    #[test]
    fn test_resize_normalizes_values() -> Result<()> {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[[0u8, 7], [3, 0]]], &device)?;
        let out = resize_mask(&mask, 2, 2)?;
        assert_eq!(out.get(0)?.to_vec2::<u8>()?, vec![vec![0, 1], vec![1, 0]]);
        Ok(())
    }

    #[test]
    fn test_all_valid() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 4, 5, 3), DType::F32, &device)?;
        let nested = NestedTensor::all_valid(x)?;
        let (x, mask) = nested.decompose();

        assert_eq!(x.dims(), &[2, 4, 5, 3]);
        assert_eq!(mask.map(|m| m.dims().to_vec()), Some(vec![2, 4, 5]));
        Ok(())
    }
}
