use candle_core::{Result, Tensor};

/// `sigmoid(q) * num / den`, the output gate shared by both AFT variants.
///
/// All three operands must have identical shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigmoidGate;

impl SigmoidGate {
    pub const fn new() -> Self {
        Self
    }

    pub fn forward(&self, q: &Tensor, num: &Tensor, den: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::sigmoid(q)?;
        gate.mul(&num.div(den)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_sigmoid_gate() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::new(&[[0f32, 2f32, -30f32]], &device)?;
        let num = Tensor::new(&[[3f32, 1f32, 5f32]], &device)?;
        let den = Tensor::new(&[[1.5f32, 2f32, 1f32]], &device)?;

        let out = SigmoidGate::new().forward(&q, &num, &den)?.to_vec2::<f32>()?;
        assert!((out[0][0] - 1.0).abs() < 1e-6);
        assert!((out[0][1] - 0.8807971 * 0.5).abs() < 1e-6);
        assert!(out[0][2].abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_sigmoid_gate_rejects_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::new(&[[0f32, 1f32]], &device)?;
        let num = Tensor::new(&[[1f32, 1f32, 1f32]], &device)?;

        assert!(SigmoidGate::new().forward(&q, &num, &num).is_err());
        Ok(())
    }
}
