use candle_core::{D, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::error::{AftError, Result};

/// A learned affine map `in_features -> out_features` applied over the last
/// axis of a tensor of any rank.
#[derive(Debug, Clone)]
pub struct Projection {
    linear: Linear,
    in_features: usize,
    out_features: usize,
}

impl Projection {
    /// Builds the projection from `{prefix}.weight` `[out, in]` and
    /// `{prefix}.bias` `[out]`.
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(in_features, out_features, vb)?;
        Ok(Self {
            linear,
            in_features,
            out_features,
        })
    }

    pub fn from_weights(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        if let Some(b) = &bias {
            if b.dims1()? != out_features {
                return Err(AftError::shape(
                    "projection",
                    format!("bias has {} entries, weight has {out_features} rows", b.dims1()?),
                ));
            }
        }
        Ok(Self {
            linear: Linear::new(weight, bias),
            in_features,
            out_features,
        })
    }

    pub fn load_weights(&mut self, weight: &Tensor, bias: Option<&Tensor>) -> Result<()> {
        let dims = weight.dims2()?;
        if dims != (self.out_features, self.in_features) {
            return Err(AftError::shape(
                "projection",
                format!(
                    "expected weight [{}, {}], got {:?}",
                    self.out_features,
                    self.in_features,
                    weight.dims()
                ),
            ));
        }
        self.linear = Linear::new(weight.clone(), bias.cloned());
        Ok(())
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = x.dim(D::Minus1)?;
        if last != self.in_features {
            return Err(AftError::shape(
                "projection",
                format!("last dim is {last}, expected {}", self.in_features),
            ));
        }
        Ok(self.linear.forward(x)?)
    }
}

impl Module for Projection {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.linear.forward(x)
    }
}

/// The three independent query/key/value maps shared by both AFT variants.
#[derive(Debug, Clone)]
pub struct QkvProjection {
    pub w_q: Projection,
    pub w_k: Projection,
    pub w_v: Projection,
}

impl QkvProjection {
    pub fn new(dim: usize, hidden_dim: usize, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            w_q: Projection::new(dim, hidden_dim, vb.pp("w_q"))?,
            w_k: Projection::new(dim, hidden_dim, vb.pp("w_k"))?,
            w_v: Projection::new(dim, hidden_dim, vb.pp("w_v"))?,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.w_q.in_features()
    }

    pub fn hidden_dim(&self) -> usize {
        self.w_q.out_features()
    }

    /// Returns `(q, k, v)`, each with the input's outer shape and
    /// `hidden_dim` channels.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let q = self.w_q.forward(x)?;
        let k = self.w_k.forward(x)?;
        let v = self.w_v.forward(x)?;
        Ok((q, k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn weight_6x4(device: &Device) -> candle_core::Result<Tensor> {
        Tensor::new(
            &[
                [1.0f32, 0.0, -1.0, 2.0],
                [0.0, 1.0, 2.0, -1.0],
                [2.0, -1.0, 0.0, 1.0],
                [-2.0, 1.0, 1.0, 0.0],
                [1.0, 1.0, 1.0, 1.0],
                [3.0, 0.0, -2.0, 1.0],
            ],
            device,
        )
    }

    #[test]
    fn test_projection_values() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0], [-1.0, 0.0, 1.0, 2.0]], &device)?;
        let bias = Tensor::new(&[1.0f32, -2.0, 0.0, 3.0, -1.0, 2.0], &device)?;

        let layer = Projection::from_weights(weight_6x4(&device)?, Some(bias))?;
        let output = layer.forward(&x)?;

        let expected = vec![
            vec![7.0f32, 2.0, 4.0, 6.0, 9.0, 3.0],
            vec![3.0, -2.0, 0.0, 6.0, 1.0, -1.0],
        ];
        assert_eq!(output.to_vec2::<f32>()?, expected);
        Ok(())
    }

    #[test]
    fn test_projection_rank4() -> Result<()> {
        let device = Device::Cpu;
        let layer = Projection::from_weights(weight_6x4(&device)?, None)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 5, 4), &device)?;
        let y = layer.forward(&x)?;
        assert_eq!(y.dims(), &[2, 3, 5, 6]);

        // every spatial position goes through the same map
        let row = x.get(0)?.get(0)?.get(0)?.unsqueeze(0)?;
        let expected = layer.forward(&row)?.squeeze(0)?.to_vec1::<f32>()?;
        let got = y.get(0)?.get(0)?.get(0)?.to_vec1::<f32>()?;
        for (a, b) in got.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_projection_rejects_width() -> Result<()> {
        let device = Device::Cpu;
        let layer = Projection::from_weights(weight_6x4(&device)?, None)?;
        let x = Tensor::zeros((2, 5), DType::F32, &device)?;

        let err = layer.forward(&x).unwrap_err();
        assert!(matches!(err, AftError::Shape { .. }));
        Ok(())
    }

    #[test]
    fn test_load_weights_checks_shape() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = Projection::from_weights(weight_6x4(&device)?, None)?;

        let bad = Tensor::zeros((4, 6), DType::F32, &device)?;
        assert!(layer.load_weights(&bad, None).is_err());

        let zero = Tensor::zeros((6, 4), DType::F32, &device)?;
        layer.load_weights(&zero, None)?;
        let y = layer.forward(&Tensor::ones((1, 4), DType::F32, &device)?)?;
        assert_eq!(y.to_vec2::<f32>()?, vec![vec![0.0f32; 6]]);
        Ok(())
    }

    #[test]
    fn test_qkv_independent() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut qkv = QkvProjection::new(4, 6, &vb)?;
        assert_eq!(qkv.input_dim(), 4);
        assert_eq!(qkv.hidden_dim(), 6);

        qkv.w_k.load_weights(&weight_6x4(&device)?, None)?;

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device)?;
        let (q, k, v) = qkv.forward(&x)?;
        assert_eq!(q.dims(), &[1, 6]);
        assert_eq!(v.dims(), &[1, 6]);
        assert_eq!(
            k.to_vec2::<f32>()?,
            vec![vec![6.0f32, 4.0, 4.0, 3.0, 10.0, 1.0]]
        );
        Ok(())
    }
}
