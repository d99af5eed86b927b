use std::path::Path;

use candle_core::{Module, Tensor};
use candle_nn::{Init, VarBuilder};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{AftError, Result};
use crate::layers::activation::SigmoidGate;
use crate::layers::aggregate::global_terms;
use crate::layers::linear::{Projection, QkvProjection};
use crate::layers::stability::ExpPolicy;

/// AFT-Full configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AftFullConfig {
    /// Longest sequence the position bias covers.
    pub max_len: usize,
    pub d_model: usize,
    /// `Raw` exponentiates bias and keys directly and can overflow for large
    /// magnitudes. `MaxShifted` subtracts the row max of the bias and the
    /// per-channel max of the keys over the sequence; both shifts cancel in
    /// `num / den`.
    pub exp_policy: ExpPolicy,
}

impl Default for AftFullConfig {
    fn default() -> Self {
        Self::new(100, 64)
    }
}

impl AftFullConfig {
    pub const fn new(max_len: usize, d_model: usize) -> Self {
        Self {
            max_len,
            d_model,
            exp_policy: ExpPolicy::Raw,
        }
    }

    #[must_use]
    pub const fn with_exp_policy(mut self, exp_policy: ExpPolicy) -> Self {
        self.exp_policy = exp_policy;
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let cfg: Self = super::read_json_config(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_len == 0 {
            return Err(AftError::config("max_len", "must be > 0"));
        }
        if self.d_model == 0 {
            return Err(AftError::config("d_model", "must be > 0"));
        }
        Ok(())
    }
}

/// Attention Free Transformer over a flat sequence with a learned
/// `[max_len, max_len]` pairwise position bias.
///
/// `y = out(sigmoid(q) * (exp(w) @ (exp(k) * v)) / (exp(w) @ exp(k)))`
#[derive(Debug, Clone)]
pub struct AftFull {
    cfg: AftFullConfig,
    qkv: QkvProjection,
    w: Tensor,
    out: Projection,
    gate: SigmoidGate,
}

impl AftFull {
    /// Parameters: `w_q`, `w_k`, `w_v`, `out` (linear) and `w` (bias matrix).
    pub fn new(cfg: AftFullConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let d = cfg.d_model;
        let qkv = QkvProjection::new(d, d, &vb)?;
        let w = vb.get_with_hints(
            (cfg.max_len, cfg.max_len),
            "w",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let out = Projection::new(d, d, vb.pp("out"))?;
        debug!(
            "AftFull::new max_len={} d_model={} exp_policy={:?}",
            cfg.max_len, cfg.d_model, cfg.exp_policy
        );
        Ok(Self {
            cfg,
            qkv,
            w,
            out,
            gate: SigmoidGate::new(),
        })
    }

    pub fn config(&self) -> &AftFullConfig {
        &self.cfg
    }

    pub fn position_bias(&self) -> &Tensor {
        &self.w
    }

    pub fn load_position_bias(&mut self, w: &Tensor) -> Result<()> {
        let dims = w.dims2()?;
        if dims != (self.cfg.max_len, self.cfg.max_len) {
            return Err(AftError::shape(
                "aft_full",
                format!(
                    "position bias must be [{0}, {0}], got {1:?}",
                    self.cfg.max_len,
                    w.dims()
                ),
            ));
        }
        self.w = w.clone();
        Ok(())
    }

    fn check_input(&self, x: &Tensor) -> Result<(usize, usize)> {
        let (b, t, c) = match x.dims() {
            &[b, t, c] => (b, t, c),
            dims => {
                return Err(AftError::shape(
                    "aft_full",
                    format!("expected [batch, seq_len, d_model], got {dims:?}"),
                ));
            },
        };
        if c != self.cfg.d_model {
            return Err(AftError::shape(
                "aft_full",
                format!("channel dim is {c}, expected d_model={}", self.cfg.d_model),
            ));
        }
        if b == 0 {
            return Err(AftError::shape("aft_full", "empty batch"));
        }
        if t == 0 {
            return Err(AftError::shape("aft_full", "empty sequence"));
        }
        if t > self.cfg.max_len {
            return Err(AftError::shape(
                "aft_full",
                format!("seq_len {t} exceeds max_len {}", self.cfg.max_len),
            ));
        }
        Ok((b, t))
    }

    /// `x`: `[batch, seq_len, d_model]` with `seq_len <= max_len`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t) = self.check_input(x)?;
        trace!("AftFull::forward batch={} seq_len={}", b, t);

        let (q, k, v) = self.qkv.forward(x)?;

        let w_bias = self.w.narrow(0, 0, t)?.narrow(1, 0, t)?;
        let exp_bias = self.cfg.exp_policy.exp_rows(&w_bias)?;
        let exp_k = self.cfg.exp_policy.exp(&k, 1)?;

        let terms = global_terms(&exp_bias, &exp_k, &v)?;
        let y = self.gate.forward(&q, &terms.num, &terms.den)?;
        self.out.forward(&y)
    }
}

impl Module for AftFull {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        AftFull::forward(self, x).map_err(candle_core::Error::wrap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(cfg: AftFullConfig) -> Result<AftFull> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        AftFull::new(cfg, vb)
    }

    #[test]
    fn test_output_shape_below_max_len() -> Result<()> {
        let model = build(AftFullConfig::new(16, 8))?;
        for t in [1, 7, 16] {
            let x = Tensor::randn(0f32, 1.0, (3, t, 8), &Device::Cpu)?;
            assert_eq!(model.forward(&x)?.dims(), &[3, t, 8]);
        }
        Ok(())
    }

    #[test]
    fn test_rejects_long_sequence() -> Result<()> {
        let model = build(AftFullConfig::new(16, 8))?;
        let x = Tensor::randn(0f32, 1.0, (2, 17, 8), &Device::Cpu)?;

        let err = model.forward(&x).unwrap_err();
        assert!(matches!(err, AftError::Shape { .. }), "{err}");
        Ok(())
    }

    #[test]
    fn test_rejects_rank_and_width() -> Result<()> {
        let model = build(AftFullConfig::new(16, 8))?;
        let x = Tensor::zeros((2, 4, 4, 8), DType::F32, &Device::Cpu)?;
        assert!(model.forward(&x).unwrap_err().is_shape_error());

        let x = Tensor::zeros((2, 4, 6), DType::F32, &Device::Cpu)?;
        assert!(model.forward(&x).unwrap_err().is_shape_error());
        Ok(())
    }

    #[test]
    fn test_rejects_empty_batch_and_sequence() -> Result<()> {
        let model = build(AftFullConfig::new(16, 8))?;
        for dims in [(0, 4, 8), (2, 0, 8)] {
            let x = Tensor::zeros(dims, DType::F32, &Device::Cpu)?;
            let err = model.forward(&x).unwrap_err();
            assert!(matches!(err, AftError::Shape { .. }), "{dims:?}: {err}");
        }
        Ok(())
    }

    #[test]
    fn test_load_position_bias() -> Result<()> {
        let mut model = build(AftFullConfig::new(4, 2))?;
        assert_eq!(model.position_bias().dims(), &[4, 4]);

        let bad = Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?;
        assert!(model.load_position_bias(&bad).is_err());

        let zeros = Tensor::zeros((4, 4), DType::F32, &Device::Cpu)?;
        model.load_position_bias(&zeros)?;
        assert_eq!(model.position_bias().sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_config_validate() {
        assert!(AftFullConfig::new(0, 8).validate().is_err());
        assert!(AftFullConfig::new(8, 0).validate().is_err());
        assert!(AftFullConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_serde_defaults() {
        let cfg: AftFullConfig = serde_json::from_str(r#"{"d_model": 32}"#).unwrap();
        assert_eq!(cfg.max_len, 100);
        assert_eq!(cfg.d_model, 32);
        assert_eq!(cfg.exp_policy, ExpPolicy::Raw);
    }
}
