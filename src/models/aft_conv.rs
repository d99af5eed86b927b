use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{AftError, Result};
use crate::layers::activation::SigmoidGate;
use crate::layers::aggregate::{center_crop, local_terms};
use crate::layers::linear::{Projection, QkvProjection};
use crate::layers::mask::{NestedTensor, resize_mask};
use crate::layers::stability::ExpPolicy;

/// AFT-Conv configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AftConvConfig {
    /// Input and output channel count.
    pub dim: usize,
    pub hidden_dim: usize,
    pub head_num: usize,
    pub kernel_size: usize,
    /// Zero padding of every head kernel. `None` keeps the spatial size
    /// (`(kernel_size - 1) / 2`); smaller values shrink the output map and
    /// its mask to `h + 2 * padding - kernel_size + 1`.
    pub padding: Option<usize>,
    /// Keys are shifted by their max over the batch axis under `MaxShifted`.
    pub exp_policy: ExpPolicy,
}

impl Default for AftConvConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

impl AftConvConfig {
    pub const fn new(dim: usize) -> Self {
        Self {
            dim,
            hidden_dim: 64,
            head_num: 1,
            kernel_size: 7,
            padding: None,
            exp_policy: ExpPolicy::MaxShifted,
        }
    }

    #[must_use]
    pub const fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    #[must_use]
    pub const fn with_head_num(mut self, head_num: usize) -> Self {
        self.head_num = head_num;
        self
    }

    #[must_use]
    pub const fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    #[must_use]
    pub const fn with_padding(mut self, padding: usize) -> Self {
        self.padding = Some(padding);
        self
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

    /// Channels per head, 0 when `head_num` is 0.
    pub const fn head_dim(&self) -> usize {
        match self.hidden_dim.checked_div(self.head_num) {
            Some(d) => d,
            None => 0,
        }
    }

    pub const fn effective_padding(&self) -> usize {
        match self.padding {
            Some(p) => p,
            None => self.kernel_size.saturating_sub(1) / 2,
        }
    }

    /// How many rows and columns the kernel removes, `None` if the padding
    /// would grow the map instead.
    const fn shrink(&self) -> Option<usize> {
        let Some(reach) = self.kernel_size.checked_sub(1) else {
            return None;
        };
        let Some(pad) = self.effective_padding().checked_mul(2) else {
            return None;
        };
        reach.checked_sub(pad)
    }

    /// Spatial size of the output map for an `h x w` input, `None` if the
    /// kernel does not fit.
    pub fn output_size(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let shrink = self.shrink()?;
        let out_h = h.checked_sub(shrink).filter(|&v| v > 0)?;
        let out_w = w.checked_sub(shrink).filter(|&v| v > 0)?;
        Some((out_h, out_w))
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(AftError::config("dim", "must be > 0"));
        }
        if self.hidden_dim == 0 {
            return Err(AftError::config("hidden_dim", "must be > 0"));
        }
        if self.head_num == 0 {
            return Err(AftError::config("head_num", "must be > 0"));
        }
        if self.hidden_dim % self.head_num != 0 {
            return Err(AftError::shape(
                "aft_conv",
                format!(
                    "hidden_dim {} is not divisible by head_num {}",
                    self.hidden_dim, self.head_num
                ),
            ));
        }
        if self.kernel_size == 0 {
            return Err(AftError::config("kernel_size", "must be > 0"));
        }
        if self.shrink().is_none() {
            return Err(AftError::config(
                "padding",
                format!(
                    "padding {} would grow the map past the identity term for kernel_size {}",
                    self.effective_padding(),
                    self.kernel_size
                ),
            ));
        }
        Ok(())
    }
}

/// Attention Free Transformer over 2-D feature maps.
///
/// The pairwise position bias of [`AftFull`](super::AftFull) is replaced by
/// one learned convolution per head over that head's channel slice, plus an
/// identity term. Input and output feature maps are channels-last
/// `[batch, h, w, dim]`.
#[derive(Debug, Clone)]
pub struct AftConv {
    cfg: AftConvConfig,
    qkv: QkvProjection,
    heads: Vec<Conv2d>,
    out: Projection,
    gate: SigmoidGate,
}

impl AftConv {
    /// Parameters: `w_q`, `w_k`, `w_v`, `out` (linear) and `conv2ds.{i}` for
    /// each head.
    pub fn new(cfg: AftConvConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let qkv = QkvProjection::new(cfg.dim, cfg.hidden_dim, &vb)?;

        let head_dim = cfg.head_dim();
        let conv_cfg = Conv2dConfig {
            padding: cfg.effective_padding(),
            ..Default::default()
        };
        let vb_heads = vb.pp("conv2ds");
        let mut heads = Vec::with_capacity(cfg.head_num);
        for i in 0..cfg.head_num {
            heads.push(candle_nn::conv2d(
                head_dim,
                head_dim,
                cfg.kernel_size,
                conv_cfg,
                vb_heads.pp(i),
            )?);
        }

        let out = Projection::new(cfg.hidden_dim, cfg.dim, vb.pp("out"))?;
        debug!(
            "AftConv::new dim={} hidden_dim={} heads={} kernel={} padding={} exp_policy={:?}",
            cfg.dim,
            cfg.hidden_dim,
            cfg.head_num,
            cfg.kernel_size,
            cfg.effective_padding(),
            cfg.exp_policy
        );
        Ok(Self {
            cfg,
            qkv,
            heads,
            out,
            gate: SigmoidGate::new(),
        })
    }

    pub fn config(&self) -> &AftConvConfig {
        &self.cfg
    }

    pub fn head(&self, index: usize) -> Option<&Conv2d> {
        self.heads.get(index)
    }

    /// Checks `[b, h, w, dim]` and returns `(b, h, w)`.
    fn check_features(&self, x: &Tensor) -> Result<(usize, usize, usize)> {
        let (b, h, w, c) = match x.dims() {
            &[b, h, w, c] => (b, h, w, c),
            dims => {
                return Err(AftError::shape(
                    "aft_conv",
                    format!("expected [batch, h, w, dim], got {dims:?}"),
                ));
            },
        };
        if b == 0 {
            return Err(AftError::shape("aft_conv", "empty batch"));
        }
        if c != self.cfg.dim {
            return Err(AftError::shape(
                "aft_conv",
                format!("channel dim is {c}, expected dim={}", self.cfg.dim),
            ));
        }
        if self.cfg.output_size(h, w).is_none() {
            return Err(AftError::shape(
                "aft_conv",
                format!("{h}x{w} map is smaller than kernel_size {}", self.cfg.kernel_size),
            ));
        }
        Ok((b, h, w))
    }

    /// One head over its channel slice, all `[b, head_dim, h, w]`.
    fn attention(&self, kernel: &Conv2d, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let exp_k = self.cfg.exp_policy.exp(k, 0)?;
        let terms = local_terms(kernel, &exp_k, v)?;
        let (_, _, out_h, out_w) = terms.num.dims4()?;
        let q = center_crop(q, out_h, out_w)?;
        Ok(self.gate.forward(&q, &terms.num, &terms.den)?)
    }

    /// Feature path only: `[b, h, w, dim]` to `[b, h', w', dim]`.
    pub fn forward_features(&self, x: &Tensor) -> Result<Tensor> {
        let (b, h, w) = self.check_features(x)?;
        trace!(
            "AftConv::forward_features batch={} h={} w={} heads={}",
            b, h, w, self.cfg.head_num
        );

        let (q, k, v) = self.qkv.forward(x)?;
        let q = q.permute((0, 3, 1, 2))?;
        let k = k.permute((0, 3, 1, 2))?;
        let v = v.permute((0, 3, 1, 2))?;

        let head_dim = self.cfg.head_dim();
        let mut outs = Vec::with_capacity(self.heads.len());
        for (i, kernel) in self.heads.iter().enumerate() {
            let start = i * head_dim;
            let q_i = q.narrow(1, start, head_dim)?.contiguous()?;
            let k_i = k.narrow(1, start, head_dim)?.contiguous()?;
            let v_i = v.narrow(1, start, head_dim)?.contiguous()?;
            outs.push(self.attention(kernel, &q_i, &k_i, &v_i)?);
            trace!("AftConv head {} done", i);
        }

        let y = Tensor::cat(&outs, 1)?.permute((0, 2, 3, 1))?.contiguous()?;
        self.out.forward(&y)
    }

    /// Runs the layer and resizes the validity mask to the output map.
    pub fn forward(&self, input: &NestedTensor) -> Result<NestedTensor> {
        let mask = input
            .mask
            .as_ref()
            .ok_or(AftError::MissingMask { op: "aft_conv" })?;
        let (b, h, w) = self.check_features(&input.tensors)?;
        if mask.dims() != [b, h, w].as_slice() {
            return Err(AftError::shape(
                "aft_conv",
                format!("mask is {:?}, features need [{b}, {h}, {w}]", mask.dims()),
            ));
        }

        let features = self.forward_features(&input.tensors)?;
        let (_, out_h, out_w, _) = features.dims4()?;
        let mask = resize_mask(mask, out_h, out_w)?;
        Ok(NestedTensor::new(features, Some(mask)))
    }

    /// [`forward`](Self::forward) keyed by feature level for multi-scale
    /// backbone consumers. Only level 0 is ever produced.
    pub fn forward_levels(&self, input: &NestedTensor) -> Result<BTreeMap<usize, NestedTensor>> {
        let out = self.forward(input)?;
        Ok(BTreeMap::from([(0, out)]))
    }
}

impl Module for AftConv {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_features(x).map_err(candle_core::Error::wrap)
    }
}
