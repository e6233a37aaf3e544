//! LoHa (Low-Rank Hadamard Product) implementation.
//!
//! LoHa uses the Hadamard (element-wise) product of two low-rank matrices
//! for more expressive weight updates: `ΔW = (A1 @ B1) ⊙ (A2 @ B2)`.
//! The correction runs the base layer's own operation with `ΔW` as weight.
//!
//! Reference: <https://arxiv.org/abs/2108.06098> (LyCORIS)

use std::sync::Arc;

use candle_core::{DType, Module, Tensor, Var};
use candle_nn::Linear;

use super::{AdapterCore, BaseShape};
use crate::error::Result;
use crate::host::LayerSlot;

/// LoHa layer implementing Low-Rank Hadamard Product adaptation.
///
/// Where:
/// - A1, A2: [out, r]
/// - B1, B2: [r, in * kh * kw]
/// - ⊙ is element-wise (Hadamard) product
pub struct LoHaModule {
    pub(crate) core: AdapterCore,
    /// First decomposition: A1 [out, r]
    hada_w1_a: Var,
    /// First decomposition: B1 [r, in]
    hada_w1_b: Var,
    /// Second decomposition: A2 [out, r], zeros so ΔW starts at 0
    hada_w2_a: Var,
    /// Second decomposition: B2 [r, in]
    hada_w2_b: Var,
}

impl LoHaModule {
    /// Create a LoHa adapter around `base`.
    ///
    /// # Errors
    /// Returns an error if the base layer is neither dense nor a convolution,
    /// `rank` is zero, or initialization fails.
    pub fn new(
        name: impl Into<String>,
        base: &Arc<LayerSlot>,
        multiplier: f64,
        rank: usize,
        alpha: f64,
        dropout: f64,
    ) -> Result<Self> {
        let core = AdapterCore::new(name.into(), base, multiplier, rank, alpha, dropout)?;
        let device = core.device.clone();
        let out_dim = core.shape.out_dim();
        let in_dim = flat_in_dim(&core.shape);

        let hada_w1_a = Var::randn_f64(0.0, 0.1, (out_dim, rank), DType::F32, &device)?;
        let hada_w1_b = Var::randn_f64(0.0, 1.0, (rank, in_dim), DType::F32, &device)?;
        let hada_w2_a = Var::zeros((out_dim, rank), DType::F32, &device)?;
        let hada_w2_b = Var::randn_f64(0.0, 1.0, (rank, in_dim), DType::F32, &device)?;

        Ok(Self {
            core,
            hada_w1_a,
            hada_w1_b,
            hada_w2_a,
            hada_w2_b,
        })
    }

    /// `(A1 @ B1) ⊙ (A2 @ B2)` reshaped to the base weight, without scaling.
    pub(crate) fn raw_delta_weight(&self) -> candle_core::Result<Tensor> {
        let term1 = self.hada_w1_a.matmul(&self.hada_w1_b)?;
        let term2 = self.hada_w2_a.matmul(&self.hada_w2_b)?;
        let delta = term1.mul(&term2)?;
        match self.core.shape {
            BaseShape::Dense { .. } => Ok(delta),
            BaseShape::Conv2d {
                in_channels,
                out_channels,
                kernel: (kh, kw),
                config,
            } => delta.reshape((out_channels, in_channels / config.groups, kh, kw)),
        }
    }

    pub(crate) fn correction(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let delta = self.raw_delta_weight()?.affine(self.core.factor(), 0.0)?;
        let delta = self.core.apply_dropout(delta)?;
        match self.core.shape {
            BaseShape::Dense { .. } => Linear::new(delta, None).forward(xs),
            BaseShape::Conv2d { config, .. } => xs.conv2d(
                &delta,
                config.padding,
                config.stride,
                config.dilation,
                config.groups,
            ),
        }
    }

    pub(crate) fn named_vars(&self) -> Vec<(&'static str, Var)> {
        vec![
            ("hada_w1_a", self.hada_w1_a.clone()),
            ("hada_w1_b", self.hada_w1_b.clone()),
            ("hada_w2_a", self.hada_w2_a.clone()),
            ("hada_w2_b", self.hada_w2_b.clone()),
        ]
    }
}

fn flat_in_dim(shape: &BaseShape) -> usize {
    match *shape {
        BaseShape::Dense { in_features, .. } => in_features,
        BaseShape::Conv2d {
            in_channels,
            kernel: (kh, kw),
            config,
            ..
        } => in_channels / config.groups * kh * kw,
    }
}
