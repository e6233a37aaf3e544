//! LoCon: LoRA extended to convolutions.
//!
//! Decomposes the weight update into a down projection to `rank` and an up
//! projection back to the output width: `ΔW = up · down`. On convolutions
//! the down projection carries the base kernel, stride and padding, the up
//! projection is a 1x1 convolution.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use std::sync::Arc;

use candle_core::{DType, Module, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear};

use super::{kaiming_uniform, AdapterCore, BaseShape};
use crate::error::Result;
use crate::host::LayerSlot;

/// A projection built over a trainable variable.
enum Projection {
    Linear(Linear),
    Conv2d(Conv2d),
}

impl Module for Projection {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Linear(linear) => linear.forward(xs),
            Self::Conv2d(conv) => conv.forward(xs),
        }
    }
}

/// Low-rank additive adapter.
///
/// Computes: `output = base_output + up(down(x)) * scale * multiplier`
pub struct LoConModule {
    pub(crate) core: AdapterCore,
    /// Down projection: in → rank, Kaiming-uniform
    lora_down: Var,
    /// Up projection: rank → out, zeros
    lora_up: Var,
    down: Projection,
    up: Projection,
}

impl LoConModule {
    /// Create a LoCon adapter around `base`.
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

        let (lora_down, lora_up, down, up) = match core.shape {
            BaseShape::Dense {
                in_features,
                out_features,
            } => {
                let lora_down = kaiming_uniform(&[rank, in_features], in_features, &device)?;
                let lora_up = Var::zeros((out_features, rank), DType::F32, &device)?;
                let down = Projection::Linear(Linear::new(lora_down.as_tensor().clone(), None));
                let up = Projection::Linear(Linear::new(lora_up.as_tensor().clone(), None));
                (lora_down, lora_up, down, up)
            }
            BaseShape::Conv2d {
                in_channels,
                out_channels,
                kernel: (kh, kw),
                config,
            } => {
                let fan_in = in_channels * kh * kw;
                let lora_down = kaiming_uniform(&[rank, in_channels, kh, kw], fan_in, &device)?;
                let lora_up = Var::zeros((out_channels, rank, 1, 1), DType::F32, &device)?;
                let down_config = Conv2dConfig {
                    groups: 1,
                    ..config
                };
                let down = Projection::Conv2d(Conv2d::new(
                    lora_down.as_tensor().clone(),
                    None,
                    down_config,
                ));
                let up = Projection::Conv2d(Conv2d::new(
                    lora_up.as_tensor().clone(),
                    None,
                    Conv2dConfig::default(),
                ));
                (lora_down, lora_up, down, up)
            }
        };

        Ok(Self {
            core,
            lora_down,
            lora_up,
            down,
            up,
        })
    }

    pub(crate) fn correction(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = self.down.forward(xs)?;
        let delta = self.up.forward(&hidden)?.affine(self.core.factor(), 0.0)?;
        self.core.apply_dropout(delta)
    }

    /// `up · down` reshaped to the base weight, without scaling.
    pub(crate) fn raw_delta_weight(&self) -> candle_core::Result<Tensor> {
        match self.core.shape {
            BaseShape::Dense { .. } => self.lora_up.matmul(&self.lora_down),
            BaseShape::Conv2d {
                in_channels,
                out_channels,
                kernel: (kh, kw),
                config,
            } => {
                if config.groups != 1 {
                    candle_core::bail!(
                        "cannot merge {} into a grouped convolution",
                        self.core.name
                    );
                }
                let rank = self.core.rank;
                let up = self.lora_up.reshape((out_channels, rank))?;
                let down = self.lora_down.reshape((rank, in_channels * kh * kw))?;
                up.matmul(&down)?
                    .reshape((out_channels, in_channels, kh, kw))
            }
        }
    }

    pub(crate) fn named_vars(&self) -> Vec<(&'static str, Var)> {
        vec![
            ("lora_down.weight", self.lora_down.clone()),
            ("lora_up.weight", self.lora_up.clone()),
        ]
    }
}
