//! Adapter strategies spliced into host layers.
//!
//! Both strategies share one construction contract
//! `(name, base layer, multiplier, rank, alpha, dropout)` and one forward
//! contract `base(x) + correction(x) * alpha / rank * multiplier`, with the
//! correction starting at exactly zero.

pub mod loha;
pub mod locon;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2dConfig, Dropout};

use crate::config::Algo;
use crate::error::{NetworkError, Result};
use crate::host::{HostLayer, LayerHook, LayerSlot};
use crate::traits::{Adapter, Mergeable, Trainable};

pub use loha::LoHaModule;
pub use locon::LoConModule;

/// Shape of the wrapped base layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaseShape {
    /// Dense layer
    Dense {
        /// Input features
        in_features: usize,
        /// Output features
        out_features: usize,
    },
    /// 2D convolution
    Conv2d {
        /// Input channels (across all groups)
        in_channels: usize,
        /// Output channels
        out_channels: usize,
        /// Kernel height and width
        kernel: (usize, usize),
        /// Stride, padding, dilation and groups of the base conv
        config: Conv2dConfig,
    },
}

impl BaseShape {
    /// Introspect a host layer.
    ///
    /// # Errors
    /// Returns [`NetworkError::UnsupportedLayer`] for layers other than dense and conv.
    pub fn of(name: &str, layer: &HostLayer) -> Result<Self> {
        match layer {
            HostLayer::Linear(linear) => {
                let (out_features, in_features) = linear.weight().dims2()?;
                Ok(Self::Dense {
                    in_features,
                    out_features,
                })
            }
            HostLayer::Conv2d(conv) => {
                let (out_channels, in_per_group, kh, kw) = conv.weight().dims4()?;
                let config = *conv.config();
                Ok(Self::Conv2d {
                    in_channels: in_per_group * config.groups,
                    out_channels,
                    kernel: (kh, kw),
                    config,
                })
            }
            HostLayer::Other { type_name, .. } => Err(NetworkError::UnsupportedLayer {
                name: name.to_string(),
                type_name: type_name.clone(),
            }),
        }
    }

    /// Output features / channels.
    #[must_use]
    pub fn out_dim(&self) -> usize {
        match self {
            Self::Dense { out_features, .. } => *out_features,
            Self::Conv2d { out_channels, .. } => *out_channels,
        }
    }
}

/// State every strategy carries besides its parameters.
pub(crate) struct AdapterCore {
    name: String,
    base: Weak<LayerSlot>,
    shape: BaseShape,
    rank: usize,
    alpha: f64,
    multiplier: AtomicU64,
    dropout: Option<Dropout>,
    training: AtomicBool,
    device: Device,
}

impl AdapterCore {
    pub(crate) fn new(
        name: String,
        base: &Arc<LayerSlot>,
        multiplier: f64,
        rank: usize,
        alpha: f64,
        dropout: f64,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(NetworkError::InvalidConfig(format!(
                "adapter {name} needs rank > 0"
            )));
        }
        let shape = BaseShape::of(&name, base.layer())?;
        let device = base
            .layer()
            .weight()
            .map_or(Device::Cpu, |w| w.device().clone());
        let alpha = if alpha == 0.0 { rank as f64 } else { alpha };
        let dropout = (dropout > 0.0).then(|| Dropout::new(dropout as f32));
        Ok(Self {
            name,
            base: Arc::downgrade(base),
            shape,
            rank,
            alpha,
            multiplier: AtomicU64::new(multiplier.to_bits()),
            dropout,
            training: AtomicBool::new(true),
            device,
        })
    }

    pub(crate) fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub(crate) fn multiplier(&self) -> f64 {
        f64::from_bits(self.multiplier.load(Ordering::Relaxed))
    }

    /// `scale * multiplier`, applied to the raw correction.
    pub(crate) fn factor(&self) -> f64 {
        self.scale() * self.multiplier()
    }

    pub(crate) fn apply_dropout(&self, xs: Tensor) -> candle_core::Result<Tensor> {
        match &self.dropout {
            Some(dropout) if self.training.load(Ordering::Relaxed) => dropout.forward(&xs, true),
            _ => Ok(xs),
        }
    }

    pub(crate) fn slot(&self) -> Result<Arc<LayerSlot>> {
        self.base.upgrade().ok_or_else(|| NetworkError::BaseLayerDropped {
            name: self.name.clone(),
        })
    }
}

/// Kaiming-uniform bound for `a = sqrt(5)`.
pub(crate) fn kaiming_uniform(shape: &[usize], fan_in: usize, device: &Device) -> Result<Var> {
    let bound = 1.0 / (fan_in as f64).sqrt();
    Ok(Var::rand_f64(-bound, bound, shape, DType::F32, device)?)
}

/// The adapter strategy selected for a network.
pub enum AdapterModule {
    /// Low-rank additive adapter
    LoCon(LoConModule),
    /// Hadamard-product adapter
    LoHa(LoHaModule),
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            AdapterModule::LoCon($inner) => $body,
            AdapterModule::LoHa($inner) => $body,
        }
    };
}

impl AdapterModule {
    /// Construct the strategy `algo` around `base`.
    ///
    /// # Errors
    /// Returns an error if the base layer cannot be adapted or parameter
    /// initialization fails.
    pub fn new(
        algo: Algo,
        name: impl Into<String>,
        base: &Arc<LayerSlot>,
        multiplier: f64,
        rank: usize,
        alpha: f64,
        dropout: f64,
    ) -> Result<Self> {
        Ok(match algo {
            Algo::Lora => Self::LoCon(LoConModule::new(name, base, multiplier, rank, alpha, dropout)?),
            Algo::Loha => Self::LoHa(LoHaModule::new(name, base, multiplier, rank, alpha, dropout)?),
        })
    }

    fn core(&self) -> &AdapterCore {
        dispatch!(self, m => &m.core)
    }

    /// Strategy tag.
    #[must_use]
    pub fn algo(&self) -> Algo {
        match self {
            Self::LoCon(_) => Algo::Lora,
            Self::LoHa(_) => Algo::Loha,
        }
    }

    /// Shape of the wrapped base layer.
    #[must_use]
    pub fn base_shape(&self) -> BaseShape {
        self.core().shape
    }

    /// The wrapped slot, if the host still holds it.
    ///
    /// # Errors
    /// Returns [`NetworkError::BaseLayerDropped`] once the host dropped the layer.
    pub fn base(&self) -> Result<Arc<LayerSlot>> {
        self.core().slot()
    }

    /// Scaled correction for `input`, cast to `out_dtype`.
    fn correction(&self, input: &Tensor, out_dtype: DType) -> candle_core::Result<Tensor> {
        let xs = input.to_dtype(DType::F32)?;
        let delta = dispatch!(self, m => m.correction(&xs))?;
        delta.to_dtype(out_dtype)
    }

    /// Full forward contract: `base(input) + correction(input)`.
    ///
    /// # Errors
    /// Returns an error if the base layer was dropped or the computation fails.
    pub fn forward_with_base(&self, input: &Tensor) -> Result<Tensor> {
        let base = self.base()?.base_forward(input)?;
        self.forward(input, Some(&base))
    }

    /// Splice this adapter into the host's call path.
    ///
    /// # Errors
    /// Returns [`NetworkError::BaseLayerDropped`] once the host dropped the layer.
    pub fn apply_to(self: &Arc<Self>) -> Result<()> {
        let slot = self.base()?;
        slot.attach(Arc::clone(self) as Arc<dyn LayerHook>);
        Ok(())
    }

    /// Remove this adapter from the host's call path. Returns `false` if it
    /// was not attached.
    pub fn detach(self: &Arc<Self>) -> bool {
        let hook = Arc::clone(self) as Arc<dyn LayerHook>;
        self.base().is_ok_and(|slot| slot.detach(&hook))
    }

    /// Parameters and the alpha buffer under their full weight-file keys.
    ///
    /// # Errors
    /// Returns an error if the alpha buffer cannot be created.
    pub fn state_dict(&self) -> Result<Vec<(String, Tensor)>> {
        let core = self.core();
        let mut entries: Vec<(String, Tensor)> = self
            .named_vars()
            .into_iter()
            .map(|(suffix, var)| (format!("{}.{suffix}", core.name), var.as_tensor().clone()))
            .collect();
        entries.push((
            format!("{}.alpha", core.name),
            Tensor::new(core.alpha as f32, &core.device)?,
        ));
        Ok(entries)
    }

    /// Match `weights` against this adapter's parameters without touching them.
    ///
    /// Returns each matched variable paired with its stored value, already
    /// cast to the variable's dtype and device, and the keys of parameters
    /// missing from `weights`.
    ///
    /// # Errors
    /// Returns [`NetworkError::ShapeMismatch`] if a stored tensor has the wrong shape.
    pub fn stage_weights(
        &self,
        weights: &std::collections::BTreeMap<String, Tensor>,
    ) -> Result<(Vec<(Var, Tensor)>, Vec<String>)> {
        let mut staged = Vec::new();
        let mut missing = Vec::new();
        for (suffix, var) in self.named_vars() {
            let key = format!("{}.{suffix}", self.name());
            let Some(stored) = weights.get(&key) else {
                missing.push(key);
                continue;
            };
            if stored.dims() != var.dims() {
                return Err(NetworkError::ShapeMismatch {
                    key,
                    expected: var.dims().to_vec(),
                    actual: stored.dims().to_vec(),
                });
            }
            let value = stored.to_dtype(var.dtype())?.to_device(var.device())?;
            staged.push((var, value));
        }
        Ok((staged, missing))
    }

    /// Copy every parameter found in `weights` into this adapter.
    ///
    /// Returns the keys of parameters missing from `weights`; those keep
    /// their current values. Nothing is copied if any shape is wrong.
    ///
    /// # Errors
    /// Returns [`NetworkError::ShapeMismatch`] if a stored tensor has the wrong shape.
    pub fn load_from(
        &self,
        weights: &std::collections::BTreeMap<String, Tensor>,
    ) -> Result<Vec<String>> {
        let (staged, missing) = self.stage_weights(weights)?;
        for (var, value) in staged {
            var.set(&value)?;
        }
        Ok(missing)
    }
}

impl Adapter for AdapterModule {
    fn name(&self) -> &str {
        &self.core().name
    }

    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>) -> Result<Tensor> {
        match base_output {
            Some(base) => {
                let delta = self.correction(input, base.dtype())?;
                Ok(base.broadcast_add(&delta)?)
            }
            None => Ok(self.correction(input, input.dtype())?),
        }
    }

    fn num_parameters(&self) -> usize {
        self.named_vars()
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum()
    }

    fn rank(&self) -> usize {
        self.core().rank
    }

    fn alpha(&self) -> f64 {
        self.core().alpha
    }

    fn multiplier(&self) -> f64 {
        self.core().multiplier()
    }

    fn set_multiplier(&self, multiplier: f64) {
        self.core()
            .multiplier
            .store(multiplier.to_bits(), Ordering::Relaxed);
    }
}

impl Mergeable for AdapterModule {
    fn delta_weight(&self) -> Result<Tensor> {
        let delta = dispatch!(self, m => m.raw_delta_weight())?;
        Ok(delta.affine(self.core().factor(), 0.0)?)
    }
}

impl Trainable for AdapterModule {
    fn named_vars(&self) -> Vec<(&'static str, Var)> {
        dispatch!(self, m => m.named_vars())
    }

    fn set_train(&self, train: bool) {
        self.core().training.store(train, Ordering::Relaxed);
    }

    fn is_training(&self) -> bool {
        self.core().training.load(Ordering::Relaxed)
    }
}

impl LayerHook for AdapterModule {
    fn hook_forward(&self, input: &Tensor, output: Tensor) -> candle_core::Result<Tensor> {
        let delta = self.correction(input, output.dtype())?;
        output.broadcast_add(&delta)
    }
}

impl std::fmt::Debug for AdapterModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core();
        f.debug_struct("AdapterModule")
            .field("algo", &self.algo())
            .field("name", &core.name)
            .field("shape", &core.shape)
            .field("rank", &core.rank)
            .field("alpha", &core.alpha)
            .field("multiplier", &core.multiplier())
            .finish_non_exhaustive()
    }
}
