//! Core traits for injected adapters.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::Result;

/// Configuration trait for network hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Core adapter trait: a small trainable correction added to a frozen layer.
pub trait Adapter: Send + Sync {
    /// Globally unique, flattened adapter name.
    fn name(&self) -> &str;

    /// Forward pass applying the adapter correction.
    ///
    /// # Arguments
    /// * `input` - Input tensor of the wrapped layer
    /// * `base_output` - Output of the wrapped layer for the same input
    ///
    /// # Returns
    /// The scaled correction when `base_output` is `None`, otherwise
    /// `base_output + correction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>) -> Result<Tensor>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;

    /// Bottleneck rank.
    fn rank(&self) -> usize;

    /// Resolved alpha (never zero).
    fn alpha(&self) -> f64;

    /// `alpha / rank`.
    fn scale(&self) -> f64 {
        self.alpha() / self.rank() as f64
    }

    /// Current runtime multiplier.
    fn multiplier(&self) -> f64;

    /// Set the runtime multiplier. Takes effect on the next forward call.
    fn set_multiplier(&self, multiplier: f64);
}

/// Trait for adapters that can be merged into base weights.
pub trait Mergeable: Adapter {
    /// Weight-space correction `ΔW * scale * multiplier`, shaped like the base weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta cannot be computed.
    fn delta_weight(&self) -> Result<Tensor>;

    /// Merge adapter weights into base model weights.
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        let delta = self.delta_weight()?.to_dtype(base_weight.dtype())?;
        Ok(base_weight.broadcast_add(&delta)?)
    }

    /// Unmerge adapter weights from merged weights.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        let delta = self.delta_weight()?.to_dtype(merged_weight.dtype())?;
        Ok(merged_weight.broadcast_sub(&delta)?)
    }
}

/// Trait for trainable adapters.
pub trait Trainable: Adapter {
    /// Trainable variables with their parameter suffix (e.g. `lora_up.weight`).
    fn named_vars(&self) -> Vec<(&'static str, Var)>;

    /// Trainable variables in declaration order.
    fn vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, var)| var).collect()
    }

    /// Register trainable parameters with the variable map under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if parameter registration fails.
    fn register_parameters(&self, var_map: &VarMap, prefix: &str) -> Result<()> {
        let mut data = var_map.data().lock().map_err(|_| {
            crate::NetworkError::InvalidConfig("variable map lock poisoned".into())
        })?;
        for (suffix, var) in self.named_vars() {
            data.insert(format!("{prefix}.{suffix}"), var);
        }
        Ok(())
    }

    /// Switch between training (dropout active) and evaluation.
    fn set_train(&self, train: bool);

    /// Check if the adapter is in training mode.
    #[must_use]
    fn is_training(&self) -> bool;
}
