//! Optimizer-facing surface of the network.

// Parameter counts are only formatted for display.
#![allow(clippy::cast_precision_loss)]

use candle_core::Var;

use crate::network::Partition;

/// Trainable variables of one partition, with an optional learning rate
/// override. Without an override the optimizer's default rate applies.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Which sub-model the variables belong to
    pub partition: Partition,
    /// The variables, in adapter discovery order
    pub params: Vec<Var>,
    /// Learning rate override
    pub learning_rate: Option<f64>,
}

impl ParamGroup {
    /// Total number of trainable elements.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.params.iter().map(|var| var.elem_count()).sum()
    }

    /// The group's learning rate, or `default` when it has no override.
    #[must_use]
    pub fn learning_rate_or(&self, default: f64) -> f64 {
        self.learning_rate.unwrap_or(default)
    }
}

/// Format parameter count with appropriate units.
///
/// # Returns
/// Human-readable string (e.g., "12.3K", "1.5M", "2.1B")
#[must_use]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}
