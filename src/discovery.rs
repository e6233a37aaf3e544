//! Discovery of injection points in a host module tree.
//!
//! Every container whose declared type is on the allow-list is walked and
//! each qualifying leaf becomes one [`Injection`]. Names are the host path
//! with dots flattened to underscores; they are the join key for weight
//! files, so the flattening must match what earlier runs produced.

use std::sync::Arc;

use crate::host::{named_modules, HostModule, LayerSlot, LeafKind};

/// Rank/alpha pairs for the two leaf families.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankPolicy {
    /// Rank for dense layers and 1x1 convolutions.
    pub lora_dim: usize,
    /// Alpha paired with `lora_dim`.
    pub alpha: f64,
    /// Rank for convolutions with a larger kernel.
    pub conv_dim: usize,
    /// Alpha paired with `conv_dim`.
    pub conv_alpha: f64,
}

impl RankPolicy {
    /// Rank and alpha for a leaf of `kind`, or `None` if it is not adapted.
    #[must_use]
    pub fn resolve(&self, kind: LeafKind) -> Option<(usize, f64)> {
        match kind {
            LeafKind::Dense if self.lora_dim > 0 => Some((self.lora_dim, self.alpha)),
            LeafKind::Conv2d { kernel_size: 1 } if self.lora_dim > 0 => {
                Some((self.lora_dim, self.alpha))
            }
            LeafKind::Conv2d { kernel_size } if kernel_size != 1 && self.conv_dim > 0 => {
                Some((self.conv_dim, self.conv_alpha))
            }
            _ => None,
        }
    }
}

/// One leaf selected for adaptation.
#[derive(Debug, Clone)]
pub struct Injection {
    /// Flattened, globally unique name.
    pub name: String,
    /// The leaf's slot.
    pub slot: Arc<LayerSlot>,
    /// Resolved rank.
    pub rank: usize,
    /// Resolved alpha.
    pub alpha: f64,
}

/// Flatten `prefix.container.leaf` into an identifier.
#[must_use]
pub fn flatten_name(prefix: &str, container_path: &str, leaf_path: &str) -> String {
    format!("{prefix}.{container_path}.{leaf_path}").replace('.', "_")
}

/// Find every adaptable leaf under containers listed in `targets`.
///
/// Order follows [`named_modules`]: containers in traversal order, leaves in
/// traversal order within each container.
#[must_use]
pub fn discover(
    prefix: &str,
    root: &dyn HostModule,
    targets: &[String],
    policy: &RankPolicy,
) -> Vec<Injection> {
    let mut injections = Vec::new();
    for (container_path, container) in named_modules(root) {
        if !targets.iter().any(|t| t == container.type_name()) {
            continue;
        }
        for (leaf_path, leaf) in named_modules(container) {
            let Some(slot) = leaf.layer() else {
                continue;
            };
            let Some((rank, alpha)) = policy.resolve(slot.layer().kind()) else {
                continue;
            };
            let name = flatten_name(prefix, &container_path, &leaf_path);
            tracing::debug!(%name, rank, alpha, "discovered injection point");
            injections.push(Injection {
                name,
                slot: Arc::clone(slot),
                rank,
                alpha,
            });
        }
    }
    injections
}
