//! # lycon
//!
//! Low-rank adapter networks for diffusion models: discovers adaptable
//! layers in a text encoder and a U-Net, wraps each with a trainable
//! low-rank correction, and saves/loads the result as a flat weight file.
//!
//! Two adapter strategies are provided:
//! - **`LoCon`** (`algo = "lora"`): `up · down`, extended to convolutions
//! - **`LoHa`** (`algo = "loha"`): Hadamard product of two low-rank pairs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lycon::{create_network, NetworkOptions};
//!
//! let options = NetworkOptions::from_network_args(["conv_dim=8", "conv_alpha=4"])?;
//! let mut network = create_network(1.0, Some(16), 8.0, None, &text_encoder, &unet, &options)?;
//! network.apply(Some(true), Some(true))?;
//!
//! let groups = network.prepare_optimizer_params(Some(5e-5), Some(1e-4));
//! // ... train ...
//! network.save_weights("out.safetensors", None, None)?;
//! ```
//!
//! ## Architecture
//!
//! The host model is seen through [`HostModule`]: a tree of named children
//! whose leaves own a [`LayerSlot`]. Applying the network attaches each
//! adapter as a hook on its slot, so the host's forward pass picks up the
//! correction without the host being rebuilt.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod io;
pub mod network;
pub mod training;
pub mod traits;

#[cfg(test)]
mod test_utils;

pub use adapters::{AdapterModule, BaseShape, LoConModule, LoHaModule};
pub use config::{Algo, NetworkConfig, NetworkOptions, TargetModules};
pub use discovery::{discover, flatten_name, Injection, RankPolicy};
pub use error::{NetworkError, Result};
pub use host::{named_modules, HostLayer, HostModule, LayerHook, LayerSlot, LeafKind, ModuleNode};
pub use io::{
    infer_network_dims, load_options, load_weights, read_metadata, save_options, save_weights,
    WeightDims, WeightFormat,
};
pub use network::{
    create_network, create_network_from_weights, LoadReport, NetworkController, Partition,
};
pub use training::{format_parameter_count, ParamGroup};
pub use traits::{Adapter, AdapterConfig, Mergeable, Trainable};
