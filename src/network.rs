//! The adapter network: every adapter injected into a text encoder and a
//! main (U-Net) network, managed as one trainable unit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::{debug, info};

use crate::adapters::AdapterModule;
use crate::config::{NetworkConfig, NetworkOptions};
use crate::discovery::{discover, RankPolicy};
use crate::error::{NetworkError, Result};
use crate::host::HostModule;
use crate::io;
use crate::traits::{Adapter, AdapterConfig, Mergeable, Trainable};
use crate::training::{format_parameter_count, ParamGroup};

/// One of the two host sub-models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// The text encoder (`lora_te` keys)
    TextEncoder,
    /// The main denoising network (`lora_unet` keys)
    MainNetwork,
}

impl Partition {
    /// Both partitions, text encoder first.
    pub const ALL: [Self; 2] = [Self::TextEncoder, Self::MainNetwork];

    /// Name prefix of every adapter (and weight key) in this partition.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::TextEncoder => "lora_te",
            Self::MainNetwork => "lora_unet",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TextEncoder => "text encoder",
            Self::MainNetwork => "main network",
        })
    }
}

/// Outcome of populating adapters from a weight dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Adapter parameters absent from the weights; they keep their initial values.
    pub missing_keys: Vec<String>,
    /// Weight keys that match no adapter parameter.
    pub unexpected_keys: Vec<String>,
}

/// Owner of all adapters for one fine-tuning session.
pub struct NetworkController {
    config: NetworkConfig,
    text_encoder_adapters: Vec<Arc<AdapterModule>>,
    main_network_adapters: Vec<Arc<AdapterModule>>,
    pending_weights: Option<BTreeMap<String, Tensor>>,
    var_map: VarMap,
    attached: bool,
}

impl NetworkController {
    /// Discover and build adapters for both host sub-models.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, two adapters share a
    /// name, or an adapter cannot be constructed.
    pub fn new(
        text_encoder: &dyn HostModule,
        main_network: &dyn HostModule,
        config: NetworkConfig,
    ) -> Result<Self> {
        config.validate()?;
        if config.conv_lora_dim != config.lora_dim {
            info!(
                conv_dim = config.conv_lora_dim,
                lora_dim = config.lora_dim,
                "applying a different rank to conv layers"
            );
        }
        if config.conv_alpha != config.alpha {
            info!(
                conv_alpha = config.conv_alpha,
                alpha = config.alpha,
                "applying a different alpha to conv layers"
            );
        }
        if config.dropout > 0.0 {
            info!(dropout = config.dropout, "using dropout on the adapter path");
        }

        let text_encoder_adapters = Self::create_modules(
            Partition::TextEncoder,
            text_encoder,
            &config.targets.text_encoder,
            &config,
        )?;
        info!(
            modules = text_encoder_adapters.len(),
            "created adapters for the text encoder"
        );

        let main_network_adapters = Self::create_modules(
            Partition::MainNetwork,
            main_network,
            &config.targets.main_network,
            &config,
        )?;
        info!(
            modules = main_network_adapters.len(),
            "created adapters for the main network"
        );

        let mut names = HashSet::new();
        for adapter in text_encoder_adapters.iter().chain(&main_network_adapters) {
            if !names.insert(adapter.name()) {
                return Err(NetworkError::DuplicateName {
                    name: adapter.name().to_string(),
                });
            }
        }

        Ok(Self {
            config,
            text_encoder_adapters,
            main_network_adapters,
            pending_weights: None,
            var_map: VarMap::new(),
            attached: false,
        })
    }

    fn create_modules(
        partition: Partition,
        root: &dyn HostModule,
        targets: &[String],
        config: &NetworkConfig,
    ) -> Result<Vec<Arc<AdapterModule>>> {
        let policy = RankPolicy {
            lora_dim: config.lora_dim,
            alpha: config.alpha,
            conv_dim: config.conv_lora_dim,
            conv_alpha: config.conv_alpha,
        };
        discover(partition.prefix(), root, targets, &policy)
            .into_iter()
            .map(|injection| {
                AdapterModule::new(
                    config.algo,
                    injection.name,
                    &injection.slot,
                    config.multiplier,
                    injection.rank,
                    injection.alpha,
                    config.dropout,
                )
                .map(Arc::new)
            })
            .collect()
    }

    /// Hyperparameters the network was built with.
    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Current global multiplier.
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.config.multiplier
    }

    /// Broadcast `multiplier` to every adapter; takes effect on the next forward pass.
    pub fn set_multiplier(&mut self, multiplier: f64) {
        self.config.multiplier = multiplier;
        for adapter in self.adapters() {
            adapter.set_multiplier(multiplier);
        }
    }

    /// Adapters of the text encoder, in discovery order.
    #[must_use]
    pub fn text_encoder_adapters(&self) -> &[Arc<AdapterModule>] {
        &self.text_encoder_adapters
    }

    /// Adapters of the main network, in discovery order.
    #[must_use]
    pub fn main_network_adapters(&self) -> &[Arc<AdapterModule>] {
        &self.main_network_adapters
    }

    /// Adapters of `partition`.
    #[must_use]
    pub fn partition_adapters(&self, partition: Partition) -> &[Arc<AdapterModule>] {
        match partition {
            Partition::TextEncoder => &self.text_encoder_adapters,
            Partition::MainNetwork => &self.main_network_adapters,
        }
    }

    /// All adapters, text encoder first.
    pub fn adapters(&self) -> impl Iterator<Item = &Arc<AdapterModule>> {
        self.text_encoder_adapters
            .iter()
            .chain(&self.main_network_adapters)
    }

    /// Look up an adapter by name.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&Arc<AdapterModule>> {
        self.adapters().find(|adapter| adapter.name() == name)
    }

    /// Whether the adapters are currently spliced into the host graph.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Read a weight file into the pending weights, replacing earlier ones.
    /// Key coverage is only checked by [`NetworkController::apply`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.pending_weights = Some(io::load_weights(path)?);
        Ok(())
    }

    /// Replace the pending weights with an in-memory dictionary.
    pub fn set_pending_weights(&mut self, weights: BTreeMap<String, Tensor>) {
        self.pending_weights = Some(weights);
    }

    /// Weights loaded but not yet applied.
    #[must_use]
    pub fn pending_weights(&self) -> Option<&BTreeMap<String, Tensor>> {
        self.pending_weights.as_ref()
    }

    /// Splice the enabled partitions into the host graph and populate them
    /// from the pending weights.
    ///
    /// With pending weights, partitions are enabled by the key prefixes they
    /// contain and explicit flags must agree. Without them, both flags are
    /// required. Disabled partitions are dropped for good.
    ///
    /// On error the controller, its pending weights and the host graph are
    /// left as they were.
    ///
    /// # Errors
    /// Returns an error on contradicting or missing flags, a second call
    /// without [`NetworkController::restore`], a weight of the wrong shape, or
    /// a dropped host layer.
    pub fn apply(
        &mut self,
        apply_text_encoder: Option<bool>,
        apply_main_network: Option<bool>,
    ) -> Result<LoadReport> {
        if self.attached {
            return Err(NetworkError::InvalidConfig(
                "network is already applied".into(),
            ));
        }

        let weights = self.pending_weights.as_ref().filter(|w| !w.is_empty());
        let (apply_text_encoder, apply_main_network) = match weights {
            Some(weights) => {
                let has = |partition: Partition| {
                    weights.keys().any(|key| key.starts_with(partition.prefix()))
                };
                let te = has(Partition::TextEncoder);
                let main = has(Partition::MainNetwork);
                (
                    resolve_flag(Partition::TextEncoder, apply_text_encoder, te)?,
                    resolve_flag(Partition::MainNetwork, apply_main_network, main)?,
                )
            }
            None => match (apply_text_encoder, apply_main_network) {
                (Some(te), Some(main)) => (te, main),
                _ => return Err(NetworkError::PartitionUnspecified),
            },
        };

        let enabled: Vec<Arc<AdapterModule>> = [
            (Partition::TextEncoder, apply_text_encoder),
            (Partition::MainNetwork, apply_main_network),
        ]
        .into_iter()
        .filter(|(_, enabled)| *enabled)
        .flat_map(|(partition, _)| self.partition_adapters(partition).iter().cloned())
        .collect();

        let (staged, report) = match weights {
            Some(weights) => stage_weights(&enabled, weights)?,
            None => (Vec::new(), LoadReport::default()),
        };

        let var_map = VarMap::new();
        for adapter in &enabled {
            adapter.register_parameters(&var_map, adapter.name())?;
        }

        for (i, adapter) in enabled.iter().enumerate() {
            if let Err(e) = adapter.apply_to() {
                detach_all(&enabled[..i]);
                return Err(e);
            }
        }
        for (var, value) in staged {
            if let Err(e) = var.set(&value) {
                detach_all(&enabled);
                return Err(e.into());
            }
        }

        if apply_text_encoder {
            info!("enabling adapters for the text encoder");
        } else {
            self.text_encoder_adapters.clear();
        }
        if apply_main_network {
            info!("enabling adapters for the main network");
        } else {
            self.main_network_adapters.clear();
        }
        self.pending_weights = None;
        self.var_map = var_map;
        self.attached = true;
        Ok(report)
    }

    /// Detach every adapter from the host graph. Returns how many were attached.
    pub fn restore(&mut self) -> usize {
        let detached = self.adapters().filter(|adapter| adapter.detach()).count();
        self.var_map = VarMap::new();
        self.attached = false;
        info!(detached, "restored host layers");
        detached
    }

    /// Switch every adapter between training and evaluation mode.
    pub fn set_train(&self, train: bool) {
        for adapter in self.adapters() {
            adapter.set_train(train);
        }
    }

    /// One parameter group per non-empty partition, with its learning rate override.
    #[must_use]
    pub fn prepare_optimizer_params(
        &self,
        text_encoder_lr: Option<f64>,
        main_network_lr: Option<f64>,
    ) -> Vec<ParamGroup> {
        let mut groups = Vec::new();
        for (partition, learning_rate) in [
            (Partition::TextEncoder, text_encoder_lr),
            (Partition::MainNetwork, main_network_lr),
        ] {
            let adapters = self.partition_adapters(partition);
            if adapters.is_empty() {
                continue;
            }
            let group = ParamGroup {
                partition,
                params: adapters.iter().flat_map(|adapter| adapter.vars()).collect(),
                learning_rate,
            };
            debug!(
                %partition,
                params = %format_parameter_count(group.num_parameters()),
                ?learning_rate,
                "prepared parameter group"
            );
            groups.push(group);
        }
        groups
    }

    /// Every trainable variable, text encoder first.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.adapters().flat_map(|adapter| adapter.vars()).collect()
    }

    /// Variables registered by the last [`NetworkController::apply`].
    #[must_use]
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Total trainable parameter count.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.adapters()
            .map(|adapter| adapter.num_parameters())
            .sum()
    }

    /// Adapter-only weight dictionary, including alpha buffers.
    ///
    /// # Errors
    /// Returns an error if an alpha buffer cannot be created.
    pub fn state_dict(&self) -> Result<BTreeMap<String, Tensor>> {
        let mut state = BTreeMap::new();
        for adapter in self.adapters() {
            state.extend(adapter.state_dict()?);
        }
        Ok(state)
    }

    /// Base weights with every adapter merged in, keyed by adapter name.
    ///
    /// # Errors
    /// Returns an error if a base layer was dropped or a delta cannot be merged.
    pub fn merged_weights(&self) -> Result<BTreeMap<String, Tensor>> {
        let mut merged = BTreeMap::new();
        for adapter in self.adapters() {
            let slot = adapter.base()?;
            let Some(weight) = slot.layer().weight() else {
                continue;
            };
            merged.insert(adapter.name().to_string(), adapter.merge(weight)?);
        }
        Ok(merged)
    }

    /// Save the adapter weights, optionally cast to `dtype`.
    ///
    /// Provenance hashes are added to `metadata`; the final metadata is
    /// returned (containers without metadata support leave persisting it to
    /// the caller).
    ///
    /// # Errors
    /// Returns an error if casting, hashing or writing fails.
    pub fn save_weights(
        &self,
        path: impl AsRef<Path>,
        dtype: Option<DType>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<HashMap<String, String>> {
        let mut state = BTreeMap::new();
        for (key, tensor) in self.state_dict()? {
            let tensor = tensor.to_device(&Device::Cpu)?;
            let tensor = match dtype {
                Some(dtype) => tensor.to_dtype(dtype)?,
                None => tensor,
            };
            state.insert(key, tensor);
        }
        io::save_weights(path, &state, metadata)
    }
}

/// Match `weights` against every adapter in `adapters` without modifying any.
fn stage_weights(
    adapters: &[Arc<AdapterModule>],
    weights: &BTreeMap<String, Tensor>,
) -> Result<(Vec<(Var, Tensor)>, LoadReport)> {
    let mut staged = Vec::new();
    let mut report = LoadReport::default();
    let mut expected = BTreeSet::new();
    for adapter in adapters {
        for (suffix, _) in adapter.named_vars() {
            expected.insert(format!("{}.{suffix}", adapter.name()));
        }
        expected.insert(format!("{}.alpha", adapter.name()));
        let (values, missing) = adapter.stage_weights(weights)?;
        staged.extend(values);
        report.missing_keys.extend(missing);
    }
    report.unexpected_keys = weights
        .keys()
        .filter(|key| !expected.contains(*key))
        .cloned()
        .collect();
    for key in &report.missing_keys {
        debug!(%key, "no stored weight, keeping initial value");
    }
    info!(
        loaded = staged.len(),
        missing = report.missing_keys.len(),
        unexpected = report.unexpected_keys.len(),
        "weights are loaded"
    );
    Ok((staged, report))
}

fn detach_all(adapters: &[Arc<AdapterModule>]) {
    for adapter in adapters {
        adapter.detach();
    }
}

fn resolve_flag(partition: Partition, requested: Option<bool>, in_weights: bool) -> Result<bool> {
    match requested {
        None => Ok(in_weights),
        Some(requested) if requested == in_weights => Ok(requested),
        Some(requested) => Err(NetworkError::PartitionMismatch {
            partition,
            in_weights,
            requested,
        }),
    }
}

/// Build a network for a trainer.
///
/// `network_dim` defaults to 4. The VAE is accepted for trainer
/// compatibility and never adapted.
///
/// # Errors
/// Returns an error if the options are invalid or construction fails.
pub fn create_network(
    multiplier: f64,
    network_dim: Option<usize>,
    network_alpha: f64,
    _vae: Option<&dyn HostModule>,
    text_encoder: &dyn HostModule,
    main_network: &dyn HostModule,
    options: &NetworkOptions,
) -> Result<NetworkController> {
    options.validate()?;
    info!(algo = %options.algo, "using rank adaptation algo");
    let config = NetworkConfig::from_options(
        multiplier,
        network_dim.unwrap_or(4),
        network_alpha,
        options,
    );
    NetworkController::new(text_encoder, main_network, config)
}

/// Build a network whose dimensions are read from an existing weight file;
/// the file's contents become the pending weights.
///
/// Only `dropout` and `targets` are taken from `options`; ranks, alphas and
/// the algo come from the file.
///
/// # Errors
/// Returns an error if the file cannot be read, no rank can be inferred, or
/// construction fails.
pub fn create_network_from_weights(
    multiplier: f64,
    path: impl AsRef<Path>,
    _vae: Option<&dyn HostModule>,
    text_encoder: &dyn HostModule,
    main_network: &dyn HostModule,
    options: &NetworkOptions,
) -> Result<NetworkController> {
    let weights = io::load_weights(path)?;
    let dims = io::infer_network_dims(&weights)?;
    info!(
        algo = %dims.algo,
        rank = dims.rank,
        alpha = dims.alpha,
        conv_rank = dims.conv_rank,
        conv_alpha = dims.conv_alpha,
        "inferred network dims from weights"
    );
    let config = NetworkConfig {
        multiplier,
        lora_dim: dims.rank,
        conv_lora_dim: dims.conv_rank,
        alpha: dims.alpha,
        conv_alpha: dims.conv_alpha,
        dropout: options.dropout,
        algo: dims.algo,
        targets: options.targets.clone(),
    };
    let mut network = NetworkController::new(text_encoder, main_network, config)?;
    network.pending_weights = Some(weights);
    Ok(network)
}
