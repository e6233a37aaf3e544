//! Configuration types for adapter networks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};
use crate::traits::AdapterConfig;

/// Adapter strategy used for every injected layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algo {
    /// Low-rank additive adapter (LoRA on dense layers, LoCon on convolutions)
    #[default]
    Lora,
    /// Hadamard-product factorized adapter
    Loha,
}

impl Algo {
    /// Tag as used in trainer arguments and option files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lora => "lora",
            Self::Loha => "loha",
        }
    }
}

impl fmt::Display for Algo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algo {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lora" => Ok(Self::Lora),
            "loha" => Ok(Self::Loha),
            other => Err(NetworkError::InvalidConfig(format!(
                "unknown algo '{other}', expected 'lora' or 'loha'"
            ))),
        }
    }
}

/// Container type names whose leaves receive adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetModules {
    /// Allow-list for the text encoder.
    pub text_encoder: Vec<String>,
    /// Allow-list for the main (U-Net) network.
    pub main_network: Vec<String>,
}

impl TargetModules {
    /// Text encoder containers adapted by default.
    pub const TEXT_ENCODER_DEFAULT: [&'static str; 2] = ["CLIPAttention", "CLIPMLP"];

    // proj_in / proj_out are left alone, they only carry a few channels.
    /// U-Net containers adapted by default.
    pub const MAIN_NETWORK_DEFAULT: [&'static str; 5] = [
        "Transformer2DModel",
        "Attention",
        "ResnetBlock2D",
        "Downsample2D",
        "Upsample2D",
    ];
}

impl Default for TargetModules {
    fn default() -> Self {
        Self {
            text_encoder: Self::TEXT_ENCODER_DEFAULT.iter().map(|s| (*s).into()).collect(),
            main_network: Self::MAIN_NETWORK_DEFAULT.iter().map(|s| (*s).into()).collect(),
        }
    }
}

/// Optional trainer arguments accepted by [`crate::create_network`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkOptions {
    /// Rank for convolutions with a kernel larger than 1 (defaults to the network rank).
    #[serde(default)]
    pub conv_dim: Option<usize>,

    /// Alpha for convolutions with a kernel larger than 1 (defaults to the network alpha).
    #[serde(default)]
    pub conv_alpha: Option<f64>,

    /// Dropout probability on the correction path.
    #[serde(default)]
    pub dropout: f64,

    /// Adapter strategy.
    #[serde(default)]
    pub algo: Algo,

    /// Container allow-lists.
    #[serde(default)]
    pub targets: TargetModules,
}

impl NetworkOptions {
    /// Parse trainer-style `key=value` network arguments.
    ///
    /// Recognised keys are `conv_dim`, `conv_alpha`, `dropout` and `algo`.
    /// Unknown keys are ignored with a warning.
    ///
    /// # Errors
    /// Returns an error if an argument is malformed or a value does not parse.
    pub fn from_network_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                NetworkError::InvalidConfig(format!("network arg '{arg}' is not key=value"))
            })?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "conv_dim" => options.conv_dim = Some(parse_value(key, value)?),
                "conv_alpha" => options.conv_alpha = Some(parse_value(key, value)?),
                "dropout" => options.dropout = parse_value(key, value)?,
                "algo" => options.algo = value.parse()?,
                _ => tracing::warn!(key, "ignoring unknown network arg"),
            }
        }
        options.validate()?;
        Ok(options)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| NetworkError::InvalidConfig(format!("invalid value '{value}' for {key}")))
}

impl AdapterConfig for NetworkOptions {
    fn validate(&self) -> Result<()> {
        validate_dropout(self.dropout)?;
        if let Some(conv_alpha) = self.conv_alpha {
            validate_alpha("conv_alpha", conv_alpha)?;
        }
        Ok(())
    }
}

/// Hyperparameters of a [`crate::NetworkController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Global multiplier propagated to every adapter.
    pub multiplier: f64,
    /// Rank for dense layers and 1x1 convolutions (0 disables them).
    pub lora_dim: usize,
    /// Rank for larger-kernel convolutions (0 disables them).
    pub conv_lora_dim: usize,
    /// Alpha paired with `lora_dim`.
    pub alpha: f64,
    /// Alpha paired with `conv_lora_dim`.
    pub conv_alpha: f64,
    /// Dropout probability on the correction path.
    pub dropout: f64,
    /// Adapter strategy.
    pub algo: Algo,
    /// Container allow-lists.
    pub targets: TargetModules,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            lora_dim: 4,
            conv_lora_dim: 4,
            alpha: 1.0,
            conv_alpha: 1.0,
            dropout: 0.0,
            algo: Algo::Lora,
            targets: TargetModules::default(),
        }
    }
}

impl NetworkConfig {
    /// Build a config from the trainer's rank/alpha and optional arguments.
    #[must_use]
    pub fn from_options(multiplier: f64, lora_dim: usize, alpha: f64, options: &NetworkOptions) -> Self {
        Self {
            multiplier,
            lora_dim,
            conv_lora_dim: options.conv_dim.unwrap_or(lora_dim),
            alpha,
            conv_alpha: options.conv_alpha.unwrap_or(alpha),
            dropout: options.dropout,
            algo: options.algo,
            targets: options.targets.clone(),
        }
    }
}

impl AdapterConfig for NetworkConfig {
    fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() {
            return Err(NetworkError::InvalidConfig("multiplier must be finite".into()));
        }
        validate_alpha("alpha", self.alpha)?;
        validate_alpha("conv_alpha", self.conv_alpha)?;
        validate_dropout(self.dropout)
    }
}

fn validate_alpha(field: &str, alpha: f64) -> Result<()> {
    if !alpha.is_finite() || alpha < 0.0 {
        return Err(NetworkError::InvalidConfig(format!(
            "{field} must be a finite non-negative number"
        )));
    }
    Ok(())
}

fn validate_dropout(dropout: f64) -> Result<()> {
    if !(0.0..1.0).contains(&dropout) {
        return Err(NetworkError::InvalidConfig(
            "dropout must be in [0, 1)".into(),
        ));
    }
    Ok(())
}
