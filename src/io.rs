//! Weight persistence: reading and writing adapter weight dictionaries.
//!
//! Files ending in `.safetensors` carry string metadata alongside the
//! tensors. PyTorch pickles (`.pt`, `.pth`, `.ckpt`, `.bin`) are accepted
//! for loading only. Every other extension is a NumPy `.npz` archive.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Algo;
use crate::error::{NetworkError, Result};

/// Metadata key of the hash over the tensor payload.
pub const MODEL_HASH_KEY: &str = "sshs_model_hash";
/// Metadata key of the short hash over a fixed window of the file.
pub const LEGACY_HASH_KEY: &str = "sshs_legacy_hash";

const LEGACY_HASH_OFFSET: usize = 0x10_0000;
const LEGACY_HASH_LEN: usize = 0x1_0000;

/// Container format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// safetensors, with a metadata header
    SafeTensors,
    /// PyTorch pickle, read-only
    Pickle,
    /// NumPy archive, no metadata
    Npz,
}

impl WeightFormat {
    /// Pick the format for `path`.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("safetensors") => Self::SafeTensors,
            Some("pt" | "pth" | "ckpt" | "bin") => Self::Pickle,
            _ => Self::Npz,
        }
    }

    /// Whether the container stores string metadata.
    #[must_use]
    pub fn supports_metadata(self) -> bool {
        matches!(self, Self::SafeTensors)
    }
}

/// Load a weight dictionary onto the CPU, sorted by key.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn load_weights(path: impl AsRef<Path>) -> Result<BTreeMap<String, Tensor>> {
    let path = path.as_ref();
    let format = WeightFormat::from_path(path);
    let weights: BTreeMap<String, Tensor> = match format {
        WeightFormat::SafeTensors => candle_core::safetensors::load(path, &Device::Cpu)?
            .into_iter()
            .collect(),
        WeightFormat::Pickle => candle_core::pickle::read_all(path)?.into_iter().collect(),
        WeightFormat::Npz => Tensor::read_npz(path)?.into_iter().collect(),
    };
    info!(path = %path.display(), ?format, tensors = weights.len(), "loaded weights");
    Ok(weights)
}

/// Write a weight dictionary, adding provenance hashes to `metadata`.
///
/// Empty metadata is treated as absent. Returns the metadata as written;
/// for `.npz` targets it is not stored and the caller may persist it.
/// `.npz` has no bf16 type, so bf16 tensors are stored as f32 there.
///
/// # Errors
/// Returns an error for pickle targets, or if hashing or writing fails.
pub fn save_weights(
    path: impl AsRef<Path>,
    tensors: &BTreeMap<String, Tensor>,
    metadata: Option<HashMap<String, String>>,
) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    let format = WeightFormat::from_path(path);
    if format == WeightFormat::Pickle {
        return Err(NetworkError::InvalidConfig(format!(
            "cannot write pickle weights to {}",
            path.display()
        )));
    }

    let widened;
    let tensors = if format == WeightFormat::Npz
        && tensors.values().any(|tensor| tensor.dtype() == DType::BF16)
    {
        warn!(path = %path.display(), "npz cannot store bf16, widening to f32");
        widened = tensors
            .iter()
            .map(|(key, tensor)| -> Result<(String, Tensor)> {
                let tensor = match tensor.dtype() {
                    DType::BF16 => tensor.to_dtype(DType::F32)?,
                    _ => tensor.clone(),
                };
                Ok((key.clone(), tensor))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        &widened
    } else {
        tensors
    };

    let mut metadata = metadata.filter(|m| !m.is_empty()).unwrap_or_default();
    let (model_hash, legacy_hash) = precalculate_safetensors_hashes(tensors, &metadata)?;
    metadata.insert(MODEL_HASH_KEY.to_string(), model_hash);
    metadata.insert(LEGACY_HASH_KEY.to_string(), legacy_hash);

    if format.supports_metadata() {
        safetensors::tensor::serialize_to_file(
            tensors.iter().map(|(key, tensor)| (key.as_str(), tensor)),
            &Some(metadata.clone()),
            path,
        )?;
    } else {
        let entries: Vec<(&str, &Tensor)> = tensors
            .iter()
            .map(|(key, tensor)| (key.as_str(), tensor))
            .collect();
        Tensor::write_npz(&entries, path)?;
        debug!(path = %path.display(), "npz target, metadata not stored");
    }
    info!(path = %path.display(), tensors = tensors.len(), "saved weights");
    Ok(metadata)
}

/// Hashes of `tensors` serialized as safetensors with only the `ss_`
/// training metadata, so they are stable across other metadata edits.
///
/// Returns `(model_hash, legacy_hash)`.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn precalculate_safetensors_hashes(
    tensors: &BTreeMap<String, Tensor>,
    metadata: &HashMap<String, String>,
) -> Result<(String, String)> {
    let training_metadata: HashMap<String, String> = metadata
        .iter()
        .filter(|(key, _)| key.starts_with("ss_"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let bytes = safetensors::tensor::serialize(
        tensors.iter().map(|(key, tensor)| (key.as_str(), tensor)),
        &Some(training_metadata),
    )?;
    Ok((model_hash(&bytes), legacy_hash(&bytes)))
}

/// SHA-256 of a serialized safetensors buffer, skipping its header.
#[must_use]
pub fn model_hash(bytes: &[u8]) -> String {
    let header_len = bytes
        .get(..8)
        .and_then(|len| <[u8; 8]>::try_from(len).ok())
        .map_or(0, u64::from_le_bytes);
    let offset = usize::try_from(header_len)
        .map_or(bytes.len(), |len| len.saturating_add(8))
        .min(bytes.len());
    hex::encode(Sha256::digest(&bytes[offset..]))
}

/// First 8 hex chars of the SHA-256 over a 64 KiB window at 1 MiB.
#[must_use]
pub fn legacy_hash(bytes: &[u8]) -> String {
    let start = LEGACY_HASH_OFFSET.min(bytes.len());
    let end = (start + LEGACY_HASH_LEN).min(bytes.len());
    let mut digest = hex::encode(Sha256::digest(&bytes[start..end]));
    digest.truncate(8);
    digest
}

/// The `__metadata__` block of a safetensors file.
///
/// # Errors
/// Returns an error if the file is not safetensors or cannot be read.
pub fn read_metadata(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    if WeightFormat::from_path(path) != WeightFormat::SafeTensors {
        return Err(NetworkError::InvalidConfig(format!(
            "{} does not carry metadata",
            path.display()
        )));
    }
    let bytes = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    Ok(header.metadata().clone().unwrap_or_default())
}

/// Network dimensions recovered from a weight dictionary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightDims {
    /// Adapter strategy the file was trained with
    pub algo: Algo,
    /// Rank of dense and 1x1 conv adapters
    pub rank: usize,
    /// Alpha paired with `rank`
    pub alpha: f64,
    /// Rank of larger-kernel conv adapters, 0 when the file has none
    pub conv_rank: usize,
    /// Alpha paired with `conv_rank`
    pub conv_alpha: f64,
}

/// Infer ranks and alphas from stored tensors. "First" means first in key order.
///
/// The rank comes from the first 2-D down projection (`lora_down` or
/// `hada_w1_b`). Files without dense adapters fall back to the first 1x1
/// conv `lora_down`, then to the first spatial one. The alpha is the one
/// stored next to the tensor that gave the rank, else the first `alpha` key,
/// else the rank. Conv rank and alpha come from the first spatial
/// `lora_down`; LoHa files store a single rank, which conv layers share.
///
/// # Errors
/// Returns an error if no tensor reveals the rank, or an alpha is not a scalar.
#[allow(clippy::cast_precision_loss)]
pub fn infer_network_dims(weights: &BTreeMap<String, Tensor>) -> Result<WeightDims> {
    let algo = if weights.keys().any(|key| key.contains("hada_")) {
        Algo::Loha
    } else {
        Algo::Lora
    };

    let dense = weights.iter().find_map(|(key, value)| {
        let module = key
            .strip_suffix(".lora_down.weight")
            .or_else(|| key.strip_suffix(".hada_w1_b"))?;
        (value.rank() == 2).then(|| (module, value.dims()[0]))
    });
    let conv_down = |spatial: bool| {
        weights.iter().find_map(|(key, value)| {
            let module = key.strip_suffix(".lora_down.weight")?;
            match value.dims() {
                &[rank, _, kh, kw] if (kh != 1 || kw != 1) == spatial => Some((module, rank)),
                _ => None,
            }
        })
    };
    let conv = match algo {
        Algo::Lora => conv_down(true),
        Algo::Loha => None,
    };

    let (module, rank) = dense
        .or_else(|| conv_down(false))
        .or(conv)
        .ok_or_else(|| {
            NetworkError::WeightLoad("no down projection to infer the rank from".into())
        })?;
    let alpha = match module_alpha(weights, module)? {
        Some(alpha) => alpha,
        None => match weights.iter().find(|(key, _)| key.contains("alpha")) {
            Some((_, value)) => scalar_value(value)?,
            None => rank as f64,
        },
    };

    let (conv_rank, conv_alpha) = match (algo, conv) {
        (Algo::Loha, _) => (rank, alpha),
        (Algo::Lora, Some((module, conv_rank))) => (
            conv_rank,
            module_alpha(weights, module)?.unwrap_or(conv_rank as f64),
        ),
        (Algo::Lora, None) => (0, alpha),
    };

    Ok(WeightDims {
        algo,
        rank,
        alpha,
        conv_rank,
        conv_alpha,
    })
}

fn module_alpha(weights: &BTreeMap<String, Tensor>, module: &str) -> Result<Option<f64>> {
    weights
        .get(&format!("{module}.alpha"))
        .map(scalar_value)
        .transpose()
}

fn scalar_value(tensor: &Tensor) -> Result<f64> {
    if tensor.elem_count() != 1 {
        return Err(NetworkError::WeightLoad(format!(
            "expected a scalar alpha, got shape {:?}",
            tensor.dims()
        )));
    }
    Ok(tensor
        .to_dtype(DType::F64)?
        .flatten_all()?
        .get(0)?
        .to_scalar::<f64>()?)
}

/// Save any serializable options as pretty JSON.
///
/// # Errors
/// Returns an error if serialization or writing fails.
pub fn save_options<T: Serialize, P: AsRef<Path>>(options: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(options)?;
    fs::write(path, json)?;
    Ok(())
}

/// Load options saved with [`save_options`].
///
/// # Errors
/// Returns an error if reading or parsing fails.
pub fn load_options<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}
