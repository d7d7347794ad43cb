/// Checkpoint files with safetensors
///
/// Two on-disk formats share one reader:
/// - compact: a safetensors file, with string metadata in its header
/// - standard: a JSON document holding metadata and `{dtype, shape, data}`
///   tensors, written when compact encoding fails
///
/// The reader tells them apart by the first byte: a JSON document starts
/// with `{`, a safetensors file with its little-endian header length.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::{LifecycleError, Result};

/// Parameter name to tensor
pub type StateDict = BTreeMap<String, Tensor>;

/// String metadata stored next to the tensors
pub type Metadata = HashMap<String, String>;

/// Anything that can be written as a weight checkpoint
pub trait StateDictSource {
    fn state_dict(&self) -> Result<StateDict>;
}

/// Serialization format a checkpoint was written in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Compact,
    Standard,
}

/// One element of a standard-format tensor
///
/// JSON numbers cannot hold NaN or infinities, so those are written as the
/// strings `"NaN"`, `"inf"` and `"-inf"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Finite(f64),
    NonFinite(String),
}

impl From<f64> for StoredValue {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            StoredValue::Finite(value)
        } else if value.is_nan() {
            StoredValue::NonFinite("NaN".to_string())
        } else if value > 0.0 {
            StoredValue::NonFinite("inf".to_string())
        } else {
            StoredValue::NonFinite("-inf".to_string())
        }
    }
}

impl StoredValue {
    fn to_f64(&self) -> Result<f64> {
        match self {
            StoredValue::Finite(value) => Ok(*value),
            StoredValue::NonFinite(tag) => match tag.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(LifecycleError::Checkpoint(format!(
                    "invalid tensor value '{}'",
                    other
                ))),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredTensor {
    dtype: String,
    shape: Vec<usize>,
    data: Vec<StoredValue>,
}

#[derive(Serialize, Deserialize)]
struct StandardFile {
    #[serde(default)]
    metadata: Option<Metadata>,
    tensors: BTreeMap<String, StoredTensor>,
}

/// Move every tensor to host memory
pub fn to_host(tensors: &StateDict) -> Result<StateDict> {
    tensors
        .iter()
        .map(|(name, t)| Ok((name.clone(), t.to_device(&Device::Cpu)?)))
        .collect()
}

/// Encode as safetensors
pub fn encode_compact(tensors: &StateDict, metadata: Option<Metadata>) -> Result<Vec<u8>> {
    let host = to_host(tensors)?;
    let bytes = safetensors::tensor::serialize(host.iter().map(|(k, v)| (k.as_str(), v)), &metadata)?;
    Ok(bytes)
}

/// Encode as a standard JSON document
pub fn encode_standard(tensors: &StateDict, metadata: Option<Metadata>) -> Result<Vec<u8>> {
    let mut stored = BTreeMap::new();
    for (name, tensor) in tensors {
        stored.insert(
            name.clone(),
            StoredTensor {
                dtype: tensor.dtype().as_str().to_string(),
                shape: tensor.dims().to_vec(),
                data: tensor
                    .to_device(&Device::Cpu)?
                    .to_dtype(DType::F64)?
                    .flatten_all()?
                    .to_vec1::<f64>()?
                    .into_iter()
                    .map(StoredValue::from)
                    .collect(),
            },
        );
    }
    let file = StandardFile {
        metadata,
        tensors: stored,
    };
    Ok(serde_json::to_vec(&file)?)
}

/// Decode either format, placing tensors on `device`
pub fn decode(bytes: &[u8], device: &Device) -> Result<(StateDict, Option<Metadata>)> {
    if bytes.first() == Some(&b'{') {
        let file: StandardFile = serde_json::from_slice(bytes)?;
        let mut tensors = StateDict::new();
        for (name, stored) in file.tensors {
            let dtype = DType::from_str(&stored.dtype).map_err(|_| {
                LifecycleError::Checkpoint(format!("unknown dtype '{}' for {}", stored.dtype, name))
            })?;
            let data = stored
                .data
                .iter()
                .map(StoredValue::to_f64)
                .collect::<Result<Vec<f64>>>()?;
            let tensor = Tensor::from_vec(data, stored.shape, device)?.to_dtype(dtype)?;
            tensors.insert(name, tensor);
        }
        Ok((tensors, file.metadata))
    } else {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header.metadata().clone();
        let tensors = candle_core::safetensors::load_buffer(bytes, device)?
            .into_iter()
            .collect();
        Ok((tensors, metadata))
    }
}

/// Copy an existing `path` to `previous` before it is overwritten
///
/// Returns whether a rotation happened.
pub fn rotate_previous(path: &Path, previous: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    std::fs::copy(path, previous)?;
    log::debug!("Rotated {} to {}", path.display(), previous.display());
    Ok(true)
}

/// Write through a sibling temporary file and rename into place
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| LifecycleError::Checkpoint(format!("not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Encode with `compact`, falling back to `standard` on failure
pub(crate) fn write_with_fallback(
    path: &Path,
    compact: impl FnOnce() -> Result<Vec<u8>>,
    standard: impl FnOnce() -> Result<Vec<u8>>,
) -> Result<Format> {
    let (bytes, format) = match compact() {
        Ok(bytes) => (bytes, Format::Compact),
        Err(e) => {
            log::warn!(
                "Compact encoding of {} failed ({}), using standard format",
                path.display(),
                e
            );
            (standard()?, Format::Standard)
        }
    };
    write_atomic(path, &bytes)?;
    Ok(format)
}

/// Save named tensors plus metadata
pub fn save_tensors(path: &Path, tensors: &StateDict, metadata: Option<Metadata>) -> Result<Format> {
    write_with_fallback(
        path,
        || encode_compact(tensors, metadata.clone()),
        || encode_standard(tensors, metadata.clone()),
    )
}

/// Load named tensors plus metadata
pub fn load_tensors(path: &Path, device: &Device) -> Result<(StateDict, Option<Metadata>)> {
    let bytes = std::fs::read(path)?;
    decode(&bytes, device)
}

/// File name of a network checkpoint
pub fn network_file_name(label: &str, iter: usize, latest: bool) -> String {
    if latest {
        format!("latest_{}.safetensors", label)
    } else {
        format!("{}_{}.safetensors", iter, label)
    }
}

/// Rotate and write a network checkpoint into `dir`
pub fn save_network(
    dir: &Path,
    source: &dyn StateDictSource,
    label: &str,
    iter: usize,
    latest: bool,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(network_file_name(label, iter, latest));
    rotate_previous(&path, &dir.join(format!("previous_{}.safetensors", label)))?;

    let tensors = source.state_dict()?;
    let format = save_tensors(&path, &tensors, None)?;
    log::info!("Saved {} ({:?}) to {}", label, format, path.display());
    Ok(path)
}
