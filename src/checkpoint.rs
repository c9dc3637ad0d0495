// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checkpoint serializer: write a (mutated or pristine) dictionary to a
//! standalone `.safetensors` file.
//!
//! The serializer is a pure sink. It never snapshots or restores; call it
//! only when the current weights should outlive the session.
//!
//! Embedded metadata (`__metadata__` header table):
//!
//! | Key | Value |
//! |-----|-------|
//! | `architecture` | `image-model` or `text-encoder` |
//! | `granularity` | `coarse` or `fine` |
//! | `note` | free text |
//! | `format` | `pt` |
//! | `tuned_by` | `candle-tuner <version>` |
//! | `sliders` | JSON array of applied sliders, when recorded |

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use safetensors::{Dtype, SafeTensorError, View};
use serde_json::Value;

use crate::config::{Architecture, Granularity};
use crate::error::{Result, TuneError};
use crate::inject::SliderSpec;
use crate::tensors::TensorDict;

/// Value of the `tuned_by` metadata entry.
pub const TUNED_BY: &str = concat!("candle-tuner ", env!("CARGO_PKG_VERSION"));

/// Host prefixes stripped when matching template keys to dictionary keys.
const HOST_PREFIXES: [&str; 2] = ["qwen3_4b.transformer.", "model."];

/// Upper bound on a safetensors JSON header.
const MAX_HEADER_BYTES: u64 = 100_000_000;

// ---------------------------------------------------------------------------
// Metadata and options
// ---------------------------------------------------------------------------

/// Minimal provenance embedded in a saved checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMetadata {
    /// Architecture the weights belong to.
    pub architecture: Architecture,
    /// Grouping granularity the sliders used.
    pub granularity: Granularity,
    /// Human-readable note.
    pub note: String,
    /// Extra entries, written after the standard ones.
    pub extra: BTreeMap<String, String>,
}

impl CheckpointMetadata {
    /// Metadata with no extra entries.
    #[must_use]
    pub fn new(architecture: Architecture, granularity: Granularity, note: impl Into<String>) -> Self {
        Self {
            architecture,
            granularity,
            note: note.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Record the applied sliders as a JSON array under `sliders`.
    #[must_use]
    pub fn with_sliders(mut self, specs: &[SliderSpec]) -> Self {
        let sliders: Vec<Value> = specs
            .iter()
            .map(|spec| {
                serde_json::json!({
                    "group": spec.target.id(),
                    "value": spec.value,
                    "mode": spec.mode.to_string(),
                })
            })
            .collect();
        self.extra
            .insert("sliders".to_owned(), Value::Array(sliders).to_string());
        self
    }

    /// Add a free-form entry.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    fn to_map(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert("architecture".to_owned(), self.architecture.tag().to_owned());
        map.insert("granularity".to_owned(), self.granularity.to_string());
        map.insert("note".to_owned(), self.note.clone());
        map.insert("format".to_owned(), "pt".to_owned());
        map.insert("tuned_by".to_owned(), TUNED_BY.to_owned());
        map
    }
}

/// Output precision for floating-point tensors.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SavePrecision {
    /// IEEE half precision.
    F16,
    /// bfloat16.
    BF16,
    /// IEEE single precision.
    F32,
}

impl SavePrecision {
    /// The candle dtype for this precision.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

impl fmt::Display for SavePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F16 => write!(f, "fp16"),
            Self::BF16 => write!(f, "bf16"),
            Self::F32 => write!(f, "fp32"),
        }
    }
}

impl FromStr for SavePrecision {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp16" | "f16" | "half" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            "fp32" | "f32" | "float" | "float32" => Ok(Self::F32),
            other => Err(TuneError::Config(format!("unknown save precision: '{other}'"))),
        }
    }
}

/// Optional behaviour of [`save_with_options`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Cast floating-point tensors before writing; integers are untouched.
    pub precision: Option<SavePrecision>,
    /// Existing checkpoint whose key names and metadata the output keeps.
    pub template: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Write every tensor of `dict` to `path` with embedded metadata.
///
/// # Errors
///
/// Returns [`TuneError::Io`] on write failure and
/// [`TuneError::Serialization`] if a tensor has a dtype the archive format
/// cannot hold.
pub fn save(dict: &TensorDict, path: impl AsRef<Path>, metadata: &CheckpointMetadata) -> Result<()> {
    save_with_options(dict, path, metadata, &SaveOptions::default())
}

/// [`save`] with a precision cast and/or a template checkpoint.
///
/// In template mode the output carries exactly the template's tensor names
/// and its metadata (overlaid with `metadata`). Each template key is matched
/// to a dictionary key after stripping the known host prefixes
/// `qwen3_4b.transformer.` and `model.` from both sides.
///
/// # Errors
///
/// Returns [`TuneError::Io`] if the template cannot be read or the output
/// cannot be written, and [`TuneError::Serialization`] for an unsupported
/// dtype, a malformed template header, or a template key with no
/// counterpart in `dict`.
pub fn save_with_options(
    dict: &TensorDict,
    path: impl AsRef<Path>,
    metadata: &CheckpointMetadata,
    options: &SaveOptions,
) -> Result<()> {
    let path = path.as_ref();
    let mut header_metadata = HashMap::new();

    // (name written to disk, key in the dictionary)
    let names: Vec<(String, String)> = match &options.template {
        Some(template) => {
            let header = read_header(template)?;
            header_metadata.extend(metadata_of(&header));
            match_template_keys(dict, &header)?
        }
        None => dict.keys().map(|k| (k.to_owned(), k.to_owned())).collect(),
    };
    header_metadata.extend(metadata.to_map());

    let mut tensors = Vec::with_capacity(names.len());
    for (name, key) in names {
        let tensor = dict.get(&key).ok_or_else(|| {
            TuneError::Serialization(format!("tensor `{key}` is not in the dictionary"))
        })?;
        let prepared = prepare_tensor(tensor, options.precision)?;
        tensors.push((name, TensorBytes::from_tensor(&key, &prepared)?));
    }

    let count = tensors.len();
    safetensors::tensor::serialize_to_file(tensors, &Some(header_metadata), path)
        .map_err(map_safetensors_error)?;

    tracing::info!(
        path = %path.display(),
        tensors = count,
        architecture = %metadata.architecture,
        precision = ?options.precision,
        template = options.template.is_some(),
        "saved checkpoint",
    );
    Ok(())
}

/// Read the `__metadata__` table of a safetensors file.
///
/// Returns an empty map when the file carries no metadata.
///
/// # Errors
///
/// Returns [`TuneError::Io`] if the file cannot be read and
/// [`TuneError::Serialization`] if its header is malformed.
pub fn read_metadata(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let header = read_header(path.as_ref())?;
    Ok(metadata_of(&header).collect())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Move to CPU and apply the precision cast to floating-point tensors.
fn prepare_tensor(tensor: &Tensor, precision: Option<SavePrecision>) -> Result<Tensor> {
    let cpu = tensor.to_device(&Device::Cpu)?;
    match precision {
        Some(precision) if cpu.dtype().is_float() && cpu.dtype() != precision.dtype() => {
            Ok(cpu.to_dtype(precision.dtype())?)
        }
        _ => Ok(cpu),
    }
}

/// A tensor in safetensors layout: dtype tag, shape, little-endian bytes.
struct TensorBytes {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TensorBytes {
    /// Encode a CPU tensor.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Serialization`] for a dtype the archive format
    /// cannot hold.
    fn from_tensor(key: &str, tensor: &Tensor) -> Result<Self> {
        let flat = tensor.flatten_all()?;
        let (dtype, data) = match tensor.dtype() {
            DType::U8 => (Dtype::U8, flat.to_vec1::<u8>()?),
            DType::U32 => (Dtype::U32, le_bytes(flat.to_vec1::<u32>()?, u32::to_le_bytes)),
            DType::I64 => (Dtype::I64, le_bytes(flat.to_vec1::<i64>()?, i64::to_le_bytes)),
            DType::BF16 => (
                Dtype::BF16,
                le_bytes(flat.to_vec1::<half::bf16>()?, half::bf16::to_le_bytes),
            ),
            DType::F16 => (
                Dtype::F16,
                le_bytes(flat.to_vec1::<half::f16>()?, half::f16::to_le_bytes),
            ),
            DType::F32 => (Dtype::F32, le_bytes(flat.to_vec1::<f32>()?, f32::to_le_bytes)),
            DType::F64 => (Dtype::F64, le_bytes(flat.to_vec1::<f64>()?, f64::to_le_bytes)),
            other => {
                return Err(TuneError::Serialization(format!(
                    "tensor `{key}` has unsupported dtype {other:?}"
                )))
            }
        };
        Ok(Self {
            dtype,
            shape: tensor.dims().to_vec(),
            data,
        })
    }
}

impl View for TensorBytes {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Concatenate the little-endian encodings of `values`.
fn le_bytes<T, const N: usize>(values: Vec<T>, to_le: fn(T) -> [u8; N]) -> Vec<u8> {
    values.into_iter().flat_map(to_le).collect()
}

fn map_safetensors_error(e: SafeTensorError) -> TuneError {
    match e {
        SafeTensorError::IoError(io) => TuneError::Io(io),
        other => TuneError::Serialization(other.to_string()),
    }
}

/// Parse the JSON header of a safetensors file without reading tensor data.
fn read_header(path: &Path) -> Result<serde_json::Map<String, Value>> {
    let mut file = File::open(path)?;
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_HEADER_BYTES {
        return Err(TuneError::Serialization(format!(
            "{}: header length {len} exceeds {MAX_HEADER_BYTES} bytes",
            path.display()
        )));
    }
    let len = usize::try_from(len)
        .map_err(|_| TuneError::Serialization(format!("header length {len} overflows usize")))?;

    let mut header = vec![0u8; len];
    file.read_exact(&mut header)?;
    match serde_json::from_slice(&header) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(TuneError::Serialization(format!(
            "{}: header is not a JSON object",
            path.display()
        ))),
        Err(e) => Err(TuneError::Serialization(format!(
            "{}: parse header: {e}",
            path.display()
        ))),
    }
}

/// String entries of a header's `__metadata__` table.
fn metadata_of(
    header: &serde_json::Map<String, Value>,
) -> impl Iterator<Item = (String, String)> + '_ {
    header
        .get("__metadata__")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
}

/// Strip known host prefixes from the front of a key.
fn strip_host_prefixes(key: &str) -> &str {
    let mut rest = key;
    while let Some(stripped) = HOST_PREFIXES.iter().find_map(|p| rest.strip_prefix(p)) {
        rest = stripped;
    }
    rest
}

/// Pair every template tensor name with its dictionary key.
fn match_template_keys(
    dict: &TensorDict,
    header: &serde_json::Map<String, Value>,
) -> Result<Vec<(String, String)>> {
    let by_suffix: HashMap<&str, &str> = dict
        .keys()
        .map(|key| (strip_host_prefixes(key), key))
        .collect();

    let mut missing = Vec::new();
    let mut names = Vec::new();
    for template_key in header.keys().filter(|k| *k != "__metadata__") {
        match by_suffix.get(strip_host_prefixes(template_key)) {
            Some(dict_key) => names.push((template_key.clone(), (*dict_key).to_owned())),
            None => missing.push(template_key.as_str()),
        }
    }

    if !missing.is_empty() {
        return Err(TuneError::Serialization(format!(
            "{} template tensors have no counterpart in the dictionary (first: `{}`)",
            missing.len(),
            missing.first().copied().unwrap_or_default()
        )));
    }
    Ok(names)
}
