// SPDX-License-Identifier: MIT OR Apache-2.0

//! The mutable tensor dictionary an injection session edits in place.
//!
//! Every entry is a [`candle_core::Var`]: [`Var::set`] copies new contents
//! into the existing storage, so a [`Tensor`] handle obtained through
//! [`TensorDict::get`] before an injection observes the scaled values
//! afterwards, exactly like the host's live model would.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};

use crate::error::{Result, TuneError};

/// Index structure for sharded safetensors checkpoints.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name → shard filename.
    weight_map: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// TensorDict
// ---------------------------------------------------------------------------

/// Named weight tensors with in-place mutable storage.
///
/// Keys are fixed at construction. The dictionary is *tainted* from the
/// first injected mutation until a successful restore or an explicit
/// [`mark_pristine`](Self::mark_pristine); a tainted dictionary refuses new
/// injection sessions unless the caller opts into cumulative application.
#[derive(Debug)]
pub struct TensorDict {
    vars: BTreeMap<String, Var>,
    tainted: bool,
}

impl TensorDict {
    /// Wrap freshly loaded tensors. Each tensor is copied into its own
    /// mutable storage.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Model`] if a tensor cannot be copied.
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let vars = tensors
            .into_iter()
            .map(|(name, tensor)| Ok((name, Var::from_tensor(&tensor)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            vars,
            tainted: false,
        })
    }

    /// Load a single `.safetensors` file onto `device`, optionally casting
    /// floating-point tensors to `dtype`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Io`] if the file cannot be read and
    /// [`TuneError::Model`] if it is not a valid safetensors archive.
    pub fn load(path: impl AsRef<Path>, device: &Device, dtype: Option<DType>) -> Result<Self> {
        let path = path.as_ref();
        let dict = Self::from_tensors(load_files(&[path.to_path_buf()], device, dtype)?)?;
        tracing::info!(
            path = %path.display(),
            tensors = dict.len(),
            "loaded tensor dictionary",
        );
        Ok(dict)
    }

    /// Load a sharded checkpoint from its `model.safetensors.index.json`.
    ///
    /// Shard paths are resolved relative to the index file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] if the index cannot be parsed, plus
    /// every error of [`load`](Self::load) for each shard.
    pub fn load_index(
        index_path: impl AsRef<Path>,
        device: &Device,
        dtype: Option<DType>,
    ) -> Result<Self> {
        let index_path = index_path.as_ref();
        let index_str = std::fs::read_to_string(index_path)?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)
            .map_err(|e| TuneError::Config(format!("parse index: {e}")))?;

        let mut shard_names: Vec<&String> = index.weight_map.values().collect();
        shard_names.sort();
        shard_names.dedup();

        let base = index_path.parent().unwrap_or_else(|| Path::new("."));
        let paths: Vec<PathBuf> = shard_names.iter().map(|name| base.join(name)).collect();

        let dict = Self::from_tensors(load_files(&paths, device, dtype)?)?;
        tracing::info!(
            index = %index_path.display(),
            shards = paths.len(),
            tensors = dict.len(),
            "loaded sharded tensor dictionary",
        );
        Ok(dict)
    }

    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the dictionary holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Tensor keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// Live handle to a tensor. The handle shares storage with the
    /// dictionary and observes later in-place mutations.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.vars.get(key).map(Var::as_tensor)
    }

    /// `(key, tensor)` pairs in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.vars
            .iter()
            .map(|(key, var)| (key.as_str(), var.as_tensor()))
    }

    /// Live tensor handles, e.g. to hand back to a host model.
    #[must_use]
    pub fn to_tensors(&self) -> HashMap<String, Tensor> {
        self.vars
            .iter()
            // BORROW: explicit .clone() of the handle; storage stays shared
            .map(|(key, var)| (key.clone(), var.as_tensor().clone()))
            .collect()
    }

    /// Whether an unrestored mutation has been applied.
    #[must_use]
    pub const fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Declare the current contents pristine.
    ///
    /// Use after [`InjectionSession::keep`](crate::InjectionSession::keep)
    /// when the scaled weights become the new baseline.
    pub fn mark_pristine(&mut self) {
        self.tainted = false;
    }

    pub(crate) fn var(&self, key: &str) -> Option<&Var> {
        self.vars.get(key)
    }

    pub(crate) fn taint(&mut self) {
        self.tainted = true;
    }
}

// ---------------------------------------------------------------------------
// Loading helpers
// ---------------------------------------------------------------------------

/// Read every tensor from `paths`, cast floats to `dtype` if given.
fn load_files(
    paths: &[PathBuf],
    device: &Device,
    dtype: Option<DType>,
) -> Result<HashMap<String, Tensor>> {
    let raw = read_safetensors(paths, device)?;
    match dtype {
        None => Ok(raw),
        Some(dtype) => raw
            .into_iter()
            .map(|(name, tensor)| {
                let tensor = if tensor.dtype().is_float() {
                    tensor.to_dtype(dtype)?
                } else {
                    tensor
                };
                Ok((name, tensor))
            })
            .collect(),
    }
}

/// Buffered loading: reads each file fully into RAM.
#[cfg(not(feature = "mmap"))]
fn read_safetensors(paths: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for path in paths {
        if !path.exists() {
            return Err(TuneError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )));
        }
        tensors.extend(candle_core::safetensors::load(path, device)?);
    }
    Ok(tensors)
}

/// Memory-mapped loading: minimal peak RAM for large or sharded checkpoints.
///
/// # Safety
///
/// The safetensors files must not be modified while they are mapped.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn read_safetensors(paths: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    // SAFETY: safetensors files must not be modified while mapped.
    let mapped = unsafe { candle_core::safetensors::MmapedSafetensors::multi(paths)? };
    mapped
        .tensors()
        .into_iter()
        .map(|(name, _)| {
            let tensor = mapped.load(&name, device)?;
            Ok((name, tensor))
        })
        .collect()
}
