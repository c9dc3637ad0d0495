// SPDX-License-Identifier: MIT OR Apache-2.0

//! First-touch backups of mutated tensors.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor, Var};

use crate::error::{Result, TuneError};
use crate::tensors::TensorDict;

/// Pristine copies of every key touched by a session.
///
/// A key is captured once, on its first mutation; later captures of the
/// same key are ignored so the stored value is always the pre-session one.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    entries: BTreeMap<String, Tensor>,
}

impl Snapshot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Back up `var` under `key` unless already captured.
    ///
    /// With `offload`, accelerator tensors are copied to CPU memory.
    /// Returns whether a copy was taken.
    pub(crate) fn capture(&mut self, key: &str, var: &Var, offload: bool) -> Result<bool> {
        if self.entries.contains_key(key) {
            return Ok(false);
        }
        let live = var.as_tensor();
        // `to_device` onto the tensor's own device shares storage, so CPU
        // tensors always take an explicit copy.
        let backup = if offload && !live.device().is_cpu() {
            live.to_device(&Device::Cpu)?
        } else {
            live.copy()?
        };
        self.entries.insert(key.to_owned(), backup);
        Ok(true)
    }

    /// Write every backup into `dict`, removing each entry once restored.
    ///
    /// On failure the failing entry and every entry not yet reached stay
    /// in the snapshot, so the call can be retried.
    pub(crate) fn restore_into(&mut self, dict: &TensorDict) -> Result<usize> {
        let mut restored = 0;
        while let Some((key, backup)) = self.entries.pop_first() {
            if let Err(e) = write_back(dict, &key, &backup) {
                self.entries.insert(key, backup);
                return Err(e);
            }
            restored += 1;
        }
        Ok(restored)
    }

    /// Drop every backup without restoring.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Bytes held by the backups.
    pub(crate) fn size_bytes(&self) -> usize {
        self.entries
            .values()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

fn write_back(dict: &TensorDict, key: &str, backup: &Tensor) -> Result<()> {
    let var = dict
        .var(key)
        .ok_or_else(|| TuneError::Injection(format!("snapshot key `{key}` is not in the dictionary")))?;
    if backup.device().same_device(var.device()) {
        var.set(backup)?;
    } else {
        var.set(&backup.to_device(var.device())?)?;
    }
    Ok(())
}
