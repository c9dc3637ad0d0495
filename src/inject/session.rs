// SPDX-License-Identifier: MIT OR Apache-2.0

//! The injection session: apply slider scales in place, then restore.

use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Tensor};

use crate::config::Architecture;
use crate::curve::compute_scale;
use crate::error::{Result, TuneError};
use crate::groups::LayerGroupTable;
use crate::inject::scope::{target_admits, Scope};
use crate::inject::slider::{AppliedGroup, InjectionOptions, MutationReport, SliderSpec};
use crate::inject::snapshot::Snapshot;
use crate::keys::{KeyScheme, TensorRole};
use crate::tensors::TensorDict;

/// One key's composed factor, in first-touch order.
#[derive(Debug)]
struct PlannedMutation {
    key: String,
    factor: f64,
}

/// The last successful call, kept to recognise a replay.
#[derive(Debug)]
struct LastCall {
    specs: Vec<SliderSpec>,
    options: InjectionOptions,
    report: MutationReport,
}

/// Exclusive, reversible editing of one [`TensorDict`].
///
/// The session borrows the dictionary mutably for its whole life, so no
/// other code can touch the tensors while a mutation is outstanding. Every
/// key is backed up on first touch; [`restore`](Self::restore) writes the
/// backups back bit-exactly.
///
/// Dropping a dirty session does **not** restore: the dictionary stays
/// tainted and a warning is logged. Call [`restore`](Self::restore) to undo
/// or [`keep`](Self::keep) to make the mutation permanent.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
///
/// use candle_core::{Device, Tensor};
/// use candle_tuner::{
///     Architecture, Granularity, InjectionOptions, InjectionSession, LayerGroupTable,
///     SliderSpec, TensorDict,
/// };
///
/// let mut tensors = HashMap::new();
/// tensors.insert(
///     "layers.0.attention.qkv.weight".to_owned(),
///     Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap(),
/// );
/// let mut dict = TensorDict::from_tensors(tensors).unwrap();
/// let table = LayerGroupTable::builtin(Architecture::ImageModel, Granularity::Coarse);
///
/// let mut session = InjectionSession::begin(&mut dict, table).unwrap();
/// let report = session
///     .apply_scales(&[SliderSpec::real("stage-1", 2.0)], &InjectionOptions::new())
///     .unwrap();
/// assert_eq!(report.keys_mutated, 1);
/// session.restore().unwrap();
/// ```
#[derive(Debug)]
pub struct InjectionSession<'a> {
    dict: &'a mut TensorDict,
    table: LayerGroupTable,
    scheme: &'static KeyScheme,
    snapshot: Snapshot,
    applied: Vec<SliderSpec>,
    last: Option<LastCall>,
    dirty: bool,
    kept: bool,
    started_tainted: bool,
}

impl<'a> InjectionSession<'a> {
    /// Start a session on a pristine dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::SessionAlreadyDirty`] if the dictionary still
    /// carries a mutation from an earlier session.
    pub fn begin(dict: &'a mut TensorDict, table: LayerGroupTable) -> Result<Self> {
        if dict.is_tainted() {
            return Err(TuneError::SessionAlreadyDirty(
                "dictionary carries an unrestored mutation; restore it or reload from disk".into(),
            ));
        }
        Ok(Self::open(dict, table))
    }

    /// Start a session even if the dictionary is tainted.
    ///
    /// New factors multiply onto already-scaled weights and the snapshot
    /// can only return the dictionary to its *current* state, so a restore
    /// leaves an already-tainted dictionary tainted.
    pub fn begin_cumulative(dict: &'a mut TensorDict, table: LayerGroupTable) -> Self {
        if dict.is_tainted() {
            tracing::warn!(
                tensors = dict.len(),
                "starting a cumulative session on a tainted dictionary; factors will compound",
            );
        }
        Self::open(dict, table)
    }

    fn open(dict: &'a mut TensorDict, table: LayerGroupTable) -> Self {
        let scheme = KeyScheme::for_architecture(table.architecture());
        let started_tainted = dict.is_tainted();
        tracing::info!(
            architecture = %table.architecture(),
            granularity = %table.granularity(),
            groups = table.groups().len(),
            tensors = dict.len(),
            tainted = started_tainted,
            "injection session opened",
        );
        Self {
            dict,
            table,
            scheme,
            snapshot: Snapshot::new(),
            applied: Vec::new(),
            last: None,
            dirty: false,
            kept: false,
            started_tainted,
        }
    }

    /// Scale every tensor the specs address, in place.
    ///
    /// All specs are resolved before the first tensor is touched, so an
    /// unknown group id or a non-finite slider leaves the dictionary as it
    /// was. Factors of several specs matching one key multiply together.
    /// Normalization tensors are skipped and counted unless
    /// `allow_normalization_scaling` is set.
    ///
    /// Re-applying exactly the previous specs and options to a dirty
    /// session returns the previous report without touching any tensor.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::SessionAlreadyDirty`] for a different spec set
    /// on a dirty session without `InjectionOptions::cumulative`,
    /// [`TuneError::UnknownGroup`] for an unresolvable slider,
    /// [`TuneError::Config`] for a non-finite slider or factor, and
    /// [`TuneError::Injection`] for a matched tensor that is not floating
    /// point. A [`TuneError::Model`] during the mutation loop leaves earlier
    /// keys scaled; call [`restore`](Self::restore) to recover.
    pub fn apply_scales(
        &mut self,
        specs: &[SliderSpec],
        options: &InjectionOptions,
    ) -> Result<MutationReport> {
        if self.dirty {
            if let Some(last) = &self.last {
                if last.specs == specs && last.options == *options {
                    tracing::debug!("identical specs on a dirty session; skipping re-application");
                    return Ok(last.report.clone());
                }
            }
            if !options.cumulative {
                return Err(TuneError::SessionAlreadyDirty(format!(
                    "{} tensors hold an unrestored mutation; call restore() first",
                    self.snapshot.len()
                )));
            }
            tracing::warn!(
                snapshot = self.snapshot.len(),
                "cumulative application; factors compound on scaled weights",
            );
        }

        let (plan, mut report) = self.plan(specs, options)?;

        if !self.dirty && plan.iter().any(|p| !is_identity(p.factor)) {
            self.dirty = true;
            self.dict.taint();
        }

        for planned in plan.iter().filter(|p| !is_identity(p.factor)) {
            let var = self.dict.var(&planned.key).ok_or_else(|| {
                TuneError::Injection(format!("key `{}` vanished from the dictionary", planned.key))
            })?;
            // Snapshot happens-before mutation, per key.
            self.snapshot
                .capture(&planned.key, var, options.offload_snapshot)?;
            let scaled = scale_tensor(var.as_tensor(), planned.factor)?;
            var.set(&scaled)?;
            report.keys_mutated += 1;
        }

        tracing::info!(
            mutated = report.keys_mutated,
            skipped = report.keys_skipped,
            groups = report.groups_applied.len(),
            snapshot = self.snapshot.len(),
            snapshot_bytes = self.snapshot.size_bytes(),
            "applied slider scales",
        );

        self.applied.extend_from_slice(specs);
        self.last = Some(LastCall {
            specs: specs.to_vec(),
            options: options.clone(),
            report: report.clone(),
        });
        Ok(report)
    }

    /// Resolve specs into per-key factors without touching any tensor.
    fn plan(
        &self,
        specs: &[SliderSpec],
        options: &InjectionOptions,
    ) -> Result<(Vec<PlannedMutation>, MutationReport)> {
        let architecture = self.table.architecture();
        let sensitivity = options
            .sensitivity
            .unwrap_or_else(|| architecture.default_sensitivity());

        let classified: Vec<(&str, TensorRole)> = self
            .dict
            .keys()
            .filter_map(|key| self.scheme.classify(key).map(|role| (key, role)))
            .collect();

        let mut plan: Vec<PlannedMutation> = Vec::new();
        let mut slot_of: HashMap<&str, usize> = HashMap::new();
        let mut skipped: BTreeSet<&str> = BTreeSet::new();
        let mut report = MutationReport::default();

        for spec in specs {
            if !spec.value.is_finite() {
                return Err(TuneError::Config(format!(
                    "slider `{}` has non-finite value {}",
                    spec.target, spec.value
                )));
            }
            let factor = compute_scale(spec.value, spec.mode, sensitivity);
            if !factor.is_finite() {
                return Err(TuneError::Config(format!(
                    "slider `{}` resolved to non-finite factor {factor}",
                    spec.target
                )));
            }
            let scope = Scope::resolve(&spec.target, &self.table)?;

            let mut matched = 0;
            for &(key, role) in &classified {
                if !scope.admits(&role) || !target_admits(options.target, &role) {
                    continue;
                }
                if role.is_normalization() && !options.allow_normalization_scaling {
                    skipped.insert(key);
                    continue;
                }
                matched += 1;
                match slot_of.get(key) {
                    Some(&slot) => {
                        if let Some(entry) = plan.get_mut(slot) {
                            entry.factor *= factor;
                        }
                    }
                    None => {
                        slot_of.insert(key, plan.len());
                        plan.push(PlannedMutation {
                            key: key.to_owned(),
                            factor,
                        });
                    }
                }
            }

            if is_identity(factor) {
                tracing::debug!(group = %spec.target, "identity factor; no scaling");
            } else {
                tracing::debug!(
                    group = %spec.target,
                    value = spec.value,
                    mode = %spec.mode,
                    factor,
                    keys = matched,
                    "resolved slider",
                );
            }
            report.groups_applied.push(AppliedGroup {
                id: spec.target.to_string(),
                factor,
                keys_matched: matched,
            });
        }

        for planned in plan.iter().filter(|p| !is_identity(p.factor)) {
            let dtype = self
                .dict
                .get(&planned.key)
                .map(Tensor::dtype)
                .ok_or_else(|| {
                    TuneError::Injection(format!("key `{}` is not in the dictionary", planned.key))
                })?;
            if !dtype.is_float() {
                return Err(TuneError::Injection(format!(
                    "cannot scale `{}`: dtype {dtype:?} is not floating point",
                    planned.key
                )));
            }
        }

        if !skipped.is_empty() {
            tracing::warn!(
                skipped = skipped.len(),
                "normalization tensors locked; set allow_normalization_scaling to scale them",
            );
        }
        report.keys_skipped = skipped.len();
        Ok((plan, report))
    }

    /// Write every backed-up tensor back and mark the session clean.
    ///
    /// Safe to call on a clean session (returns 0). Returns the number of
    /// tensors restored. The dictionary is marked pristine only if it was
    /// pristine when the session began.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Model`] or [`TuneError::Injection`] if a backup
    /// cannot be written back; the remaining backups are kept so the call
    /// can be retried.
    pub fn restore(&mut self) -> Result<usize> {
        if !self.dirty && self.snapshot.is_empty() {
            tracing::debug!("restore on a clean session; nothing to do");
            return Ok(0);
        }
        let restored = self.snapshot.restore_into(self.dict)?;
        self.dirty = false;
        self.applied.clear();
        self.last = None;
        if self.started_tainted {
            tracing::warn!(
                restored,
                "restored pre-session weights; dictionary was already tainted and stays tainted",
            );
        } else {
            self.dict.mark_pristine();
            tracing::info!(restored, "restored pristine weights");
        }
        Ok(restored)
    }

    /// End the session keeping the mutation; the snapshot is discarded.
    ///
    /// The dictionary stays tainted until
    /// [`TensorDict::mark_pristine`] is called.
    pub fn keep(mut self) {
        tracing::info!(
            tensors = self.snapshot.len(),
            "keeping scaled weights; snapshot discarded",
        );
        self.snapshot.clear();
        self.kept = true;
    }

    /// The dictionary being edited, e.g. to save it.
    #[must_use]
    pub fn dict(&self) -> &TensorDict {
        self.dict
    }

    /// Whether an unrestored mutation is outstanding.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of tensors backed up.
    #[must_use]
    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }

    /// Whether `key` has been backed up.
    #[must_use]
    pub fn is_snapshotted(&self, key: &str) -> bool {
        self.snapshot.contains(key)
    }

    /// Every spec applied since the last restore, in order.
    #[must_use]
    pub fn applied_specs(&self) -> &[SliderSpec] {
        &self.applied
    }

    /// The grouping table in use.
    #[must_use]
    pub const fn table(&self) -> &LayerGroupTable {
        &self.table
    }

    /// Architecture of the grouping table.
    #[must_use]
    pub const fn architecture(&self) -> Architecture {
        self.table.architecture()
    }
}

/// Multiply `tensor` by `factor`.
///
/// Half-precision tensors are scaled in `f32` and rounded once on the way
/// back; `affine` would round the factor itself to the tensor's dtype.
fn scale_tensor(tensor: &Tensor, factor: f64) -> Result<Tensor> {
    let dtype = tensor.dtype();
    let scaled = match dtype {
        DType::F32 | DType::F64 => tensor.affine(factor, 0.0)?,
        _ => tensor
            .to_dtype(DType::F32)?
            .affine(factor, 0.0)?
            .to_dtype(dtype)?,
    };
    Ok(scaled)
}

/// Exactly neutral factors skip the multiply.
#[allow(clippy::float_cmp)]
fn is_identity(factor: f64) -> bool {
    factor == 1.0
}

impl Drop for InjectionSession<'_> {
    fn drop(&mut self) {
        if self.dirty && !self.kept {
            tracing::warn!(
                tensors = self.snapshot.len(),
                "injection session dropped without restore; dictionary stays tainted",
            );
        }
    }
}
