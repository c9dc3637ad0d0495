// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layer grouping tables: which transformer layers each slider owns.
//!
//! A [`LayerGroupTable`] partitions the layer indices `0..N` of one
//! [`Architecture`] into named groups at one [`Granularity`]. The built-in
//! tables encode empirical, deliberately loose annotations of what each band
//! of layers tends to influence; they are data, not derived from model
//! introspection, and can be replaced wholesale with
//! [`LayerGroupTable::from_json`].
//!
//! | Architecture | Coarse groups | Fine groups |
//! |--------------|---------------|-------------|
//! | image model (30 layers) | `stage-1` .. `stage-5`, 6 layers each | `layer-0` .. `layer-29` |
//! | text encoder (36 layers) | `zone-1` .. `zone-6`, 6 layers each | `layer-0` .. `layer-35` |
//!
//! # Usage
//!
//! ```
//! use candle_tuner::{resolve_group, Architecture, Granularity};
//!
//! let layers = resolve_group(Architecture::ImageModel, Granularity::Coarse, "stage-1").unwrap();
//! assert_eq!(layers, vec![0, 1, 2, 3, 4, 5]);
//! ```

use std::collections::HashSet;

use serde_json::Value;

use crate::config::{get_optional_str, get_str, get_usize, Architecture, Granularity};
use crate::error::{Result, TuneError};

/// Image-model stages: `(id, label, first layer, last layer inclusive)`.
/// Largest layer stack a parsed table may describe.
pub const MAX_TABLE_LAYERS: usize = 1024;

const IMAGE_STAGES: [(&str, &str, usize, usize); 5] = [
    ("stage-1", "Semantic Seeding", 0, 5),
    ("stage-2", "Spatial Layout", 6, 11),
    ("stage-3", "Morphological Form", 12, 17),
    ("stage-4", "Volumetric Lighting", 18, 23),
    ("stage-5", "Surface Refinement", 24, 29),
];

/// Text-encoder zones: `(id, label, first layer, last layer inclusive)`.
const TEXT_ZONES: [(&str, &str, usize, usize); 6] = [
    ("zone-1", "Embedding", 0, 5),
    ("zone-2", "Syntax (low)", 6, 11),
    ("zone-3", "Syntax (high)", 12, 17),
    ("zone-4", "Semantics", 18, 23),
    ("zone-5", "Context", 24, 29),
    ("zone-6", "Abstract Reasoning", 30, 35),
];

// ---------------------------------------------------------------------------
// LayerGroupSpec
// ---------------------------------------------------------------------------

/// One named group of layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerGroupSpec {
    /// Architecture the group belongs to.
    pub architecture: Architecture,
    /// Granularity of the table the group belongs to.
    pub granularity: Granularity,
    /// Slider id (`stage-1`, `zone-4`, `layer-17`, ...).
    pub id: String,
    /// Human-readable role annotation (heuristic).
    pub label: String,
    /// Owned layer indices, ascending.
    pub layers: Vec<usize>,
}

// ---------------------------------------------------------------------------
// LayerGroupTable
// ---------------------------------------------------------------------------

/// An ordered, exhaustive, non-overlapping partition of a layer stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerGroupTable {
    architecture: Architecture,
    granularity: Granularity,
    num_layers: usize,
    groups: Vec<LayerGroupSpec>,
}

impl LayerGroupTable {
    /// The built-in table for an architecture and granularity.
    #[must_use]
    pub fn builtin(architecture: Architecture, granularity: Granularity) -> Self {
        let coarse: &[(&str, &str, usize, usize)] = match architecture {
            Architecture::ImageModel => &IMAGE_STAGES,
            Architecture::TextEncoder => &TEXT_ZONES,
        };

        let groups = match granularity {
            Granularity::Coarse => coarse
                .iter()
                .map(|&(id, label, first, last)| LayerGroupSpec {
                    architecture,
                    granularity,
                    id: id.to_owned(),
                    label: label.to_owned(),
                    layers: (first..=last).collect(),
                })
                .collect(),
            // Per-layer groups keep the label of their enclosing coarse group.
            Granularity::Fine => coarse
                .iter()
                .flat_map(|&(_, label, first, last)| {
                    (first..=last).map(move |layer| LayerGroupSpec {
                        architecture,
                        granularity,
                        id: format!("layer-{layer}"),
                        label: label.to_owned(),
                        layers: vec![layer],
                    })
                })
                .collect(),
        };

        Self {
            architecture,
            granularity,
            num_layers: architecture.num_layers(),
            groups,
        }
    }

    /// Parse a replacement table from JSON and validate it.
    ///
    /// ```json
    /// {
    ///   "architecture": "image-model",
    ///   "granularity": "coarse",
    ///   "num_layers": 30,
    ///   "groups": [
    ///     { "id": "block-1", "label": "Start", "start": 0, "end": 4 },
    ///     { "id": "block-2", "layers": [5, 6, 7, 8, 9] }
    ///   ]
    /// }
    /// ```
    ///
    /// `end` is inclusive. `num_layers` defaults to the architecture's layer
    /// count and `granularity` to coarse.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] on missing or mistyped fields, on a
    /// `num_layers` above [`MAX_TABLE_LAYERS`], and on
    /// any violation of the partition invariant (see
    /// [`validate`](Self::validate)).
    pub fn from_json(table: &Value) -> Result<Self> {
        let architecture: Architecture = get_str(table, "architecture")?.parse()?;
        let granularity = match get_optional_str(table, "granularity")? {
            Some(s) => s.parse()?,
            None => Granularity::Coarse,
        };
        let num_layers = match table.get("num_layers") {
            Some(_) => get_usize(table, "num_layers")?,
            None => architecture.num_layers(),
        };
        if num_layers > MAX_TABLE_LAYERS {
            return Err(TuneError::Config(format!(
                "num_layers {num_layers} exceeds the supported maximum of {MAX_TABLE_LAYERS}"
            )));
        }

        let entries = table
            .get("groups")
            .and_then(Value::as_array)
            .ok_or_else(|| TuneError::Config("missing or invalid field 'groups'".into()))?;

        let mut groups = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = normalize_id(get_str(entry, "id")?);
            let label = get_optional_str(entry, "label")?
                .unwrap_or(id.as_str())
                .to_owned();
            let layers = parse_layers(entry, &id, num_layers)?;
            groups.push(LayerGroupSpec {
                architecture,
                granularity,
                id,
                label,
                layers,
            });
        }

        let parsed = Self {
            architecture,
            granularity,
            num_layers,
            groups,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse a replacement table from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] on malformed JSON, plus every error of
    /// [`from_json`](Self::from_json).
    pub fn from_json_str(table: &str) -> Result<Self> {
        let json: Value = serde_json::from_str(table)
            .map_err(|e| TuneError::Config(format!("parse grouping table: {e}")))?;
        Self::from_json(&json)
    }

    /// Check that the groups partition `0..num_layers` exactly.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] naming the first duplicate id, empty
    /// group, out-of-range layer, overlap, or uncovered layer.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers > MAX_TABLE_LAYERS {
            return Err(TuneError::Config(format!(
                "num_layers {} exceeds the supported maximum of {MAX_TABLE_LAYERS}",
                self.num_layers
            )));
        }
        let mut ids = HashSet::with_capacity(self.groups.len());
        let mut owner: Vec<Option<&str>> = vec![None; self.num_layers];

        for group in &self.groups {
            if !ids.insert(group.id.as_str()) {
                return Err(TuneError::Config(format!("duplicate group id '{}'", group.id)));
            }
            if group.layers.is_empty() {
                return Err(TuneError::Config(format!("group '{}' owns no layers", group.id)));
            }
            for &layer in &group.layers {
                let slot = owner.get_mut(layer).ok_or_else(|| {
                    TuneError::Config(format!(
                        "group '{}' references layer {layer}, but the stack has {} layers",
                        group.id, self.num_layers
                    ))
                })?;
                if let Some(previous) = slot {
                    return Err(TuneError::Config(format!(
                        "layer {layer} is claimed by both '{previous}' and '{}'",
                        group.id
                    )));
                }
                *slot = Some(group.id.as_str());
            }
        }

        if let Some(gap) = owner.iter().position(Option::is_none) {
            return Err(TuneError::Config(format!(
                "layer {gap} is not covered by any group"
            )));
        }
        Ok(())
    }

    /// Resolve a group id to its ordered layer indices.
    ///
    /// Ids are matched case-insensitively, with `_` treated as `-`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::UnknownGroup`] if no group has this id.
    pub fn resolve(&self, group_id: &str) -> Result<&[usize]> {
        self.group(group_id)
            .map(|group| group.layers.as_slice())
            .ok_or_else(|| TuneError::UnknownGroup {
                architecture: self.architecture.to_string(),
                granularity: self.granularity.to_string(),
                group: group_id.to_owned(),
            })
    }

    /// Look up a group by id.
    #[must_use]
    pub fn group(&self, group_id: &str) -> Option<&LayerGroupSpec> {
        let wanted = normalize_id(group_id);
        self.groups.iter().find(|group| group.id == wanted)
    }

    /// The group that owns `layer`, if any.
    #[must_use]
    pub fn group_of_layer(&self, layer: usize) -> Option<&LayerGroupSpec> {
        self.groups.iter().find(|group| group.layers.contains(&layer))
    }

    /// All groups in slider order.
    #[must_use]
    pub fn groups(&self) -> &[LayerGroupSpec] {
        &self.groups
    }

    /// Architecture this table partitions.
    #[must_use]
    pub const fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Granularity of this table.
    #[must_use]
    pub const fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Size of the partitioned layer stack.
    #[must_use]
    pub const fn num_layers(&self) -> usize {
        self.num_layers
    }
}

/// Resolve a group id against the built-in table for `(architecture, granularity)`.
///
/// # Errors
///
/// Returns [`TuneError::UnknownGroup`] for an unrecognized id.
pub fn resolve_group(
    architecture: Architecture,
    granularity: Granularity,
    group_id: &str,
) -> Result<Vec<usize>> {
    LayerGroupTable::builtin(architecture, granularity)
        .resolve(group_id)
        .map(<[usize]>::to_vec)
}

/// Canonical form of a group id.
fn normalize_id(id: &str) -> String {
    id.trim().to_ascii_lowercase().replace('_', "-")
}

/// Parse a group's layers from either `layers: [..]` or `start`/`end`.
fn parse_layers(entry: &Value, id: &str, num_layers: usize) -> Result<Vec<usize>> {
    if let Some(list) = entry.get("layers").and_then(Value::as_array) {
        let mut layers = list
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|l| usize::try_from(l).ok())
                    .ok_or_else(|| {
                        TuneError::Config(format!("group '{id}' has a non-integer layer index"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        layers.sort_unstable();
        return Ok(layers);
    }

    let start = get_usize(entry, "start")?;
    let end = get_usize(entry, "end")?;
    if end < start {
        return Err(TuneError::Config(format!(
            "group '{id}' has end {end} before start {start}"
        )));
    }
    if end >= num_layers {
        return Err(TuneError::Config(format!(
            "group '{id}' ends at layer {end}, but the stack has {num_layers} layers"
        )));
    }
    Ok((start..=end).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
