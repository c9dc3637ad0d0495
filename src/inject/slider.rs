// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slider specifications, injection options, and the mutation report.

use std::fmt;

use crate::config::{ScaleMode, Sensitivity, TargetKind};

// ===========================================================================
// Part 1: Slider targets and specs
// ===========================================================================

/// What a slider addresses.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SliderTarget {
    /// A group id from the active [`LayerGroupTable`](crate::LayerGroupTable).
    Group(String),
    /// Every tensor of every transformer layer (the base-strength slider).
    Global,
    /// Attention tensors across all layers.
    GlobalAttention,
    /// Feed-forward tensors across all layers.
    GlobalFeedForward,
    /// Embedder tensors.
    Embedders,
    /// Every refiner tensor, noise and context alike.
    Refiners,
    /// Noise refiner tensors only.
    NoiseRefiners,
    /// Context refiner tensors only.
    ContextRefiners,
}

impl SliderTarget {
    /// Canonical id, as accepted by `From<&str>`.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Group(id) => id,
            Self::Global => "global",
            Self::GlobalAttention => "global-attention",
            Self::GlobalFeedForward => "global-feed-forward",
            Self::Embedders => "embedders",
            Self::Refiners => "refiners",
            Self::NoiseRefiners => "noise-refiners",
            Self::ContextRefiners => "context-refiners",
        }
    }
}

/// Special ids map to their variants; anything else is a group id.
impl From<&str> for SliderTarget {
    fn from(id: &str) -> Self {
        match id.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "global" | "base" | "base-strength" | "base-scale" => Self::Global,
            "global-attention" => Self::GlobalAttention,
            "global-feed-forward" | "global-mlp" | "global-ffn" => Self::GlobalFeedForward,
            "embedders" | "embedders-strength" => Self::Embedders,
            "refiners" | "refiners-strength" => Self::Refiners,
            "noise-refiners" | "noise-refiner" => Self::NoiseRefiners,
            "context-refiners" | "context-refiner" => Self::ContextRefiners,
            _ => Self::Group(id.trim().to_owned()),
        }
    }
}

impl From<String> for SliderTarget {
    fn from(id: String) -> Self {
        Self::from(id.as_str())
    }
}

impl fmt::Display for SliderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// One slider position: a target, a raw value, and how to map it.
///
/// Values outside roughly `[0, 2]` destabilize most models; they are
/// accepted, not clamped.
///
/// # Example
///
/// ```
/// use candle_tuner::{ScaleMode, SliderSpec, SliderTarget};
///
/// let spec = SliderSpec::real("stage-1", 1.2);
/// assert_eq!(spec.target, SliderTarget::Group("stage-1".into()));
/// assert_eq!(spec.mode, ScaleMode::Real);
///
/// let attn = SliderSpec::soft("global-attention", 0.8);
/// assert_eq!(attn.target, SliderTarget::GlobalAttention);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SliderSpec {
    /// Addressed tensors.
    pub target: SliderTarget,
    /// Raw slider value.
    pub value: f64,
    /// Slider-to-factor mapping.
    pub mode: ScaleMode,
}

impl SliderSpec {
    /// Create a slider spec.
    pub fn new(target: impl Into<SliderTarget>, value: f64, mode: ScaleMode) -> Self {
        Self {
            target: target.into(),
            value,
            mode,
        }
    }

    /// A [`ScaleMode::Real`] slider.
    pub fn real(target: impl Into<SliderTarget>, value: f64) -> Self {
        Self::new(target, value, ScaleMode::Real)
    }

    /// A [`ScaleMode::Soft`] slider.
    pub fn soft(target: impl Into<SliderTarget>, value: f64) -> Self {
        Self::new(target, value, ScaleMode::Soft)
    }
}

// ===========================================================================
// Part 2: Injection options
// ===========================================================================

/// Per-call options for
/// [`InjectionSession::apply_scales`](crate::InjectionSession::apply_scales).
///
/// # Example
///
/// ```
/// use candle_tuner::{InjectionOptions, TargetKind};
///
/// let opts = InjectionOptions::new()
///     .target(TargetKind::Attention)
///     .offload_snapshot(false);
/// assert!(!opts.allow_normalization_scaling);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct InjectionOptions {
    /// Which tensors inside each slider's scope are eligible.
    pub target: TargetKind,
    /// Scale normalization tensors too. Unsafe: norms are the first thing
    /// to blow up.
    pub allow_normalization_scaling: bool,
    /// Allow a new spec set on a dirty session. Factors compound on
    /// already-scaled weights.
    pub cumulative: bool,
    /// Curve sensitivity; `None` uses the architecture default.
    pub sensitivity: Option<Sensitivity>,
    /// Keep snapshot copies in CPU memory regardless of the tensor device.
    pub offload_snapshot: bool,
}

impl InjectionOptions {
    /// Defaults: all tensors, norms locked, no stacking, snapshots offloaded.
    pub const fn new() -> Self {
        Self {
            target: TargetKind::All,
            allow_normalization_scaling: false,
            cumulative: false,
            sensitivity: None,
            offload_snapshot: true,
        }
    }

    /// Restrict eligible tensors.
    pub fn target(mut self, target: TargetKind) -> Self {
        self.target = target;
        self
    }

    /// Unlock normalization tensors.
    pub fn allow_normalization_scaling(mut self, allow: bool) -> Self {
        self.allow_normalization_scaling = allow;
        self
    }

    /// Opt into stacking spec sets on a dirty session.
    pub fn cumulative(mut self, cumulative: bool) -> Self {
        self.cumulative = cumulative;
        self
    }

    /// Override the curve sensitivity.
    pub fn sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }

    /// Choose where snapshot copies live.
    pub fn offload_snapshot(mut self, offload: bool) -> Self {
        self.offload_snapshot = offload;
        self
    }
}

impl Default for InjectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Part 3: Mutation report
// ===========================================================================

/// One slider as it was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedGroup {
    /// Slider id.
    pub id: String,
    /// Resolved scale factor.
    pub factor: f64,
    /// Keys the slider matched, norm-guarded keys excluded.
    pub keys_matched: usize,
}

/// Outcome of one `apply_scales` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MutationReport {
    /// Distinct keys whose contents were multiplied.
    pub keys_mutated: usize,
    /// Distinct normalization keys left untouched by the guard.
    pub keys_skipped: usize,
    /// Sliders in application order.
    pub groups_applied: Vec<AppliedGroup>,
}

impl MutationReport {
    /// Slider ids in application order.
    #[must_use]
    pub fn group_ids(&self) -> Vec<&str> {
        self.groups_applied.iter().map(|g| g.id.as_str()).collect()
    }

    /// Resolved factor of a slider, if it was applied.
    #[must_use]
    pub fn factor_of(&self, id: &str) -> Option<f64> {
        self.groups_applied
            .iter()
            .find(|g| g.id == id)
            .map(|g| g.factor)
    }
}
