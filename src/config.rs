// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tuning vocabulary and operator preset parsing.
//!
//! The enums here name the axes every other module switches on: which
//! [`Architecture`] a tensor dictionary belongs to, which [`Granularity`]
//! of layer grouping is in use, how a slider maps to a factor
//! ([`ScaleMode`], [`Sensitivity`]), and which tensors inside a layer are
//! eligible ([`TargetKind`]).
//!
//! [`TunePreset`] parses a saved slider preset from JSON so that a set of
//! slider positions can be stored and replayed outside any UI.
//!
//! # Usage
//!
//! ```
//! use candle_tuner::{Architecture, ScaleMode, TunePreset};
//!
//! let json = serde_json::json!({
//!     "architecture": "image-model",
//!     "granularity": "coarse",
//!     "mode": "soft",
//!     "sliders": { "stage-1": 1.2, "stage-5": 0.9 }
//! });
//! let preset = TunePreset::from_json(&json).unwrap();
//! assert_eq!(preset.architecture, Architecture::ImageModel);
//! assert_eq!(preset.specs.len(), 2);
//! assert_eq!(preset.specs[0].mode, ScaleMode::Soft);
//! ```

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{Result, TuneError};
use crate::inject::{InjectionOptions, SliderSpec, SliderTarget};

// ---------------------------------------------------------------------------
// Architecture
// ---------------------------------------------------------------------------

/// Target model family whose weights are being tuned.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// Single-stream diffusion transformer (Z-Image S3-DiT), 30 layers.
    ImageModel,
    /// Qwen3-4B text encoder, 36 layers.
    TextEncoder,
}

impl Architecture {
    /// Number of transformer layers in the architecture's main stack.
    #[must_use]
    pub const fn num_layers(self) -> usize {
        match self {
            Self::ImageModel => 30,
            Self::TextEncoder => 36,
        }
    }

    /// Curve sensitivity used when a session does not override it.
    ///
    /// Language-model weights collapse into gibberish under much smaller
    /// perturbations than diffusion weights, so the text encoder defaults
    /// to [`Sensitivity::Conservative`].
    #[must_use]
    pub const fn default_sensitivity(self) -> Sensitivity {
        match self {
            Self::ImageModel => Sensitivity::Standard,
            Self::TextEncoder => Sensitivity::Conservative,
        }
    }

    /// Stable tag written into checkpoint metadata.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::ImageModel => "image-model",
            Self::TextEncoder => "text-encoder",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Architecture {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image-model" | "image" | "z-image" | "dit" => Ok(Self::ImageModel),
            "text-encoder" | "text" | "qwen-te" | "te" => Ok(Self::TextEncoder),
            other => Err(TuneError::Config(format!("unknown architecture: '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Granularity
// ---------------------------------------------------------------------------

/// How finely the layer stack is partitioned into slider groups.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// A handful of multi-layer stages (image model) or zones (text encoder).
    Coarse,
    /// One group per layer (`layer-0` .. `layer-(N-1)`), the "LAB" layout.
    Fine,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coarse => write!(f, "coarse"),
            Self::Fine => write!(f, "fine"),
        }
    }
}

impl FromStr for Granularity {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coarse" | "simple" => Ok(Self::Coarse),
            "fine" | "lab" | "per-layer" => Ok(Self::Fine),
            other => Err(TuneError::Config(format!("unknown granularity: '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ScaleMode / Sensitivity
// ---------------------------------------------------------------------------

/// How a slider value is turned into a multiplicative factor.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScaleMode {
    /// The slider value is the factor.
    Real,
    /// Eased curve: quadratic reduction below neutral, dampened boost above.
    #[default]
    Soft,
}

impl fmt::Display for ScaleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => write!(f, "real"),
            Self::Soft => write!(f, "soft"),
        }
    }
}

/// Accepts the canonical names plus the UI labels `"Real Value"` and
/// `"Soft Value"`.
impl FromStr for ScaleMode {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "real" | "real value" | "real-value" => Ok(Self::Real),
            "soft" | "soft value" | "soft-value" => Ok(Self::Soft),
            _ => Err(TuneError::InvalidMode(s.to_owned())),
        }
    }
}

/// Curve constant set applied in [`ScaleMode::Soft`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sensitivity {
    /// Diffusion-model weights.
    Standard,
    /// Text-encoder weights: narrower excursion in both directions.
    Conservative,
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Conservative => write!(f, "conservative"),
        }
    }
}

impl FromStr for Sensitivity {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "conservative" => Ok(Self::Conservative),
            other => Err(TuneError::Config(format!("unknown sensitivity: '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetKind
// ---------------------------------------------------------------------------

/// Which tensors inside the selected scope are eligible for scaling.
///
/// Normalization tensors admitted by [`All`](Self::All) or
/// [`Normalization`](Self::Normalization) are only scaled when the caller
/// sets the unsafe override
/// (`allow_normalization_scaling`).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetKind {
    /// Every parameter in scope.
    #[default]
    All,
    /// Attention projections (`qkv`, `out`, `q_proj`, ...).
    Attention,
    /// Feed-forward / MLP projections.
    FeedForward,
    /// Norm and `adaLN` modulation parameters.
    Normalization,
    /// Embedder parameters.
    Embedding,
    /// Noise/context refiner parameters.
    Refiner,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Attention => write!(f, "attention"),
            Self::FeedForward => write!(f, "feed-forward"),
            Self::Normalization => write!(f, "normalization"),
            Self::Embedding => write!(f, "embedding"),
            Self::Refiner => write!(f, "refiner"),
        }
    }
}

impl FromStr for TargetKind {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "all" => Ok(Self::All),
            "attention" | "attn" => Ok(Self::Attention),
            "feed-forward" | "ffn" | "mlp" => Ok(Self::FeedForward),
            "normalization" | "norm" => Ok(Self::Normalization),
            "embedding" | "embedders" => Ok(Self::Embedding),
            "refiner" | "refiners" => Ok(Self::Refiner),
            other => Err(TuneError::Config(format!("unknown target kind: '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// TunePreset
// ---------------------------------------------------------------------------

/// A stored set of slider positions plus the options to apply them with.
///
/// Parsed from JSON via [`from_json`](Self::from_json). Sliders may be given
/// either as an array of `{"group", "value", "mode"?}` objects (order
/// preserved) or as a `{group: value}` object (applied in sorted key order).
#[derive(Debug, Clone, PartialEq)]
pub struct TunePreset {
    /// Architecture the preset was authored for.
    pub architecture: Architecture,
    /// Grouping granularity the slider ids refer to.
    pub granularity: Granularity,
    /// Sliders in application order.
    pub specs: Vec<SliderSpec>,
    /// Options for [`InjectionSession::apply_scales`](crate::InjectionSession::apply_scales).
    pub options: InjectionOptions,
}

impl TunePreset {
    /// Parse a preset from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] if a required field is missing or has
    /// the wrong type, and [`TuneError::InvalidMode`] for an unrecognized
    /// mode string.
    pub fn from_json(preset: &Value) -> Result<Self> {
        let architecture: Architecture = get_str(preset, "architecture")?.parse()?;
        let granularity = match get_optional_str(preset, "granularity")? {
            Some(s) => s.parse()?,
            None => Granularity::Coarse,
        };
        let default_mode = match get_optional_str(preset, "mode")? {
            Some(s) => s.parse()?,
            None => ScaleMode::default(),
        };

        let mut options = InjectionOptions::new()
            .allow_normalization_scaling(get_bool_or(
                preset,
                "allow_normalization_scaling",
                false,
            ))
            .cumulative(get_bool_or(preset, "cumulative", false));
        if let Some(target) = get_optional_str(preset, "target")? {
            options = options.target(target.parse()?);
        }
        if let Some(sensitivity) = get_optional_str(preset, "sensitivity")? {
            options = options.sensitivity(sensitivity.parse()?);
        }

        let specs = match preset.get("sliders") {
            Some(Value::Array(entries)) => entries
                .iter()
                .map(|entry| parse_slider_entry(entry, default_mode))
                .collect::<Result<Vec<_>>>()?,
            Some(Value::Object(map)) => map
                .iter()
                .map(|(group, value)| {
                    let value = value.as_f64().ok_or_else(|| {
                        TuneError::Config(format!("slider '{group}' is not a number"))
                    })?;
                    Ok(SliderSpec::new(group.as_str(), value, default_mode))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(TuneError::Config(
                    "'sliders' must be an array or an object".into(),
                ))
            }
            None => Vec::new(),
        };

        Ok(Self {
            architecture,
            granularity,
            specs,
            options,
        })
    }

    /// Parse a preset from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] on malformed JSON, plus every error of
    /// [`from_json`](Self::from_json).
    pub fn from_json_str(preset: &str) -> Result<Self> {
        let json: Value = serde_json::from_str(preset)
            .map_err(|e| TuneError::Config(format!("parse preset: {e}")))?;
        Self::from_json(&json)
    }
}

/// Parse one `{"group", "value", "mode"?}` slider entry.
fn parse_slider_entry(entry: &Value, default_mode: ScaleMode) -> Result<SliderSpec> {
    let group = get_str(entry, "group")?;
    let value = get_f64(entry, "value")?;
    let mode = match get_optional_str(entry, "mode")? {
        Some(s) => s.parse()?,
        None => default_mode,
    };
    Ok(SliderSpec::new(SliderTarget::from(group), value, mode))
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required string field from a JSON object.
pub(crate) fn get_str<'a>(config: &'a Value, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| TuneError::Config(format!("missing or invalid field '{key}'")))
}

/// Extract an optional string field; present but not a string is an error.
pub(crate) fn get_optional_str<'a>(config: &'a Value, key: &str) -> Result<Option<&'a str>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(TuneError::Config(format!(
            "field '{key}' must be a string, got {other}"
        ))),
    }
}

/// Extract a required `f64` field from a JSON object.
pub(crate) fn get_f64(config: &Value, key: &str) -> Result<f64> {
    config
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| TuneError::Config(format!("missing or invalid field '{key}'")))
}

/// Extract a required `usize` field from a JSON object.
pub(crate) fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| TuneError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| TuneError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract a `bool` field, returning a default if absent.
pub(crate) fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
