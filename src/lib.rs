// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-tuner
//!
//! Reversible, in-place scaling of transformer weight groups, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! candle-tuner partitions a model's layer stack into named groups, maps
//! operator slider values to multiplicative factors, multiplies the matched
//! weight tensors in place, and restores them bit-exactly from a
//! first-touch snapshot. Tuned weights can be written to a standalone
//! `.safetensors` checkpoint.
//!
//! ## Supported architectures
//!
//! - **Image model**: a 30-layer single-stream diffusion transformer
//!   (Z-Image S3-DiT naming), five coarse stages or 30 per-layer groups,
//!   plus embedder, refiner, and final-layer tensors.
//! - **Text encoder**: a 36-layer decoder-only language model (Qwen3
//!   naming), six coarse zones or 36 per-layer groups.
//!
//! ## Quick start
//!
//! ```no_run
//! use candle_core::Device;
//! use candle_tuner::{
//!     save, Architecture, CheckpointMetadata, Granularity, InjectionOptions, InjectionSession,
//!     LayerGroupTable, SliderSpec, TensorDict,
//! };
//!
//! # fn main() -> candle_tuner::Result<()> {
//! let mut dict = TensorDict::load("z_image.safetensors", &Device::Cpu, None)?;
//! let table = LayerGroupTable::builtin(Architecture::ImageModel, Granularity::Coarse);
//!
//! let mut session = InjectionSession::begin(&mut dict, table)?;
//! let specs = [SliderSpec::soft("stage-4", 1.3), SliderSpec::real("global-attention", 0.95)];
//! let report = session.apply_scales(&specs, &InjectionOptions::new())?;
//! println!("scaled {} tensors", report.keys_mutated);
//!
//! let meta = CheckpointMetadata::new(Architecture::ImageModel, Granularity::Coarse, "brighter")
//!     .with_sliders(session.applied_specs());
//! save(session.dict(), "z_image_tuned.safetensors", &meta)?;
//! session.restore()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Usage invariant
//!
//! Factors always multiply the *current* contents of a tensor. Feeding a
//! dictionary that was already scaled (for example a host-cached model)
//! into a new session compounds the factors with no detectable signal.
//! [`InjectionSession::begin`] refuses dictionaries that it knows are
//! tainted; dictionaries loaded from a modified file cannot be detected.

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod curve;
pub mod error;
pub mod groups;
pub mod inject;
pub mod keys;
pub mod tensors;

// --- Public re-exports ---------------------------------------------------

// Vocabulary and presets
pub use config::{Architecture, Granularity, ScaleMode, Sensitivity, TargetKind, TunePreset};

// Errors
pub use error::{Result, TuneError};

// Grouping and curve
pub use curve::{compute_scale, SoftCurve};
pub use groups::{resolve_group, LayerGroupSpec, LayerGroupTable};

// Key schemes
pub use keys::{Component, KeyScheme, RefinerKind, Region, TensorRole};

// Injection
pub use inject::{
    AppliedGroup, InjectionOptions, InjectionSession, MutationReport, SliderSpec, SliderTarget,
};
pub use tensors::TensorDict;

// Checkpoints
pub use checkpoint::{
    read_metadata, save, save_with_options, CheckpointMetadata, SaveOptions, SavePrecision,
};
