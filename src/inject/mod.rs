// SPDX-License-Identifier: MIT OR Apache-2.0

//! Weight injection: resolve sliders, snapshot, scale in place, restore.
//!
//! ## Lifecycle
//!
//! 1. [`InjectionSession::begin`] borrows a pristine [`TensorDict`](crate::TensorDict).
//! 2. [`InjectionSession::apply_scales`] resolves every [`SliderSpec`] to a
//!    scope and a factor, backs up each matched key on first touch, and
//!    multiplies it in place.
//! 3. [`InjectionSession::restore`] writes the backups back bit-exactly, or
//!    [`InjectionSession::keep`] discards them.
//!
//! ## Selection
//!
//! A slider's scope (a layer group, `global`, `global-attention`,
//! `global-feed-forward`, `embedders`, `refiners`, `noise-refiners`,
//! `context-refiners`) is intersected with the
//! call's [`TargetKind`](crate::TargetKind). Normalization tensors left in
//! the intersection are skipped unless
//! `allow_normalization_scaling` is set.

mod scope;
mod session;
mod slider;
mod snapshot;

pub use session::InjectionSession;
pub use slider::{AppliedGroup, InjectionOptions, MutationReport, SliderSpec, SliderTarget};
