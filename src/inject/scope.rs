// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slider scopes and the target-kind filter.

use std::collections::BTreeSet;

use crate::config::TargetKind;
use crate::error::Result;
use crate::groups::LayerGroupTable;
use crate::inject::slider::SliderTarget;
use crate::keys::{Component, RefinerKind, Region, TensorRole};

/// The tensors a slider addresses before target filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scope {
    /// A set of layers; the final layer counts when the set owns the last one.
    Layers {
        layers: BTreeSet<usize>,
        includes_final: bool,
    },
    /// Every transformer layer plus the final layer.
    AllLayers,
    /// One component across every transformer layer.
    AllLayersOf(Component),
    /// Embedders only.
    Embedders,
    /// Every refiner.
    Refiners,
    /// One refiner stream.
    RefinersOf(RefinerKind),
}

impl Scope {
    /// Resolve a slider target against a grouping table.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::UnknownGroup`](crate::TuneError::UnknownGroup)
    /// for a group id the table does not define.
    pub(crate) fn resolve(target: &SliderTarget, table: &LayerGroupTable) -> Result<Self> {
        Ok(match target {
            SliderTarget::Group(id) => {
                let layers: BTreeSet<usize> = table.resolve(id)?.iter().copied().collect();
                let includes_final = table
                    .num_layers()
                    .checked_sub(1)
                    .is_some_and(|last| layers.contains(&last));
                Self::Layers {
                    layers,
                    includes_final,
                }
            }
            SliderTarget::Global => Self::AllLayers,
            SliderTarget::GlobalAttention => Self::AllLayersOf(Component::Attention),
            SliderTarget::GlobalFeedForward => Self::AllLayersOf(Component::FeedForward),
            SliderTarget::Embedders => Self::Embedders,
            SliderTarget::Refiners => Self::Refiners,
            SliderTarget::NoiseRefiners => Self::RefinersOf(RefinerKind::Noise),
            SliderTarget::ContextRefiners => Self::RefinersOf(RefinerKind::Context),
        })
    }

    /// Whether a classified tensor falls inside this scope.
    pub(crate) fn admits(&self, role: &TensorRole) -> bool {
        match (self, role.region) {
            (
                Self::Layers {
                    layers,
                    includes_final,
                },
                region,
            ) => match region {
                Region::Layer(i) => layers.contains(&i),
                Region::FinalLayer => *includes_final,
                _ => false,
            },
            (Self::AllLayers, region) => {
                matches!(region, Region::Layer(_) | Region::FinalLayer)
            }
            (Self::AllLayersOf(component), Region::Layer(_)) => role.component == *component,
            (Self::Embedders, Region::Embedder) | (Self::Refiners, Region::Refiner(_)) => true,
            (Self::RefinersOf(wanted), Region::Refiner(kind)) => kind == *wanted,
            _ => false,
        }
    }
}

/// Whether the call's [`TargetKind`] admits a classified tensor.
pub(crate) fn target_admits(target: TargetKind, role: &TensorRole) -> bool {
    match target {
        TargetKind::All => true,
        TargetKind::Attention => role.component == Component::Attention,
        TargetKind::FeedForward => role.component == Component::FeedForward,
        TargetKind::Normalization => role.component == Component::Normalization,
        TargetKind::Embedding => role.region == Region::Embedder,
        TargetKind::Refiner => matches!(role.region, Region::Refiner(_)),
    }
}
