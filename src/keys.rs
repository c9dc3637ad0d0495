// SPDX-License-Identifier: MIT OR Apache-2.0

//! Static key-naming schemes: which layer and which component a tensor
//! key belongs to.
//!
//! Classification works on dotted path segments, so host prefixes such as
//! `model.diffusion_model.` or `qwen3_4b.transformer.` are tolerated.
//! Only parameter tensors (`*.weight`, and `*.bias` where the scheme
//! allows) are classified; buffers and pad tokens return `None`.
//!
//! | Key | Image model | Text encoder |
//! |-----|-------------|--------------|
//! | `layers.3.attention.qkv.weight` | layer 3, attention | layer 3, attention |
//! | `layers.3.feed_forward.w1.weight` | layer 3, feed-forward | layer 3, feed-forward |
//! | `layers.3.adaLN_modulation.0.weight` | layer 3, normalization | layer 3, other |
//! | `model.layers.7.self_attn.q_proj.bias` | layer 7, attention | `None` (bias) |
//! | `noise_refiner.0.attention.out.weight` | noise refiner, attention | other, attention |
//! | `context_refiner.1.feed_forward.w2.weight` | context refiner, feed-forward | other, feed-forward |
//! | `x_embedder.weight` | embedder | other |
//! | `final_layer.linear.weight` | final layer | other |

use crate::config::Architecture;

/// Where in the network a tensor lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Inside transformer layer `i` of the main stack.
    Layer(usize),
    /// Patch, timestep, caption, or token embedders.
    Embedder,
    /// Refiner blocks ahead of the main stack.
    Refiner(RefinerKind),
    /// Output projection after the last layer.
    FinalLayer,
    /// Anything else (top-level norms, output heads, ...).
    Other,
}

/// Which refiner stream a refiner tensor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefinerKind {
    /// Refines the noisy latent tokens.
    Noise,
    /// Refines the caption (context) tokens.
    Context,
    /// A refiner of neither named stream.
    Other,
}

/// What a tensor does inside its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Attention projections.
    Attention,
    /// Feed-forward / MLP projections.
    FeedForward,
    /// Norm or modulation parameters.
    Normalization,
    /// Anything else.
    Other,
}

/// Classification of one tensor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorRole {
    /// Where the tensor lives.
    pub region: Region,
    /// What the tensor does.
    pub component: Component,
}

impl TensorRole {
    /// Whether the normalization guard applies to this tensor.
    #[must_use]
    pub fn is_normalization(&self) -> bool {
        self.component == Component::Normalization
    }

    /// Transformer layer index, if the tensor lives in the main stack.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self.region {
            Region::Layer(i) => Some(i),
            _ => None,
        }
    }
}

/// Segment markers for one architecture's key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyScheme {
    /// Segment names that precede a layer index.
    pub layer_containers: &'static [&'static str],
    /// Substrings marking a normalization segment.
    pub norm_markers: &'static [&'static str],
    /// Substrings marking an attention segment.
    pub attention_markers: &'static [&'static str],
    /// Substrings marking a feed-forward segment.
    pub feed_forward_markers: &'static [&'static str],
    /// Substrings marking an embedder segment.
    pub embedder_markers: &'static [&'static str],
    /// Substrings marking a refiner segment.
    pub refiner_markers: &'static [&'static str],
    /// Substrings marking the noise refiner, checked inside refiners.
    pub noise_refiner_markers: &'static [&'static str],
    /// Substrings marking the context refiner, checked inside refiners.
    pub context_refiner_markers: &'static [&'static str],
    /// Substrings marking the final output layer.
    pub final_layer_markers: &'static [&'static str],
    /// Whether `*.bias` parameters are eligible.
    pub include_bias: bool,
}

impl KeyScheme {
    /// Single-stream diffusion transformer naming.
    pub const IMAGE_MODEL: Self = Self {
        layer_containers: &["layers", "joint_blocks", "blocks"],
        norm_markers: &["norm", "adaLN"],
        attention_markers: &["attention", "attn"],
        feed_forward_markers: &["feed_forward", "mlp", "ffn"],
        embedder_markers: &["embedder"],
        refiner_markers: &["refiner"],
        noise_refiner_markers: &["noise_refiner"],
        context_refiner_markers: &["context_refiner"],
        final_layer_markers: &["final_layer"],
        include_bias: true,
    };

    /// Decoder-only language model naming (Qwen/Llama and GPT-2 style).
    pub const TEXT_ENCODER: Self = Self {
        layer_containers: &["layers", "h"],
        norm_markers: &["norm", "ln_"],
        attention_markers: &["self_attn", "attn", "attention"],
        feed_forward_markers: &["mlp", "feed_forward"],
        embedder_markers: &["embed_tokens", "wte"],
        refiner_markers: &[],
        noise_refiner_markers: &[],
        context_refiner_markers: &[],
        final_layer_markers: &[],
        include_bias: false,
    };

    /// Scheme for an architecture.
    #[must_use]
    pub const fn for_architecture(architecture: Architecture) -> &'static Self {
        match architecture {
            Architecture::ImageModel => &Self::IMAGE_MODEL,
            Architecture::TextEncoder => &Self::TEXT_ENCODER,
        }
    }

    /// Classify a tensor key, or `None` if the key is not a scalable
    /// parameter under this scheme.
    #[must_use]
    pub fn classify(&self, key: &str) -> Option<TensorRole> {
        let segments: Vec<&str> = key.split('.').collect();
        match segments.last() {
            Some(&"weight") => {}
            Some(&"bias") if self.include_bias => {}
            _ => return None,
        }

        let region = self.region_of(&segments);
        let component = self.component_of(&segments);
        Some(TensorRole { region, component })
    }

    fn region_of(&self, segments: &[&str]) -> Region {
        let layer = segments.windows(2).find_map(|pair| match pair {
            [container, index] if self.layer_containers.contains(container) => {
                index.parse::<usize>().ok()
            }
            _ => None,
        });
        if let Some(i) = layer {
            return Region::Layer(i);
        }

        if any_segment_has(segments, self.refiner_markers) {
            Region::Refiner(self.refiner_kind_of(segments))
        } else if any_segment_has(segments, self.embedder_markers) {
            Region::Embedder
        } else if any_segment_has(segments, self.final_layer_markers) {
            Region::FinalLayer
        } else {
            Region::Other
        }
    }

    fn refiner_kind_of(&self, segments: &[&str]) -> RefinerKind {
        if any_segment_has(segments, self.noise_refiner_markers) {
            RefinerKind::Noise
        } else if any_segment_has(segments, self.context_refiner_markers) {
            RefinerKind::Context
        } else {
            RefinerKind::Other
        }
    }

    fn component_of(&self, segments: &[&str]) -> Component {
        // Norm markers win: `post_attention_layernorm` is a norm.
        if any_segment_has(segments, self.norm_markers) {
            Component::Normalization
        } else if any_segment_has(segments, self.attention_markers) {
            Component::Attention
        } else if any_segment_has(segments, self.feed_forward_markers) {
            Component::FeedForward
        } else {
            Component::Other
        }
    }
}

fn any_segment_has(segments: &[&str], markers: &[&str]) -> bool {
    segments
        .iter()
        .any(|segment| markers.iter().any(|marker| segment.contains(marker)))
}
