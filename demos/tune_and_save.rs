// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tune a checkpoint with a slider preset, save it, then restore.
//!
//! ```bash
//! RUST_LOG=info cargo run --example tune_and_save -- preset.json model.safetensors out.safetensors
//! ```
//!
//! **What it does:**
//!
//! 1. Initialises a tracing subscriber (structured logs on stderr, filtered
//!    by `RUST_LOG`).
//! 2. Parses a [`candle_tuner::TunePreset`] and loads the checkpoint it
//!    applies to. With no arguments, a built-in preset is applied to a
//!    small synthetic image-model dictionary.
//! 3. Applies the sliders, writes the tuned weights with provenance
//!    metadata, and restores the live dictionary bit-exactly.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{Device, Tensor};
use candle_tuner::{
    read_metadata, save, CheckpointMetadata, InjectionSession, LayerGroupTable, TensorDict,
    TunePreset,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_PRESET: &str = r#"{
    "architecture": "image-model",
    "granularity": "coarse",
    "mode": "soft",
    "sliders": [
        { "group": "stage-1", "value": 1.3 },
        { "group": "stage-5", "value": 0.8 },
        { "group": "refiners", "value": 1.1, "mode": "real" }
    ]
}"#;

fn main() -> candle_tuner::Result<()> {
    // 1. Structured logs
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let preset_path = args.next();
    let model_path = args.next();
    let out_path = args
        .next()
        .map_or_else(|| std::env::temp_dir().join("tuned.safetensors"), PathBuf::from);

    // 2. Preset and weights
    let preset = match &preset_path {
        Some(path) => TunePreset::from_json_str(&std::fs::read_to_string(path)?)?,
        None => TunePreset::from_json_str(DEFAULT_PRESET)?,
    };
    let mut dict = match &model_path {
        Some(path) => TensorDict::load(path, &Device::Cpu, None)?,
        None => synthetic_image_model()?,
    };
    println!(
        "{} tensors, {} sliders for {}",
        dict.len(),
        preset.specs.len(),
        preset.architecture
    );

    // 3. Apply, save, restore
    let table = LayerGroupTable::builtin(preset.architecture, preset.granularity);
    let mut session = InjectionSession::begin(&mut dict, table)?;
    let report = session.apply_scales(&preset.specs, &preset.options)?;
    for group in &report.groups_applied {
        println!(
            "  {:<20} x{:.4}  ({} tensors)",
            group.id, group.factor, group.keys_matched
        );
    }
    println!(
        "mutated {} tensors, skipped {} normalization tensors",
        report.keys_mutated, report.keys_skipped
    );

    let metadata = CheckpointMetadata::new(preset.architecture, preset.granularity, "demo")
        .with_sliders(session.applied_specs());
    save(session.dict(), &out_path, &metadata)?;
    let restored = session.restore()?;
    println!("saved {}, restored {restored} tensors", out_path.display());

    for (key, value) in read_metadata(&out_path)? {
        if key != "sliders" {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}

/// A tiny dictionary with the image model's key layout.
fn synthetic_image_model() -> candle_tuner::Result<TensorDict> {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    for i in 0..30 {
        for suffix in [
            "attention.qkv.weight",
            "attention.out.weight",
            "feed_forward.w1.weight",
            "attention_norm1.weight",
        ] {
            tensors.insert(
                format!("layers.{i}.{suffix}"),
                Tensor::ones((4, 4), candle_core::DType::F32, &device)?,
            );
        }
    }
    for key in [
        "x_embedder.weight",
        "context_refiner.0.attention.qkv.weight",
        "final_layer.linear.weight",
    ] {
        tensors.insert(
            key.to_owned(),
            Tensor::ones((4, 4), candle_core::DType::F32, &device)?,
        );
    }
    TensorDict::from_tensors(tensors)
}
