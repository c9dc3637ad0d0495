// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: apply slider scales to synthetic tensor dictionaries
//! laid out like the real checkpoints, then restore.
//!
//! No model download is needed; every dictionary is built on the CPU.
//!
//! Run:
//!   `cargo test --test injection_roundtrip`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    missing_docs
)]

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor};
use candle_tuner::{
    compute_scale, Architecture, Granularity, InjectionOptions, InjectionSession, KeyScheme,
    LayerGroupTable, ScaleMode, Sensitivity, SliderSpec, TargetKind, TensorDict, TuneError,
    TunePreset,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Per-layer tensor names of the synthetic image model.
const IMAGE_LAYER_KEYS: [&str; 6] = [
    "attention.qkv.weight",
    "attention.out.weight",
    "feed_forward.w1.weight",
    "feed_forward.w2.bias",
    "attention_norm1.weight",
    "adaLN_modulation.0.weight",
];

/// Auxiliary tensors of the synthetic image model.
const IMAGE_AUX_KEYS: [&str; 8] = [
    "x_embedder.weight",
    "t_embedder.mlp.0.weight",
    "cap_embedder.1.weight",
    "noise_refiner.0.attention.qkv.weight",
    "context_refiner.0.feed_forward.w1.weight",
    "final_layer.linear.weight",
    "final_layer.adaLN_modulation.1.weight",
    "x_pad_token",
];

/// Four distinct, non-zero values per tensor.
fn values(seed: usize) -> Vec<f32> {
    (0..4)
        .map(|j| {
            let magnitude = 0.01 * (seed * 4 + j + 1) as f32;
            if j % 2 == 0 {
                magnitude
            } else {
                -magnitude
            }
        })
        .collect()
}

fn build(keys: Vec<String>) -> TensorDict {
    let tensors: HashMap<String, Tensor> = keys
        .into_iter()
        .enumerate()
        .map(|(seed, key)| {
            let t = Tensor::new(values(seed).as_slice(), &Device::Cpu).unwrap();
            (key, t)
        })
        .collect();
    TensorDict::from_tensors(tensors).unwrap()
}

fn image_dict() -> TensorDict {
    let mut keys: Vec<String> = (0..30)
        .flat_map(|i| IMAGE_LAYER_KEYS.iter().map(move |k| format!("layers.{i}.{k}")))
        .collect();
    keys.extend(IMAGE_AUX_KEYS.iter().map(|k| (*k).to_owned()));
    build(keys)
}

fn text_dict() -> TensorDict {
    let mut keys: Vec<String> = (0..36)
        .flat_map(|i| {
            [
                "self_attn.q_proj.weight",
                "self_attn.q_proj.bias",
                "mlp.up_proj.weight",
                "input_layernorm.weight",
            ]
            .into_iter()
            .map(move |k| format!("model.layers.{i}.{k}"))
        })
        .collect();
    keys.push("model.embed_tokens.weight".to_owned());
    keys.push("model.norm.weight".to_owned());
    build(keys)
}

fn contents(dict: &TensorDict) -> BTreeMap<String, Vec<f32>> {
    dict.iter()
        .map(|(k, t)| (k.to_owned(), t.to_vec1::<f32>().unwrap()))
        .collect()
}

fn bits(dict: &TensorDict) -> BTreeMap<String, Vec<u32>> {
    contents(dict)
        .into_iter()
        .map(|(k, v)| (k, v.into_iter().map(f32::to_bits).collect()))
        .collect()
}

/// Assert `after[key] == before[key] * factor` element-wise.
fn assert_scaled(before: &[f32], after: &[f32], factor: f64, key: &str) {
    for (b, a) in before.iter().zip(after) {
        let expected = f64::from(*b) * factor;
        assert!(
            (f64::from(*a) - expected).abs() <= 1e-6 * expected.abs().max(1e-6),
            "{key}: {a} != {b} * {factor}"
        );
    }
}

fn image_table() -> LayerGroupTable {
    LayerGroupTable::builtin(Architecture::ImageModel, Granularity::Coarse)
}

fn is_norm(key: &str) -> bool {
    KeyScheme::IMAGE_MODEL
        .classify(key)
        .is_some_and(|role| role.is_normalization())
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[test]
fn stage_one_real_scales_layers_zero_to_five() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let report = session
        .apply_scales(&[SliderSpec::real("stage-1", 1.2)], &InjectionOptions::new())
        .unwrap();
    let after = contents(session.dict());

    // 4 scalable tensors in each of 6 layers; 2 norms per layer guarded.
    assert_eq!(report.keys_mutated, 24);
    assert_eq!(report.keys_skipped, 12);
    assert_eq!(report.group_ids(), ["stage-1"]);
    assert_eq!(report.factor_of("stage-1"), Some(1.2));

    for (key, old) in &before {
        let new = &after[key];
        let in_stage = (0..6).any(|i| key.starts_with(&format!("layers.{i}.")));
        if in_stage && !is_norm(key) {
            assert_scaled(old, new, 1.2, key);
        } else {
            assert_eq!(old, new, "{key} must be untouched");
        }
    }
    session.restore().unwrap();
}

#[test]
fn stage_one_with_norms_unlocked_scales_every_key() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let opts = InjectionOptions::new().allow_normalization_scaling(true);
    let report = session
        .apply_scales(&[SliderSpec::real("stage-1", 1.2)], &opts)
        .unwrap();
    assert_eq!(report.keys_mutated, 36);
    assert_eq!(report.keys_skipped, 0);

    let after = contents(session.dict());
    for i in 0..6 {
        for k in IMAGE_LAYER_KEYS {
            let key = format!("layers.{i}.{k}");
            assert_scaled(&before[&key], &after[&key], 1.2, &key);
        }
    }
    assert_eq!(before["layers.6.attention.qkv.weight"], after["layers.6.attention.qkv.weight"]);
}

#[test]
fn stage_one_soft_uses_boost_branch() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let report = session
        .apply_scales(&[SliderSpec::soft("stage-1", 1.2)], &InjectionOptions::new())
        .unwrap();

    let factor = report.factor_of("stage-1").unwrap();
    assert_eq!(factor, compute_scale(1.2, ScaleMode::Soft, Sensitivity::Standard));
    assert!(factor > 1.0 && factor < 1.2);

    let key = "layers.3.feed_forward.w1.weight";
    assert_scaled(&before[key], &contents(session.dict())[key], factor, key);
}

#[test]
fn global_attention_touches_only_attention() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let opts = InjectionOptions::new().target(TargetKind::Attention);
    let report = session
        .apply_scales(&[SliderSpec::real("global-attention", 0.8)], &opts)
        .unwrap();
    assert_eq!(report.keys_mutated, 60);
    assert_eq!(report.keys_skipped, 0);

    let after = contents(session.dict());
    for (key, old) in &before {
        let attention_in_layer = key.starts_with("layers.")
            && key.contains(".attention.")
            && key.ends_with(".weight");
        if attention_in_layer {
            assert_scaled(old, &after[key], 0.8, key);
        } else {
            assert_eq!(old, &after[key], "{key} must be untouched");
        }
    }
}

#[test]
fn second_spec_set_on_dirty_session_fails_and_leaves_tensors() {
    let mut dict = image_dict();
    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(&[SliderSpec::real("stage-2", 1.5)], &InjectionOptions::new())
        .unwrap();
    let after_first = bits(session.dict());

    let err = session
        .apply_scales(&[SliderSpec::real("stage-3", 0.5)], &InjectionOptions::new())
        .unwrap_err();
    assert!(matches!(err, TuneError::SessionAlreadyDirty(_)), "{err}");
    assert_eq!(bits(session.dict()), after_first);
    assert!(session.is_dirty());
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

#[test]
fn restore_is_bit_exact_for_mixed_specs() {
    let mut dict = image_dict();
    let pristine = bits(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let specs = [
        SliderSpec::soft("stage-1", 0.7),
        SliderSpec::real("stage-5", 1.37),
        SliderSpec::real("global-attention", 1.3),
        SliderSpec::real("global-feed-forward", 0.91),
        SliderSpec::real("embedders", 0.5),
        SliderSpec::soft("refiners", 1.8),
        SliderSpec::real("global", 0.93),
    ];
    let opts = InjectionOptions::new().allow_normalization_scaling(true);
    let report = session.apply_scales(&specs, &opts).unwrap();
    assert!(report.keys_mutated > 0);
    assert_ne!(bits(session.dict()), pristine);

    let restored = session.restore().unwrap();
    assert_eq!(restored, report.keys_mutated);
    assert!(!session.is_dirty());
    assert_eq!(session.snapshot_len(), 0);
    drop(session);

    assert_eq!(bits(&dict), pristine);
    assert!(!dict.is_tainted());
}

#[test]
fn restore_twice_equals_restore_once() {
    let mut dict = image_dict();
    let pristine = bits(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(&[SliderSpec::real("stage-4", 3.0)], &InjectionOptions::new())
        .unwrap();
    assert!(session.restore().unwrap() > 0);
    let once = bits(session.dict());
    assert_eq!(session.restore().unwrap(), 0);
    assert_eq!(bits(session.dict()), once);
    assert_eq!(once, pristine);
}

#[test]
fn restore_on_fresh_session_is_noop() {
    let mut dict = image_dict();
    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    assert_eq!(session.restore().unwrap(), 0);
}

#[test]
fn overlapping_specs_compose_and_snapshot_once() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let specs = [
        SliderSpec::real("stage-1", 2.0),
        SliderSpec::real("global-attention", 0.5),
    ];
    let report = session.apply_scales(&specs, &InjectionOptions::new()).unwrap();

    // Layers 0-5 attention compose to 1.0 and are left alone.
    assert_eq!(report.keys_mutated, 60);
    let after = contents(session.dict());
    let k = "layers.2.attention.qkv.weight";
    assert_eq!(before[k], after[k]);
    assert!(!session.is_snapshotted(k));
    let k = "layers.2.feed_forward.w1.weight";
    assert_scaled(&before[k], &after[k], 2.0, k);
    let k = "layers.20.attention.out.weight";
    assert_scaled(&before[k], &after[k], 0.5, k);
    assert_eq!(session.snapshot_len(), 60);
}

#[test]
fn cumulative_application_compounds_and_still_restores() {
    let mut dict = image_dict();
    let pristine = bits(&dict);
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(&[SliderSpec::real("stage-3", 2.0)], &InjectionOptions::new())
        .unwrap();
    let opts = InjectionOptions::new().cumulative(true);
    session
        .apply_scales(&[SliderSpec::real("stage-3", 1.5)], &opts)
        .unwrap();

    let k = "layers.14.feed_forward.w1.weight";
    assert_scaled(&before[k], &contents(session.dict())[k], 3.0, k);
    assert_eq!(session.applied_specs().len(), 2);

    session.restore().unwrap();
    assert_eq!(bits(session.dict()), pristine);
}

#[test]
fn identical_reapply_is_a_noop() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let specs = [SliderSpec::real("stage-2", 1.25)];
    let first = session.apply_scales(&specs, &InjectionOptions::new()).unwrap();
    let second = session.apply_scales(&specs, &InjectionOptions::new()).unwrap();
    assert_eq!(first, second);

    let k = "layers.7.attention.qkv.weight";
    assert_scaled(&before[k], &contents(session.dict())[k], 1.25, k);
}

// ---------------------------------------------------------------------------
// Guards and failures
// ---------------------------------------------------------------------------

#[test]
fn normalization_guard_counts_every_locked_norm() {
    let mut dict = image_dict();
    let before = contents(&dict);
    let expected_skips = before
        .keys()
        .filter(|k| is_norm(k) && (k.starts_with("layers.") || k.starts_with("final_layer.")))
        .count();
    assert_eq!(expected_skips, 61);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let report = session
        .apply_scales(
            &[SliderSpec::real("global", 5.0), SliderSpec::real("stage-5", 0.1)],
            &InjectionOptions::new(),
        )
        .unwrap();
    assert_eq!(report.keys_skipped, expected_skips);

    let after = contents(session.dict());
    for key in before.keys().filter(|k| is_norm(k)) {
        assert_eq!(before[key], after[key], "{key} must be locked");
    }
}

#[test]
fn normalization_target_without_override_changes_nothing() {
    let mut dict = image_dict();
    let pristine = bits(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let opts = InjectionOptions::new().target(TargetKind::Normalization);
    let report = session
        .apply_scales(&[SliderSpec::real("global", 1.5)], &opts)
        .unwrap();
    assert_eq!(report.keys_mutated, 0);
    assert_eq!(report.keys_skipped, 61);
    assert!(!session.is_dirty());
    drop(session);

    assert_eq!(bits(&dict), pristine);
    assert!(!dict.is_tainted());
}

#[test]
fn final_layer_follows_last_stage() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(&[SliderSpec::real("stage-5", 0.6)], &InjectionOptions::new())
        .unwrap();
    let k = "final_layer.linear.weight";
    assert_scaled(&before[k], &contents(session.dict())[k], 0.6, k);
}

#[test]
fn auxiliary_sliders_reach_embedders_and_refiners() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(
            &[SliderSpec::real("embedders", 0.5), SliderSpec::real("refiners", 1.1)],
            &InjectionOptions::new(),
        )
        .unwrap();
    let after = contents(session.dict());
    for k in ["x_embedder.weight", "t_embedder.mlp.0.weight", "cap_embedder.1.weight"] {
        assert_scaled(&before[k], &after[k], 0.5, k);
    }
    for k in [
        "noise_refiner.0.attention.qkv.weight",
        "context_refiner.0.feed_forward.w1.weight",
    ] {
        assert_scaled(&before[k], &after[k], 1.1, k);
    }
    assert_eq!(before["x_pad_token"], after["x_pad_token"]);
    assert_eq!(before["layers.0.attention.qkv.weight"], after["layers.0.attention.qkv.weight"]);
}

#[test]
fn refiner_streams_scale_independently() {
    let noise = "noise_refiner.0.attention.qkv.weight";
    let context = "context_refiner.0.feed_forward.w1.weight";

    for (slider, scaled, untouched) in [
        ("noise-refiners", noise, context),
        ("context-refiners", context, noise),
    ] {
        let mut dict = image_dict();
        let before = contents(&dict);
        let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
        let report = session
            .apply_scales(&[SliderSpec::real(slider, 1.4)], &InjectionOptions::new())
            .unwrap();
        assert_eq!(report.keys_mutated, 1, "{slider}");
        let after = contents(session.dict());
        assert_scaled(&before[scaled], &after[scaled], 1.4, scaled);
        assert_eq!(before[untouched], after[untouched], "{slider}");
        session.restore().unwrap();
    }

    // Both streams compose with the combined slider.
    let mut dict = image_dict();
    let before = contents(&dict);
    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(
            &[SliderSpec::real("refiners", 2.0), SliderSpec::real("noise-refiners", 0.5)],
            &InjectionOptions::new(),
        )
        .unwrap();
    let after = contents(session.dict());
    assert_eq!(before[noise], after[noise]);
    assert_scaled(&before[context], &after[context], 2.0, context);
    session.restore().unwrap();
}

#[test]
fn unknown_group_leaves_dictionary_untouched() {
    let mut dict = image_dict();
    let pristine = bits(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let err = session
        .apply_scales(
            &[SliderSpec::real("stage-1", 2.0), SliderSpec::real("stage-9", 2.0)],
            &InjectionOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, TuneError::UnknownGroup { ref group, .. } if group == "stage-9"));
    assert!(!session.is_dirty());
    drop(session);
    assert_eq!(bits(&dict), pristine);
}

#[test]
fn non_finite_slider_is_rejected() {
    let mut dict = image_dict();
    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let err = session
        .apply_scales(&[SliderSpec::real("stage-1", f64::NAN)], &InjectionOptions::new())
        .unwrap_err();
    assert!(matches!(err, TuneError::Config(_)));
}

#[test]
fn integer_weights_are_an_injection_error() {
    let mut tensors = HashMap::new();
    tensors.insert(
        "layers.0.attention.qkv.weight".to_owned(),
        Tensor::new(&[1u32, 2, 3], &Device::Cpu).unwrap(),
    );
    let mut dict = TensorDict::from_tensors(tensors).unwrap();
    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    let err = session
        .apply_scales(&[SliderSpec::real("stage-1", 2.0)], &InjectionOptions::new())
        .unwrap_err();
    assert!(matches!(err, TuneError::Injection(_)), "{err}");
    assert!(!session.is_dirty());
}

#[test]
fn tainted_dictionary_refuses_new_sessions() {
    let mut dict = image_dict();
    {
        let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
        session
            .apply_scales(&[SliderSpec::real("stage-1", 1.1)], &InjectionOptions::new())
            .unwrap();
        // Dropped without restore.
    }
    assert!(dict.is_tainted());
    assert!(matches!(
        InjectionSession::begin(&mut dict, image_table()),
        Err(TuneError::SessionAlreadyDirty(_))
    ));

    let session = InjectionSession::begin_cumulative(&mut dict, image_table());
    assert!(!session.is_dirty());
    drop(session);

    dict.mark_pristine();
    assert!(InjectionSession::begin(&mut dict, image_table()).is_ok());
}

#[test]
fn cumulative_restore_keeps_earlier_taint() {
    let mut dict = image_dict();
    let k = "layers.0.attention.qkv.weight";
    let pristine = contents(&dict)[k].clone();
    {
        let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
        session
            .apply_scales(&[SliderSpec::real("stage-1", 2.0)], &InjectionOptions::new())
            .unwrap();
        // Dropped without restore.
    }

    let mut session = InjectionSession::begin_cumulative(&mut dict, image_table());
    session
        .apply_scales(&[SliderSpec::real("stage-1", 1.5)], &InjectionOptions::new())
        .unwrap();
    assert_eq!(session.restore().unwrap(), 24);
    drop(session);

    // Back to the doubled weights, which are still not pristine.
    assert_scaled(&pristine, &contents(&dict)[k], 2.0, k);
    assert!(dict.is_tainted());
    assert!(matches!(
        InjectionSession::begin(&mut dict, image_table()),
        Err(TuneError::SessionAlreadyDirty(_))
    ));

    // A cumulative session on a pristine dictionary still clears the flag.
    let mut fresh = image_dict();
    let mut session = InjectionSession::begin_cumulative(&mut fresh, image_table());
    session
        .apply_scales(&[SliderSpec::real("stage-1", 1.5)], &InjectionOptions::new())
        .unwrap();
    session.restore().unwrap();
    drop(session);
    assert!(!fresh.is_tainted());
}

#[test]
fn keep_discards_snapshot_and_keeps_scaling() {
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(&[SliderSpec::real("stage-2", 0.5)], &InjectionOptions::new())
        .unwrap();
    session.keep();

    assert!(dict.is_tainted());
    let k = "layers.9.feed_forward.w1.weight";
    assert_scaled(&before[k], &contents(&dict)[k], 0.5, k);
}

#[test]
fn live_handles_see_scaling_and_restore() {
    let mut dict = image_dict();
    let handle = dict.get("layers.0.attention.qkv.weight").unwrap().clone();
    let before = handle.to_vec1::<f32>().unwrap();

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(&[SliderSpec::real("stage-1", 2.0)], &InjectionOptions::new())
        .unwrap();
    assert_scaled(&before, &handle.to_vec1::<f32>().unwrap(), 2.0, "handle");
    session.restore().unwrap();
    assert_eq!(handle.to_vec1::<f32>().unwrap(), before);
}

// ---------------------------------------------------------------------------
// Other layouts
// ---------------------------------------------------------------------------

#[test]
fn text_encoder_zone_uses_conservative_curve_and_skips_biases() {
    let mut dict = text_dict();
    let before = contents(&dict);
    let table = LayerGroupTable::builtin(Architecture::TextEncoder, Granularity::Coarse);

    let mut session = InjectionSession::begin(&mut dict, table).unwrap();
    let report = session
        .apply_scales(&[SliderSpec::soft("zone-4", 2.0)], &InjectionOptions::new())
        .unwrap();
    let factor = report.factor_of("zone-4").unwrap();
    assert!((factor - 1.1).abs() < 1e-12);
    // q_proj + up_proj in 6 layers; layernorms locked, biases ineligible.
    assert_eq!(report.keys_mutated, 12);
    assert_eq!(report.keys_skipped, 6);

    let after = contents(session.dict());
    let k = "model.layers.20.self_attn.q_proj.weight";
    assert_scaled(&before[k], &after[k], factor, k);
    let k = "model.layers.20.self_attn.q_proj.bias";
    assert_eq!(before[k], after[k]);
    let k = "model.layers.17.mlp.up_proj.weight";
    assert_eq!(before[k], after[k]);
}

#[test]
fn text_encoder_sensitivity_override() {
    let mut dict = text_dict();
    let table = LayerGroupTable::builtin(Architecture::TextEncoder, Granularity::Fine);
    let mut session = InjectionSession::begin(&mut dict, table).unwrap();
    let opts = InjectionOptions::new().sensitivity(Sensitivity::Standard);
    let report = session
        .apply_scales(&[SliderSpec::soft("layer-35", 0.0)], &opts)
        .unwrap();
    assert_eq!(report.factor_of("layer-35"), Some(0.0));
    assert_eq!(report.keys_mutated, 2);
}

#[test]
fn fine_granularity_addresses_one_layer() {
    let mut dict = image_dict();
    let before = contents(&dict);
    let table = LayerGroupTable::builtin(Architecture::ImageModel, Granularity::Fine);

    let mut session = InjectionSession::begin(&mut dict, table).unwrap();
    let report = session
        .apply_scales(&[SliderSpec::real("layer-7", 0.5)], &InjectionOptions::new())
        .unwrap();
    assert_eq!(report.keys_mutated, 4);

    let after = contents(session.dict());
    for (key, old) in &before {
        if key.starts_with("layers.7.") && !is_norm(key) {
            assert_scaled(old, &after[key], 0.5, key);
        } else {
            assert_eq!(old, &after[key]);
        }
    }
}

#[test]
fn block_preset_table_drives_injection() {
    let table =
        LayerGroupTable::from_json_str(include_str!("../presets/image_model_blocks.json")).unwrap();
    let mut dict = image_dict();
    let before = contents(&dict);

    let mut session = InjectionSession::begin(&mut dict, table).unwrap();
    session
        .apply_scales(&[SliderSpec::real("block-6", 1.5)], &InjectionOptions::new())
        .unwrap();
    let after = contents(session.dict());
    for k in ["layers.25.attention.qkv.weight", "final_layer.linear.weight"] {
        assert_scaled(&before[k], &after[k], 1.5, k);
    }
    let k = "layers.24.attention.qkv.weight";
    assert_eq!(before[k], after[k]);
}

#[test]
fn tune_preset_replays_sliders() {
    let preset = TunePreset::from_json_str(
        r#"{
            "architecture": "image-model",
            "granularity": "coarse",
            "mode": "real",
            "sliders": [
                { "group": "stage-2", "value": 1.1 },
                { "group": "global_mlp", "value": 0.9 }
            ]
        }"#,
    )
    .unwrap();
    let mut dict = image_dict();
    let pristine = bits(&dict);
    let table = LayerGroupTable::builtin(preset.architecture, preset.granularity);

    let mut session = InjectionSession::begin(&mut dict, table).unwrap();
    let report = session.apply_scales(&preset.specs, &preset.options).unwrap();
    assert_eq!(report.group_ids(), ["stage-2", "global-feed-forward"]);
    session.restore().unwrap();
    drop(session);
    assert_eq!(bits(&dict), pristine);
}

#[test]
fn half_precision_weights_roundtrip() {
    let tensors: HashMap<String, Tensor> = (0..30)
        .map(|i| {
            let t = Tensor::new(values(i).as_slice(), &Device::Cpu)
                .unwrap()
                .to_dtype(DType::BF16)
                .unwrap();
            (format!("layers.{i}.feed_forward.w1.weight"), t)
        })
        .collect();
    let mut dict = TensorDict::from_tensors(tensors).unwrap();
    let pristine: Vec<Vec<f32>> = dict
        .iter()
        .map(|(_, t)| t.to_dtype(DType::F32).unwrap().to_vec1().unwrap())
        .collect();

    let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
    session
        .apply_scales(&[SliderSpec::soft("global", 0.3)], &InjectionOptions::new())
        .unwrap();
    session.restore().unwrap();
    drop(session);

    let restored: Vec<Vec<f32>> = dict
        .iter()
        .map(|(_, t)| t.to_dtype(DType::F32).unwrap().to_vec1().unwrap())
        .collect();
    assert_eq!(restored, pristine);
}

/// Half-precision weights are multiplied in `f32` and rounded once.
#[test]
fn half_precision_weights_scale_by_exact_factor() {
    let raw = [3.0f32, 5.0, 7.0, 100.0];
    for dtype in [DType::BF16, DType::F16] {
        let mut tensors = HashMap::new();
        tensors.insert(
            "layers.0.feed_forward.w1.weight".to_owned(),
            Tensor::new(&raw, &Device::Cpu).unwrap().to_dtype(dtype).unwrap(),
        );
        let mut dict = TensorDict::from_tensors(tensors).unwrap();

        let mut session = InjectionSession::begin(&mut dict, image_table()).unwrap();
        session
            .apply_scales(&[SliderSpec::real("stage-1", 1.2)], &InjectionOptions::new())
            .unwrap();
        let after: Vec<f32> = session
            .dict()
            .get("layers.0.feed_forward.w1.weight")
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1()
            .unwrap();

        let products: Vec<f32> = raw.iter().map(|v| v * 1.2f32).collect();
        let expected: Vec<f32> = Tensor::new(products.as_slice(), &Device::Cpu)
            .unwrap()
            .to_dtype(dtype)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(after, expected, "{dtype:?}");
        if dtype == DType::BF16 {
            assert_eq!(after, [3.59375, 6.0, 8.375, 120.0]);
        }
        session.restore().unwrap();
    }
}
