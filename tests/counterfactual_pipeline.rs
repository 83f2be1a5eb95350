// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end runs on a toy subject model and a two-feature codec.
//!
//! Run:
//!   `cargo test --test counterfactual_pipeline`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::as_conversions,
    missing_docs
)]

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_counterfactual::{
    ActivationLocation, CfError, CfModel, CfTokenizer, Condition, CounterfactualPipeline,
    FeatureCodec, FeatureConfig, FeatureStore, GenerationConfig, GenerationController, HookPoint,
    HookSpec, InterventionEngine, InterventionSpec, JumpReluSae, PipelineConfig, ResultTable,
    RunSnapshot, ToyTransformer, WordVocab,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const WORDS: [&str; 12] = [
    "<bos>", "<unk>", "\n", "the", "cat", "sat", "on", "a", "mat", "dog", "ran", "home",
];
const HIDDEN: usize = 4;
const LAYER: usize = 1;

fn tokenizer() -> CfTokenizer {
    CfTokenizer::Word(
        WordVocab::new(WORDS)
            .with_bos("<bos>")
            .unwrap()
            .with_unk("<unk>")
            .unwrap(),
    )
}

fn toy_model(seed: u64) -> CfModel {
    let dev = Device::Cpu;
    CfModel::new(
        Box::new(ToyTransformer::new(WORDS.len(), HIDDEN, 2, seed, &dev).unwrap()),
        dev,
    )
}

/// Feature 0 reads hidden dimension 0, feature 1 reads dimension 1.
fn toy_codec() -> Arc<dyn FeatureCodec> {
    let dev = Device::Cpu;
    let w_enc = Tensor::from_vec(
        vec![1.0_f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        (HIDDEN, 2),
        &dev,
    )
    .unwrap();
    let w_dec = w_enc.t().unwrap().contiguous().unwrap();
    Arc::new(
        JumpReluSae::new(
            w_enc,
            Tensor::zeros(2, DType::F32, &dev).unwrap(),
            Tensor::zeros(2, DType::F32, &dev).unwrap(),
            w_dec,
            Tensor::zeros(HIDDEN, DType::F32, &dev).unwrap(),
        )
        .unwrap(),
    )
}

/// Four sequences; in each, feature 0 fires at position 3 and feature 1 at
/// position 4.
fn toy_store() -> FeatureStore {
    let corpus = vec![
        vec![3, 4, 5, 6, 7, 8],
        vec![3, 9, 10, 11, 3, 4],
        vec![7, 8, 5, 6, 3, 9],
        vec![9, 10, 6, 3, 8, 11],
    ];
    let mut locations = Vec::new();
    for sequence in 0..corpus.len() {
        let s = sequence as f32;
        locations.push(ActivationLocation {
            sequence,
            position: 3,
            feature: 0,
            activation: 1.0 + s,
        });
        locations.push(ActivationLocation {
            sequence,
            position: 4,
            feature: 1,
            activation: 2.0 + s,
        });
    }
    let cfg = FeatureConfig {
        width: 2,
        n_splits: 1,
        max_examples: 100,
        min_examples: 1,
    };
    FeatureStore::from_locations(&corpus, &locations, LAYER, cfg, 6).unwrap()
}

fn toy_config() -> PipelineConfig {
    PipelineConfig {
        feat_layer: LAYER,
        n_feats: 2,
        n_train: 2,
        n_test: 2,
        n_quantiles: 1,
        max_generation_length: 3,
        explainer_max_tokens: 4,
        n_explanations: 2,
        ..PipelineConfig::default()
    }
}

// ---------------------------------------------------------------------------
// End-to-end
// ---------------------------------------------------------------------------

#[test]
fn two_features_two_rows() {
    let subject = toy_model(1);
    let explainer = toy_model(2);
    let tok = tokenizer();
    let store = toy_store();
    assert_eq!(store.len(), 2);
    assert!(store.records().iter().all(|r| r.examples.len() == 4));

    let pipeline = CounterfactualPipeline::new(toy_config(), &subject, &tok, toy_codec())
        .unwrap()
        .with_explainer(&explainer, &tok)
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("run");
    let table = pipeline.run(&store, &out).unwrap();

    assert_eq!(table.len(), 2);
    let feats: Vec<usize> = table.rows().iter().map(|r| r.feat_idx).collect();
    assert_eq!(feats, vec![0, 1]);
    for row in table.rows() {
        assert_eq!(row.scorer_examples.len(), 2);
        assert_eq!(row.completions.len(), 2);
        for record in &row.completions {
            assert!(!record.completions.clean.is_empty());
            assert!(!record.completions.intervened.is_empty());
        }
        assert_eq!(row.explanations.as_ref().unwrap().len(), 2);
        assert_eq!(row.explainer_intervention_examples.as_ref().unwrap().len(), 2);
        assert_eq!(row.explainer_prompts.as_ref().unwrap().len(), 2);
        assert_eq!(row.explainer_examples.as_ref().unwrap().len(), 2);
        let prompter = row.neuron_prompter.as_ref().unwrap();
        assert!(
            prompter
                .intervention_examples
                .iter()
                .all(|e| e.top_tokens.len() == 5 && e.top_p_increases.len() == 5)
        );
    }

    let on_disk = ResultTable::from_json_file(out.join("results.json")).unwrap();
    assert_eq!(on_disk, table);
    let snapshot: RunSnapshot =
        serde_json::from_slice(&std::fs::read(out.join("config.json")).unwrap()).unwrap();
    assert_eq!(snapshot.config, toy_config());
}

#[test]
fn identical_configs_reproduce_the_run() {
    let subject = toy_model(1);
    let explainer = toy_model(2);
    let tok = tokenizer();
    let store = toy_store();
    let dir = tempfile::tempdir().unwrap();

    let run = |name: &str| {
        CounterfactualPipeline::new(toy_config(), &subject, &tok, toy_codec())
            .unwrap()
            .with_explainer(&explainer, &tok)
            .unwrap()
            .run(&store, dir.path().join(name))
            .unwrap()
    };
    assert_eq!(run("first"), run("second"));
}

#[test]
fn existing_results_abort_before_writing() {
    let subject = toy_model(1);
    let explainer = toy_model(2);
    let tok = tokenizer();
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results.json");
    std::fs::write(&results, b"[]").unwrap();

    let pipeline = CounterfactualPipeline::new(toy_config(), &subject, &tok, toy_codec())
        .unwrap()
        .with_explainer(&explainer, &tok)
        .unwrap();
    let err = pipeline.run(&toy_store(), dir.path()).unwrap_err();

    assert!(matches!(err, CfError::DestinationExists(_)));
    assert_eq!(std::fs::read(&results).unwrap(), b"[]");
    assert!(!dir.path().join("config.json").exists());
}

#[test]
fn random_explanations_come_from_previous_results() {
    let subject = toy_model(1);
    let explainer = toy_model(2);
    let tok = tokenizer();
    let store = toy_store();
    let dir = tempfile::tempdir().unwrap();

    let first = CounterfactualPipeline::new(toy_config(), &subject, &tok, toy_codec())
        .unwrap()
        .with_explainer(&explainer, &tok)
        .unwrap()
        .run(&store, dir.path().join("explained"))
        .unwrap();
    let pool: Vec<String> = first
        .rows()
        .iter()
        .flat_map(|r| r.explanations.clone().unwrap_or_default())
        .collect();

    let config = PipelineConfig {
        random_explanations: true,
        random_explanations_source: Some(dir.path().join("explained").join("results.json")),
        ..toy_config()
    };
    let control = CounterfactualPipeline::new(config, &subject, &tok, toy_codec())
        .unwrap()
        .run(&store, dir.path().join("control"))
        .unwrap();

    for row in control.rows() {
        let drawn = row.explanations.as_ref().unwrap();
        assert_eq!(drawn.len(), 2);
        assert!(drawn.iter().all(|e| pool.contains(e)));
        assert_eq!(row.explainer_prompts, Some(vec![None, None]));
        assert!(row.neuron_prompter.is_none());
    }
}

// ---------------------------------------------------------------------------
// Intervention engine on the toy model
// ---------------------------------------------------------------------------

#[test]
fn sequential_installs_leave_one_intervention() {
    let model = toy_model(3);
    let engine = InterventionEngine::new(toy_codec(), &model).unwrap();
    let mut hooks = HookSpec::new();
    for layer in [0, 1, 0, 1, 1] {
        engine
            .install(&InterventionSpec::clamp(layer, layer % 2, 1.5), &mut hooks)
            .unwrap();
        assert_eq!(hooks.num_interventions(), 1);
    }
    engine
        .install(
            &InterventionSpec::additive(0, 2.0, vec![1.0; HIDDEN]),
            &mut hooks,
        )
        .unwrap();
    assert_eq!(hooks.num_interventions(), 1);
    assert!(hooks.has_intervention_at(&HookPoint::ResidPost(0)));
    assert!(!hooks.has_intervention_at(&HookPoint::ResidPost(1)));
}

#[test]
fn invalid_layer_is_rejected_without_touching_hooks() {
    let model = toy_model(3);
    let engine = InterventionEngine::new(toy_codec(), &model).unwrap();
    let mut hooks = HookSpec::new();
    engine
        .install(&InterventionSpec::clamp(0, 0, 1.0), &mut hooks)
        .unwrap();
    let err = engine
        .install(&InterventionSpec::clamp(5, 0, 1.0), &mut hooks)
        .unwrap_err();
    assert!(matches!(err, CfError::Configuration(_)));
    assert!(hooks.has_intervention_at(&HookPoint::ResidPost(0)));
}

#[test]
fn steering_logits_are_deterministic_and_respond_to_strength() {
    let model = toy_model(4);
    let tok = tokenizer();
    let engine = InterventionEngine::new(toy_codec(), &model).unwrap();
    let controller =
        GenerationController::new(&model, &tok, GenerationConfig::default()).with_engine(&engine);
    let direction = [0.0_f32, 1.0, 0.0, 0.0];

    let logits = |strength: f32| -> Vec<f32> {
        controller
            .get_logits("the cat sat", LAYER, strength, &direction)
            .unwrap()
            .to_vec1()
            .unwrap()
    };
    assert_eq!(logits(32.0), logits(32.0));
    assert_ne!(logits(32.0), logits(0.0));
}

#[test]
fn clean_condition_is_a_zero_clamp() {
    let model = toy_model(5);
    let tok = tokenizer();
    let engine = InterventionEngine::new(toy_codec(), &model).unwrap();
    let controller = GenerationController::new(
        &model,
        &tok,
        GenerationConfig {
            max_new_tokens: 4,
            temperature: 0.0,
            stop_token: None,
        },
    )
    .with_engine(&engine);
    let mut rng = StdRng::seed_from_u64(22);

    let clean = controller
        .generate_with_intervention("a dog ran", LAYER, 0.0, 0, &mut rng)
        .unwrap();
    assert_eq!(clean.condition, Some(Condition::Clean));

    let hooks = engine
        .hook_spec(&InterventionSpec::clamp(LAYER, 0, 0.0))
        .unwrap();
    let explicit = controller.generate("a dog ran", &hooks, &mut rng).unwrap();
    assert_eq!(clean.generated_tokens, explicit.generated_tokens);
}
