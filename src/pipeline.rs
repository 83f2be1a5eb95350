// SPDX-License-Identifier: MIT OR Apache-2.0

//! The three-pass counterfactual run.
//!
//! 1. **Generation**: for every test example of every feature, sample one
//!    completion with the feature clamped to zero (`clean`) and one with
//!    it clamped to `steering_strength × max_act` (`intervened`).
//! 2. **Explainer probe**: for every train example, steer along the
//!    feature's decoder direction and record the most increased next
//!    tokens.
//! 3. **Explanation**: sample explanations from the explainer model, or
//!    draw them from a random pool in control runs (which skip pass 2).
//!
//! Features are processed one at a time on the caller's thread. The table
//! is checkpointed every [`CHECKPOINT_INTERVAL`](crate::results::CHECKPOINT_INTERVAL)
//! features and at the end of each pass.

use std::path::PathBuf;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::backend::CfModel;
use crate::codec::FeatureCodec;
use crate::config::{PipelineConfig, RunSnapshot};
use crate::error::{CfError, Result};
use crate::explain::{Explainer, InterventionExample, NeuronPrompter, RandomExplanationPool};
use crate::features::sampler;
use crate::features::{FeatureRecord, FeatureStore};
use crate::generation::GenerationController;
use crate::interp::intervention::InterventionEngine;
use crate::interp::steering::{Condition, random_direction_like};
use crate::results::{
    Checkpointer, CompletionRecord, Completions, PromptExample, ResultRow, ResultTable,
    RunDirectory,
};
use crate::tokenizer::CfTokenizer;

/// Prompts selected for one feature.
#[derive(Debug, Clone)]
pub struct FeaturePrompts<'s> {
    /// The feature's record.
    pub record: &'s FeatureRecord,
    /// Prompts from train examples, shown to the explainer.
    pub explainer_examples: Vec<PromptExample>,
    /// Prompts from test examples, completed under both conditions.
    pub scorer_examples: Vec<PromptExample>,
}

/// Where explanations come from.
enum ExplanationSource<'a> {
    Model(Explainer<'a>),
    Pool(Vec<String>),
    File(PathBuf),
    Missing,
}

/// Orchestrates sampling, generation, probing and explanation for a set of
/// features.
pub struct CounterfactualPipeline<'a> {
    config: PipelineConfig,
    subject: &'a CfModel,
    tokenizer: &'a CfTokenizer,
    engine: InterventionEngine,
    explanations: ExplanationSource<'a>,
}

impl<'a> CounterfactualPipeline<'a> {
    /// Pipeline over a subject model and the codec of `config.feat_layer`.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the config is invalid, the
    /// layer does not exist, or the codec does not match the model.
    pub fn new(
        config: PipelineConfig,
        subject: &'a CfModel,
        tokenizer: &'a CfTokenizer,
        codec: Arc<dyn FeatureCodec>,
    ) -> Result<Self> {
        config.validate()?;
        if config.feat_layer >= subject.num_layers() {
            return Err(CfError::Configuration(format!(
                "feat_layer {} out of range (model has {} layers)",
                config.feat_layer,
                subject.num_layers()
            )));
        }
        let engine = InterventionEngine::new(codec, subject)?;
        let explanations = config
            .random_explanations_source
            .clone()
            .map_or(ExplanationSource::Missing, ExplanationSource::File);
        Ok(Self {
            config,
            subject,
            tokenizer,
            engine,
            explanations,
        })
    }

    /// Sample explanations from `model`.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if the explainer tokenizer cannot
    /// encode a newline.
    pub fn with_explainer(mut self, model: &'a CfModel, tokenizer: &'a CfTokenizer) -> Result<Self> {
        self.explanations = ExplanationSource::Model(Explainer::new(
            model,
            tokenizer,
            self.config.explainer_temperature,
            self.config.explainer_max_tokens,
        )?);
        Ok(self)
    }

    /// Use `explanations` as the random-explanation pool.
    #[must_use]
    pub fn with_explanation_pool(mut self, explanations: Vec<String>) -> Self {
        self.explanations = ExplanationSource::Pool(explanations);
        self
    }

    /// The run configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run all passes over the first `n_feats` records of `store`, writing
    /// `config.json` and `results.json` into `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::DestinationExists`] before writing anything if
    /// `output_dir` already holds results, [`CfError::Configuration`] if
    /// no explanation source fits the run mode, and any error raised while
    /// sampling, generating or persisting. The last checkpoint stays on
    /// disk.
    pub fn run(&self, store: &FeatureStore, output_dir: impl Into<PathBuf>) -> Result<ResultTable> {
        self.check_explanation_source()?;
        let run_dir = RunDirectory::create(output_dir)?;
        run_dir.write_snapshot(&RunSnapshot::from_env_args(self.config.clone()))?;
        info!("Run directory: {}", run_dir.path().display());

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let features = self.prepare(store, &mut rng)?;
        let mut table = ResultTable::new();
        let mut ckpt = run_dir.checkpointer();

        self.generation_pass(&features, &mut table, &mut ckpt, &mut rng)?;
        if self.config.random_explanations {
            let pool = match &self.explanations {
                ExplanationSource::Pool(items) => {
                    RandomExplanationPool::from_explanations(items.iter().cloned(), &mut rng)?
                }
                ExplanationSource::File(path) => {
                    RandomExplanationPool::from_results_file(path, &mut rng)?
                }
                ExplanationSource::Model(_) | ExplanationSource::Missing => {
                    return Err(missing_source());
                }
            };
            self.random_explanation_pass(&pool, &mut table, &mut ckpt, &mut rng)?;
        } else {
            let ExplanationSource::Model(explainer) = &self.explanations else {
                return Err(missing_source());
            };
            let evidence = self.probe_pass(&features, &mut table, &mut ckpt, &mut rng)?;
            self.explanation_pass(explainer, &features, evidence, &mut table, &mut ckpt, &mut rng)?;
        }

        info!("Run complete: {} features", table.len());
        Ok(table)
    }

    fn check_explanation_source(&self) -> Result<()> {
        let ok = match &self.explanations {
            ExplanationSource::Model(_) => !self.config.random_explanations,
            ExplanationSource::Pool(_) | ExplanationSource::File(_) => {
                self.config.random_explanations
            }
            ExplanationSource::Missing => false,
        };
        if ok { Ok(()) } else { Err(missing_source()) }
    }

    /// Sample train/test examples of each feature and cut preactivating
    /// prompts from them.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] for a record of another layer,
    /// [`CfError::InsufficientData`] under the strict sampling policy, and
    /// tokenizer errors.
    pub fn prepare<'s>(
        &self,
        store: &'s FeatureStore,
        rng: &mut StdRng,
    ) -> Result<Vec<FeaturePrompts<'s>>> {
        let experiment = self.config.experiment_config();
        let max_gen = self.config.max_generation_length;
        let mut features = Vec::new();
        for record in store.records().iter().take(self.config.n_feats) {
            if record.layer_index != self.config.feat_layer {
                return Err(CfError::Configuration(format!(
                    "feature {} belongs to layer {}, run targets layer {}",
                    record.feature_index, record.layer_index, self.config.feat_layer
                )));
            }
            let sampled = sampler::sample(record, &experiment, self.config.sampler_policy, rng)?;
            let explainer_examples = sampled
                .train
                .iter()
                .map(|e| e.preactivating_prompt(self.tokenizer, max_gen, rng))
                .collect::<Result<Vec<_>>>()?;
            let scorer_examples = sampled
                .test
                .iter()
                .map(|e| e.preactivating_prompt(self.tokenizer, max_gen, rng))
                .collect::<Result<Vec<_>>>()?;
            features.push(FeaturePrompts {
                record,
                explainer_examples,
                scorer_examples,
            });
        }
        info!("Prepared prompts for {} features", features.len());
        Ok(features)
    }

    fn generation_pass(
        &self,
        features: &[FeaturePrompts<'_>],
        table: &mut ResultTable,
        ckpt: &mut Checkpointer,
        rng: &mut StdRng,
    ) -> Result<()> {
        info!("Generating completions for {} features", features.len());
        let controller =
            GenerationController::new(self.subject, self.tokenizer, self.config.subject_generation())
                .with_engine(&self.engine);
        let layer = self.config.feat_layer;

        for (i, feature) in features.iter().enumerate() {
            let feat_idx = feature.record.feature_index;
            let mut completions = Vec::with_capacity(feature.scorer_examples.len());
            for (prompt, max_act) in &feature.scorer_examples {
                let mut by_condition = Completions::default();
                for condition in Condition::ALL {
                    let value = condition.clamp_value(self.config.steering_strength, *max_act);
                    let result =
                        controller.generate_with_intervention(prompt, layer, value, feat_idx, rng)?;
                    match condition {
                        Condition::Clean => by_condition.clean = result.completion,
                        Condition::Intervened => by_condition.intervened = result.completion,
                    }
                }
                completions.push(CompletionRecord {
                    text: prompt.clone(),
                    max_act: *max_act,
                    completions: by_condition,
                });
            }
            table.push(ResultRow::new(
                feat_idx,
                feature.scorer_examples.clone(),
                completions,
            ))?;
            ckpt.record_iteration(table)?;
            info!("[{}/{}] feature {feat_idx}: completions done", i + 1, features.len());
        }
        ckpt.finish_pass(table)
    }

    fn probe_pass(
        &self,
        features: &[FeaturePrompts<'_>],
        table: &mut ResultTable,
        ckpt: &mut Checkpointer,
        rng: &mut StdRng,
    ) -> Result<Vec<Vec<InterventionExample>>> {
        info!("Running explainer probes for {} features", features.len());
        let controller =
            GenerationController::new(self.subject, self.tokenizer, self.config.subject_generation())
                .with_engine(&self.engine);
        let layer = self.config.feat_layer;

        let mut evidence = Vec::with_capacity(features.len());
        for (i, feature) in features.iter().enumerate() {
            let feat_idx = feature.record.feature_index;
            let mut direction = feature
                .record
                .direction_or_codec(self.engine.codec().as_ref())?;
            if self.config.random_resid_direction {
                direction = random_direction_like(&direction, rng);
            }

            let examples = feature
                .explainer_examples
                .iter()
                .map(|(prompt, _)| {
                    InterventionExample::probe(
                        &controller,
                        prompt,
                        layer,
                        self.config.explainer_intervention_strength,
                        &direction,
                        self.config.n_tokens_per_explainer_example,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            debug!("feature {feat_idx}: {} probe examples", examples.len());

            row_mut(table, feat_idx)?.explainer_intervention_examples = Some(examples.clone());
            evidence.push(examples);
            ckpt.record_iteration(table)?;
            info!("[{}/{}] feature {feat_idx}: probes done", i + 1, features.len());
        }
        ckpt.finish_pass(table)?;
        Ok(evidence)
    }

    fn explanation_pass(
        &self,
        explainer: &Explainer<'_>,
        features: &[FeaturePrompts<'_>],
        evidence: Vec<Vec<InterventionExample>>,
        table: &mut ResultTable,
        ckpt: &mut Checkpointer,
        rng: &mut StdRng,
    ) -> Result<()> {
        info!("Generating explanations for {} features", features.len());
        for (i, (feature, examples)) in features.iter().zip(evidence).enumerate() {
            let feat_idx = feature.record.feature_index;
            let prompter = NeuronPrompter::new(examples);
            let explanations = explainer.explain(&prompter, self.config.n_explanations, rng)?;

            let row = row_mut(table, feat_idx)?;
            row.explanations = Some(explanations);
            row.explainer_prompts = Some(
                prompter
                    .intervention_examples
                    .iter()
                    .map(|e| Some(e.prompt.clone()))
                    .collect(),
            );
            row.explainer_examples = Some(
                feature
                    .explainer_examples
                    .iter()
                    .cloned()
                    .map(Some)
                    .collect(),
            );
            row.neuron_prompter = Some(prompter);
            ckpt.record_iteration(table)?;
            info!("[{}/{}] feature {feat_idx}: explanations done", i + 1, features.len());
        }
        ckpt.finish_pass(table)
    }

    fn random_explanation_pass(
        &self,
        pool: &RandomExplanationPool,
        table: &mut ResultTable,
        ckpt: &mut Checkpointer,
        rng: &mut StdRng,
    ) -> Result<()> {
        info!("Drawing random explanations from a pool of {}", pool.len());
        let n = self.config.n_explanations;
        for i in 0..table.len() {
            if let Some(row) = table.rows_mut().get_mut(i) {
                row.explanations = Some(pool.draw(n, rng));
                row.explainer_prompts = Some(vec![None; n]);
                row.explainer_examples = Some(vec![None; n]);
                row.neuron_prompter = None;
            }
            ckpt.record_iteration(table)?;
        }
        ckpt.finish_pass(table)
    }
}

fn row_mut(table: &mut ResultTable, feat_idx: usize) -> Result<&mut ResultRow> {
    table.get_mut(feat_idx).ok_or_else(|| {
        CfError::Configuration(format!("no result row for feature {feat_idx}"))
    })
}

fn missing_source() -> CfError {
    CfError::Configuration(
        "explanations need an explainer model, or a random pool when random_explanations is set"
            .into(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
