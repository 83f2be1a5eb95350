// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration and the reproducibility snapshot written once per run.
//!
//! [`PipelineConfig::default`] carries the parameters of the reference
//! Gemma 2 9B / Gemma Scope 131k experiment.
//!
//! # Usage
//!
//! ```
//! use candle_counterfactual::PipelineConfig;
//!
//! let config: PipelineConfig =
//!     serde_json::from_str(r#"{"feat_layer": 3, "n_test": 4}"#).unwrap();
//! assert_eq!(config.feat_layer, 3);
//! assert_eq!(config.n_train, 5);
//! assert!(config.validate().is_ok());
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CfError, Result};
use crate::features::ExperimentConfig;
use crate::features::sampler::SamplerPolicy;
use crate::generation::GenerationConfig;

/// Parameters of one counterfactual run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Layer whose hidden state is intervened on.
    pub feat_layer: usize,
    /// Features processed (first `n_feats` records of the store).
    pub n_feats: usize,
    /// Train examples per feature (explainer evidence).
    pub n_train: usize,
    /// Test examples per feature (scorer prompts).
    pub n_test: usize,
    /// Activation quantiles used for stratified sampling.
    pub n_quantiles: usize,
    /// What to do when a feature has too few examples.
    pub sampler_policy: SamplerPolicy,
    /// Tokens sampled per scorer completion.
    pub max_generation_length: usize,
    /// Sampling temperature for subject completions.
    pub subject_temperature: f32,
    /// Intervened clamp value is `steering_strength × max_act`.
    pub steering_strength: f32,
    /// Additive steering strength for the explainer probe.
    pub explainer_intervention_strength: f32,
    /// Most increased tokens kept per explainer prompt.
    pub n_tokens_per_explainer_example: usize,
    /// Explanations sampled per feature.
    pub n_explanations: usize,
    /// Sampling temperature for the explainer.
    pub explainer_temperature: f32,
    /// Token budget of one explanation.
    pub explainer_max_tokens: usize,
    /// Probe with a random direction of the decoder row's norm.
    pub random_resid_direction: bool,
    /// Draw explanations from a pool instead of the explainer model.
    pub random_explanations: bool,
    /// Results file of a previous run feeding the random pool.
    pub random_explanations_source: Option<PathBuf>,
    /// Seed of the run-wide random number generator.
    pub seed: u64,
    /// Subject model identifier, recorded in the snapshot.
    pub subject_name: String,
    /// Explainer model identifier, recorded in the snapshot.
    pub explainer_name: String,
    /// Prefix of the run directory name.
    pub run_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feat_layer: 32,
            n_feats: 300,
            n_train: 5,
            n_test: 20,
            n_quantiles: 5,
            sampler_policy: SamplerPolicy::Truncate,
            max_generation_length: 8,
            subject_temperature: 1.0,
            steering_strength: 10.0,
            explainer_intervention_strength: 32.0,
            n_tokens_per_explainer_example: 5,
            n_explanations: 1,
            explainer_temperature: 0.7,
            explainer_max_tokens: 20,
            random_resid_direction: false,
            random_explanations: false,
            random_explanations_source: None,
            seed: 22,
            subject_name: "google/gemma-2-9b".into(),
            explainer_name: "meta-llama/Meta-Llama-3.1-8B".into(),
            run_prefix: String::new(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Io`] or [`CfError::Serialization`] if the file
    /// cannot be read, and [`CfError::Configuration`] if it fails
    /// [`validate`](Self::validate).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_quantiles", self.n_quantiles),
            ("max_generation_length", self.max_generation_length),
            ("n_explanations", self.n_explanations),
            ("explainer_max_tokens", self.explainer_max_tokens),
            ("n_tokens_per_explainer_example", self.n_tokens_per_explainer_example),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(CfError::Configuration(format!("{name} must be positive")));
        }
        if self.n_train + self.n_test == 0 {
            return Err(CfError::Configuration(
                "n_train + n_test must be positive".into(),
            ));
        }
        let finite = [
            ("subject_temperature", self.subject_temperature),
            ("explainer_temperature", self.explainer_temperature),
            ("steering_strength", self.steering_strength),
            (
                "explainer_intervention_strength",
                self.explainer_intervention_strength,
            ),
        ];
        if let Some((name, _)) = finite.iter().find(|(_, v)| !v.is_finite()) {
            return Err(CfError::Configuration(format!("{name} must be finite")));
        }
        Ok(())
    }

    /// Sampling parameters derived from this run's counts.
    #[must_use]
    pub fn experiment_config(&self) -> ExperimentConfig {
        ExperimentConfig {
            n_quantiles: self.n_quantiles,
            n_examples_train: self.n_train,
            n_examples_test: self.n_test,
            ..ExperimentConfig::default()
        }
    }

    /// Generation parameters for subject completions.
    #[must_use]
    pub const fn subject_generation(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.max_generation_length,
            temperature: self.subject_temperature,
            stop_token: None,
        }
    }

    /// Directory name for this run.
    #[must_use]
    pub fn run_name(&self) -> String {
        let subject = self
            .subject_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.subject_name);
        format!("{}_{subject}", self.run_prefix)
    }
}

/// Parameters plus reproducibility metadata, written to `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// The run's configuration.
    pub config: PipelineConfig,
    /// Command line that started the run.
    pub run_command: String,
    /// Version of this crate.
    pub crate_version: String,
}

impl RunSnapshot {
    /// Snapshot with an explicit command line.
    #[must_use]
    pub fn new(config: PipelineConfig, run_command: impl Into<String>) -> Self {
        Self {
            config,
            run_command: run_command.into(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Snapshot recording the current process's arguments.
    #[must_use]
    pub fn from_env_args(config: PipelineConfig) -> Self {
        let command = std::env::args().collect::<Vec<_>>().join(" ");
        Self::new(config, command)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_run() {
        let c = PipelineConfig::default();
        assert_eq!(c.n_tokens_per_explainer_example, 5);
        assert_eq!(c.explainer_intervention_strength, 32.0);
        assert_eq!((c.n_train, c.n_test, c.n_quantiles), (5, 20, 5));
        assert_eq!(c.max_generation_length, 8);
        assert_eq!(c.steering_strength, 10.0);
        assert_eq!(c.seed, 22);
        assert!(!c.random_resid_direction && !c.random_explanations);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn invalid_values_rejected() {
        let zero_q = PipelineConfig {
            n_quantiles: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(zero_q.validate(), Err(CfError::Configuration(m)) if m.contains("n_quantiles")));

        let nan = PipelineConfig {
            explainer_temperature: f32::NAN,
            ..PipelineConfig::default()
        };
        assert!(nan.validate().is_err());

        let empty = PipelineConfig {
            n_train: 0,
            n_test: 0,
            ..PipelineConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn experiment_config_carries_counts() {
        let c = PipelineConfig {
            n_train: 2,
            n_test: 3,
            n_quantiles: 1,
            ..PipelineConfig::default()
        };
        let e = c.experiment_config();
        assert_eq!(
            (e.n_examples_train, e.n_examples_test, e.n_quantiles),
            (2, 3, 1)
        );
    }

    #[test]
    fn run_name_uses_model_basename() {
        let c = PipelineConfig {
            run_prefix: "generative".into(),
            ..PipelineConfig::default()
        };
        assert_eq!(c.run_name(), "generative_gemma-2-9b");
    }

    #[test]
    fn snapshot_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let snap = RunSnapshot::new(PipelineConfig::default(), "toy --seed 22");
        std::fs::write(&path, serde_json::to_vec(&snap).unwrap()).unwrap();
        let back: RunSnapshot = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.crate_version, env!("CARGO_PKG_VERSION"));
    }
}
