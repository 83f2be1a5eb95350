// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generation controller: single-pass logit queries and autoregressive
//! sampling under an intervention.
//!
//! Every entry point builds a fresh [`HookSpec`] for its own call, so no
//! intervention outlives the call that installed it.

use candle_core::Tensor;
use rand::Rng;
use tracing::debug;

use crate::backend::{CfModel, GenerationResult, sample_token};
use crate::error::{CfError, Result};
use crate::hooks::HookSpec;
use crate::interp::intervention::{InterventionEngine, InterventionSpec};
use crate::interp::steering::Condition;
use crate::tokenizer::CfTokenizer;

/// Sampling parameters for autoregressive generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Fixed token budget.
    pub max_new_tokens: usize,
    /// Softmax temperature; `<= 0` is greedy.
    pub temperature: f32,
    /// Generation stops after this token is sampled (it is not kept).
    pub stop_token: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 8,
            temperature: 1.0,
            stop_token: None,
        }
    }
}

/// Drives a model (optionally with an [`InterventionEngine`]) through
/// logit queries and sampling loops.
pub struct GenerationController<'a> {
    model: &'a CfModel,
    tokenizer: &'a CfTokenizer,
    engine: Option<&'a InterventionEngine>,
    config: GenerationConfig,
}

impl<'a> GenerationController<'a> {
    /// A controller without an intervention engine (plain generation only).
    #[must_use]
    pub const fn new(
        model: &'a CfModel,
        tokenizer: &'a CfTokenizer,
        config: GenerationConfig,
    ) -> Self {
        Self {
            model,
            tokenizer,
            engine: None,
            config,
        }
    }

    /// Attach the engine used by [`get_logits`](Self::get_logits) and
    /// [`generate_with_intervention`](Self::generate_with_intervention).
    #[must_use]
    pub const fn with_engine(mut self, engine: &'a InterventionEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// The sampling parameters.
    #[must_use]
    pub const fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// The tokenizer used for prompts and completions.
    #[must_use]
    pub const fn tokenizer(&self) -> &CfTokenizer {
        self.tokenizer
    }

    fn engine(&self) -> Result<&InterventionEngine> {
        self.engine.ok_or_else(|| {
            CfError::Configuration("generation controller has no intervention engine".into())
        })
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Vec<u32>> {
        let ids = self.tokenizer.encode(prompt)?;
        if ids.is_empty() {
            return Err(CfError::Configuration(format!(
                "prompt {prompt:?} encodes to no tokens"
            )));
        }
        Ok(ids)
    }

    /// Next-token logits for `prompt` with `strength × direction` added to
    /// the output of `layer` at the last position.
    ///
    /// No sampling is involved: identical inputs give identical logits.
    ///
    /// # Shapes
    /// - `direction`: `[hidden_size]`
    /// - returns: `[vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] for an invalid layer or direction
    /// and propagates model/tokenizer errors.
    pub fn get_logits(
        &self,
        prompt: &str,
        layer: usize,
        strength: f32,
        direction: &[f32],
    ) -> Result<Tensor> {
        let spec = InterventionSpec::additive(layer, strength, direction.to_vec());
        let hooks = self.engine()?.hook_spec(&spec)?;
        let ids = self.encode_prompt(prompt)?;
        self.model.next_token_logits(&ids, &hooks)
    }

    /// Sample one continuation of `prompt` with `feature_index` clamped to
    /// `clamp_value` at every position of `layer`'s output.
    ///
    /// `clamp_value == 0.0` is the clean control condition: the feature is
    /// forced to zero, not left alone.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] for an invalid layer or feature
    /// and propagates model/tokenizer errors.
    pub fn generate_with_intervention<R: Rng + ?Sized>(
        &self,
        prompt: &str,
        layer: usize,
        clamp_value: f32,
        feature_index: usize,
        rng: &mut R,
    ) -> Result<GenerationResult> {
        let spec = InterventionSpec::clamp(layer, feature_index, clamp_value);
        let hooks = self.engine()?.hook_spec(&spec)?;
        let mut result = self.generate(prompt, &hooks, rng)?;
        result.condition = Some(Condition::from_clamp_value(clamp_value));
        debug!(
            "feature {feature_index} clamp={clamp_value:.3}: {:?} -> {:?}",
            result.prompt, result.completion
        );
        Ok(result)
    }

    /// Sample one continuation of `prompt` without any intervention.
    ///
    /// # Errors
    ///
    /// Propagates model/tokenizer errors.
    pub fn generate_plain<R: Rng + ?Sized>(
        &self,
        prompt: &str,
        rng: &mut R,
    ) -> Result<GenerationResult> {
        self.generate(prompt, &HookSpec::new(), rng)
    }

    /// Autoregressive sampling loop under `hooks`.
    ///
    /// Each step re-runs the full sequence, so an intervention over all
    /// positions also covers every generated token. Stops at the token
    /// budget, the configured stop token, or the tokenizer's EOS.
    ///
    /// # Errors
    ///
    /// Propagates model/tokenizer errors.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        prompt: &str,
        hooks: &HookSpec,
        rng: &mut R,
    ) -> Result<GenerationResult> {
        let prompt_tokens = self.encode_prompt(prompt)?;
        let eos = self.tokenizer.eos_token_id();

        let mut ids = prompt_tokens.clone();
        let mut generated_tokens = Vec::with_capacity(self.config.max_new_tokens);
        for _ in 0..self.config.max_new_tokens {
            let logits = self.model.next_token_logits(&ids, hooks)?;
            let token = sample_token(&logits, self.config.temperature, rng)?;
            if Some(token) == self.config.stop_token || Some(token) == eos {
                break;
            }
            generated_tokens.push(token);
            ids.push(token);
        }

        let completion = self.tokenizer.decode(&generated_tokens)?;
        Ok(GenerationResult {
            prompt: prompt.to_string(),
            completion,
            condition: None,
            prompt_tokens,
            generated_tokens,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::codec::{FeatureCodec, JumpReluSae};
    use crate::tokenizer::WordVocab;
    use crate::toy::ToyTransformer;

    const WORDS: [&str; 8] = ["<bos>", "red", "green", "blue", "cat", "dog", "runs", "sleeps"];

    fn fixtures() -> (CfModel, CfTokenizer, InterventionEngine) {
        let dev = Device::Cpu;
        let model = CfModel::new(
            Box::new(ToyTransformer::new(WORDS.len(), 4, 2, 5, &dev).unwrap()),
            dev.clone(),
        );
        let tokenizer = CfTokenizer::Word(WordVocab::new(WORDS).with_bos("<bos>").unwrap());
        let w = Tensor::eye(4, DType::F32, &dev).unwrap();
        let codec: Arc<dyn FeatureCodec> = Arc::new(
            JumpReluSae::new(
                w.clone(),
                Tensor::zeros(4, DType::F32, &dev).unwrap(),
                Tensor::zeros(4, DType::F32, &dev).unwrap(),
                w,
                Tensor::zeros(4, DType::F32, &dev).unwrap(),
            )
            .unwrap(),
        );
        let engine = InterventionEngine::new(codec, &model).unwrap();
        (model, tokenizer, engine)
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.to_vec1().unwrap()
    }

    #[test]
    fn logit_queries_are_deterministic() {
        let (model, tokenizer, engine) = fixtures();
        let ctl = GenerationController::new(&model, &tokenizer, GenerationConfig::default())
            .with_engine(&engine);
        let dir = [0.5_f32, -0.5, 1.0, 0.0];
        let a = to_vec(&ctl.get_logits("red cat", 1, 4.0, &dir).unwrap());
        let b = to_vec(&ctl.get_logits("red cat", 1, 4.0, &dir).unwrap());
        assert_eq!(a.len(), WORDS.len());
        assert_eq!(a, b);

        let clean = to_vec(&ctl.get_logits("red cat", 1, 0.0, &dir).unwrap());
        assert_ne!(a, clean);
    }

    #[test]
    fn invalid_layer_is_configuration_error() {
        let (model, tokenizer, engine) = fixtures();
        let ctl = GenerationController::new(&model, &tokenizer, GenerationConfig::default())
            .with_engine(&engine);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            ctl.get_logits("red", 2, 1.0, &[0.0; 4]),
            Err(CfError::Configuration(_))
        ));
        assert!(matches!(
            ctl.generate_with_intervention("red", 7, 0.0, 0, &mut rng),
            Err(CfError::Configuration(_))
        ));
    }

    #[test]
    fn missing_engine_is_configuration_error() {
        let (model, tokenizer, _) = fixtures();
        let ctl = GenerationController::new(&model, &tokenizer, GenerationConfig::default());
        assert!(matches!(
            ctl.get_logits("red", 0, 1.0, &[0.0; 4]),
            Err(CfError::Configuration(_))
        ));
    }

    #[test]
    fn generation_respects_budget_and_strips_prompt() {
        let (model, tokenizer, engine) = fixtures();
        let config = GenerationConfig {
            max_new_tokens: 3,
            temperature: 1.0,
            stop_token: None,
        };
        let ctl = GenerationController::new(&model, &tokenizer, config).with_engine(&engine);
        let mut rng = StdRng::seed_from_u64(42);
        let result = ctl
            .generate_with_intervention("blue dog", 0, 0.0, 2, &mut rng)
            .unwrap();
        assert_eq!(result.condition, Some(Condition::Clean));
        assert_eq!(result.prompt_tokens.len(), 3);
        assert!(result.generated_tokens.len() <= 3);
        assert_eq!(
            result.completion,
            tokenizer.decode(&result.generated_tokens).unwrap()
        );
        assert!(!result.completion.starts_with("blue dog"));
    }

    #[test]
    fn generation_is_reproducible_from_seed() {
        let (model, tokenizer, engine) = fixtures();
        let ctl = GenerationController::new(&model, &tokenizer, GenerationConfig::default())
            .with_engine(&engine);
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            ctl.generate_with_intervention("red cat", 1, 3.0, 1, &mut rng)
                .unwrap()
                .generated_tokens
        };
        assert_eq!(run(8), run(8));
    }

    #[test]
    fn greedy_stop_token_is_not_kept() {
        let (model, tokenizer, _) = fixtures();
        let probe = GenerationController::new(
            &model,
            &tokenizer,
            GenerationConfig {
                max_new_tokens: 1,
                temperature: 0.0,
                stop_token: None,
            },
        );
        let mut rng = StdRng::seed_from_u64(0);
        let first = probe.generate_plain("green", &mut rng).unwrap().generated_tokens[0];

        let stopping = GenerationController::new(
            &model,
            &tokenizer,
            GenerationConfig {
                max_new_tokens: 5,
                temperature: 0.0,
                stop_token: Some(first),
            },
        );
        let result = stopping.generate_plain("green", &mut rng).unwrap();
        assert!(result.generated_tokens.is_empty());
        assert!(result.completion.is_empty());
    }
}
