// SPDX-License-Identifier: MIT OR Apache-2.0

//! Explanation generation.
//!
//! The explainer probe pass steers the subject model along a feature's
//! decoder direction and records which next tokens gain the most
//! probability ([`InterventionExample`]). A [`NeuronPrompter`] formats that
//! evidence; [`explainer_prompt`] wraps it in a fixed few-shot template, and
//! an [`Explainer`] samples short explanations from a second model.
//!
//! [`RandomExplanationPool`] replaces the explainer in null-hypothesis
//! control runs.

use std::fmt::Write as _;
use std::path::Path;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::CfModel;
use crate::error::{CfError, Result};
use crate::generation::{GenerationConfig, GenerationController};
use crate::interp::intervention::top_probability_increases;
use crate::results::ResultTable;
use crate::tokenizer::CfTokenizer;

/// Instruction placed before the few-shot examples.
pub const EXPLAINER_INSTRUCTION: &str = "We're studying neurons in a neural network. \
Each neuron has been amplified while the model reads a prompt. \
Look at the tokens whose probability increased the most and summarize in a \
short phrase what the neuron promotes.";

/// Escape control characters so a token prints on one line.
fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

/// One prompt block: the prompt and its most increased tokens.
fn format_block<'t>(out: &mut String, prompt: &str, increases: impl Iterator<Item = (&'t str, f32)>) {
    let _ = writeln!(out, "<PROMPT>{prompt}</PROMPT>");
    out.push_str("Most increased tokens:");
    for (i, (token, delta)) in increases.enumerate() {
        let sep = if i == 0 { " " } else { ", " };
        let _ = write!(out, "{sep}'{}' ({delta:+.3})", format_token(token));
    }
    out.push('\n');
}

// ---------------------------------------------------------------------------
// InterventionExample / NeuronPrompter
// ---------------------------------------------------------------------------

/// Effect of steering along a feature direction on one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionExample {
    /// Prompt the subject model read.
    pub prompt: String,
    /// Decoded tokens whose probability increased most.
    pub top_tokens: Vec<String>,
    /// Probability deltas of `top_tokens`, largest first.
    pub top_p_increases: Vec<f32>,
}

impl InterventionExample {
    /// Compare next-token distributions with and without steering by
    /// `strength × direction` at `layer`, keeping the `k` tokens whose
    /// probability increased most.
    ///
    /// # Errors
    ///
    /// Propagates errors from the controller and tokenizer.
    pub fn probe(
        controller: &GenerationController<'_>,
        prompt: &str,
        layer: usize,
        strength: f32,
        direction: &[f32],
        k: usize,
    ) -> Result<Self> {
        let clean = controller.get_logits(prompt, layer, 0.0, direction)?;
        let steered = controller.get_logits(prompt, layer, strength, direction)?;
        let increases = top_probability_increases(&clean, &steered, k)?;

        let mut top_tokens = Vec::with_capacity(increases.len());
        let mut top_p_increases = Vec::with_capacity(increases.len());
        for (id, delta) in increases {
            top_tokens.push(controller.tokenizer().decode(&[id])?);
            top_p_increases.push(delta);
        }
        Ok(Self {
            prompt: prompt.to_string(),
            top_tokens,
            top_p_increases,
        })
    }
}

/// Formats the intervention evidence of one feature for the explainer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeuronPrompter {
    /// One entry per explainer prompt.
    pub intervention_examples: Vec<InterventionExample>,
}

impl NeuronPrompter {
    /// Wrap intervention examples.
    #[must_use]
    pub const fn new(intervention_examples: Vec<InterventionExample>) -> Self {
        Self {
            intervention_examples,
        }
    }

    /// Text block listing every example.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = String::new();
        for example in &self.intervention_examples {
            format_block(
                &mut out,
                &example.prompt,
                example
                    .top_tokens
                    .iter()
                    .map(String::as_str)
                    .zip(example.top_p_increases.iter().copied()),
            );
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Few-shot template
// ---------------------------------------------------------------------------

/// A hand-written prompt with its most increased tokens.
#[derive(Debug, Clone, Copy)]
pub struct FewShotPrompt {
    /// Prompt text.
    pub prompt: &'static str,
    /// `(token, probability increase)` pairs.
    pub top_tokens: &'static [(&'static str, f32)],
}

/// A worked example shown to the explainer before the target feature.
#[derive(Debug, Clone, Copy)]
pub struct FewShotExample {
    /// Evidence blocks.
    pub prompts: &'static [FewShotPrompt],
    /// The reference explanation.
    pub explanation: &'static str,
}

/// Few-shot examples placed before the target feature.
pub const FEW_SHOT_EXAMPLES: &[FewShotExample] = &[
    FewShotExample {
        prompts: &[
            FewShotPrompt {
                prompt: "The weather today is",
                top_tokens: &[(" rainy", 0.412), (" stormy", 0.187), (" wet", 0.061)],
            },
            FewShotPrompt {
                prompt: "She grabbed her umbrella because",
                top_tokens: &[(" rain", 0.534), (" drizzle", 0.095), (" showers", 0.044)],
            },
        ],
        explanation: "rain and wet weather",
    },
    FewShotExample {
        prompts: &[
            FewShotPrompt {
                prompt: "def parse(self, data):\n   ",
                top_tokens: &[(" return", 0.288), (" raise", 0.152), (" yield", 0.071)],
            },
            FewShotPrompt {
                prompt: "if x is None:\n   ",
                top_tokens: &[(" return", 0.367), (" raise", 0.203), (" continue", 0.048)],
            },
        ],
        explanation: "Python control-flow keywords at the start of a statement",
    },
    FewShotExample {
        prompts: &[
            FewShotPrompt {
                prompt: "The treaty was signed in",
                top_tokens: &[(" Paris", 0.301), (" Versailles", 0.244), (" France", 0.090)],
            },
            FewShotPrompt {
                prompt: "We spent our honeymoon in",
                top_tokens: &[(" Paris", 0.466), (" Nice", 0.058), (" Lyon", 0.031)],
            },
        ],
        explanation: "French places, especially Paris",
    },
];

/// Full explainer prompt: instruction, few-shot examples, then the target
/// feature's block ending in `Explanation:`.
#[must_use]
pub fn explainer_prompt(prompter: &NeuronPrompter, few_shot: &[FewShotExample]) -> String {
    let mut out = String::from(EXPLAINER_INSTRUCTION);
    out.push_str("\n\n");
    for example in few_shot {
        for p in example.prompts {
            format_block(&mut out, p.prompt, p.top_tokens.iter().copied());
        }
        let _ = write!(out, "Explanation: {}\n\n", example.explanation);
    }
    out.push_str(&prompter.format());
    out.push_str("Explanation:");
    out
}

// ---------------------------------------------------------------------------
// Explainer
// ---------------------------------------------------------------------------

/// Samples explanations from an explainer model.
pub struct Explainer<'a> {
    controller: GenerationController<'a>,
}

impl<'a> Explainer<'a> {
    /// Sample with `temperature`, up to `max_new_tokens` tokens, stopping at
    /// the tokenizer's newline token.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if the tokenizer cannot encode a
    /// newline.
    pub fn new(
        model: &'a CfModel,
        tokenizer: &'a CfTokenizer,
        temperature: f32,
        max_new_tokens: usize,
    ) -> Result<Self> {
        let config = GenerationConfig {
            max_new_tokens,
            temperature,
            stop_token: Some(tokenizer.stop_token("\n")?),
        };
        Ok(Self {
            controller: GenerationController::new(model, tokenizer, config),
        })
    }

    /// Sample `n` explanations for one feature, each cut at its first
    /// newline and trimmed.
    ///
    /// # Errors
    ///
    /// Propagates model and tokenizer errors.
    pub fn explain<R: Rng + ?Sized>(
        &self,
        prompter: &NeuronPrompter,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<String>> {
        let prompt = explainer_prompt(prompter, FEW_SHOT_EXAMPLES);
        let mut explanations = Vec::with_capacity(n);
        for _ in 0..n {
            let sample = self.controller.generate_plain(&prompt, rng)?;
            let text = sample
                .completion
                .split('\n')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            debug!("explanation: {text:?}");
            explanations.push(text);
        }
        Ok(explanations)
    }
}

// ---------------------------------------------------------------------------
// RandomExplanationPool
// ---------------------------------------------------------------------------

/// Previously generated explanations, drawn at random as a baseline.
#[derive(Debug, Clone)]
pub struct RandomExplanationPool {
    explanations: Vec<String>,
}

impl RandomExplanationPool {
    /// Build a pool, shuffling it once.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the pool is empty.
    pub fn from_explanations<I, R>(explanations: I, rng: &mut R) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
        R: Rng + ?Sized,
    {
        let mut explanations: Vec<String> = explanations.into_iter().collect();
        if explanations.is_empty() {
            return Err(CfError::Configuration(
                "random explanation pool is empty".into(),
            ));
        }
        explanations.shuffle(rng);
        Ok(Self { explanations })
    }

    /// Pool every explanation of every row of a previous results file.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Io`] or [`CfError::Serialization`] if the file
    /// cannot be read, [`CfError::Configuration`] if it holds no
    /// explanations.
    pub fn from_results_file<R: Rng + ?Sized>(path: impl AsRef<Path>, rng: &mut R) -> Result<Self> {
        let table = ResultTable::from_json_file(path)?;
        let explanations = table
            .rows()
            .iter()
            .filter_map(|row| row.explanations.as_ref())
            .flatten()
            .cloned();
        Self::from_explanations(explanations, rng)
    }

    /// `k` explanations drawn uniformly with replacement.
    pub fn draw<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Vec<String> {
        (0..k)
            .filter_map(|_| self.explanations.choose(rng).cloned())
            .collect()
    }

    /// Pool size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.explanations.len()
    }

    /// Whether the pool is empty (never true for a constructed pool).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.explanations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn prompter() -> NeuronPrompter {
        NeuronPrompter::new(vec![InterventionExample {
            prompt: "the cat".into(),
            top_tokens: vec![" sat".into(), "\n".into()],
            top_p_increases: vec![0.25, 0.125],
        }])
    }

    #[test]
    fn prompter_lists_tokens_with_deltas() {
        let text = prompter().format();
        assert_eq!(
            text,
            "<PROMPT>the cat</PROMPT>\nMost increased tokens: ' sat' (+0.250), '\\n' (+0.125)\n"
        );
    }

    #[test]
    fn negative_deltas_keep_a_single_sign() {
        let prompter = NeuronPrompter::new(vec![InterventionExample {
            prompt: "a".into(),
            top_tokens: vec!["b".into(), "c".into()],
            top_p_increases: vec![0.5, -0.004],
        }]);
        let text = prompter.format();
        assert!(text.ends_with("'b' (+0.500), 'c' (-0.004)\n"), "{text}");
        assert!(!text.contains("+-"));
    }

    #[test]
    fn prompt_ends_with_target_block() {
        let prompt = explainer_prompt(&prompter(), FEW_SHOT_EXAMPLES);
        assert!(prompt.starts_with(EXPLAINER_INSTRUCTION));
        assert!(prompt.ends_with("(+0.125)\nExplanation:"));
        assert_eq!(
            prompt.matches("Explanation:").count(),
            FEW_SHOT_EXAMPLES.len() + 1
        );
        assert!(prompt.contains("Explanation: rain and wet weather\n\n"));
    }

    #[test]
    fn pool_draws_with_replacement() {
        let mut rng = StdRng::seed_from_u64(22);
        let pool =
            RandomExplanationPool::from_explanations(vec!["only".to_string()], &mut rng).unwrap();
        assert_eq!(pool.draw(3, &mut rng), vec!["only"; 3]);
        assert!(pool.draw(0, &mut rng).is_empty());
    }

    #[test]
    fn pool_shuffle_is_seeded() {
        let items: Vec<String> = (0..20).map(|i| format!("e{i}")).collect();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let pool = RandomExplanationPool::from_explanations(items.clone(), &mut rng).unwrap();
            pool.draw(5, &mut rng)
        };
        assert_eq!(draw(1), draw(1));
    }

    #[test]
    fn empty_pool_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            RandomExplanationPool::from_explanations(Vec::new(), &mut rng),
            Err(CfError::Configuration(_))
        ));
    }
}
