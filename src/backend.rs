// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait and model wrapper.
//!
//! [`CfBackend`] is the capability interface a subject or explainer model
//! must provide. [`CfModel`] wraps a backend with device metadata and
//! convenience methods.

use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::error::{CfError, Result};
use crate::hooks::{HookCache, HookSpec};
use crate::interp::steering::Condition;

// ---------------------------------------------------------------------------
// CfBackend trait
// ---------------------------------------------------------------------------

/// Hook-aware forward pass over an indexable stack of layers.
///
/// The caller specifies captures and the (single) intervention via
/// [`HookSpec`]; the backend returns a [`HookCache`] holding the logits and
/// any requested activations. Backends expose their layers by calling
/// [`apply_layer_hooks`](crate::hooks::apply_layer_hooks) with the hidden
/// state leaving each layer, so the engine never needs to know a model's
/// internal module structure.
pub trait CfBackend: Send + Sync {
    /// Number of layers.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Forward pass with optional hook capture and intervention.
    ///
    /// When `hooks` is empty, this must be equivalent to a plain forward
    /// pass.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Model`] on tensor operation failures and
    /// [`CfError::Configuration`] if the intervention does not fit the
    /// input.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;
}

// ---------------------------------------------------------------------------
// CfModel
// ---------------------------------------------------------------------------

/// High-level model wrapper combining a backend with its device.
pub struct CfModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn CfBackend>,
    /// The device this model lives on.
    device: Device,
}

impl CfModel {
    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn CfBackend>, device: Device) -> Self {
        Self { backend, device }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Run a forward pass with the given hook specification.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward(input_ids, hooks)
    }

    /// Run a single-sequence forward pass and return the logits at the
    /// final position.
    ///
    /// # Shapes
    /// - `token_ids`: `seq` token IDs
    /// - returns: `[vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] for an empty sequence and
    /// propagates backend errors.
    pub fn next_token_logits(&self, token_ids: &[u32], hooks: &HookSpec) -> Result<Tensor> {
        let seq_len = token_ids.len();
        if seq_len == 0 {
            return Err(CfError::Configuration(
                "cannot run a forward pass on an empty sequence".into(),
            ));
        }
        let input = Tensor::new(token_ids, &self.device)?.unsqueeze(0)?; // [1, seq_len]
        let cache = self.forward(&input, hooks)?;
        Ok(cache.output().get(0)?.get(seq_len - 1)?)
    }
}

// ---------------------------------------------------------------------------
// Sampling helpers
// ---------------------------------------------------------------------------

/// Sample a token from logits using the given temperature.
///
/// When `temperature <= 0.0`, performs greedy (argmax) decoding. The
/// caller owns the random source so runs are reproducible from one seed.
///
/// # Shapes
/// - `logits`: `[vocab_size]` -- logit scores for each vocabulary token
///
/// # Errors
///
/// Returns [`CfError::Model`] if the logits tensor is empty or
/// cannot be converted to `f32`.
pub fn sample_token<R: Rng + ?Sized>(logits: &Tensor, temperature: f32, rng: &mut R) -> Result<u32> {
    if temperature <= 0.0 {
        argmax(logits)
    } else {
        sample_with_temperature(logits, temperature, rng)
    }
}

/// Greedy (argmax) sampling.
fn argmax(logits: &Tensor) -> Result<u32> {
    let logits_f32 = logits.to_dtype(DType::F32)?;
    let logits_vec: Vec<f32> = logits_f32.flatten_all()?.to_vec1()?;

    let (max_idx, _) = logits_vec
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| CfError::Model(candle_core::Error::Msg("empty logits".into())))?;

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    Ok(max_idx as u32)
}

/// Temperature-scaled softmax sampling.
fn sample_with_temperature<R: Rng + ?Sized>(
    logits: &Tensor,
    temperature: f32,
    rng: &mut R,
) -> Result<u32> {
    let logits_f32 = logits.to_dtype(DType::F32)?;
    let logits_vec: Vec<f32> = logits_f32.flatten_all()?.to_vec1()?;
    if logits_vec.is_empty() {
        return Err(CfError::Model(candle_core::Error::Msg("empty logits".into())));
    }

    let scaled: Vec<f32> = logits_vec.iter().map(|x| x / temperature).collect();

    // Numerically stable softmax.
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rng.r#gen::<f32>() * sum;
    let mut cumsum = 0.0;
    for (idx, &e) in exp_vals.iter().enumerate() {
        cumsum += e;
        if r < cumsum {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            return Ok(idx as u32);
        }
    }

    // Fallback to last token (floating-point rounding edge case).
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    Ok((exp_vals.len() - 1) as u32)
}

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

/// Output of one generation run.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Original prompt text.
    pub prompt: String,
    /// Only the generated portion (prompt prefix stripped).
    pub completion: String,
    /// Condition the completion was generated under, if any.
    pub condition: Option<Condition>,
    /// Token IDs from the prompt.
    pub prompt_tokens: Vec<u32>,
    /// Token IDs that were generated.
    pub generated_tokens: Vec<u32>,
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

    #[test]
    fn greedy_picks_argmax() {
        let logits = Tensor::new(&[0.1_f32, 3.0, -1.0], &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_token(&logits, 0.0, &mut rng).unwrap(), 1);
    }

    #[test]
    fn sampling_is_reproducible_from_seed() {
        let logits = Tensor::new(&[0.5_f32, 0.4, 0.3, 0.2, 0.1], &Device::Cpu).unwrap();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..16)
                .map(|_| sample_token(&logits, 1.0, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(3), draw(3));
    }

    #[test]
    fn peaked_distribution_samples_its_mode() {
        let logits = Tensor::new(&[0.0_f32, 50.0, 0.0], &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..10 {
            assert_eq!(sample_token(&logits, 1.0, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn empty_logits_error() {
        let logits = Tensor::new(&[] as &[f32], &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_token(&logits, 0.0, &mut rng).is_err());
        assert!(sample_token(&logits, 1.0, &mut rng).is_err());
    }
}
