// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feature interventions on a layer's hidden state.
//!
//! ## Intervention Modes
//!
//! - **Additive steering**: add `strength × direction` to the hidden state
//!   at selected positions (default: the last token). No sampling is
//!   involved, so single-pass logit queries stay deterministic.
//! - **Clamping**: run the hidden state through a [`FeatureCodec`], force
//!   one feature coefficient to a fixed value over selected positions
//!   (default: all), and add back the codec's reconstruction error so that
//!   only the targeted coefficient's contribution changes:
//!
//! ```text
//! codes  = encode(h)
//! error  = h - decode(codes)
//! codes[:, positions, feature] = value
//! h'     = decode(codes) + error
//! ```
//!
//! [`InterventionEngine`] validates an [`InterventionSpec`] against the
//! subject model and turns it into a fresh [`HookSpec`] for one call.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::backend::CfModel;
use crate::codec::FeatureCodec;
use crate::error::{CfError, Result};
use crate::hooks::{HookPoint, HookSpec, Intervention};

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Convert logits to a probability distribution (softmax).
fn softmax_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    // PROMOTE: softmax needs f32 for numerical stability
    let logits_f32 = logits.to_dtype(DType::F32)?;
    let probs = candle_nn::ops::softmax_last_dim(&logits_f32)?;
    Ok(probs.flatten_all()?.to_vec1()?)
}

/// Build a `[1, seq, 1]` mask with `1.0` at each of `positions`.
fn position_mask(positions: &[usize], seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0_f32; seq_len];
    for &p in positions {
        if let Some(cell) = data.get_mut(p) {
            *cell = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (1, seq_len, 1), device)?)
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Token positions an intervention acts on.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Positions {
    /// The final position of the sequence.
    #[default]
    Last,
    /// Every position of the sequence.
    All,
    /// Explicit positions.
    At(Vec<usize>),
}

impl Positions {
    /// Resolve to concrete indices for a sequence of length `seq_len`.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the sequence is empty or an
    /// explicit position is out of range.
    pub fn resolve(&self, seq_len: usize) -> Result<Vec<usize>> {
        if seq_len == 0 {
            return Err(CfError::Configuration(
                "cannot intervene on an empty sequence".into(),
            ));
        }
        match self {
            Self::Last => Ok(vec![seq_len - 1]),
            Self::All => Ok((0..seq_len).collect()),
            Self::At(positions) => {
                if let Some(&bad) = positions.iter().find(|&&p| p >= seq_len) {
                    return Err(CfError::Configuration(format!(
                        "position {bad} out of range (sequence length {seq_len})"
                    )));
                }
                Ok(positions.clone())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Hook-level interventions
// ---------------------------------------------------------------------------

/// Additive steering applied at a hook point.
#[derive(Debug, Clone)]
pub struct SteeringIntervention {
    /// Direction vector, shape `[hidden]`.
    pub direction: Tensor,
    /// Multiplier on `direction`.
    pub strength: f32,
    /// Positions to steer.
    pub positions: Positions,
}

impl SteeringIntervention {
    /// Add `strength × direction` at the selected positions.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden]`
    /// - returns: `[batch, seq, hidden]`
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] on a bad position or direction
    /// length, [`CfError::Model`] on tensor failure.
    pub fn apply(&self, hidden: &Tensor) -> Result<Tensor> {
        let (_, seq_len, d_model) = hidden.dims3()?;
        let dir_len = self.direction.dims1()?;
        if dir_len != d_model {
            return Err(CfError::Configuration(format!(
                "steering direction has length {dir_len}, hidden size is {d_model}"
            )));
        }
        let positions = self.positions.resolve(seq_len)?;
        let mask = position_mask(&positions, seq_len, hidden.device())?;
        let delta = mask
            .broadcast_mul(&self.direction.reshape((1, 1, d_model))?)?
            .affine(f64::from(self.strength), 0.0)?
            .to_dtype(hidden.dtype())?;
        Ok(hidden.broadcast_add(&delta)?)
    }
}

/// Codec-based clamping applied at a hook point.
#[derive(Debug, Clone)]
pub struct ClampIntervention {
    /// Codec used to expose the feature coefficient.
    pub codec: Arc<dyn FeatureCodec>,
    /// Feature whose coefficient is forced.
    pub feature_index: usize,
    /// Value the coefficient is forced to.
    pub value: f32,
    /// Positions to clamp.
    pub positions: Positions,
}

impl ClampIntervention {
    /// Force the feature coefficient to `value`, keeping the codec's
    /// reconstruction error.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden]`
    /// - returns: `[batch, seq, hidden]`
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] on a bad position or feature,
    /// [`CfError::Model`] on tensor failure.
    pub fn apply(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden.dims3()?;
        let n_features = self.codec.num_features();
        if self.feature_index >= n_features {
            return Err(CfError::Configuration(format!(
                "feature {} out of range (codec has {n_features} features)",
                self.feature_index
            )));
        }
        let positions = self.positions.resolve(seq_len)?;

        let hidden_f32 = hidden.to_dtype(DType::F32)?;
        let codes = self.codec.encode(&hidden_f32)?;
        let error = (&hidden_f32 - self.codec.decode(&codes)?)?;

        // Only the target column is rewritten: [batch, seq, 1].
        let f = self.feature_index;
        let column = codes.narrow(2, f, 1)?;
        let mask = position_mask(&positions, seq_len, hidden.device())?;
        let new_column = column
            .broadcast_mul(&mask.affine(-1.0, 1.0)?)?
            .broadcast_add(&mask.affine(f64::from(self.value), 0.0)?)?;
        let clamped = codes.slice_assign(&[0..batch, 0..seq_len, f..f + 1], &new_column)?;

        let out = (self.codec.decode(&clamped)? + error)?;
        Ok(out.to_dtype(hidden.dtype())?)
    }
}

// ---------------------------------------------------------------------------
// InterventionSpec
// ---------------------------------------------------------------------------

/// What an intervention does, independent of where it is applied.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum InterventionMode {
    /// Add `strength × direction`.
    Additive {
        /// Multiplier on `direction`.
        strength: f32,
        /// Direction vector of length `hidden_size`.
        direction: Vec<f32>,
    },
    /// Force a feature coefficient through the codec.
    Clamp {
        /// Value the coefficient is forced to.
        value: f32,
        /// Target feature.
        feature_index: usize,
    },
}

/// A short-lived description of one intervention, created per call.
///
/// ```
/// use candle_counterfactual::interp::intervention::{InterventionSpec, Positions};
///
/// let spec = InterventionSpec::clamp(3, 17, 0.0);
/// assert_eq!(spec.layer, 3);
/// assert_eq!(spec.positions, Positions::All);
///
/// let spec = InterventionSpec::additive(3, 8.0, vec![0.0; 4]);
/// assert_eq!(spec.positions, Positions::Last);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct InterventionSpec {
    /// Additive or clamp.
    pub mode: InterventionMode,
    /// Layer whose output hidden state is modified.
    pub layer: usize,
    /// Positions to act on.
    pub positions: Positions,
}

impl InterventionSpec {
    /// Additive steering at the last position.
    pub const fn additive(layer: usize, strength: f32, direction: Vec<f32>) -> Self {
        Self {
            mode: InterventionMode::Additive {
                strength,
                direction,
            },
            layer,
            positions: Positions::Last,
        }
    }

    /// Clamping over all positions.
    pub const fn clamp(layer: usize, feature_index: usize, value: f32) -> Self {
        Self {
            mode: InterventionMode::Clamp {
                value,
                feature_index,
            },
            layer,
            positions: Positions::All,
        }
    }

    /// Override the target positions.
    pub fn at_positions(mut self, positions: Positions) -> Self {
        self.positions = positions;
        self
    }

    /// Validate against model and codec dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the layer, feature, or
    /// direction length is invalid.
    pub fn validate(&self, n_layers: usize, hidden_size: usize, n_features: usize) -> Result<()> {
        if self.layer >= n_layers {
            return Err(CfError::Configuration(format!(
                "layer {} out of range (model has {n_layers} layers)",
                self.layer
            )));
        }
        match &self.mode {
            InterventionMode::Additive { direction, .. } => {
                if direction.len() != hidden_size {
                    return Err(CfError::Configuration(format!(
                        "steering direction has length {}, hidden size is {hidden_size}",
                        direction.len()
                    )));
                }
            }
            InterventionMode::Clamp { feature_index, .. } => {
                if *feature_index >= n_features {
                    return Err(CfError::Configuration(format!(
                        "feature {feature_index} out of range (codec has {n_features} features)"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InterventionEngine
// ---------------------------------------------------------------------------

/// Turns [`InterventionSpec`]s into hook specifications for one subject
/// model and one feature codec.
#[derive(Debug, Clone)]
pub struct InterventionEngine {
    codec: Arc<dyn FeatureCodec>,
    n_layers: usize,
    hidden_size: usize,
    device: Device,
}

impl InterventionEngine {
    /// Create an engine for `model`, checking that the codec matches the
    /// model's hidden size.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] on a hidden-size mismatch.
    pub fn new(codec: Arc<dyn FeatureCodec>, model: &CfModel) -> Result<Self> {
        let hidden_size = model.hidden_size();
        if codec.hidden_size() != hidden_size {
            return Err(CfError::Configuration(format!(
                "codec hidden size {} does not match model hidden size {hidden_size}",
                codec.hidden_size()
            )));
        }
        Ok(Self {
            codec,
            n_layers: model.num_layers(),
            hidden_size,
            device: model.device().clone(),
        })
    }

    /// The codec used for clamping.
    #[must_use]
    pub fn codec(&self) -> &Arc<dyn FeatureCodec> {
        &self.codec
    }

    /// Validate `spec` and install it into `hooks`, clearing any
    /// intervention already present on any layer.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the spec is invalid for this
    /// model, [`CfError::Model`] on tensor failure.
    pub fn install(&self, spec: &InterventionSpec, hooks: &mut HookSpec) -> Result<()> {
        spec.validate(self.n_layers, self.hidden_size, self.codec.num_features())?;
        hooks.clear_intervention();
        let intervention = match &spec.mode {
            InterventionMode::Additive {
                strength,
                direction,
            } => Intervention::Steer(SteeringIntervention {
                direction: Tensor::new(direction.as_slice(), &self.device)?,
                strength: *strength,
                positions: spec.positions.clone(),
            }),
            InterventionMode::Clamp {
                value,
                feature_index,
            } => Intervention::Clamp(ClampIntervention {
                codec: Arc::clone(&self.codec),
                feature_index: *feature_index,
                value: *value,
                positions: spec.positions.clone(),
            }),
        };
        hooks.install(HookPoint::ResidPost(spec.layer), intervention);
        Ok(())
    }

    /// A fresh [`HookSpec`] carrying only `spec`.
    ///
    /// # Errors
    ///
    /// Same as [`install`](Self::install).
    pub fn hook_spec(&self, spec: &InterventionSpec) -> Result<HookSpec> {
        let mut hooks = HookSpec::new();
        self.install(spec, &mut hooks)?;
        Ok(hooks)
    }
}

// ---------------------------------------------------------------------------
// Logit comparison
// ---------------------------------------------------------------------------

/// Next-token logits with and without an intervention.
#[derive(Debug)]
pub struct LogitShift {
    /// Logits from the control pass, shape `[vocab]`.
    pub clean_logits: Tensor,
    /// Logits from the intervened pass, shape `[vocab]`.
    pub intervened_logits: Tensor,
}

impl LogitShift {
    /// Create a new comparison.
    pub const fn new(clean_logits: Tensor, intervened_logits: Tensor) -> Self {
        Self {
            clean_logits,
            intervened_logits,
        }
    }

    /// KL divergence between the clean and intervened distributions.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Model`] if tensor operations fail.
    pub fn kl_divergence(&self) -> Result<f32> {
        kl_divergence(&self.clean_logits, &self.intervened_logits)
    }

    /// The `k` tokens whose probability increased most.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Model`] if tensor operations fail.
    pub fn top_increases(&self, k: usize) -> Result<Vec<(u32, f32)>> {
        top_probability_increases(&self.clean_logits, &self.intervened_logits, k)
    }
}

/// Compute `KL(P || Q)` where `P = softmax(clean)`, `Q = softmax(other)`.
///
/// # Errors
///
/// Returns [`CfError::Model`] if tensor operations fail.
pub fn kl_divergence(clean_logits: &Tensor, other_logits: &Tensor) -> Result<f32> {
    let p = softmax_to_vec(clean_logits)?;
    let q = softmax_to_vec(other_logits)?;

    let kl: f32 = p
        .iter()
        .zip(q.iter())
        .filter(|&(&pi, &qi)| pi > 1e-10 && qi > 1e-10)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum();

    Ok(kl)
}

/// Top-`k` tokens by signed probability increase
/// `softmax(intervened) - softmax(clean)`, largest first.
///
/// # Errors
///
/// Returns [`CfError::Model`] if tensor operations fail.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn top_probability_increases(
    clean_logits: &Tensor,
    intervened_logits: &Tensor,
    k: usize,
) -> Result<Vec<(u32, f32)>> {
    let clean = softmax_to_vec(clean_logits)?;
    let intervened = softmax_to_vec(intervened_logits)?;

    let mut deltas: Vec<(u32, f32)> = clean
        .iter()
        .zip(intervened.iter())
        .enumerate()
        .map(|(idx, (&c, &i))| (idx as u32, i - c))
        .collect();

    deltas.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    deltas.truncate(k);
    Ok(deltas)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::codec::JumpReluSae;

    fn toy_codec() -> Arc<dyn FeatureCodec> {
        let dev = Device::Cpu;
        // Feature 0 reads 0.5 * (x0 + x1), feature 1 reads x2.
        let w_enc = Tensor::from_vec(vec![0.5_f32, 0.0, 0.5, 0.0, 0.0, 1.0], (3, 2), &dev).unwrap();
        let w_dec = Tensor::from_vec(vec![1.0_f32, 1.0, 0.0, 0.0, 0.0, 1.0], (2, 3), &dev).unwrap();
        Arc::new(
            JumpReluSae::new(
                w_enc,
                Tensor::zeros(2, DType::F32, &dev).unwrap(),
                Tensor::zeros(2, DType::F32, &dev).unwrap(),
                w_dec,
                Tensor::new(&[0.1_f32, -0.2, 0.3], &dev).unwrap(),
            )
            .unwrap(),
        )
    }

    fn hidden(values: Vec<f32>, seq: usize) -> Tensor {
        Tensor::from_vec(values, (1, seq, 3), &Device::Cpu).unwrap()
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn positions_resolve() {
        assert_eq!(Positions::Last.resolve(4).unwrap(), vec![3]);
        assert_eq!(Positions::All.resolve(3).unwrap(), vec![0, 1, 2]);
        assert_eq!(Positions::At(vec![1]).resolve(3).unwrap(), vec![1]);
        assert!(Positions::At(vec![3]).resolve(3).is_err());
        assert!(Positions::Last.resolve(0).is_err());
    }

    #[test]
    fn steering_touches_only_target_position() {
        let steer = SteeringIntervention {
            direction: Tensor::new(&[1.0_f32, 0.0, -1.0], &Device::Cpu).unwrap(),
            strength: 2.0,
            positions: Positions::Last,
        };
        let h = hidden(vec![0.0; 6], 2);
        let out = to_vec(&steer.apply(&h).unwrap());
        assert_eq!(out, vec![0.0, 0.0, 0.0, 2.0, 0.0, -2.0]);
    }

    #[test]
    fn steering_rejects_wrong_direction_length() {
        let steer = SteeringIntervention {
            direction: Tensor::new(&[1.0_f32, 0.0], &Device::Cpu).unwrap(),
            strength: 1.0,
            positions: Positions::Last,
        };
        assert!(matches!(
            steer.apply(&hidden(vec![0.0; 3], 1)),
            Err(CfError::Configuration(_))
        ));
    }

    #[test]
    fn clamp_to_natural_coefficient_is_identity() {
        let codec = toy_codec();
        let h = hidden(vec![0.7, 0.3, 1.9], 1);
        let natural = to_vec(&codec.encode(&h).unwrap())[0];

        let clamp = ClampIntervention {
            codec,
            feature_index: 0,
            value: natural,
            positions: Positions::All,
        };
        let out = to_vec(&clamp.apply(&h).unwrap());
        for (a, b) in out.iter().zip(to_vec(&h).iter()) {
            assert!((a - b).abs() < 1e-5, "{a} != {b}");
        }
    }

    #[test]
    fn clamp_moves_along_decoder_row_only() {
        let codec = toy_codec();
        // Position 0: feature 0 code = 0.5 * (1.0 + 1.0) = 1.0.
        let h = hidden(vec![1.0, 1.0, 0.5, 1.0, 1.0, 0.5], 2);
        let clamp = ClampIntervention {
            codec,
            feature_index: 0,
            value: 4.0,
            positions: Positions::At(vec![0]),
        };
        let out = to_vec(&clamp.apply(&h).unwrap());
        // Position 0 moves by (4.0 - 1.0) * W_dec[0] = [3, 3, 0].
        assert!((out[0] - 4.0).abs() < 1e-5);
        assert!((out[1] - 4.0).abs() < 1e-5);
        assert!((out[2] - 0.5).abs() < 1e-5);
        // Position 1 is untouched.
        assert!((out[3] - 1.0).abs() < 1e-5);
        assert!((out[5] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn clamp_to_zero_removes_feature_contribution() {
        let codec = toy_codec();
        let h = hidden(vec![1.0, 1.0, 0.5], 1);
        let clamp = ClampIntervention {
            codec: Arc::clone(&codec),
            feature_index: 0,
            value: 0.0,
            positions: Positions::All,
        };
        let out = clamp.apply(&h).unwrap();
        let codes = to_vec(&codec.encode(&out).unwrap());
        assert!(codes[0].abs() < 1e-5);
    }

    #[test]
    fn engine_clamps_explicit_positions_in_every_batch_row() {
        use crate::hooks::apply_intervention;
        use crate::toy::ToyTransformer;

        let dev = Device::Cpu;
        let model = CfModel::new(
            Box::new(ToyTransformer::new(5, 3, 2, 0, &dev).unwrap()),
            dev.clone(),
        );
        let codec = toy_codec();
        let engine = InterventionEngine::new(Arc::clone(&codec), &model).unwrap();
        let spec = InterventionSpec::clamp(1, 0, 3.0).at_positions(Positions::At(vec![1]));
        let hooks = engine.hook_spec(&spec).unwrap();
        let intervention = hooks.intervention_at(&HookPoint::ResidPost(1)).unwrap();

        // [2, 3, 3]: two rows of three positions.
        let h = Tensor::from_vec(
            (0..18_u8).map(|v| f32::from(v) / 10.0).collect::<Vec<_>>(),
            (2, 3, 3),
            &dev,
        )
        .unwrap();
        let out = apply_intervention(&h, intervention).unwrap();

        let before = codec.encode(&h).unwrap().to_vec3::<f32>().unwrap();
        let after = codec.encode(&out).unwrap().to_vec3::<f32>().unwrap();
        let (h_in, h_out) = (h.to_vec3::<f32>().unwrap(), out.to_vec3::<f32>().unwrap());
        for b in 0..2 {
            assert!((after[b][1][0] - 3.0).abs() < 1e-5);
            assert!((after[b][1][1] - before[b][1][1]).abs() < 1e-5);
            for p in [0, 2] {
                for d in 0..3 {
                    assert!((h_out[b][p][d] - h_in[b][p][d]).abs() < 1e-6);
                }
            }
        }

        let beyond = InterventionSpec::clamp(1, 0, 3.0).at_positions(Positions::At(vec![3]));
        let hooks = engine.hook_spec(&beyond).unwrap();
        let intervention = hooks.intervention_at(&HookPoint::ResidPost(1)).unwrap();
        assert!(matches!(
            apply_intervention(&h, intervention),
            Err(CfError::Configuration(_))
        ));
    }

    #[test]
    fn spec_validation() {
        let spec = InterventionSpec::clamp(2, 1, 0.0);
        assert!(spec.validate(3, 3, 2).is_ok());
        assert!(spec.validate(2, 3, 2).is_err());
        assert!(InterventionSpec::clamp(0, 2, 0.0).validate(3, 3, 2).is_err());
        assert!(
            InterventionSpec::additive(0, 1.0, vec![0.0; 2])
                .validate(3, 3, 2)
                .is_err()
        );
    }

    #[test]
    fn top_increases_sorted_by_signed_delta() {
        let clean = Tensor::new(&[0.0_f32, 0.0, 0.0, 0.0], &Device::Cpu).unwrap();
        let steered = Tensor::new(&[2.0_f32, 0.0, 1.0, -3.0], &Device::Cpu).unwrap();
        let shift = LogitShift::new(clean, steered);
        let top = shift.top_increases(2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, 0);
        assert_eq!(top[1].0, 2);
        assert!(top[0].1 > top[1].1);
        assert!(shift.kl_divergence().unwrap() > 0.0);
    }

    #[test]
    fn kl_of_identical_logits_is_zero() {
        let logits = Tensor::new(&[0.3_f32, 1.2, -0.4], &Device::Cpu).unwrap();
        assert!(kl_divergence(&logits, &logits).unwrap().abs() < 1e-6);
    }
}
