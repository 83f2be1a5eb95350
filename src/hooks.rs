// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and intervention.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (what to capture and which intervention to apply), and
//! [`HookCache`] (captured tensors from a forward pass).
//!
//! A [`HookSpec`] is a plain value handed to
//! [`CfBackend::forward`](crate::CfBackend::forward). Nothing is registered
//! on the model itself, so two calls can never see each other's
//! interventions. A spec holds at most one intervention: installing a new
//! one replaces whatever was installed before, on every layer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{CfError, Result};
use crate::interp::intervention::{ClampIntervention, SteeringIntervention};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or an intervention applied.
///
/// Follows the `TransformerLens` naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// ```
/// use candle_counterfactual::HookPoint;
///
/// let hook = HookPoint::ResidPost(5);
/// assert_eq!(hook.to_string(), "blocks.5.hook_resid_post");
///
/// let parsed: HookPoint = "blocks.5.hook_resid_post".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token embedding (`hook_embed`).
    Embed,
    /// Residual stream entering layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Hidden state leaving layer `i` (`blocks.{i}.hook_resid_post`).
    ///
    /// This is where feature interventions act: it corresponds to the
    /// output of the decoder layer that a residual-stream SAE was trained on.
    ResidPost(usize),
    /// Backend-specific hook point not covered by the standard enum.
    Custom(String),
}

impl HookPoint {
    /// Layer index for per-layer hook points.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i) | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

fn parse_hook_string(s: &str) -> HookPoint {
    if s == "hook_embed" {
        return HookPoint::Embed;
    }

    if let Some((layer_str, suffix)) = s.strip_prefix("blocks.").and_then(|r| r.split_once('.'))
    {
        if let Ok(layer) = layer_str.parse::<usize>() {
            match suffix {
                "hook_resid_pre" => return HookPoint::ResidPre(layer),
                "hook_resid_post" => return HookPoint::ResidPost(layer),
                _ => {}
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An intervention applied to the activation at a hook point.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Zero the hidden state (ablation).
    Zero,
    /// Add `strength × direction` at selected token positions.
    Steer(SteeringIntervention),
    /// Force one sparse-feature coefficient to a fixed value through a
    /// feature codec, keeping the codec's reconstruction error.
    Clamp(ClampIntervention),
}

/// Apply a single [`Intervention`] to a tensor.
///
/// # Shapes
/// - `tensor`: `[batch, seq, hidden]` (any shape for `Zero`)
/// - returns: same shape as `tensor`.
///
/// # Errors
///
/// Returns [`CfError::Model`] if a tensor operation fails and
/// [`CfError::Configuration`] if a target position is out of range.
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Zero => Ok(tensor.zeros_like()?),
        Intervention::Steer(steer) => steer.apply(tensor),
        Intervention::Clamp(clamp) => clamp.apply(tensor),
    }
}

/// Run the hooks registered at `hook` on `hidden`: apply the intervention
/// (if it targets this point), then capture (if requested).
///
/// Backends call this at every hook point they expose. Captures therefore
/// see the post-intervention activation.
///
/// # Errors
///
/// Propagates errors from [`apply_intervention`].
pub fn run_hooks(
    hook: &HookPoint,
    hidden: Tensor,
    hooks: &HookSpec,
    cache: &mut HookCache,
) -> Result<Tensor> {
    let hidden = match hooks.intervention_at(hook) {
        Some(intervention) => apply_intervention(&hidden, intervention)?,
        None => hidden,
    };
    if hooks.is_captured(hook) {
        cache.store(hook.clone(), hidden.clone());
    }
    Ok(hidden)
}

/// Convenience wrapper around [`run_hooks`] for the output of layer `layer`.
///
/// # Errors
///
/// Propagates errors from [`apply_intervention`].
pub fn apply_layer_hooks(
    layer: usize,
    hidden: Tensor,
    hooks: &HookSpec,
    cache: &mut HookCache,
) -> Result<Tensor> {
    run_hooks(&HookPoint::ResidPost(layer), hidden, hooks, cache)
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which intervention to apply.
///
/// When empty, the forward pass is a plain forward pass.
///
/// ```
/// use candle_counterfactual::{HookPoint, HookSpec, Intervention};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::ResidPost(1));
/// hooks.install(HookPoint::ResidPost(0), Intervention::Zero);
/// hooks.install(HookPoint::ResidPost(1), Intervention::Zero);
/// assert_eq!(hooks.num_interventions(), 1);
/// assert!(hooks.has_intervention_at(&HookPoint::ResidPost(1)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// The single active intervention slot.
    intervention: Option<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Install an intervention, clearing any intervention previously
    /// installed at any hook point.
    pub fn install<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.intervention = Some((hook.into(), intervention));
        self
    }

    /// Remove the installed intervention, if any.
    pub fn clear_intervention(&mut self) -> &mut Self {
        self.intervention = None;
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Check whether this spec has no captures and no intervention.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.intervention.is_none()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of installed interventions (zero or one).
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        if self.intervention.is_some() { 1 } else { 0 }
    }

    /// The intervention installed at `hook`, if any.
    #[must_use]
    pub fn intervention_at(&self, hook: &HookPoint) -> Option<&Intervention> {
        self.intervention
            .as_ref()
            .filter(|(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Check whether the installed intervention targets `hook`.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.intervention_at(hook).is_some()
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// ```
/// use candle_counterfactual::{HookCache, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let logits = Tensor::zeros((1, 4, 16), DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
/// let hidden = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::ResidPost(0), hidden);
/// assert!(cache.get(&HookPoint::ResidPost(0)).is_some());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| CfError::Configuration(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor after computing the final logits.
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::ResidPost(9), "blocks.9.hook_resid_post"),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "blocks.3.attn.hook_pattern".parse().unwrap();
        assert_eq!(
            hook,
            HookPoint::Custom("blocks.3.attn.hook_pattern".to_string())
        );
        assert_eq!(hook.layer(), None);
        assert_eq!(HookPoint::ResidPost(4).layer(), Some(4));
    }

    #[test]
    fn install_replaces_previous_intervention_on_any_layer() {
        let mut spec = HookSpec::new();
        assert!(spec.is_empty());

        for layer in 0..5 {
            spec.install(HookPoint::ResidPost(layer), Intervention::Zero);
            assert_eq!(spec.num_interventions(), 1);
        }
        assert!(spec.has_intervention_at(&HookPoint::ResidPost(4)));
        for layer in 0..4 {
            assert!(!spec.has_intervention_at(&HookPoint::ResidPost(layer)));
        }

        spec.clear_intervention();
        assert_eq!(spec.num_interventions(), 0);
        assert!(spec.is_empty());
    }

    #[test]
    fn run_hooks_applies_then_captures() {
        let mut spec = HookSpec::new();
        spec.capture(HookPoint::ResidPost(0));
        spec.install(HookPoint::ResidPost(0), Intervention::Zero);

        let hidden = Tensor::ones((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        let out = apply_layer_hooks(0, hidden, &spec, &mut cache).unwrap();

        let sum: f32 = out.sum_all().unwrap().to_scalar().unwrap();
        assert!(sum.abs() < 1e-6);
        let captured = cache.require(&HookPoint::ResidPost(0)).unwrap();
        let captured_sum: f32 = captured.sum_all().unwrap().to_scalar().unwrap();
        assert!(captured_sum.abs() < 1e-6);
        assert!(cache.require(&HookPoint::ResidPost(1)).is_err());
    }

    #[test]
    fn run_hooks_ignores_other_layers() {
        let mut spec = HookSpec::new();
        spec.install(HookPoint::ResidPost(1), Intervention::Zero);

        let hidden = Tensor::ones((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        let out = apply_layer_hooks(0, hidden, &spec, &mut cache).unwrap();
        let sum: f32 = out.sum_all().unwrap().to_scalar().unwrap();
        assert!((sum - 6.0).abs() < 1e-6);
        assert_eq!(cache.num_captures(), 0);
    }
}
