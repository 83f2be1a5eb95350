// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering strengths and control conditions.
//!
//! Clamp values used for scoring are never fixed constants: the
//! intervened condition clamps the feature to `steering_factor ×
//! max_activation` of the example the prompt was cut from, so the dose is
//! calibrated to how strongly the feature fires on that text.

use std::fmt;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Generation condition recorded with every completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// Control condition: the feature is clamped to zero.
    ///
    /// This is not an unmodified forward pass. Clamping to zero removes
    /// the feature's contribution, so the comparison isolates the feature
    /// rather than comparing against the model's natural behaviour.
    Clean,
    /// The feature is clamped to `steering_factor × max_activation`.
    Intervened,
}

impl Condition {
    /// Both conditions, in the order completions are generated.
    pub const ALL: [Self; 2] = [Self::Clean, Self::Intervened];

    /// Label used as the key in result tables.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Intervened => "intervened",
        }
    }

    /// Clamp value for this condition.
    #[must_use]
    pub fn clamp_value(self, steering_factor: f32, max_activation: f32) -> f32 {
        match self {
            Self::Clean => 0.0,
            Self::Intervened => scoring_clamp_value(steering_factor, max_activation),
        }
    }

    /// Condition implied by a clamp value: zero is the clean control.
    #[must_use]
    pub fn from_clamp_value(value: f32) -> Self {
        if value == 0.0 {
            Self::Clean
        } else {
            Self::Intervened
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Clamp value for the intervened condition: `steering_factor × max_activation`.
#[must_use]
pub fn scoring_clamp_value(steering_factor: f32, max_activation: f32) -> f32 {
    steering_factor * max_activation
}

/// A Gaussian random direction rescaled to the L2 norm of `direction`.
///
/// Used as a control: steering along a random residual direction of the
/// same magnitude as the feature's decoder row.
pub fn random_direction_like<R: Rng + ?Sized>(direction: &[f32], rng: &mut R) -> Vec<f32> {
    let target_norm = l2_norm(direction);
    let mut random: Vec<f32> = (0..direction.len())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    let norm = l2_norm(&random);
    if norm > 1e-12 {
        let scale = target_norm / norm;
        for v in &mut random {
            *v *= scale;
        }
    }
    random
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn clean_condition_clamps_to_zero() {
        assert_eq!(Condition::Clean.clamp_value(10.0, 3.5), 0.0);
        assert!((Condition::Intervened.clamp_value(10.0, 3.5) - 35.0).abs() < 1e-6);
    }

    #[test]
    fn condition_from_clamp_value() {
        assert_eq!(Condition::from_clamp_value(0.0), Condition::Clean);
        assert_eq!(Condition::from_clamp_value(-2.0), Condition::Intervened);
        assert_eq!(Condition::Clean.to_string(), "clean");
        assert_eq!(
            serde_json::to_string(&Condition::Intervened).unwrap(),
            "\"intervened\""
        );
    }

    #[test]
    fn random_direction_keeps_norm() {
        let mut rng = StdRng::seed_from_u64(7);
        let dir = vec![3.0_f32, 4.0, 0.0, 0.0];
        let random = random_direction_like(&dir, &mut rng);
        assert_eq!(random.len(), 4);
        assert!((l2_norm(&random) - 5.0).abs() < 1e-4);
        assert_ne!(random, dir);
    }

    #[test]
    fn random_direction_components_are_standard_normal() {
        // Norm sqrt(n) keeps the rescale factor near 1.
        let n = 4096;
        let dir = vec![1.0_f32; n];
        let random = random_direction_like(&dir, &mut StdRng::seed_from_u64(22));
        let mean = random.iter().sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.1, "mean {mean}");
        let within_one = random.iter().filter(|x| x.abs() < 1.0).count() as f32 / n as f32;
        assert!((0.62..0.74).contains(&within_one), "{within_one}");
        assert!(random.iter().any(|&x| x < 0.0));
    }

    #[test]
    fn random_direction_is_seeded() {
        let dir = vec![1.0_f32; 8];
        let a = random_direction_like(&dir, &mut StdRng::seed_from_u64(1));
        let b = random_direction_like(&dir, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
    }
}
