// SPDX-License-Identifier: MIT OR Apache-2.0

//! Train/test partitioning of a feature's activation examples.
//!
//! Train examples are drawn first with `train_type` from all examples;
//! test examples are then drawn with `test_type` from what remains, so the
//! two groups are always disjoint.
//!
//! ## Quantile sampling
//!
//! Examples are sorted by max activation (descending) and cut into
//! `n_quantiles` contiguous bins of near-equal size. Each bin contributes
//! `n / n_quantiles` examples; the remaining `n % n_quantiles` go one each
//! to the highest-activation bins. A bin that runs short is topped up from
//! the leftovers of the other bins.
//!
//! ## Shortfall
//!
//! With [`SamplerPolicy::Truncate`] (the default) a feature with fewer
//! examples than `n_train + n_test` yields all of them, train filled first.
//! [`SamplerPolicy::Strict`] fails with [`CfError::InsufficientData`].

use std::cmp::Ordering;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ActivationExample, ExperimentConfig, FeatureRecord, SampleType};
use crate::error::{CfError, Result};

/// What to do when a feature has fewer examples than requested.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerPolicy {
    /// Sample everything available and log a warning.
    #[default]
    Truncate,
    /// Fail with [`CfError::InsufficientData`].
    Strict,
}

/// Disjoint train and test examples of one feature.
#[derive(Debug, Clone)]
pub struct SampledFeature {
    /// Feature index.
    pub feature_index: usize,
    /// Examples shown to the explainer.
    pub train: Vec<ActivationExample>,
    /// Examples used for scoring completions.
    pub test: Vec<ActivationExample>,
}

impl SampledFeature {
    /// Total number of sampled examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    /// Whether nothing was sampled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.test.is_empty()
    }
}

/// Partition `record`'s examples into train and test groups.
///
/// Deterministic for a given `rng` state.
///
/// # Errors
///
/// Returns [`CfError::InsufficientData`] under [`SamplerPolicy::Strict`]
/// when fewer than `n_examples_train + n_examples_test` examples exist.
pub fn sample<R: Rng + ?Sized>(
    record: &FeatureRecord,
    cfg: &ExperimentConfig,
    policy: SamplerPolicy,
    rng: &mut R,
) -> Result<SampledFeature> {
    let available = record.examples.len();
    let requested = cfg.n_examples_train + cfg.n_examples_test;
    if available < requested {
        match policy {
            SamplerPolicy::Strict => {
                return Err(CfError::InsufficientData {
                    feature: record.feature_index,
                    requested,
                    available,
                });
            }
            SamplerPolicy::Truncate => warn!(
                "feature {}: requested {requested} examples, sampling the {available} available",
                record.feature_index
            ),
        }
    }

    let n_train = cfg.n_examples_train.min(available);
    let n_test = cfg.n_examples_test.min(available - n_train);

    let mut pool: Vec<usize> = (0..available).collect();
    let train_idx = draw(&pool, n_train, cfg.train_type, cfg.n_quantiles, record, rng);
    pool.retain(|i| !train_idx.contains(i));
    let test_idx = draw(&pool, n_test, cfg.test_type, cfg.n_quantiles, record, rng);

    let pick = |idx: &[usize]| -> Vec<ActivationExample> {
        idx.iter()
            .filter_map(|&i| record.examples.get(i).cloned())
            .collect()
    };
    Ok(SampledFeature {
        feature_index: record.feature_index,
        train: pick(&train_idx),
        test: pick(&test_idx),
    })
}

/// `pool` sorted by max activation, highest first; ties keep index order.
fn by_activation(pool: &[usize], record: &FeatureRecord) -> Vec<usize> {
    let key = |i: usize| {
        record
            .examples
            .get(i)
            .map_or(f32::NEG_INFINITY, ActivationExample::max_activation)
    };
    let mut sorted = pool.to_vec();
    sorted.sort_by(|&a, &b| match key(b).total_cmp(&key(a)) {
        Ordering::Equal => a.cmp(&b),
        other => other,
    });
    sorted
}

/// Draw `n` distinct indices from `pool`.
fn draw<R: Rng + ?Sized>(
    pool: &[usize],
    n: usize,
    kind: SampleType,
    n_quantiles: usize,
    record: &FeatureRecord,
    rng: &mut R,
) -> Vec<usize> {
    let n = n.min(pool.len());
    if n == 0 {
        return Vec::new();
    }
    match kind {
        SampleType::Top => {
            let mut top = by_activation(pool, record);
            top.truncate(n);
            top
        }
        SampleType::Random => pool.choose_multiple(rng, n).copied().collect(),
        SampleType::Quantiles => draw_quantiles(&by_activation(pool, record), n, n_quantiles, rng),
    }
}

/// Stratified draw from `sorted` (highest activation first).
fn draw_quantiles<R: Rng + ?Sized>(
    sorted: &[usize],
    n: usize,
    n_quantiles: usize,
    rng: &mut R,
) -> Vec<usize> {
    let q = n_quantiles.clamp(1, sorted.len());

    let mut picked = Vec::with_capacity(n);
    let mut leftovers = Vec::new();
    let mut start = 0;
    for bin in 0..q {
        let bin_len = sorted.len() / q + usize::from(bin < sorted.len() % q);
        let quota = n / q + usize::from(bin < n % q);
        let mut members = sorted
            .get(start..start + bin_len)
            .map(<[usize]>::to_vec)
            .unwrap_or_default();
        start += bin_len;

        members.shuffle(rng);
        let take = quota.min(members.len());
        leftovers.extend(members.drain(take..));
        picked.extend(members);
    }

    if picked.len() < n {
        leftovers.shuffle(rng);
        leftovers.truncate(n - picked.len());
        picked.extend(leftovers);
    }
    picked
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
