// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feature record store: per-feature activation examples.
//!
//! A [`FeatureStore`] is built once per run, either from serialized record
//! shards or from a tokenized corpus plus sparse activation locations, and
//! is read-only afterwards. [`sampler`] partitions a record's examples into
//! train and test groups.

pub mod sampler;

use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::FeatureCodec;
use crate::error::{CfError, Result};
use crate::tokenizer::CfTokenizer;

// ---------------------------------------------------------------------------
// ActivationExample
// ---------------------------------------------------------------------------

/// One context window with a per-token activation trace for a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationExample {
    tokens: Vec<u32>,
    activations: Vec<f32>,
}

impl ActivationExample {
    /// Pair a token window with its activation trace.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the two sequences differ in
    /// length.
    pub fn new(tokens: Vec<u32>, activations: Vec<f32>) -> Result<Self> {
        let example = Self {
            tokens,
            activations,
        };
        example.validate()?;
        Ok(example)
    }

    fn validate(&self) -> Result<()> {
        if self.tokens.len() != self.activations.len() {
            return Err(CfError::Configuration(format!(
                "example has {} tokens but {} activations",
                self.tokens.len(),
                self.activations.len()
            )));
        }
        Ok(())
    }

    /// Token IDs of the window.
    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Activation of the feature at each token.
    #[must_use]
    pub fn activations(&self) -> &[f32] {
        &self.activations
    }

    /// Window length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Largest activation in the window (`0.0` for an empty window).
    #[must_use]
    pub fn max_activation(&self) -> f32 {
        self.activations
            .iter()
            .copied()
            .reduce(f32::max)
            .unwrap_or(0.0)
    }

    /// Index of the first strictly positive activation.
    #[must_use]
    pub fn first_activation_index(&self) -> Option<usize> {
        self.activations.iter().position(|&a| a > 0.0)
    }

    fn argmax_index(&self) -> usize {
        self.activations
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map_or(0, |(i, _)| i)
    }

    /// Length of a prompt prefix that ends shortly before the feature first
    /// fires.
    ///
    /// With `first` the first active position, the prefix length is drawn
    /// uniformly from `[max(0, first - 1 - max_generation_length / 2),
    /// first - 1]`, so that a completion of `max_generation_length` tokens
    /// has a chance to reach the activating context. A window whose first
    /// token already fires gives an empty prefix; a window that never fires
    /// falls back to its largest activation.
    pub fn preactivating_prefix_len<R: Rng + ?Sized>(
        &self,
        max_generation_length: usize,
        rng: &mut R,
    ) -> usize {
        let first = self
            .first_activation_index()
            .unwrap_or_else(|| self.argmax_index());
        if first == 0 {
            return 0;
        }
        let hi = first - 1;
        let lo = hi.saturating_sub(max_generation_length / 2);
        rng.gen_range(lo..=hi)
    }

    /// Decoded preactivating prefix paired with this example's max
    /// activation.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if decoding fails.
    pub fn preactivating_prompt<R: Rng + ?Sized>(
        &self,
        tokenizer: &CfTokenizer,
        max_generation_length: usize,
        rng: &mut R,
    ) -> Result<(String, f32)> {
        let len = self.preactivating_prefix_len(max_generation_length, rng);
        let prefix = self.tokens.get(..len).unwrap_or(&self.tokens);
        Ok((tokenizer.decode(prefix)?, self.max_activation()))
    }
}

// ---------------------------------------------------------------------------
// FeatureRecord
// ---------------------------------------------------------------------------

/// All activation examples of one feature at one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Feature index within the codec.
    pub feature_index: usize,
    /// Layer whose hidden state the codec reads.
    pub layer_index: usize,
    /// Decoder row of the feature; filled from the codec when empty.
    #[serde(default)]
    pub decoder_direction: Vec<f32>,
    /// Activation examples.
    pub examples: Vec<ActivationExample>,
}

impl FeatureRecord {
    /// A record without a decoder direction.
    #[must_use]
    pub const fn new(
        feature_index: usize,
        layer_index: usize,
        examples: Vec<ActivationExample>,
    ) -> Self {
        Self {
            feature_index,
            layer_index,
            decoder_direction: Vec::new(),
            examples,
        }
    }

    /// Largest activation over all examples.
    #[must_use]
    pub fn max_activation(&self) -> f32 {
        self.examples
            .iter()
            .map(ActivationExample::max_activation)
            .reduce(f32::max)
            .unwrap_or(0.0)
    }

    /// The stored decoder direction, or the codec's decoder row when none
    /// is stored.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the feature is outside the
    /// codec and [`CfError::Model`] on tensor failure.
    pub fn direction_or_codec(&self, codec: &dyn FeatureCodec) -> Result<Vec<f32>> {
        if !self.decoder_direction.is_empty() {
            return Ok(self.decoder_direction.clone());
        }
        Ok(codec
            .decoder_direction(self.feature_index)?
            .to_dtype(candle_core::DType::F32)?
            .to_vec1()?)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How examples are drawn from a record.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    /// Stratified over activation-magnitude quantiles.
    #[default]
    Quantiles,
    /// Highest max activation first.
    Top,
    /// Uniform without replacement.
    Random,
}

/// Shape and size bounds of the feature dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Codec width; every feature index must be below it.
    pub width: usize,
    /// Number of record shards on disk.
    pub n_splits: usize,
    /// Examples kept per feature.
    pub max_examples: usize,
    /// Features with fewer examples are skipped.
    pub min_examples: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            width: 131_072,
            n_splits: 5,
            max_examples: 100_000,
            min_examples: 200,
        }
    }
}

/// Per-feature sampling parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Random (non-activating) contexts per feature.
    pub n_random: usize,
    /// Context window length in tokens.
    pub example_ctx_len: usize,
    /// Activation quantiles used for stratified sampling.
    pub n_quantiles: usize,
    /// Test examples per feature.
    pub n_examples_test: usize,
    /// Train examples per feature.
    pub n_examples_train: usize,
    /// Sampling scheme for train examples.
    pub train_type: SampleType,
    /// Sampling scheme for test examples.
    pub test_type: SampleType,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            n_random: 0,
            example_ctx_len: 64,
            n_quantiles: 5,
            n_examples_test: 20,
            n_examples_train: 5,
            train_type: SampleType::Quantiles,
            test_type: SampleType::Quantiles,
        }
    }
}

// ---------------------------------------------------------------------------
// FeatureStore
// ---------------------------------------------------------------------------

/// One nonzero feature activation in a tokenized corpus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationLocation {
    /// Corpus sequence index.
    pub sequence: usize,
    /// Token position within the sequence.
    pub position: usize,
    /// Feature index.
    pub feature: usize,
    /// Activation value.
    pub activation: f32,
}

/// Read-only collection of feature records for one run.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    cfg: FeatureConfig,
    records: Vec<FeatureRecord>,
}

impl FeatureStore {
    /// Validate records, cap each at `max_examples`, and drop records with
    /// fewer than `min_examples` examples.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if a feature index is outside the
    /// codec width, appears twice, or an example's token and activation
    /// lengths differ.
    pub fn from_records(records: Vec<FeatureRecord>, cfg: FeatureConfig) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        let mut kept = Vec::with_capacity(records.len());
        for mut record in records {
            if record.feature_index >= cfg.width {
                return Err(CfError::Configuration(format!(
                    "feature {} out of range (width {})",
                    record.feature_index, cfg.width
                )));
            }
            if !seen.insert((record.layer_index, record.feature_index)) {
                return Err(CfError::Configuration(format!(
                    "feature {} at layer {} appears twice",
                    record.feature_index, record.layer_index
                )));
            }
            for example in &record.examples {
                example.validate()?;
            }
            if record.examples.len() < cfg.min_examples {
                warn!(
                    "skipping feature {}: {} examples (min {})",
                    record.feature_index,
                    record.examples.len(),
                    cfg.min_examples
                );
                continue;
            }
            record.examples.truncate(cfg.max_examples);
            kept.push(record);
        }
        info!("Loaded {} feature records", kept.len());
        Ok(Self { cfg, records: kept })
    }

    /// Build records from a tokenized corpus and sparse activations.
    ///
    /// Each sequence is cut into consecutive non-overlapping windows of
    /// `ctx_len` tokens (the last window may be shorter). Every window in
    /// which a feature is active becomes one example of that feature.
    /// Records are ordered by feature index.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] for `ctx_len == 0` or a location
    /// outside the corpus, plus the errors of
    /// [`from_records`](Self::from_records).
    pub fn from_locations(
        corpus: &[Vec<u32>],
        locations: &[ActivationLocation],
        layer_index: usize,
        cfg: FeatureConfig,
        ctx_len: usize,
    ) -> Result<Self> {
        if ctx_len == 0 {
            return Err(CfError::Configuration(
                "context length must be positive".into(),
            ));
        }

        // feature -> (sequence, window) -> activations
        let mut traces: BTreeMap<usize, BTreeMap<(usize, usize), Vec<f32>>> = BTreeMap::new();
        for loc in locations {
            let sequence = corpus.get(loc.sequence).ok_or_else(|| {
                CfError::Configuration(format!(
                    "activation in sequence {} but corpus has {} sequences",
                    loc.sequence,
                    corpus.len()
                ))
            })?;
            if loc.position >= sequence.len() {
                return Err(CfError::Configuration(format!(
                    "activation at position {} of sequence {} (length {})",
                    loc.position,
                    loc.sequence,
                    sequence.len()
                )));
            }
            if loc.activation <= 0.0 {
                continue;
            }
            let window = loc.position / ctx_len;
            let start = window * ctx_len;
            let window_len = ctx_len.min(sequence.len() - start);
            let trace = traces
                .entry(loc.feature)
                .or_default()
                .entry((loc.sequence, window))
                .or_insert_with(|| vec![0.0; window_len]);
            if let Some(slot) = trace.get_mut(loc.position - start) {
                *slot = loc.activation;
            }
        }

        let mut records = Vec::with_capacity(traces.len());
        for (feature, windows) in traces {
            let mut examples = Vec::with_capacity(windows.len());
            for ((sequence, window), activations) in windows {
                let start = window * ctx_len;
                let tokens = corpus
                    .get(sequence)
                    .and_then(|s| s.get(start..start + activations.len()))
                    .map(<[u32]>::to_vec)
                    .unwrap_or_default();
                examples.push(ActivationExample::new(tokens, activations)?);
            }
            records.push(FeatureRecord::new(feature, layer_index, examples));
        }
        Self::from_records(records, cfg)
    }

    /// Read `shard_{i}.json` for `i in 0..n_splits` from `dir`, each a JSON
    /// array of [`FeatureRecord`]s.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Io`] for a missing shard,
    /// [`CfError::Serialization`] for a malformed one, plus the errors of
    /// [`from_records`](Self::from_records).
    pub fn load_shards(dir: impl AsRef<Path>, cfg: FeatureConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let mut records = Vec::new();
        for i in 0..cfg.n_splits {
            let path = dir.join(format!("shard_{i}.json"));
            let bytes = std::fs::read(&path)?;
            let shard: Vec<FeatureRecord> = serde_json::from_slice(&bytes)?;
            info!("Read {} records from {}", shard.len(), path.display());
            records.extend(shard);
        }
        Self::from_records(records, cfg)
    }

    /// Fill empty decoder directions from the codec's decoder rows.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if a feature is outside the codec
    /// and [`CfError::Model`] on tensor failure.
    pub fn fill_directions(&mut self, codec: &dyn FeatureCodec) -> Result<()> {
        for record in &mut self.records {
            record.decoder_direction = record.direction_or_codec(codec)?;
        }
        Ok(())
    }

    /// All records, in load order.
    #[must_use]
    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }

    /// The record of one feature.
    #[must_use]
    pub fn get(&self, feature_index: usize) -> Option<&FeatureRecord> {
        self.records
            .iter()
            .find(|r| r.feature_index == feature_index)
    }

    /// Keep only the first `n` records.
    pub fn truncate(&mut self, n: usize) {
        self.records.truncate(n);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The dataset configuration.
    #[must_use]
    pub const fn config(&self) -> &FeatureConfig {
        &self.cfg
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
