// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-counterfactual.

use std::path::PathBuf;

/// Errors that can occur while sampling, intervening, generating, or
/// persisting results.
#[derive(Debug, thiserror::Error)]
pub enum CfError {
    /// Invalid layer, feature, or position reference, or an invalid
    /// configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Fewer activation examples are available than were requested.
    #[error("feature {feature}: requested {requested} examples, only {available} available")]
    InsufficientData {
        /// Feature index.
        feature: usize,
        /// Number of examples requested (`n_train + n_test`).
        requested: usize,
        /// Number of examples held by the feature record.
        available: usize,
    },

    /// The results file of a run already exists.
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    /// Opaque failure during a subject or explainer model call.
    #[error("external model error: {0}")]
    ExternalModel(String),

    /// Tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A spawned persistence task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-counterfactual operations.
pub type Result<T> = std::result::Result<T, CfError>;
