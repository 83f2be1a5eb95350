// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer abstraction: dispatch between `HuggingFace` and word-level
//! vocabularies.
//!
//! [`CfTokenizer`] provides a unified encode/decode interface regardless of
//! the underlying tokenizer implementation.

mod word;

pub use word::WordVocab;

use crate::error::{CfError, Result};

/// Unified tokenizer supporting multiple backends.
///
/// Real models use the `HuggingFace` `tokenizers` crate. Synthetic corpora
/// and toy models use a whitespace-split [`WordVocab`].
///
/// # Example
///
/// ```
/// use candle_counterfactual::{CfTokenizer, WordVocab};
///
/// # fn main() -> candle_counterfactual::Result<()> {
/// let tok = CfTokenizer::Word(WordVocab::new(["<bos>", "the", "cat"]).with_bos("<bos>")?);
/// let ids = tok.encode("the cat")?;
/// assert_eq!(ids, vec![0, 1, 2]);
/// assert_eq!(tok.decode(&ids[1..])?, "the cat");
/// # Ok(())
/// # }
/// ```
#[non_exhaustive]
pub enum CfTokenizer {
    /// `HuggingFace` `tokenizers` backend.
    HuggingFace(Box<tokenizers::Tokenizer>),
    /// Whitespace-split word vocabulary.
    Word(WordVocab),
}

impl CfTokenizer {
    /// Load a `HuggingFace` tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_hf_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            CfError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::HuggingFace(Box::new(tok)))
    }

    /// Wrap an already-loaded `HuggingFace` tokenizer.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer) -> Self {
        Self::HuggingFace(Box::new(tokenizer))
    }

    /// Encode text into token IDs, adding special tokens (e.g. BOS).
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            Self::HuggingFace(tok) => {
                let encoding = tok
                    .encode(text, true)
                    .map_err(|e| CfError::Tokenizer(format!("HF encode failed: {e}")))?;
                Ok(encoding.get_ids().to_vec())
            }
            Self::Word(vocab) => vocab.encode(text, true),
        }
    }

    /// Encode text into token IDs **without** adding special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if encoding fails.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            Self::HuggingFace(tok) => {
                let encoding = tok
                    .encode(text, false)
                    .map_err(|e| CfError::Tokenizer(format!("HF encode failed: {e}")))?;
                Ok(encoding.get_ids().to_vec())
            }
            Self::Word(vocab) => vocab.encode(text, false),
        }
    }

    /// Decode token IDs back to a string.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            Self::HuggingFace(tok) => tok
                .decode(ids, false)
                .map_err(|e| CfError::Tokenizer(format!("HF decode failed: {e}"))),
            Self::Word(vocab) => vocab.decode(ids),
        }
    }

    /// Token ID that ends `text` when encoded on its own.
    ///
    /// Used to find the newline token that stops explanation sampling.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if `text` encodes to nothing.
    pub fn stop_token(&self, text: &str) -> Result<u32> {
        self.encode_raw(text)?
            .last()
            .copied()
            .ok_or_else(|| CfError::Tokenizer(format!("{text:?} encodes to no tokens")))
    }

    /// End-of-sequence token, if the tokenizer defines one.
    #[must_use]
    pub fn eos_token_id(&self) -> Option<u32> {
        match self {
            Self::HuggingFace(tok) => ["</s>", "<eos>", "<|endoftext|>", "<|end_of_text|>"]
                .iter()
                .find_map(|t| tok.token_to_id(t)),
            Self::Word(vocab) => vocab.eos(),
        }
    }

    /// Get vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        match self {
            Self::HuggingFace(tok) => tok.get_vocab_size(true),
            Self::Word(vocab) => vocab.len(),
        }
    }
}

impl std::fmt::Debug for CfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HuggingFace(_) => f.debug_tuple("HuggingFace").field(&"...").finish(),
            Self::Word(vocab) => f.debug_tuple("Word").field(vocab).finish(),
        }
    }
}
