// SPDX-License-Identifier: MIT OR Apache-2.0

//! Whitespace-split word vocabulary.
//!
//! Words are separated by spaces; a newline is its own token when the
//! vocabulary contains `"\n"`. Decoding joins words with single spaces and
//! emits newlines without surrounding spaces.

use std::collections::HashMap;

use crate::error::{CfError, Result};

const NEWLINE: &str = "\n";

/// Fixed word-level vocabulary.
#[derive(Debug, Clone)]
pub struct WordVocab {
    /// Token strings, indexed by ID.
    words: Vec<String>,
    /// Reverse lookup.
    ids: HashMap<String, u32>,
    /// Prepended by [`encode`](Self::encode) when `add_special` is set.
    bos: Option<u32>,
    /// End-of-sequence marker.
    eos: Option<u32>,
    /// Substituted for out-of-vocabulary words.
    unk: Option<u32>,
}

impl WordVocab {
    /// Build a vocabulary; IDs follow iteration order, duplicates keep
    /// their first ID.
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self {
            words: Vec::new(),
            ids: HashMap::new(),
            bos: None,
            eos: None,
            unk: None,
        };
        for word in words {
            let word = word.into();
            if vocab.ids.contains_key(&word) {
                continue;
            }
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            let id = vocab.words.len() as u32;
            vocab.ids.insert(word.clone(), id);
            vocab.words.push(word);
        }
        vocab
    }

    /// Mark `token` as the beginning-of-sequence token.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if `token` is not in the vocabulary.
    pub fn with_bos(mut self, token: &str) -> Result<Self> {
        self.bos = Some(self.id(token)?);
        Ok(self)
    }

    /// Mark `token` as the end-of-sequence token.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if `token` is not in the vocabulary.
    pub fn with_eos(mut self, token: &str) -> Result<Self> {
        self.eos = Some(self.id(token)?);
        Ok(self)
    }

    /// Map out-of-vocabulary words to `token` instead of failing.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] if `token` is not in the vocabulary.
    pub fn with_unk(mut self, token: &str) -> Result<Self> {
        self.unk = Some(self.id(token)?);
        Ok(self)
    }

    /// ID of a single token.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] for an unknown token.
    pub fn id(&self, token: &str) -> Result<u32> {
        self.ids
            .get(token)
            .copied()
            .ok_or_else(|| CfError::Tokenizer(format!("unknown word {token:?}")))
    }

    /// Encode text, optionally prepending the BOS token.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] for an unknown word when no UNK
    /// token is set.
    pub fn encode(&self, text: &str, add_special: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        if add_special {
            ids.extend(self.bos);
        }
        let newline = self.ids.get(NEWLINE).copied();
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                ids.push(newline.ok_or_else(|| {
                    CfError::Tokenizer("vocabulary has no newline token".into())
                })?);
            }
            for word in line.split_whitespace() {
                match (self.ids.get(word), self.unk) {
                    (Some(&id), _) | (None, Some(id)) => ids.push(id),
                    (None, None) => return Err(CfError::Tokenizer(format!("unknown word {word:?}"))),
                }
            }
        }
        Ok(ids)
    }

    /// Decode IDs back to text.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Tokenizer`] for an out-of-range ID.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut out = String::new();
        for &id in ids {
            #[allow(clippy::as_conversions)]
            let word = self
                .words
                .get(id as usize)
                .ok_or_else(|| CfError::Tokenizer(format!("token ID {id} out of range")))?;
            if word == NEWLINE {
                out.push('\n');
                continue;
            }
            if !out.is_empty() && !out.ends_with('\n') {
                out.push(' ');
            }
            out.push_str(word);
        }
        Ok(out)
    }

    /// Beginning-of-sequence token ID.
    #[must_use]
    pub const fn bos(&self) -> Option<u32> {
        self.bos
    }

    /// End-of-sequence token ID.
    #[must_use]
    pub const fn eos(&self) -> Option<u32> {
        self.eos
    }

    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the vocabulary is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vocab() -> WordVocab {
        WordVocab::new(["<bos>", "a", "b", "\n", "a"])
            .with_bos("<bos>")
            .unwrap()
    }

    #[test]
    fn duplicates_keep_first_id() {
        let v = vocab();
        assert_eq!(v.len(), 4);
        assert_eq!(v.id("a").unwrap(), 1);
    }

    #[test]
    fn newline_is_a_token() {
        let v = vocab();
        let ids = v.encode("a b\nb", false).unwrap();
        assert_eq!(ids, vec![1, 2, 3, 2]);
        assert_eq!(v.decode(&ids).unwrap(), "a b\nb");
    }

    #[test]
    fn bos_only_with_special_tokens() {
        let v = vocab();
        assert_eq!(v.encode("a", true).unwrap(), vec![0, 1]);
        assert_eq!(v.encode("", true).unwrap(), vec![0]);
        assert!(v.encode("", false).unwrap().is_empty());
    }

    #[test]
    fn unk_replaces_unknown_words() {
        let v = WordVocab::new(["<unk>", "a"]).with_unk("<unk>").unwrap();
        assert_eq!(v.encode("a zebra a", false).unwrap(), vec![1, 0, 1]);
    }

    #[test]
    fn unknown_word_and_id_fail() {
        let v = vocab();
        assert!(v.encode("zebra", false).is_err());
        assert!(v.decode(&[42]).is_err());
        assert!(WordVocab::new(["a"]).with_eos("</s>").is_err());
    }
}
