// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer abstraction: dispatch between `HuggingFace` and word-level
//! backends.
//!
//! [`SteerTokenizer`] provides a unified encode/decode interface regardless
//! of the underlying tokenizer implementation. Encoding never adds special
//! tokens; models prepend their own beginning-of-sequence token.

pub mod word;

use crate::error::{Result, SteerError};

pub use word::WordTokenizer;

/// Candidate spellings of a beginning-of-sequence token, in lookup order.
#[cfg(feature = "hf-tokenizer")]
const BOS_CANDIDATES: [&str; 4] = ["<|endoftext|>", "<s>", "<bos>", "<|begin_of_text|>"];

/// Unified tokenizer supporting multiple backends.
///
/// # Example
///
/// ```
/// use candle_steer::{SteerTokenizer, WordTokenizer};
///
/// # fn main() -> candle_steer::Result<()> {
/// let tok = SteerTokenizer::from(WordTokenizer::from_corpus(["I love dogs"]));
/// let ids = tok.encode("I love")?;
/// assert_eq!(tok.decode(&ids)?, "I love");
/// # Ok(())
/// # }
/// ```
#[non_exhaustive]
pub enum SteerTokenizer {
    /// `HuggingFace` `tokenizers` backend.
    #[cfg(feature = "hf-tokenizer")]
    HuggingFace(Box<tokenizers::Tokenizer>),
    /// Built-in word-level tokenizer.
    Word(WordTokenizer),
}

impl SteerTokenizer {
    /// Load a `HuggingFace` tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if the file cannot be loaded or parsed.
    #[cfg(feature = "hf-tokenizer")]
    pub fn from_hf_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            SteerError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::HuggingFace(Box::new(tok)))
    }

    /// Encode text into token IDs without special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            #[cfg(feature = "hf-tokenizer")]
            Self::HuggingFace(tok) => {
                let encoding = tok
                    .encode(text, false)
                    .map_err(|e| SteerError::Tokenizer(format!("HF encode failed: {e}")))?;
                Ok(encoding.get_ids().to_vec())
            }
            Self::Word(tok) => Ok(tok.encode(text)),
        }
    }

    /// Decode token IDs back to a string, skipping special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            #[cfg(feature = "hf-tokenizer")]
            Self::HuggingFace(tok) => tok
                .decode(ids, true)
                .map_err(|e| SteerError::Tokenizer(format!("HF decode failed: {e}"))),
            Self::Word(tok) => tok.decode(ids),
        }
    }

    /// Beginning-of-sequence token ID.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if the vocabulary has no
    /// recognizable BOS token.
    pub fn bos_id(&self) -> Result<u32> {
        match self {
            #[cfg(feature = "hf-tokenizer")]
            Self::HuggingFace(tok) => BOS_CANDIDATES
                .iter()
                .find_map(|candidate| tok.token_to_id(candidate))
                .ok_or_else(|| {
                    SteerError::Tokenizer("no beginning-of-sequence token in vocabulary".into())
                }),
            Self::Word(_) => Ok(WordTokenizer::BOS_ID),
        }
    }

    /// Get vocabulary size (including special tokens).
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        match self {
            #[cfg(feature = "hf-tokenizer")]
            Self::HuggingFace(tok) => tok.get_vocab_size(true),
            Self::Word(tok) => tok.vocab_size(),
        }
    }
}

impl From<WordTokenizer> for SteerTokenizer {
    fn from(tok: WordTokenizer) -> Self {
        Self::Word(tok)
    }
}

#[cfg(feature = "hf-tokenizer")]
impl From<tokenizers::Tokenizer> for SteerTokenizer {
    fn from(tok: tokenizers::Tokenizer) -> Self {
        Self::HuggingFace(Box::new(tok))
    }
}

impl std::fmt::Debug for SteerTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "hf-tokenizer")]
            Self::HuggingFace(_) => f.debug_tuple("HuggingFace").field(&"...").finish(),
            Self::Word(tok) => f.debug_tuple("Word").field(tok).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, feature = "hf-tokenizer"))]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use std::str::FromStr;

    use candle_core::Device;

    use super::*;
    use crate::backend::SteerableModel;
    use crate::config::TinyModelConfig;
    use crate::steer::sets::pad_phrase_group;
    use crate::tiny::TinyResidualModel;

    /// Word-level vocabulary that keeps spaces as their own token.
    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {
            "type": "Split", "pattern": {"String": " "}, "behavior": "Isolated", "invert": false
        },
        "post_processor": null,
        "decoder": {"type": "Fuse"},
        "model": {
            "type": "WordLevel",
            "vocab": {"<|endoftext|>": 0, " ": 1, "I": 2, "love": 3, "dogs": 4, "<unk>": 5},
            "unk_token": "<unk>"
        }
    }"#;

    fn hf_tokenizer() -> SteerTokenizer {
        tokenizers::Tokenizer::from_str(TOKENIZER_JSON).unwrap().into()
    }

    #[test]
    fn hf_bos_comes_from_candidate_list() {
        let tok = hf_tokenizer();
        assert_eq!(tok.bos_id().unwrap(), 0);
        assert!(tok.vocab_size() >= 6);
    }

    #[test]
    fn hf_encode_decode_round_trip() {
        let tok = hf_tokenizer();
        let ids = tok.encode("I love dogs").unwrap();
        assert_eq!(ids, vec![2, 1, 3, 1, 4]);
        assert_eq!(tok.decode(&ids).unwrap(), "I love dogs");
        // BOS is special and skipped on decode.
        assert_eq!(tok.decode(&[0, 2]).unwrap(), "I");
    }

    #[test]
    fn hf_tokenizer_loads_from_file() {
        let path = std::env::temp_dir().join(format!(
            "candle-steer-tokenizer-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, TOKENIZER_JSON).unwrap();
        let tok = SteerTokenizer::from_hf_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(tok.encode("dogs").unwrap(), vec![4]);

        let missing = SteerTokenizer::from_hf_path(path.with_extension("missing"));
        assert!(matches!(missing, Err(SteerError::Tokenizer(_))));
    }

    #[test]
    fn hf_tokenizer_drives_the_reference_model() {
        let model =
            TinyResidualModel::new(TinyModelConfig::default(), hf_tokenizer(), &Device::Cpu)
                .unwrap();
        assert_eq!(model.to_tokens("I love").unwrap(), vec![0, 2, 1, 3]);
        assert_eq!(model.to_single_token(" ").unwrap(), 1);
        assert!(model.to_single_token("I love").is_err());

        let group = [("I love dogs".to_string(), 1.0), ("I".to_string(), -1.0)];
        let padded = pad_phrase_group(&model, &group).unwrap();
        assert_eq!(padded[1].0, vec![0, 2, 1, 1, 1, 1]);
        assert!(model.logits(&padded[0].0).is_ok());
    }
}
