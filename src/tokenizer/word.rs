// SPDX-License-Identifier: MIT OR Apache-2.0

//! Word-level tokenizer for the reference model.
//!
//! Text is split into maximal runs of non-whitespace characters (words) and
//! single whitespace characters, so `" "` is always exactly one token and
//! decoding reproduces the input for in-vocabulary text. Three special
//! tokens come first: BOS, unknown, and the space.

use std::collections::HashMap;

use crate::error::{Result, SteerError};

/// Word-level tokenizer with a fixed vocabulary.
#[derive(Clone)]
pub struct WordTokenizer {
    /// Token ID to piece mapping.
    idx2token: Vec<String>,
    /// Piece to token ID mapping.
    vocab_map: HashMap<String, u32>,
}

impl std::fmt::Debug for WordTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WordTokenizer")
            .field("vocab_size", &self.idx2token.len())
            .finish_non_exhaustive()
    }
}

impl WordTokenizer {
    /// Beginning-of-sequence token ID.
    pub const BOS_ID: u32 = 0;
    /// Unknown-piece token ID.
    pub const UNK_ID: u32 = 1;
    /// Space token ID.
    pub const SPACE_ID: u32 = 2;

    /// Spelling of the special tokens, indexed by ID.
    const SPECIALS: [&'static str; 3] = ["<|endoftext|>", "<unk>", " "];

    /// Build a vocabulary from every piece appearing in `texts`.
    ///
    /// Pieces are numbered in order of first appearance after the special
    /// tokens, so the same corpus always yields the same IDs.
    pub fn from_corpus<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tok = Self::empty();
        for text in texts {
            for piece in split_pieces(text.as_ref()) {
                tok.insert(piece);
            }
        }
        tok
    }

    /// Tokenizer holding only the special tokens.
    fn empty() -> Self {
        let mut tok = Self {
            idx2token: Vec::new(),
            vocab_map: HashMap::new(),
        };
        for special in Self::SPECIALS {
            tok.insert(special);
        }
        tok
    }

    /// Add a piece if it is new.
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)] // vocabularies stay far below u32::MAX
    fn insert(&mut self, piece: &str) {
        if !self.vocab_map.contains_key(piece) {
            let id = self.idx2token.len() as u32;
            self.idx2token.push(piece.to_string());
            self.vocab_map.insert(piece.to_string(), id);
        }
    }

    /// Encode text; unknown pieces map to [`Self::UNK_ID`].
    #[must_use]
    pub fn encode(&self, text: &str) -> Vec<u32> {
        split_pieces(text)
            .map(|piece| self.vocab_map.get(piece).copied().unwrap_or(Self::UNK_ID))
            .collect()
    }

    /// Decode token IDs, skipping the BOS token.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if an ID is out of range.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut text = String::new();
        for &id in ids {
            if id == Self::BOS_ID {
                continue;
            }
            let piece = usize::try_from(id)
                .ok()
                .and_then(|i| self.idx2token.get(i))
                .ok_or_else(|| SteerError::Tokenizer(format!("token id {id} out of range")))?;
            text.push_str(piece);
        }
        Ok(text)
    }

    /// ID of a piece, if it is in the vocabulary.
    #[must_use]
    pub fn token_to_id(&self, piece: &str) -> Option<u32> {
        self.vocab_map.get(piece).copied()
    }

    /// Get vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.idx2token.len()
    }
}

/// Split text into words and single whitespace characters.
fn split_pieces(text: &str) -> impl Iterator<Item = &str> {
    let mut pieces = Vec::new();
    let mut word_start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = word_start.take() {
                pieces.extend(text.get(start..i));
            }
            pieces.extend(text.get(i..i + c.len_utf8()));
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }
    if let Some(start) = word_start {
        pieces.extend(text.get(start..));
    }
    pieces.into_iter()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_each_whitespace_char() {
        let pieces: Vec<&str> = split_pieces("I  love\ndogs").collect();
        assert_eq!(pieces, vec!["I", " ", " ", "love", "\n", "dogs"]);
    }

    #[test]
    fn roundtrip_in_vocabulary_text() {
        let tok = WordTokenizer::from_corpus(["Love is all", "Hate"]);
        let ids = tok.encode("Hate is all");
        assert_eq!(tok.decode(&ids).unwrap(), "Hate is all");
    }

    #[test]
    fn specials_come_first() {
        let tok = WordTokenizer::from_corpus(["word"]);
        assert_eq!(tok.token_to_id(" "), Some(WordTokenizer::SPACE_ID));
        assert_eq!(tok.token_to_id("word"), Some(3));
        assert_eq!(tok.vocab_size(), 4);
    }

    #[test]
    fn unknown_pieces_map_to_unk() {
        let tok = WordTokenizer::from_corpus(["known"]);
        assert_eq!(tok.encode("unknown"), vec![WordTokenizer::UNK_ID]);
    }

    #[test]
    fn decode_skips_bos_and_rejects_out_of_range() {
        let tok = WordTokenizer::from_corpus(["a"]);
        assert_eq!(tok.decode(&[WordTokenizer::BOS_ID, 3]).unwrap(), "a");
        assert!(tok.decode(&[999]).is_err());
    }
}
