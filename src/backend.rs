// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model capability trait and sampling helpers.
//!
//! [`SteerableModel`] is everything the sweep engine needs from a language
//! model: tokenization, a capturing forward pass, logits, generation, and
//! a global hook state. Sampling helpers implement the temperature / top-p /
//! frequency-penalty policy used by [`GenerationConfig`].

use candle_core::{DType, Tensor, D};
use rand::Rng;

use crate::config::{GenerationConfig, SamplingConfig};
use crate::error::{Result, SteerError};
use crate::hooks::{HookFn, HookPoint};

// ---------------------------------------------------------------------------
// SteerableModel trait
// ---------------------------------------------------------------------------

/// A language model whose forward pass can be read and mutated at named
/// hook points.
///
/// The installed hooks are global, mutable state on the model instance:
/// every forward pass (capture, logits, generation) runs them. The
/// hook-mutating methods take `&mut self`, so the borrow checker keeps any
/// other user out while an [`InterventionSession`](crate::InterventionSession)
/// holds the model.
pub trait SteerableModel {
    // --- Metadata --------------------------------------------------------

    /// Number of layers (blocks).
    fn num_layers(&self) -> usize;

    /// Residual stream width (`d_model`).
    fn hidden_size(&self) -> usize;

    // --- Tokenization ----------------------------------------------------

    /// Tokenize text, prepending the beginning-of-sequence token.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if encoding fails.
    fn to_tokens(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode tokens back to text (special tokens are dropped).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if decoding fails.
    fn to_string(&self, tokens: &[u32]) -> Result<String>;

    /// The single token that encodes `text` (without BOS).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if `text` is not exactly one token.
    fn to_single_token(&self, text: &str) -> Result<u32>;

    // --- Forward passes --------------------------------------------------

    /// Run one forward pass over `tokens` and return the activation at
    /// `site`, after any hooks installed there.
    ///
    /// # Shapes
    /// - returns: `[1, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if `site` does not exist in this model.
    fn activations_at(&self, tokens: &[u32], site: &HookPoint) -> Result<Tensor>;

    /// Run one forward pass over `tokens` and return the logits.
    ///
    /// # Shapes
    /// - returns: `[1, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor operation failures.
    fn logits(&self, tokens: &[u32]) -> Result<Tensor>;

    /// Generate a completion for every prompt of the batch.
    ///
    /// The seed in `config`, when set, is applied once at the start of the
    /// call, so two calls with the same seed and hook state agree.
    ///
    /// # Errors
    ///
    /// Propagates tokenizer, tensor and hook errors.
    fn generate(&self, prompts: &[String], config: &GenerationConfig)
        -> Result<Vec<GenerationResult>>;

    // --- Hook state (session-only) ---------------------------------------

    /// Install `hook` at `site`. Only called by
    /// [`InterventionSession`](crate::InterventionSession).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if `site` does not resolve to exactly
    /// one activation in this model.
    fn add_hook(&mut self, site: HookPoint, hook: HookFn) -> Result<()>;

    /// Remove every installed hook. Only called by
    /// [`InterventionSession`](crate::InterventionSession).
    fn remove_all_hooks(&mut self);

    /// Number of installed hooks.
    fn num_hooks(&self) -> usize;
}

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

/// Output of one generated completion.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Original prompt text.
    pub prompt: String,
    /// Only the generated portion.
    pub completion: String,
    /// Token IDs of the prompt (including BOS).
    pub prompt_tokens: Vec<u32>,
    /// Token IDs that were generated.
    pub generated_tokens: Vec<u32>,
    /// Mean negative log-likelihood of the generated tokens under the model
    /// (with its hooks); `None` when nothing was generated.
    pub loss: Option<f32>,
}

// ---------------------------------------------------------------------------
// Loss helpers
// ---------------------------------------------------------------------------

/// Per-position next-token negative log-likelihood.
///
/// Entry `i` is `-log p(tokens[i + 1] | tokens[..=i])`.
///
/// # Shapes
/// - `logits`: `[1, seq, vocab]` or `[seq, vocab]`
/// - returns: `seq - 1` values
///
/// # Errors
///
/// Returns [`SteerError::Model`] on tensor failures and
/// [`SteerError::Config`] if `tokens` and `logits` disagree in length.
pub fn token_losses(logits: &Tensor, tokens: &[u32]) -> Result<Vec<f32>> {
    let logits = if logits.rank() == 3 {
        logits.squeeze(0)?
    } else {
        logits.clone()
    };
    let (seq, _) = logits.dims2()?;
    if seq != tokens.len() {
        return Err(SteerError::Config(format!(
            "logits cover {seq} positions but {} tokens were given",
            tokens.len()
        )));
    }
    // PROMOTE: log-softmax needs f32 for numerical stability
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let rows: Vec<Vec<f32>> = log_probs.to_vec2()?;
    Ok(rows
        .iter()
        .zip(tokens.iter().skip(1))
        .map(|(row, &next)| {
            let idx = usize::try_from(next).unwrap_or(usize::MAX);
            -row.get(idx).copied().unwrap_or(f32::NEG_INFINITY)
        })
        .collect())
}

/// Mean of a slice, `None` when empty.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub(crate) fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

// ---------------------------------------------------------------------------
// Sampling helpers
// ---------------------------------------------------------------------------

/// Sample the next token from last-position logits.
///
/// Applies, in order: frequency penalty (one `freq_penalty` per previous
/// occurrence of a token in `history`), temperature (`<= 0.0` means greedy
/// argmax), then nucleus truncation to the smallest set of tokens whose
/// probability mass reaches `top_p`.
///
/// # Shapes
/// - `logits`: `[vocab_size]`
///
/// # Errors
///
/// Returns [`SteerError::Model`] if the logits are empty or cannot be
/// converted to `f32`.
pub fn sample_token<R: Rng + ?Sized>(
    logits: &Tensor,
    sampling: &SamplingConfig,
    history: &[u32],
    rng: &mut R,
) -> Result<u32> {
    let mut values: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if values.is_empty() {
        return Err(SteerError::Model(candle_core::Error::Msg("empty logits".into())));
    }

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let penalty = sampling.freq_penalty as f32;
    if penalty != 0.0 {
        for &token in history {
            if let Some(v) = usize::try_from(token).ok().and_then(|i| values.get_mut(i)) {
                *v -= penalty;
            }
        }
    }

    if sampling.temperature <= 0.0 {
        return argmax(&values);
    }

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let temperature = sampling.temperature as f32;
    let probs = softmax(&values, temperature);

    let candidates = match sampling.top_p {
        Some(p) if p < 1.0 => nucleus(&probs, p),
        _ => probs.iter().copied().enumerate().collect(),
    };

    let total: f32 = candidates.iter().map(|(_, p)| p).sum();
    let r: f32 = rng.gen::<f32>() * total;
    let mut cumsum = 0.0;
    for &(idx, p) in &candidates {
        cumsum += p;
        if r < cumsum {
            return to_token_id(idx);
        }
    }

    // Floating-point rounding edge case: take the last candidate.
    candidates
        .last()
        .map_or_else(|| argmax(&values), |&(idx, _)| to_token_id(idx))
}

/// Greedy (argmax) selection.
fn argmax(values: &[f32]) -> Result<u32> {
    let (max_idx, _) = values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| SteerError::Model(candle_core::Error::Msg("empty logits".into())))?;
    to_token_id(max_idx)
}

/// Temperature-scaled, numerically stable softmax.
fn softmax(values: &[f32], temperature: f32) -> Vec<f32> {
    let scaled: Vec<f32> = values.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    exp_vals.iter().map(|x| x / sum).collect()
}

/// Smallest highest-probability prefix whose mass reaches `top_p`.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn nucleus(probs: &[f32], top_p: f64) -> Vec<(usize, f32)> {
    let mut sorted: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept = Vec::new();
    let mut mass = 0.0_f32;
    for (idx, p) in sorted {
        kept.push((idx, p));
        mass += p;
        if mass >= top_p as f32 {
            break;
        }
    }
    kept
}

/// Convert a vocabulary index to a token ID.
fn to_token_id(idx: usize) -> Result<u32> {
    u32::try_from(idx).map_err(|_| {
        SteerError::Model(candle_core::Error::Msg(format!(
            "token index {idx} exceeds u32"
        )))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
