// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expansion of a compact sweep description into addition sets.
//!
//! A [`SweepSpec`] lists phrase groups, injection sites and outer
//! coefficients. [`SweepSpec::build`] produces one [`AdditionSet`] per
//! element of `groups x sites x coeffs` (groups outermost, coefficients
//! innermost), each tagged with the [`SweepPoint`] it came from.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::SteerableModel;
use crate::error::{Result, SteerError};
use crate::hooks::HookPoint;
use crate::steer::addition::{ActivationAddition, AdditionSet};
use crate::table::{Cell, ResultTable};

/// Filler text used to right-pad phrase tokens.
pub const PAD_TEXT: &str = " ";

// ---------------------------------------------------------------------------
// SweepSpec
// ---------------------------------------------------------------------------

/// Phrase groups, sites and coefficients to sweep over.
///
/// # Example
///
/// ```
/// use candle_steer::{HookPoint, SweepSpec};
///
/// # fn main() -> candle_steer::Result<()> {
/// let spec = SweepSpec {
///     phrases: vec![vec![("Love".into(), 1.0), ("Hate".into(), -1.0)]],
///     sites: vec![HookPoint::block(0), HookPoint::block(5)],
///     coeffs: vec![1.0, 10.0],
///     pad: false,
/// };
/// let sweep = spec.build(None)?;
/// assert_eq!(sweep.len(), 4);
/// assert_eq!(sweep.sets()[3][1].coeff(), -10.0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// Phrase groups; each `(phrase, base coefficient)` becomes one addition.
    pub phrases: Vec<Vec<(String, f64)>>,
    /// Injection sites.
    pub sites: Vec<HookPoint>,
    /// Outer coefficients multiplying every base coefficient.
    pub coeffs: Vec<f64>,
    /// Right-pad the phrases of each group to a common token length.
    #[serde(default)]
    pub pad: bool,
}

impl SweepSpec {
    /// Number of addition sets this spec expands to.
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.phrases.len() * self.sites.len() * self.coeffs.len()
    }

    /// Expand into addition sets.
    ///
    /// `model` is only needed when [`pad`](Self::pad) is set.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if padding is requested without a
    /// model, and propagates tokenizer errors from padding.
    pub fn build(&self, model: Option<&dyn SteerableModel>) -> Result<AdditionSweep> {
        make_addition_sets(&self.phrases, &self.sites, &self.coeffs, self.pad, model)
    }
}

// ---------------------------------------------------------------------------
// SweepPoint / AdditionSweep
// ---------------------------------------------------------------------------

/// Provenance of one addition set: the group, site and coefficient it was
/// built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// The phrase group, with base coefficients.
    pub phrases: Vec<(String, f64)>,
    /// Injection site.
    pub site: HookPoint,
    /// Outer coefficient.
    pub coeff: f64,
}

/// Addition sets with their provenance, index-aligned.
///
/// The position of a set is its `rich_prompt_index` in sweep tables.
#[derive(Debug, Clone, Default)]
pub struct AdditionSweep {
    /// One set per sweep point.
    sets: Vec<AdditionSet>,
    /// Provenance of `sets[i]`.
    points: Vec<SweepPoint>,
}

impl AdditionSweep {
    /// The addition sets, in expansion order.
    #[must_use]
    pub fn sets(&self) -> &[AdditionSet] {
        &self.sets
    }

    /// The provenance of each set.
    #[must_use]
    pub fn points(&self) -> &[SweepPoint] {
        &self.points
    }

    /// Number of sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether there are no sets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Provenance as a joinable table.
    ///
    /// Columns: `rich_prompt_index`, `phrases` (JSON text of the group),
    /// `act_name` (site string), `coeff`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Json`] if a phrase group fails to serialize.
    pub fn provenance_table(&self) -> Result<ResultTable> {
        let mut table = ResultTable::new(["rich_prompt_index", "phrases", "act_name", "coeff"]);
        for (idx, point) in self.points.iter().enumerate() {
            table.push_row(vec![
                Cell::from(idx),
                Cell::Text(serde_json::to_string(&point.phrases)?),
                Cell::Text(point.site.to_string()),
                Cell::Float(point.coeff),
            ])?;
        }
        Ok(table)
    }
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// Build one addition set per `(group, site, coeff)`.
///
/// Each addition gets coefficient `base * coeff` and the element's site.
/// With `pad`, the phrases of each group are tokenized (with BOS) and
/// right-padded with the model's token for [`PAD_TEXT`] to the group's
/// longest phrase before the additions are built.
///
/// # Errors
///
/// Returns [`SteerError::Config`] if `pad` is set and `model` is `None`;
/// this is checked before any expansion. Propagates tokenizer errors.
pub fn make_addition_sets(
    phrases: &[Vec<(String, f64)>],
    sites: &[HookPoint],
    coeffs: &[f64],
    pad: bool,
    model: Option<&dyn SteerableModel>,
) -> Result<AdditionSweep> {
    let pad_model = match (pad, model) {
        (true, None) => {
            return Err(SteerError::Config(
                "padding requires a model to tokenize phrases".into(),
            ))
        }
        (true, Some(model)) => Some(model),
        (false, _) => None,
    };

    let capacity = phrases.len() * sites.len() * coeffs.len();
    let mut sweep = AdditionSweep {
        sets: Vec::with_capacity(capacity),
        points: Vec::with_capacity(capacity),
    };

    for group in phrases {
        // Padding is scoped to this group.
        let base: Vec<ActivationAddition> = match pad_model {
            Some(model) => pad_phrase_group(model, group)?
                .into_iter()
                .map(|(tokens, coeff)| ActivationAddition::from_tokens(tokens, coeff, 0_usize))
                .collect(),
            None => group
                .iter()
                .map(|(phrase, coeff)| ActivationAddition::from_phrase(phrase.as_str(), *coeff, 0_usize))
                .collect(),
        };

        for site in sites {
            for &coeff in coeffs {
                let set: AdditionSet = base
                    .iter()
                    .map(|add| add.at_site(site.clone()).scaled_by(coeff))
                    .collect();
                sweep.sets.push(set);
                sweep.points.push(SweepPoint {
                    phrases: group.clone(),
                    site: site.clone(),
                    coeff,
                });
            }
        }
    }

    debug!(sets = sweep.len(), pad, "expanded addition sets");
    Ok(sweep)
}

/// Tokenize each phrase of a group (with BOS) and right-pad to the group
/// maximum with the model's [`PAD_TEXT`] token.
///
/// Returns `(tokens, base coefficient)` per phrase, in input order.
///
/// # Errors
///
/// Propagates tokenizer errors, including a pad text that is not a single
/// token.
pub fn pad_phrase_group(
    model: &dyn SteerableModel,
    group: &[(String, f64)],
) -> Result<Vec<(Vec<u32>, f64)>> {
    let pad_id = model.to_single_token(PAD_TEXT)?;
    let tokenized = group
        .iter()
        .map(|(phrase, coeff)| Ok((model.to_tokens(phrase)?, *coeff)))
        .collect::<Result<Vec<_>>>()?;
    let max_len = tokenized.iter().map(|(t, _)| t.len()).max().unwrap_or(0);
    Ok(tokenized
        .into_iter()
        .map(|(mut tokens, coeff)| {
            tokens.resize(max_len, pad_id);
            (tokens, coeff)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Steering pairs
// ---------------------------------------------------------------------------

/// How to equalize the two phrases of a steering pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PairPadding {
    /// Use the phrases as they tokenize.
    #[default]
    None,
    /// Right-pad the shorter phrase with the model's [`PAD_TEXT`] token.
    Space,
    /// Right-pad the shorter phrase with a given token ID.
    Token(u32),
}

/// The `phrase1 - phrase2` pair: `+coeff` on the first, `-coeff` on the
/// second, both at `site`.
///
/// ```
/// use candle_steer::{steering_pair, AdditionContent, PairPadding, PhraseSource};
/// # use candle_core::Device;
/// # use candle_steer::{TinyModelConfig, TinyResidualModel, WordTokenizer};
///
/// # fn main() -> candle_steer::Result<()> {
/// # let tok = WordTokenizer::from_corpus(["I love you", "Hate"]);
/// # let model = TinyResidualModel::new(TinyModelConfig::default(), tok.into(), &Device::Cpu)?;
/// let [pos, neg] = steering_pair(&model, "I love you", "Hate", 4.0, 6_usize, PairPadding::Space)?;
/// assert_eq!(neg.coeff(), -4.0);
/// if let AdditionContent::Phrase(PhraseSource::Tokens(tokens)) = neg.content() {
///     assert_eq!(tokens.len(), 6); // BOS + "I" " " "love" " " "you"
/// }
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Propagates tokenizer errors when padding.
pub fn steering_pair(
    model: &dyn SteerableModel,
    phrase1: &str,
    phrase2: &str,
    coeff: f64,
    site: impl Into<HookPoint>,
    padding: PairPadding,
) -> Result<[ActivationAddition; 2]> {
    let site = site.into();
    let pad_id = match padding {
        PairPadding::None => {
            return Ok([
                ActivationAddition::from_phrase(phrase1, coeff, site.clone()),
                ActivationAddition::from_phrase(phrase2, -coeff, site),
            ])
        }
        PairPadding::Space => model.to_single_token(PAD_TEXT)?,
        PairPadding::Token(id) => id,
    };

    let mut tokens1 = model.to_tokens(phrase1)?;
    let mut tokens2 = model.to_tokens(phrase2)?;
    let max_len = tokens1.len().max(tokens2.len());
    tokens1.resize(max_len, pad_id);
    tokens2.resize(max_len, pad_id);

    Ok([
        ActivationAddition::from_tokens(tokens1, coeff, site.clone()),
        ActivationAddition::from_tokens(tokens2, -coeff, site),
    ])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
