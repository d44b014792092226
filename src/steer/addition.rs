// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation additions: one additive edit to the residual stream.
//!
//! An [`ActivationAddition`] pairs an injection site and a signed
//! coefficient with content, either a raw per-position tensor or a phrase
//! that the model encodes at the site on first use.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};

use crate::backend::SteerableModel;
use crate::error::{Result, SteerError};
use crate::hooks::HookPoint;

/// Source text or tokens of a phrase addition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhraseSource {
    /// Text, tokenized with the model's BOS token on first use.
    Text(String),
    /// Pre-tokenized phrase (including BOS), as produced by padding.
    Tokens(Vec<u32>),
}

/// What an addition injects.
#[derive(Debug, Clone)]
pub enum AdditionContent {
    /// Explicit activations, shape `[1, seq, d_model]`.
    RawVector(Tensor),
    /// A phrase whose activations at the addition's site are injected.
    Phrase(PhraseSource),
}

/// A scaled, positioned edit to one hook point's activation.
///
/// The scaled activations (`coeff * content`) are computed on first call to
/// [`activations`](Self::activations) and cached; clones made before that
/// call compute their own.
///
/// # Example
///
/// ```
/// use candle_steer::{ActivationAddition, HookPoint};
///
/// let love = ActivationAddition::from_phrase("Love", 5.0, HookPoint::block(6));
/// assert_eq!(love.coeff(), 5.0);
/// assert_eq!(love.site().to_string(), "blocks.6.hook_resid_pre");
/// ```
#[derive(Debug, Clone)]
pub struct ActivationAddition {
    /// Injection site.
    site: HookPoint,
    /// Signed scale applied to the content.
    coeff: f64,
    /// Raw vector or phrase.
    content: AdditionContent,
    /// `coeff * representation`, shape `[1, seq, d_model]`.
    scaled: OnceLock<Tensor>,
}

impl ActivationAddition {
    /// Addition of a text phrase's activations.
    #[must_use]
    pub fn from_phrase(prompt: impl Into<String>, coeff: f64, site: impl Into<HookPoint>) -> Self {
        Self::with_content(AdditionContent::Phrase(PhraseSource::Text(prompt.into())), coeff, site)
    }

    /// Addition of a pre-tokenized phrase's activations.
    #[must_use]
    pub fn from_tokens(tokens: Vec<u32>, coeff: f64, site: impl Into<HookPoint>) -> Self {
        Self::with_content(AdditionContent::Phrase(PhraseSource::Tokens(tokens)), coeff, site)
    }

    /// Addition of an explicit activation tensor.
    ///
    /// # Shapes
    /// - `vector`: `[1, seq, d_model]` or `[seq, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] for any other rank.
    pub fn from_vector(vector: Tensor, coeff: f64, site: impl Into<HookPoint>) -> Result<Self> {
        let vector = match vector.rank() {
            3 => vector,
            2 => vector.unsqueeze(0)?,
            rank => {
                return Err(SteerError::Config(format!(
                    "raw steering vector must be [1, seq, d_model] or [seq, d_model], got rank {rank}"
                )))
            }
        };
        if vector.dim(0)? != 1 {
            return Err(SteerError::Config(format!(
                "raw steering vector must have batch size 1, got {}",
                vector.dim(0)?
            )));
        }
        Ok(Self::with_content(AdditionContent::RawVector(vector), coeff, site))
    }

    /// Start assembling an addition field by field.
    #[must_use]
    pub fn builder() -> ActivationAdditionBuilder {
        ActivationAdditionBuilder::default()
    }

    /// Shared constructor.
    fn with_content(content: AdditionContent, coeff: f64, site: impl Into<HookPoint>) -> Self {
        Self {
            site: site.into(),
            coeff,
            content,
            scaled: OnceLock::new(),
        }
    }

    /// Injection site.
    #[must_use]
    pub const fn site(&self) -> &HookPoint {
        &self.site
    }

    /// Signed coefficient.
    #[must_use]
    pub const fn coeff(&self) -> f64 {
        self.coeff
    }

    /// Content of the addition.
    #[must_use]
    pub const fn content(&self) -> &AdditionContent {
        &self.content
    }

    /// Same addition with its coefficient multiplied by `factor`.
    ///
    /// The copy starts with an empty cache.
    #[must_use]
    pub fn scaled_by(&self, factor: f64) -> Self {
        Self::with_content(self.content.clone(), self.coeff * factor, self.site.clone())
    }

    /// Same addition moved to another site.
    #[must_use]
    pub fn at_site(&self, site: impl Into<HookPoint>) -> Self {
        Self::with_content(self.content.clone(), self.coeff, site)
    }

    /// `coeff * representation` at this addition's site.
    ///
    /// Phrase content costs one forward pass over the phrase tokens on the
    /// first call; later calls return the cached tensor.
    ///
    /// # Shapes
    /// - returns: `[1, seq, d_model]`
    ///
    /// # Errors
    ///
    /// Propagates tokenizer and forward-pass errors from `model`.
    pub fn activations(&self, model: &dyn SteerableModel) -> Result<Tensor> {
        // `OnceLock::get_or_try_init` is unstable: check, compute, then set.
        if let Some(cached) = self.scaled.get() {
            return Ok(cached.clone());
        }
        let raw = match &self.content {
            AdditionContent::RawVector(vector) => vector.clone(),
            AdditionContent::Phrase(PhraseSource::Text(text)) => {
                let tokens = model.to_tokens(text)?;
                model.activations_at(&tokens, &self.site)?
            }
            AdditionContent::Phrase(PhraseSource::Tokens(tokens)) => {
                model.activations_at(tokens, &self.site)?
            }
        };
        let scaled = raw.affine(self.coeff, 0.0)?;
        // A concurrent initializer may win; both computed the same value.
        Ok(self.scaled.get_or_init(|| scaled).clone())
    }
}

impl PartialEq for ActivationAddition {
    /// Compares site, coefficient and phrase content; raw vectors compare
    /// by shape and values.
    fn eq(&self, other: &Self) -> bool {
        if self.site != other.site || self.coeff.to_bits() != other.coeff.to_bits() {
            return false;
        }
        match (&self.content, &other.content) {
            (AdditionContent::Phrase(a), AdditionContent::Phrase(b)) => a == b,
            (AdditionContent::RawVector(a), AdditionContent::RawVector(b)) => {
                if a.dims() != b.dims() {
                    return false;
                }
                // Unreadable tensors never compare equal.
                match (vector_values(a), vector_values(b)) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

/// Flattened values of `t`, promoted to f32.
fn vector_values(t: &Tensor) -> candle_core::Result<Vec<f32>> {
    t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()
}

/// A set of additions applied together in one session.
pub type AdditionSet = Vec<ActivationAddition>;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Field-by-field construction of an [`ActivationAddition`].
///
/// Exactly one of [`vector`](Self::vector), [`prompt`](Self::prompt) or
/// [`tokens`](Self::tokens) must be set.
///
/// ```
/// use candle_steer::ActivationAddition;
///
/// let err = ActivationAddition::builder().coeff(1.0).site(3_usize).build();
/// assert!(err.is_err());
/// ```
#[derive(Debug, Default)]
#[must_use]
pub struct ActivationAdditionBuilder {
    /// Injection site.
    site: Option<HookPoint>,
    /// Coefficient (defaults to 1.0).
    coeff: Option<f64>,
    /// Explicit activations.
    vector: Option<Tensor>,
    /// Phrase content.
    phrase: Option<PhraseSource>,
}

impl ActivationAdditionBuilder {
    /// Set the injection site.
    pub fn site(mut self, site: impl Into<HookPoint>) -> Self {
        self.site = Some(site.into());
        self
    }

    /// Set the coefficient.
    pub const fn coeff(mut self, coeff: f64) -> Self {
        self.coeff = Some(coeff);
        self
    }

    /// Set raw vector content.
    pub fn vector(mut self, vector: Tensor) -> Self {
        self.vector = Some(vector);
        self
    }

    /// Set text phrase content.
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.phrase = Some(PhraseSource::Text(prompt.into()));
        self
    }

    /// Set pre-tokenized phrase content.
    pub fn tokens(mut self, tokens: Vec<u32>) -> Self {
        self.phrase = Some(PhraseSource::Tokens(tokens));
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if the site is missing, or if both or
    /// neither of vector and phrase content are set.
    pub fn build(self) -> Result<ActivationAddition> {
        let site = self
            .site
            .ok_or_else(|| SteerError::Config("activation addition needs a site".into()))?;
        let coeff = self.coeff.unwrap_or(1.0);
        match (self.vector, self.phrase) {
            (Some(vector), None) => ActivationAddition::from_vector(vector, coeff, site),
            (None, Some(phrase)) => Ok(ActivationAddition::with_content(
                AdditionContent::Phrase(phrase),
                coeff,
                site,
            )),
            (Some(_), Some(_)) => Err(SteerError::Config(
                "activation addition has both a vector and a phrase".into(),
            )),
            (None, None) => Err(SteerError::Config(
                "activation addition needs a vector or a phrase".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
