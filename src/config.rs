// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sweep, sampling and reference-model configuration.
//!
//! Every struct deserializes from JSON with `#[serde(default)]`, so a
//! config file only needs the fields it changes.
//!
//! # Usage
//!
//! ```
//! use candle_steer::SweepConfig;
//!
//! let config = SweepConfig::from_json_str(
//!     r#"{"num_normal_completions": 4, "seed": 0,
//!         "sampling": {"temperature": 1.0, "top_p": 0.3, "freq_penalty": 1.0}}"#,
//! ).unwrap();
//! assert_eq!(config.num_normal_completions, 4);
//! assert_eq!(config.num_patched_completions, 100);
//! assert_eq!(config.tokens_to_generate, 40);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SteerError};
use crate::hooks::HookPoint;

// ---------------------------------------------------------------------------
// Sampling / generation
// ---------------------------------------------------------------------------

/// Sampling parameters, forwarded opaquely to the generation capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Softmax temperature; `0.0` means greedy decoding.
    pub temperature: f64,
    /// Nucleus sampling mass in `(0, 1]`; `None` disables truncation.
    pub top_p: Option<f64>,
    /// Subtracted from a token's logit once per previous occurrence.
    pub freq_penalty: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: None,
            freq_penalty: 0.0,
        }
    }
}

impl SamplingConfig {
    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] for a negative or non-finite
    /// temperature, a `top_p` outside `(0, 1]`, or a non-finite penalty.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SteerError::Config(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(SteerError::Config(format!(
                    "top_p must be in (0, 1], got {p}"
                )));
            }
        }
        if !self.freq_penalty.is_finite() {
            return Err(SteerError::Config(format!(
                "freq_penalty must be finite, got {}",
                self.freq_penalty
            )));
        }
        Ok(())
    }
}

/// Arguments of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of tokens to generate after each prompt.
    pub max_new_tokens: usize,
    /// Seed applied at the start of the call; `None` draws from entropy.
    pub seed: Option<u64>,
    /// Sampling parameters.
    pub sampling: SamplingConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 40,
            seed: None,
            sampling: SamplingConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// SweepConfig
// ---------------------------------------------------------------------------

/// Options recognized by the sweep runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Baseline completions generated per prompt.
    pub num_normal_completions: usize,
    /// Intervened completions generated per prompt and descriptor set.
    pub num_patched_completions: usize,
    /// Generation token budget.
    pub tokens_to_generate: usize,
    /// Seed reused for every generation call.
    pub seed: Option<u64>,
    /// Right-pad phrases within each phrase group to equal token length.
    pub pad: bool,
    /// Sampling parameters.
    pub sampling: SamplingConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            num_normal_completions: 100,
            num_patched_completions: 100,
            tokens_to_generate: 40,
            seed: None,
            pad: false,
            sampling: SamplingConfig::default(),
        }
    }
}

impl SweepConfig {
    /// Parse and validate a JSON config string.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Json`] on malformed JSON and
    /// [`SteerError::Config`] if validation fails.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Check option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if the token budget is zero or the
    /// sampling parameters are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.tokens_to_generate == 0 {
            return Err(SteerError::Config(
                "tokens_to_generate must be at least 1".into(),
            ));
        }
        self.sampling.validate()
    }

    /// The generation arguments every sweep call uses.
    #[must_use]
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.tokens_to_generate,
            seed: self.seed,
            // BORROW: explicit .clone() — each call owns its sampling config
            sampling: self.sampling.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TinyModelConfig
// ---------------------------------------------------------------------------

/// Shape and initialization of [`TinyResidualModel`](crate::TinyResidualModel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TinyModelConfig {
    /// Number of residual blocks.
    pub num_layers: usize,
    /// Residual stream width (`d_model`).
    pub hidden_size: usize,
    /// MLP inner width.
    pub intermediate_size: usize,
    /// RMS norm epsilon.
    pub norm_eps: f64,
    /// Weight initialization seed.
    pub init_seed: u64,
}

impl Default for TinyModelConfig {
    fn default() -> Self {
        Self {
            num_layers: 6,
            hidden_size: 32,
            intermediate_size: 64,
            norm_eps: 1e-5,
            init_seed: 0,
        }
    }
}

impl TinyModelConfig {
    /// Check that every dimension is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] on a zero dimension or a
    /// non-positive epsilon.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 || self.hidden_size == 0 || self.intermediate_size == 0 {
            return Err(SteerError::Config(format!(
                "tiny model dimensions must be non-zero: layers={}, hidden={}, intermediate={}",
                self.num_layers, self.hidden_size, self.intermediate_size
            )));
        }
        if !(self.norm_eps > 0.0) {
            return Err(SteerError::Config(format!(
                "norm_eps must be positive, got {}",
                self.norm_eps
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExperimentConfig
// ---------------------------------------------------------------------------

/// A complete completion-sweep experiment, as stored in a JSON file.
///
/// `phrases` is a list of phrase groups, each a list of
/// `[phrase, base_coeff]` pairs; `sites` accepts block numbers or hook
/// strings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Prompts to complete.
    pub prompts: Vec<String>,
    /// Phrase groups to sweep.
    pub phrases: Vec<Vec<(String, f64)>>,
    /// Injection sites to sweep.
    pub sites: Vec<HookPoint>,
    /// Outer coefficients to sweep.
    pub coeffs: Vec<f64>,
    /// Runner options.
    pub sweep: SweepConfig,
    /// Reference model shape, when the experiment runs on the tiny model.
    pub model: TinyModelConfig,
}

impl ExperimentConfig {
    /// Read, parse and validate an experiment file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`], [`SteerError::Json`] or
    /// [`SteerError::Config`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.sweep.validate()?;
        config.model.validate()?;
        Ok(config)
    }

    /// The phrase / site / coefficient grid, with the sweep's pad flag.
    #[must_use]
    pub fn sweep_spec(&self) -> crate::SweepSpec {
        crate::SweepSpec {
            phrases: self.phrases.clone(),
            sites: self.sites.clone(),
            coeffs: self.coeffs.clone(),
            pad: self.sweep.pad,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = SweepConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SweepConfig::default());
        assert_eq!(config.sampling.temperature, 1.0);
        assert!(!config.pad);
    }

    #[test]
    fn generation_config_forwards_seed_and_sampling() {
        let config = SweepConfig::from_json_str(
            r#"{"tokens_to_generate": 7, "seed": 3, "sampling": {"top_p": 0.5}}"#,
        )
        .unwrap();
        let generation = config.generation_config();
        assert_eq!(generation.max_new_tokens, 7);
        assert_eq!(generation.seed, Some(3));
        assert_eq!(generation.sampling.top_p, Some(0.5));
    }

    #[test]
    fn rejects_invalid_sampling() {
        let err = SweepConfig::from_json_str(r#"{"sampling": {"top_p": 1.5}}"#).unwrap_err();
        assert!(matches!(err, SteerError::Config(_)));
        let err = SweepConfig::from_json_str(r#"{"sampling": {"temperature": -1.0}}"#)
            .unwrap_err();
        assert!(matches!(err, SteerError::Config(_)));
    }

    #[test]
    fn rejects_zero_token_budget() {
        let err = SweepConfig::from_json_str(r#"{"tokens_to_generate": 0}"#).unwrap_err();
        assert!(matches!(err, SteerError::Config(_)));
    }

    #[test]
    fn experiment_parses_phrase_groups_and_sites() {
        let json = r#"{
            "prompts": ["I went up to my friend and said"],
            "phrases": [[["Love", 1.0], ["Hate", -1.0]]],
            "sites": [6, "blocks.2.hook_resid_post"],
            "coeffs": [1, 10]
        }"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.phrases[0][1], ("Hate".to_string(), -1.0));
        assert_eq!(
            config.sites,
            vec![HookPoint::ResidPre(6), HookPoint::ResidPost(2)]
        );
        assert_eq!(config.coeffs, vec![1.0, 10.0]);
    }

    #[test]
    fn tiny_model_config_rejects_zero_width() {
        let config = TinyModelConfig {
            hidden_size: 0,
            ..TinyModelConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
