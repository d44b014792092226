// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-steer
//!
//! Steering-vector sweeps for language models in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! An [`ActivationAddition`] adds `coeff * activations(phrase)` to the
//! residual stream at a hook point (following the `TransformerLens`
//! naming). candle-steer expands phrase groups, sites and coefficients
//! into addition sets, compiles each set into hook functions, installs
//! them on a shared model through an RAII [`InterventionSession`], sweeps
//! completions or metrics over every set, and reduces repeated trials into
//! tables joined with the sweep provenance.
//!
//! ## Quick start
//!
//! ```
//! use candle_core::Device;
//! use candle_steer::{
//!     reduce_sweep_results, sweep_over_prompts, HookPoint, SweepConfig, SweepSpec,
//!     TinyModelConfig, TinyResidualModel, WordTokenizer,
//! };
//!
//! # fn main() -> candle_steer::Result<()> {
//! let tok = WordTokenizer::from_corpus(["I think you're Love Hate"]);
//! let mut model = TinyResidualModel::new(TinyModelConfig::default(), tok.into(), &Device::Cpu)?;
//!
//! let sweep = SweepSpec {
//!     phrases: vec![vec![("Love".into(), 1.0), ("Hate".into(), -1.0)]],
//!     sites: vec![HookPoint::block(0), HookPoint::block(5)],
//!     coeffs: vec![1.0, 10.0],
//!     pad: false,
//! }
//! .build(None)?;
//!
//! let config = SweepConfig {
//!     num_normal_completions: 2,
//!     num_patched_completions: 2,
//!     tokens_to_generate: 3,
//!     seed: Some(0),
//!     ..SweepConfig::default()
//! };
//! let prompts = vec!["I think you're".to_string()];
//! let out = sweep_over_prompts(&mut model, &prompts, sweep.sets(), &config, None)?;
//! assert_eq!(out.patched.len(), 8);
//!
//! let reduced = reduce_sweep_results(&out.normal, &out.patched, &sweep.provenance_table()?)?;
//! assert_eq!(reduced.patched.len(), 4);
//! # Ok(())
//! # }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod steer;
pub mod table;
pub mod tiny;
pub mod tokenizer;

// --- Public re-exports ---------------------------------------------------

// Model capability
pub use backend::{sample_token, token_losses, GenerationResult, SteerableModel};

// Configuration
pub use config::{ExperimentConfig, GenerationConfig, SamplingConfig, SweepConfig, TinyModelConfig};

// Errors
pub use error::{Result, SteerError};

// Hooks
pub use hooks::{HookFn, HookMap, HookPoint, HookRegistry};

// Metrics
pub use metrics::{LossMetric, Metric, MetricSet, WordCountMetric};

// Steering
pub use steer::{
    activation_dict, hook_fn_from_activations, hook_fns_from_additions, make_addition_sets,
    pad_phrase_group, prompt_magnitudes, random_matched_vector, reduce_metric_sweep,
    reduce_sweep_results, steering_magnitudes_relative_to_prompt, steering_pair,
    steering_vec_magnitudes, sweep_over_metrics, sweep_over_prompts, with_hooks,
    ActivationAddition, ActivationAdditionBuilder, AdditionContent, AdditionSet, AdditionSweep,
    CompletionSweep, InterventionSession, PairPadding, PhraseSource, ReducedSweep, SweepPoint,
    SweepSpec,
};

// Tables
pub use table::{Cell, ResultTable};

// Reference model
pub use tiny::TinyResidualModel;

// Tokenizers
pub use tokenizer::{SteerTokenizer, WordTokenizer};
