// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering sweeps: additions, set expansion, hook compilation, sessions,
//! sweep runners and result reduction.
//!
//! - [`addition`]: one additive edit ([`ActivationAddition`]).
//! - [`sets`]: phrase group x site x coefficient expansion.
//! - [`compile`]: addition sets to hook functions.
//! - [`session`]: scoped hook installation.
//! - [`sweep`]: completion and metric sweeps.
//! - [`reduce`]: trial means joined with provenance.
//! - [`magnitude`]: steering vs residual-stream norms.

pub mod addition;
pub mod compile;
pub mod magnitude;
pub mod reduce;
pub mod session;
pub mod sets;
pub mod sweep;

pub use addition::{
    ActivationAddition, ActivationAdditionBuilder, AdditionContent, AdditionSet, PhraseSource,
};
pub use compile::{activation_dict, hook_fn_from_activations, hook_fns_from_additions};
pub use magnitude::{
    prompt_magnitudes, random_matched_vector, steering_magnitudes_relative_to_prompt,
    steering_vec_magnitudes,
};
pub use reduce::{reduce_metric_sweep, reduce_sweep_results, ReducedSweep, INDEX_COLUMNS};
pub use session::{with_hooks, InterventionSession};
pub use sets::{
    make_addition_sets, pad_phrase_group, steering_pair, AdditionSweep, PairPadding, SweepPoint,
    SweepSpec, PAD_TEXT,
};
pub use sweep::{sweep_over_metrics, sweep_over_prompts, CompletionSweep, SET_INDEX_COLUMN};
