// SPDX-License-Identifier: MIT OR Apache-2.0

//! Residual-stream magnitude analysis.
//!
//! Compares the per-position L2 norm of a steering vector with the norm of
//! the residual stream it is added to, and builds random control vectors
//! with matched norms.

use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::backend::SteerableModel;
use crate::error::{Result, SteerError};
use crate::hooks::HookPoint;
use crate::steer::addition::ActivationAddition;
use crate::steer::compile::{activation_dict, add_aligned};

/// Per-position L2 norm of the residual stream for `prompt` at `site`.
///
/// # Errors
///
/// Propagates tokenizer and forward-pass errors.
pub fn prompt_magnitudes(
    model: &dyn SteerableModel,
    prompt: &str,
    site: &HookPoint,
) -> Result<Vec<f32>> {
    let tokens = model.to_tokens(prompt)?;
    position_norms(&model.activations_at(&tokens, site)?)
}

/// Per-position L2 norm of the summed steering vector of `additions`.
///
/// The vector is as long as the longest addition; shorter additions
/// contribute only over their own positions.
///
/// # Errors
///
/// Returns [`SteerError::Config`] unless all additions share one site.
pub fn steering_vec_magnitudes(
    model: &dyn SteerableModel,
    additions: &[ActivationAddition],
) -> Result<Vec<f32>> {
    position_norms(&summed_steering_vector(model, additions)?)
}

/// Steering norm divided by prompt norm, over the positions both cover.
///
/// # Errors
///
/// As [`steering_vec_magnitudes`] and [`prompt_magnitudes`].
pub fn steering_magnitudes_relative_to_prompt(
    model: &dyn SteerableModel,
    prompt: &str,
    additions: &[ActivationAddition],
) -> Result<Vec<f32>> {
    let steering = steering_vec_magnitudes(model, additions)?;
    let site = single_site(additions)?;
    let prompt = prompt_magnitudes(model, prompt, site)?;
    Ok(steering
        .iter()
        .zip(&prompt)
        .map(|(s, p)| if *p > 0.0 { s / p } else { f32::INFINITY })
        .collect())
}

/// Random `[1, seq, d_model]` vector whose position norms equal
/// `magnitudes`, with position 0 zeroed.
///
/// Position 0 holds the BOS token, whose residual norm dwarfs the rest, so
/// a control vector leaves it alone.
///
/// # Errors
///
/// Returns [`SteerError::Config`] if `d_model` is zero.
pub fn random_matched_vector(
    magnitudes: &[f32],
    d_model: usize,
    seed: u64,
    device: &Device,
) -> Result<Tensor> {
    if d_model == 0 {
        return Err(SteerError::Config("d_model must be at least 1".into()));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(magnitudes.len() * d_model);
    for (pos, &target) in magnitudes.iter().enumerate() {
        let row: Vec<f32> = (0..d_model)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        let scale = if pos == 0 || norm == 0.0 { 0.0 } else { target / norm };
        data.extend(row.into_iter().map(|x| x * scale));
    }
    Ok(Tensor::from_vec(data, (1, magnitudes.len(), d_model), device)?)
}

/// Sum of all additions' scaled activations, position-aligned.
fn summed_steering_vector(
    model: &dyn SteerableModel,
    additions: &[ActivationAddition],
) -> Result<Tensor> {
    single_site(additions)?;
    let deltas = activation_dict(model, additions)?
        .into_iter()
        .flat_map(|(_, deltas)| deltas)
        .collect::<Vec<_>>();

    let mut max_len = 0;
    for delta in &deltas {
        max_len = max_len.max(delta.dim(1)?);
    }
    let template = deltas
        .first()
        .ok_or_else(|| SteerError::Config("no additions to measure".into()))?;
    let zeros = Tensor::zeros(
        (1, max_len, template.dim(D::Minus1)?),
        template.dtype(),
        template.device(),
    )?;
    deltas.iter().try_fold(zeros, |acc, delta| add_aligned(&acc, delta))
}

/// The one site shared by every addition.
fn single_site(additions: &[ActivationAddition]) -> Result<&HookPoint> {
    let first = additions
        .first()
        .ok_or_else(|| SteerError::Config("no additions to measure".into()))?;
    if additions.iter().any(|a| a.site() != first.site()) {
        return Err(SteerError::Config(
            "magnitude analysis needs all additions at one site".into(),
        ));
    }
    Ok(first.site())
}

/// L2 norm over the hidden dimension of a `[1, seq, d]` tensor.
fn position_norms(acts: &Tensor) -> Result<Vec<f32>> {
    // PROMOTE: norms in f32
    Ok(acts
        .to_dtype(DType::F32)?
        .sqr()?
        .sum(D::Minus1)?
        .sqrt()?
        .flatten_all()?
        .to_vec1()?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
