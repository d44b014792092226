// SPDX-License-Identifier: MIT OR Apache-2.0

//! Compile addition sets into hook functions.
//!
//! Every addition contributes `coeff * activations` to its site, aligned at
//! sequence position 0 of the activation flowing through the hook. Content
//! shorter than the activation touches only the leading positions; longer
//! content is cut to the activation's length. Additions sharing a site are
//! summed positionwise.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::debug;

use crate::backend::SteerableModel;
use crate::error::{Result, SteerError};
use crate::hooks::{HookFn, HookMap, HookPoint};
use crate::steer::addition::ActivationAddition;

/// Scaled activations of each addition, grouped by site in order of first
/// appearance.
///
/// # Shapes
/// - each tensor: `[1, seq_i, d_model]`
///
/// # Errors
///
/// Propagates errors from [`ActivationAddition::activations`].
pub fn activation_dict(
    model: &dyn SteerableModel,
    additions: &[ActivationAddition],
) -> Result<Vec<(HookPoint, Vec<Tensor>)>> {
    let mut dict: Vec<(HookPoint, Vec<Tensor>)> = Vec::new();
    for addition in additions {
        let acts = addition.activations(model)?;
        if let Some((_, list)) = dict.iter_mut().find(|(site, _)| site == addition.site()) {
            list.push(acts);
        } else {
            dict.push((addition.site().clone(), vec![acts]));
        }
    }
    Ok(dict)
}

/// Compile an addition set into a [`HookMap`] with one function per site.
///
/// Phrase activations are computed here, on `model` as it is now, so
/// compile sets before opening any session that changes the model's hooks.
///
/// # Errors
///
/// Propagates errors from [`activation_dict`].
pub fn hook_fns_from_additions(
    model: &dyn SteerableModel,
    additions: &[ActivationAddition],
) -> Result<HookMap> {
    let mut hooks = HookMap::new();
    for (site, deltas) in activation_dict(model, additions)? {
        debug!(site = %site, additions = deltas.len(), "compiled hook");
        hooks.insert(site, hook_fn_from_deltas(deltas));
    }
    Ok(hooks)
}

/// Hook adding one fixed tensor at position 0 onwards.
///
/// # Shapes
/// - `activations`: `[1, seq, d_model]` or `[seq, d_model]`
///
/// # Errors
///
/// Returns [`SteerError::Hook`] for any other rank or a batch size
/// other than 1.
pub fn hook_fn_from_activations(activations: Tensor) -> Result<HookFn> {
    let delta = match activations.rank() {
        3 => activations,
        2 => activations.unsqueeze(0)?,
        rank => {
            return Err(SteerError::Hook(format!(
                "hook activations must be [1, seq, d_model] or [seq, d_model], got rank {rank}"
            )))
        }
    };
    let batch = delta.dim(0)?;
    if batch != 1 {
        return Err(SteerError::Hook(format!(
            "hook activations must have batch size 1, got {batch}"
        )));
    }
    Ok(hook_fn_from_deltas(vec![delta]))
}

/// The hook for one site: add each delta, position-aligned.
fn hook_fn_from_deltas(deltas: Vec<Tensor>) -> HookFn {
    Arc::new(move |resid: &Tensor| {
        deltas
            .iter()
            .try_fold(resid.clone(), |acc, delta| add_aligned(&acc, delta))
    })
}

/// `resid + delta` over the leading `min(seq, delta_seq)` positions.
///
/// # Shapes
/// - `resid`: `[batch, seq, d_model]`
/// - `delta`: `[1, delta_seq, d_model]`
/// - returns: `[batch, seq, d_model]`
pub(crate) fn add_aligned(resid: &Tensor, delta: &Tensor) -> Result<Tensor> {
    let (_, seq, d_model) = resid.dims3()?;
    let (_, delta_seq, delta_d) = delta.dims3()?;
    if delta_d != d_model {
        return Err(SteerError::Hook(format!(
            "steering content has width {delta_d} but the activation has width {d_model}"
        )));
    }

    let overlap = seq.min(delta_seq);
    if overlap == 0 {
        return Ok(resid.clone());
    }
    let delta = delta
        .narrow(1, 0, overlap)?
        .pad_with_zeros(1, 0, seq - overlap)?
        .to_dtype(resid.dtype())?
        .to_device(resid.device())?;
    Ok(resid.broadcast_add(&delta)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::config::TinyModelConfig;
    use crate::tiny::TinyResidualModel;
    use crate::tokenizer::WordTokenizer;

    fn model() -> TinyResidualModel {
        let tok = WordTokenizer::from_corpus(["Love Hate I think you are nice"]);
        TinyResidualModel::new(TinyModelConfig::default(), tok.into(), &Device::Cpu).unwrap()
    }

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.squeeze(0).unwrap().to_vec2().unwrap()
    }

    fn filled(seq: usize, d: usize, value: f32) -> Tensor {
        Tensor::full(value, (1, seq, d), &Device::Cpu).unwrap()
    }

    #[test]
    fn shorter_content_modifies_only_leading_positions() {
        let hook = hook_fn_from_activations(filled(2, 3, 1.0)).unwrap();
        let out = hook(&Tensor::zeros((1, 4, 3), DType::F32, &Device::Cpu).unwrap()).unwrap();
        assert_eq!(
            rows(&out),
            vec![vec![1.0; 3], vec![1.0; 3], vec![0.0; 3], vec![0.0; 3]]
        );
    }

    #[test]
    fn longer_content_is_truncated() {
        let hook = hook_fn_from_activations(filled(5, 3, 2.0)).unwrap();
        let out = hook(&Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap()).unwrap();
        assert_eq!(rows(&out), vec![vec![2.0; 3], vec![2.0; 3]]);
    }

    #[test]
    fn batch_rows_all_receive_the_delta() {
        let hook = hook_fn_from_activations(filled(1, 2, 1.0)).unwrap();
        let out = hook(&Tensor::zeros((3, 2, 2), DType::F32, &Device::Cpu).unwrap()).unwrap();
        let values: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();
        for batch in values {
            assert_eq!(batch, vec![vec![1.0, 1.0], vec![0.0, 0.0]]);
        }
    }

    #[test]
    fn batched_activations_are_rejected() {
        let batched = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            hook_fn_from_activations(batched),
            Err(SteerError::Hook(_))
        ));
        let rank1 = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            hook_fn_from_activations(rank1),
            Err(SteerError::Hook(_))
        ));
    }

    #[test]
    fn width_mismatch_is_a_hook_error() {
        let hook = hook_fn_from_activations(filled(1, 4, 1.0)).unwrap();
        let err = hook(&Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap());
        assert!(matches!(err, Err(SteerError::Hook(_))));
    }

    #[test]
    fn different_lengths_act_independently() {
        let m = model();
        let additions = vec![
            ActivationAddition::from_vector(filled(1, 32, 1.0), 1.0, 2_usize).unwrap(),
            ActivationAddition::from_vector(filled(3, 32, 1.0), 10.0, 2_usize).unwrap(),
        ];
        let hooks = hook_fns_from_additions(&m, &additions).unwrap();
        assert_eq!(hooks.len(), 1);

        let hook = hooks.get(&HookPoint::block(2)).unwrap();
        let out = rows(&hook(&Tensor::zeros((1, 4, 32), DType::F32, &Device::Cpu).unwrap()).unwrap());
        assert_eq!(out[0][0], 11.0);
        assert_eq!(out[2][0], 10.0);
        assert_eq!(out[3][0], 0.0);
    }

    #[test]
    fn same_site_additions_superpose() {
        let m = model();
        let love = ActivationAddition::from_phrase("Love", 3.0, 4_usize);
        let hate = ActivationAddition::from_phrase("I think you are", -2.0, 4_usize);
        let resid = m
            .activations_at(&m.to_tokens("you are nice").unwrap(), &HookPoint::block(4))
            .unwrap();

        let both = hook_fns_from_additions(&m, &[love.clone(), hate.clone()]).unwrap();
        let only_love = hook_fns_from_additions(&m, &[love]).unwrap();
        let only_hate = hook_fns_from_additions(&m, &[hate]).unwrap();
        let site = HookPoint::block(4);

        let combined = both.get(&site).unwrap()(&resid).unwrap();
        let love_delta = (only_love.get(&site).unwrap()(&resid).unwrap() - &resid).unwrap();
        let hate_delta = (only_hate.get(&site).unwrap()(&resid).unwrap() - &resid).unwrap();
        let expected = ((&resid + love_delta).unwrap() + hate_delta).unwrap();

        let diff: Vec<f32> = (combined - expected)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(diff.iter().all(|d| d.abs() < 1e-4));
    }

    #[test]
    fn different_sites_get_separate_hooks() {
        let m = model();
        let additions = vec![
            ActivationAddition::from_phrase("Love", 1.0, 1_usize),
            ActivationAddition::from_phrase("Hate", -1.0, 3_usize),
            ActivationAddition::from_phrase("I", 1.0, 1_usize),
        ];
        let dict = activation_dict(&m, &additions).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict[0].0, HookPoint::block(1));
        assert_eq!(dict[0].1.len(), 2);
        let sites: Vec<String> = hook_fns_from_additions(&m, &additions)
            .unwrap()
            .sites()
            .map(ToString::to_string)
            .collect();
        assert_eq!(sites, ["blocks.1.hook_resid_pre", "blocks.3.hook_resid_pre"]);
    }
}
