// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scoped hook installation.
//!
//! [`InterventionSession`] is the only code path that installs or removes
//! hooks on a model. It clears the model's hook state on open and again on
//! drop, so every exit (scope end, `?`, panic unwinding) leaves the model
//! without hooks. The session holds the unique `&mut` borrow of the model,
//! which rules out a second session on the same instance while it lives.

use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use crate::backend::SteerableModel;
use crate::error::Result;
use crate::hooks::HookMap;

/// RAII guard over a model with a hook mapping installed.
///
/// Derefs to the model for generation and scoring.
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use candle_steer::{
///     hook_fns_from_additions, ActivationAddition, InterventionSession, SteerableModel,
///     TinyModelConfig, TinyResidualModel, WordTokenizer,
/// };
///
/// # fn main() -> candle_steer::Result<()> {
/// let tok = WordTokenizer::from_corpus(["Love Hate I think"]);
/// let mut model = TinyResidualModel::new(TinyModelConfig::default(), tok.into(), &Device::Cpu)?;
/// let set = [ActivationAddition::from_phrase("Love", 5.0, 2_usize)];
/// let hooks = hook_fns_from_additions(&model, &set)?;
///
/// {
///     let session = InterventionSession::open(&mut model, &hooks)?;
///     assert_eq!(session.num_hooks(), 1);
///     let _steered = session.logits(&session.to_tokens("I think")?)?;
/// }
/// assert_eq!(model.num_hooks(), 0);
/// # Ok(())
/// # }
/// ```
#[must_use = "hooks are removed as soon as the session is dropped"]
pub struct InterventionSession<'m, M: SteerableModel + ?Sized> {
    /// The hooked model.
    model: &'m mut M,
}

impl<'m, M: SteerableModel + ?Sized> InterventionSession<'m, M> {
    /// Clear the model's hooks, then install `hooks`.
    ///
    /// # Errors
    ///
    /// Returns the model's [`SteerError::Hook`](crate::SteerError::Hook) if a
    /// site cannot be installed; the model is left with no hooks.
    pub fn open(model: &'m mut M, hooks: &HookMap) -> Result<Self> {
        model.remove_all_hooks();
        for (site, hook) in hooks.iter() {
            if let Err(e) = model.add_hook(site.clone(), Arc::clone(hook)) {
                model.remove_all_hooks();
                return Err(e);
            }
        }
        debug!(hooks = hooks.len(), "installed hooks");
        Ok(Self { model })
    }

    /// Run `f` against the hooked model, then close the session.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error unchanged; hooks are already removed by then.
    pub fn run<T>(self, f: impl FnOnce(&M) -> Result<T>) -> Result<T> {
        f(&*self.model)
    }
}

impl<M: SteerableModel + ?Sized> Deref for InterventionSession<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &*self.model
    }
}

impl<M: SteerableModel + ?Sized> Drop for InterventionSession<'_, M> {
    fn drop(&mut self) {
        self.model.remove_all_hooks();
        debug!("removed hooks");
    }
}

/// Run `f` with `hooks` installed on `model`, removing them afterwards.
///
/// An empty mapping gives a baseline run on a model guaranteed to have no
/// leftover hooks.
///
/// # Errors
///
/// Returns installation errors, or `f`'s error unchanged.
pub fn with_hooks<M, T>(model: &mut M, hooks: &HookMap, f: impl FnOnce(&M) -> Result<T>) -> Result<T>
where
    M: SteerableModel + ?Sized,
{
    InterventionSession::open(model, hooks)?.run(f)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use candle_core::{Device, Tensor};

    use super::*;
    use crate::config::TinyModelConfig;
    use crate::error::SteerError;
    use crate::hooks::{HookFn, HookPoint};
    use crate::tiny::TinyResidualModel;
    use crate::tokenizer::WordTokenizer;

    fn model() -> TinyResidualModel {
        let tok = WordTokenizer::from_corpus(["a b c"]);
        TinyResidualModel::new(TinyModelConfig::default(), tok.into(), &Device::Cpu).unwrap()
    }

    fn identity() -> HookFn {
        Arc::new(|t: &Tensor| -> Result<Tensor> { Ok(t.clone()) })
    }

    fn two_hooks() -> HookMap {
        let mut hooks = HookMap::new();
        hooks.insert(1_usize, identity());
        hooks.insert(HookPoint::MlpOut(2), identity());
        hooks
    }

    #[test]
    fn hooks_are_installed_then_removed() {
        let mut m = model();
        {
            let session = InterventionSession::open(&mut m, &two_hooks()).unwrap();
            assert_eq!(session.num_hooks(), 2);
        }
        assert_eq!(m.num_hooks(), 0);
    }

    #[test]
    fn open_clears_preexisting_hooks() {
        let mut m = model();
        m.add_hook(HookPoint::Embed, identity()).unwrap();
        let session = InterventionSession::open(&mut m, &HookMap::new()).unwrap();
        assert_eq!(session.num_hooks(), 0);
    }

    #[test]
    fn error_propagates_unchanged_after_cleanup() {
        let mut m = model();
        let result: Result<()> = with_hooks(&mut m, &two_hooks(), |hooked| {
            assert_eq!(hooked.num_hooks(), 2);
            Err(SteerError::Metric("boom".into()))
        });
        assert!(matches!(result, Err(SteerError::Metric(msg)) if msg == "boom"));
        assert_eq!(m.num_hooks(), 0);
    }

    #[test]
    fn failed_install_leaves_no_hooks() {
        let mut m = model();
        let mut hooks = two_hooks();
        hooks.insert(HookPoint::Custom("not.a.site".into()), identity());
        assert!(matches!(
            InterventionSession::open(&mut m, &hooks),
            Err(SteerError::Hook(_))
        ));
        assert_eq!(m.num_hooks(), 0);
    }

    #[test]
    fn panic_inside_session_still_cleans_up() {
        let mut m = model();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _ = with_hooks(&mut m, &two_hooks(), |_| -> Result<()> {
                panic!("generation blew up");
            });
        }));
        assert!(outcome.is_err());
        assert_eq!(m.num_hooks(), 0);
    }

    #[test]
    fn run_returns_the_closure_value() {
        let mut m = model();
        let n = InterventionSession::open(&mut m, &two_hooks())
            .unwrap()
            .run(|hooked| Ok(hooked.num_hooks()))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(m.num_hooks(), 0);
    }
}
