// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook points and hook functions.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookFn`] (an activation-mutation function), [`HookMap`] (the
//! site-to-function mapping produced by the hook compiler) and
//! [`HookRegistry`] (the hook state a model keeps between forward passes).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::Tensor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be read or
/// mutated.
///
/// Mirrors the `TransformerLens` hook point naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// ```
/// use candle_steer::HookPoint;
///
/// let hook = HookPoint::ResidPre(6);
/// assert_eq!(hook.to_string(), "blocks.6.hook_resid_pre");
///
/// let parsed: HookPoint = "blocks.6.hook_resid_pre".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`]; whether a custom point
/// resolves to a tensor is decided by the model when the hook is installed.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token embedding (`hook_embed`).
    Embed,
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Token-mixing (attention) output in layer `i` (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between mixing and MLP in layer `i`
    /// (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP output in layer `i` (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// After final layer norm (`hook_final_norm`).
    FinalNorm,
    /// Backend-specific hook point not covered by the standard enum.
    Custom(String),
}

impl HookPoint {
    /// The residual-stream injection point for a block number.
    ///
    /// Steering sweeps address layers by block number; this is the site
    /// they resolve to (`blocks.{layer}.hook_resid_pre`).
    #[must_use]
    pub const fn block(layer: usize) -> Self {
        Self::ResidPre(layer)
    }

    /// Layer index for per-layer hook points, `None` otherwise.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "hook_final_norm"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// A bare layer number means the residual stream before that block.
impl From<usize> for HookPoint {
    fn from(layer: usize) -> Self {
        Self::block(layer)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_final_norm" => return HookPoint::FinalNorm,
        _ => {}
    }

    if let Some(rest) = s.strip_prefix("blocks.") {
        if let Some((layer_str, suffix)) = rest.split_once('.') {
            if let Ok(layer) = layer_str.parse::<usize>() {
                return match suffix {
                    "hook_resid_pre" => HookPoint::ResidPre(layer),
                    "hook_attn_out" => HookPoint::AttnOut(layer),
                    "hook_resid_mid" => HookPoint::ResidMid(layer),
                    "hook_mlp_out" => HookPoint::MlpOut(layer),
                    "hook_resid_post" => HookPoint::ResidPost(layer),
                    _ => HookPoint::Custom(s.to_string()),
                };
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

impl Serialize for HookPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts either a hook string or a bare block number.
impl<'de> Deserialize<'de> for HookPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Layer(usize),
            Name(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Layer(layer) => Self::block(layer),
            Raw::Name(name) => parse_hook_string(&name),
        })
    }
}

// ---------------------------------------------------------------------------
// HookFn / HookMap
// ---------------------------------------------------------------------------

/// Activation-mutation function installed at a hook point.
///
/// Receives the activation flowing through the hook point (`[batch, seq,
/// d_model]` for residual-stream sites) and returns the replacement.
// TRAIT_OBJECT: hooks are heterogeneous closures shared between the compiler and the model
pub type HookFn = Arc<dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync>;

/// Mapping from injection site to the function applied there.
///
/// Produced by [`hook_fns_from_additions`](crate::hook_fns_from_additions)
/// and consumed by [`InterventionSession`](crate::InterventionSession).
/// Keeps insertion order so installation is deterministic.
#[derive(Clone, Default)]
pub struct HookMap {
    /// `(site, hook)` pairs, at most one per site.
    entries: Vec<(HookPoint, HookFn)>,
}

impl HookMap {
    /// Create an empty mapping (a baseline run).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hook for `site`, replacing any previous one.
    pub fn insert<H: Into<HookPoint>>(&mut self, site: H, hook: HookFn) -> &mut Self {
        let site = site.into();
        if let Some(entry) = self.entries.iter_mut().find(|(s, _)| *s == site) {
            entry.1 = hook;
        } else {
            self.entries.push((site, hook));
        }
        self
    }

    /// The hook registered at `site`, if any.
    #[must_use]
    pub fn get(&self, site: &HookPoint) -> Option<&HookFn> {
        self.entries.iter().find(|(s, _)| s == site).map(|(_, h)| h)
    }

    /// Iterate over `(site, hook)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&HookPoint, &HookFn)> {
        self.entries.iter().map(|(s, h)| (s, h))
    }

    /// Sites with a hook, in insertion order.
    pub fn sites(&self) -> impl Iterator<Item = &HookPoint> {
        self.entries.iter().map(|(s, _)| s)
    }

    /// Number of sites with a hook.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for HookMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(s, _)| s.to_string()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HookRegistry
// ---------------------------------------------------------------------------

/// Hooks currently installed on a model.
///
/// This is the global, mutable hook state a model consults on every
/// forward pass. Only [`InterventionSession`](crate::InterventionSession)
/// adds or clears entries (through [`SteerableModel`](crate::SteerableModel)).
/// Several hooks may share a site; they run in installation order.
#[derive(Clone, Default)]
pub struct HookRegistry {
    /// Installed `(site, hook)` pairs.
    hooks: Vec<(HookPoint, HookFn)>,
}

impl HookRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook at `site`.
    pub fn add(&mut self, site: HookPoint, hook: HookFn) {
        self.hooks.push((site, hook));
    }

    /// Remove every installed hook.
    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    /// Number of installed hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hook is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Whether any hook targets `site`.
    #[must_use]
    pub fn has_hook_at(&self, site: &HookPoint) -> bool {
        self.hooks.iter().any(|(s, _)| s == site)
    }

    /// Run every hook installed at `site` over `tensor`.
    ///
    /// Returns `tensor` untouched when nothing is installed there.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by a hook.
    pub fn apply(&self, site: &HookPoint, tensor: Tensor) -> Result<Tensor> {
        let mut out = tensor;
        for (_, hook) in self.hooks.iter().filter(|(s, _)| s == site) {
            out = hook(&out)?;
        }
        Ok(out)
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field(
                "sites",
                &self.hooks.iter().map(|(s, _)| s.to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::FinalNorm, "hook_final_norm"),
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::AttnOut(2), "blocks.2.hook_attn_out"),
            (HookPoint::ResidMid(11), "blocks.11.hook_resid_mid"),
            (HookPoint::MlpOut(4), "blocks.4.hook_mlp_out"),
            (HookPoint::ResidPost(9), "blocks.9.hook_resid_post"),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "blocks.3.attn.hook_q".parse().unwrap();
        assert_eq!(hook, HookPoint::Custom("blocks.3.attn.hook_q".to_string()));
    }

    #[test]
    fn serde_accepts_layer_numbers_and_names() {
        let sites: Vec<HookPoint> =
            serde_json::from_str(r#"[6, "blocks.2.hook_mlp_out"]"#).unwrap();
        assert_eq!(sites, vec![HookPoint::ResidPre(6), HookPoint::MlpOut(2)]);
        let json = serde_json::to_string(&HookPoint::block(20)).unwrap();
        assert_eq!(json, r#""blocks.20.hook_resid_pre""#);
    }

    #[test]
    fn hook_map_replaces_per_site() {
        let identity: HookFn = Arc::new(|t: &Tensor| -> Result<Tensor> { Ok(t.clone()) });
        let mut map = HookMap::new();
        map.insert(3_usize, Arc::clone(&identity))
            .insert("blocks.3.hook_resid_pre", Arc::clone(&identity))
            .insert(HookPoint::Embed, identity);
        assert_eq!(map.len(), 2);
        let sites: Vec<_> = map.sites().cloned().collect();
        assert_eq!(sites, vec![HookPoint::ResidPre(3), HookPoint::Embed]);
    }

    #[test]
    fn registry_applies_hooks_in_order() {
        let mut registry = HookRegistry::new();
        let site = HookPoint::ResidPre(0);
        registry.add(site.clone(), Arc::new(|t: &Tensor| -> Result<Tensor> { Ok((t + 1.0)?) }));
        registry.add(site.clone(), Arc::new(|t: &Tensor| -> Result<Tensor> { Ok((t * 3.0)?) }));
        registry.add(HookPoint::Embed, Arc::new(|t: &Tensor| -> Result<Tensor> { Ok(t.zeros_like()?) }));

        let x = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let out = registry.apply(&site, x).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![6.0; 4]);

        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.has_hook_at(&site));
    }
}
