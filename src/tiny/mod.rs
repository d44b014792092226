// SPDX-License-Identifier: MIT OR Apache-2.0

//! Small deterministic reference model.
//!
//! [`TinyResidualModel`] is a pre-norm residual network with the same hook
//! layout as a decoder-only transformer block: a causal token-mixing
//! sub-block (uniform attention over the prefix) followed by a GELU MLP.
//! Weights are drawn from a seeded RNG, so two models built from the same
//! [`TinyModelConfig`] and tokenizer are identical. It implements
//! [`SteerableModel`] and exists to exercise the sweep engine end to end
//! without downloading weights.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::{mean, sample_token, token_losses, GenerationResult, SteerableModel};
use crate::config::{GenerationConfig, TinyModelConfig};
use crate::error::{Result, SteerError};
use crate::hooks::{HookFn, HookPoint, HookRegistry};
use crate::tokenizer::SteerTokenizer;

// ---------------------------------------------------------------------------
// TinyBlock
// ---------------------------------------------------------------------------

/// One residual block: causal mixing, then MLP.
struct TinyBlock {
    /// Norm before the mixing sub-block.
    mix_norm: RmsNorm,
    /// Output projection of the mixing sub-block: `[hidden, hidden]`.
    mix_proj: Linear,
    /// Norm before the MLP.
    mlp_norm: RmsNorm,
    /// MLP up projection: `[hidden, intermediate]`.
    up: Linear,
    /// MLP down projection: `[intermediate, hidden]`.
    down: Linear,
}

impl TinyBlock {
    /// Draw the block's weights.
    fn init(config: &TinyModelConfig, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            mix_norm: rms_norm(hidden, config.norm_eps, device)?,
            mix_proj: linear(rng, hidden, hidden, device)?,
            mlp_norm: rms_norm(hidden, config.norm_eps, device)?,
            up: linear(rng, hidden, inter, device)?,
            down: linear(rng, inter, hidden, device)?,
        })
    }
}

// ---------------------------------------------------------------------------
// TinyResidualModel
// ---------------------------------------------------------------------------

/// Seeded residual model implementing [`SteerableModel`].
///
/// Hook points: [`HookPoint::Embed`], per layer `ResidPre`, `AttnOut`,
/// `ResidMid`, `MlpOut`, `ResidPost`, and [`HookPoint::FinalNorm`].
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use candle_steer::{SteerableModel, TinyModelConfig, TinyResidualModel, WordTokenizer};
///
/// # fn main() -> candle_steer::Result<()> {
/// let tokenizer = WordTokenizer::from_corpus(["I think you're nice"]);
/// let model = TinyResidualModel::new(TinyModelConfig::default(), tokenizer.into(), &Device::Cpu)?;
/// let tokens = model.to_tokens("I think")?;
/// let resid = model.activations_at(&tokens, &candle_steer::HookPoint::ResidPre(2))?;
/// assert_eq!(resid.dims(), &[1, 4, 32]);
/// # Ok(())
/// # }
/// ```
pub struct TinyResidualModel {
    /// Shape and seed.
    config: TinyModelConfig,
    /// Tokenizer.
    tokenizer: SteerTokenizer,
    /// Beginning-of-sequence token prepended by [`SteerableModel::to_tokens`].
    bos_id: u32,
    /// Device holding the weights.
    device: Device,
    /// Token embedding: `[vocab, hidden]`.
    embed: Embedding,
    /// Residual blocks.
    layers: Vec<TinyBlock>,
    /// Final norm.
    final_norm: RmsNorm,
    /// Unembedding: `[hidden, vocab]`.
    unembed: Linear,
    /// Installed hooks.
    hooks: HookRegistry,
}

impl TinyResidualModel {
    /// Build a model with seeded weights sized to the tokenizer's vocabulary.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] for an invalid config or empty
    /// vocabulary, [`SteerError::Tokenizer`] if the tokenizer has no BOS
    /// token, and [`SteerError::Model`] if weight creation fails.
    pub fn new(config: TinyModelConfig, tokenizer: SteerTokenizer, device: &Device) -> Result<Self> {
        config.validate()?;
        let vocab = tokenizer.vocab_size();
        if vocab == 0 {
            return Err(SteerError::Config("tokenizer vocabulary is empty".into()));
        }
        let bos_id = tokenizer.bos_id()?;

        let mut rng = StdRng::seed_from_u64(config.init_seed);
        let hidden = config.hidden_size;

        let embed = Embedding::new(uniform(&mut rng, (vocab, hidden), 1.0, device)?, hidden);
        let layers = (0..config.num_layers)
            .map(|_| TinyBlock::init(&config, &mut rng, device))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = rms_norm(hidden, config.norm_eps, device)?;
        let unembed = linear(&mut rng, hidden, vocab, device)?;

        Ok(Self {
            config,
            tokenizer,
            bos_id,
            // BORROW: explicit .clone() — Device is a cheap handle
            device: device.clone(),
            embed,
            layers,
            final_norm,
            unembed,
            hooks: HookRegistry::new(),
        })
    }

    /// The model's configuration.
    #[must_use]
    pub const fn config(&self) -> &TinyModelConfig {
        &self.config
    }

    /// The model's tokenizer.
    #[must_use]
    pub const fn tokenizer(&self) -> &SteerTokenizer {
        &self.tokenizer
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Whether `site` names an activation of this model.
    #[must_use]
    pub fn has_site(&self, site: &HookPoint) -> bool {
        match site {
            HookPoint::Embed | HookPoint::FinalNorm => true,
            HookPoint::Custom(_) => false,
            other => other.layer().is_some_and(|l| l < self.config.num_layers),
        }
    }

    /// Forward pass with installed hooks, optionally capturing one site.
    ///
    /// # Shapes
    /// - `tokens`: `seq` token IDs
    /// - returns: logits `[1, seq, vocab]` and the capture `[1, seq, hidden]`
    fn forward(&self, tokens: &[u32], capture: Option<&HookPoint>) -> Result<(Tensor, Option<Tensor>)> {
        if tokens.is_empty() {
            return Err(SteerError::Config("cannot run a forward pass on zero tokens".into()));
        }
        let ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let mut captured = None;

        let mut hidden = self.embed.forward(&ids)?;
        hidden = self.hook(&HookPoint::Embed, hidden, capture, &mut captured)?;

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            hidden = self.hook(&HookPoint::ResidPre(layer_idx), hidden, capture, &mut captured)?;

            // Causal mixing sub-block
            let mixed = causal_mean(&layer.mix_norm.forward(&hidden)?)?;
            let attn_out = layer.mix_proj.forward(&mixed)?;
            let attn_out = self.hook(&HookPoint::AttnOut(layer_idx), attn_out, capture, &mut captured)?;
            hidden = (hidden + attn_out)?;
            hidden = self.hook(&HookPoint::ResidMid(layer_idx), hidden, capture, &mut captured)?;

            // MLP sub-block
            let up = layer.up.forward(&layer.mlp_norm.forward(&hidden)?)?.gelu()?;
            let mlp_out = layer.down.forward(&up)?;
            let mlp_out = self.hook(&HookPoint::MlpOut(layer_idx), mlp_out, capture, &mut captured)?;
            hidden = (hidden + mlp_out)?;
            hidden = self.hook(&HookPoint::ResidPost(layer_idx), hidden, capture, &mut captured)?;
        }

        hidden = self.final_norm.forward(&hidden)?;
        hidden = self.hook(&HookPoint::FinalNorm, hidden, capture, &mut captured)?;

        let logits = self.unembed.forward(&hidden)?;
        Ok((logits, captured))
    }

    /// Run installed hooks at `site`, then capture the result if requested.
    fn hook(
        &self,
        site: &HookPoint,
        tensor: Tensor,
        capture: Option<&HookPoint>,
        captured: &mut Option<Tensor>,
    ) -> Result<Tensor> {
        let out = self.hooks.apply(site, tensor)?;
        if capture == Some(site) {
            *captured = Some(out.clone());
        }
        Ok(out)
    }

    /// Sample one completion.
    fn generate_one(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        rng: &mut StdRng,
    ) -> Result<GenerationResult> {
        let prompt_tokens = self.to_tokens(prompt)?;
        let prompt_len = prompt_tokens.len();
        let mut tokens = prompt_tokens.clone();

        for _ in 0..config.max_new_tokens {
            let logits = self.logits(&tokens)?;
            let last = logits.get(0)?.get(tokens.len() - 1)?;
            let next = sample_token(&last, &config.sampling, &tokens, rng)?;
            tokens.push(next);
        }

        let generated_tokens = tokens.get(prompt_len..).map(<[u32]>::to_vec).unwrap_or_default();
        let loss = if generated_tokens.is_empty() {
            None
        } else {
            let losses = token_losses(&self.logits(&tokens)?, &tokens)?;
            losses.get(prompt_len - 1..).and_then(mean)
        };

        Ok(GenerationResult {
            prompt: prompt.to_string(),
            completion: self.to_string(&generated_tokens)?,
            prompt_tokens,
            generated_tokens,
            loss,
        })
    }
}

impl SteerableModel for TinyResidualModel {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn to_tokens(&self, text: &str) -> Result<Vec<u32>> {
        let mut tokens = vec![self.bos_id];
        tokens.extend(self.tokenizer.encode(text)?);
        Ok(tokens)
    }

    fn to_string(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer.decode(tokens)
    }

    fn to_single_token(&self, text: &str) -> Result<u32> {
        match self.tokenizer.encode(text)?.as_slice() {
            [token] => Ok(*token),
            other => Err(SteerError::Tokenizer(format!(
                "{text:?} encodes to {} tokens, expected exactly one",
                other.len()
            ))),
        }
    }

    fn activations_at(&self, tokens: &[u32], site: &HookPoint) -> Result<Tensor> {
        if !self.has_site(site) {
            return Err(SteerError::Hook(format!("no hook point `{site}` in this model")));
        }
        let (_, captured) = self.forward(tokens, Some(site))?;
        captured.ok_or_else(|| SteerError::Hook(format!("hook point `{site}` was not captured")))
    }

    fn logits(&self, tokens: &[u32]) -> Result<Tensor> {
        Ok(self.forward(tokens, None)?.0)
    }

    fn generate(&self, prompts: &[String], config: &GenerationConfig) -> Result<Vec<GenerationResult>> {
        config.sampling.validate()?;
        let mut rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        prompts
            .iter()
            .map(|prompt| self.generate_one(prompt, config, &mut rng))
            .collect()
    }

    fn add_hook(&mut self, site: HookPoint, hook: HookFn) -> Result<()> {
        if !self.has_site(&site) {
            return Err(SteerError::Hook(format!("no hook point `{site}` in this model")));
        }
        self.hooks.add(site, hook);
        Ok(())
    }

    fn remove_all_hooks(&mut self) {
        self.hooks.clear();
    }

    fn num_hooks(&self) -> usize {
        self.hooks.len()
    }
}

impl std::fmt::Debug for TinyResidualModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TinyResidualModel")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Uniform `[-bound, bound)` weights.
fn uniform(rng: &mut StdRng, shape: (usize, usize), bound: f32, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Bias-free linear layer with `1/sqrt(fan_in)` uniform init.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn linear(rng: &mut StdRng, in_dim: usize, out_dim: usize, device: &Device) -> Result<Linear> {
    let bound = 1.0 / (in_dim as f32).sqrt();
    Ok(Linear::new(uniform(rng, (out_dim, in_dim), bound, device)?, None))
}

/// RMS norm with unit weight.
fn rms_norm(hidden: usize, eps: f64, device: &Device) -> Result<RmsNorm> {
    Ok(RmsNorm::new(Tensor::ones(hidden, DType::F32, device)?, eps))
}

/// Uniform causal attention: position `t` averages positions `0..=t`.
///
/// # Shapes
/// - `xs`: `[batch, seq, hidden]`
/// - returns: `[batch, seq, hidden]`
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn causal_mean(xs: &Tensor) -> Result<Tensor> {
    let (batch, seq, _) = xs.dims3()?;
    let mut weights = vec![0.0_f32; seq * seq];
    for (t, row) in weights.chunks_mut(seq).enumerate() {
        let w = 1.0 / (t + 1) as f32;
        for cell in row.iter_mut().take(t + 1) {
            *cell = w;
        }
    }
    let mix = Tensor::from_vec(weights, (1, seq, seq), xs.device())?
        .to_dtype(xs.dtype())?
        .broadcast_as((batch, seq, seq))?
        .contiguous()?;
    Ok(mix.matmul(&xs.contiguous()?)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
