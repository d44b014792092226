// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering-vector magnitudes relative to the residual stream, and a
//! matched random-direction control.
//!
//! ```bash
//! cargo run --example magnitudes -- --layer 2 --coeff 5
//! ```

use candle_core::Device;
use candle_steer::{
    hook_fn_from_activations, prompt_magnitudes, random_matched_vector, steering_pair,
    steering_vec_magnitudes, with_hooks, HookMap, HookPoint, PairPadding, SteerableModel,
    TinyModelConfig, TinyResidualModel, WordTokenizer,
};
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(name = "magnitudes")]
#[command(about = "Compare steering and residual-stream norms on the tiny model")]
struct Args {
    /// Block whose residual stream is steered
    #[arg(long, default_value_t = 2)]
    layer: usize,

    /// Steering coefficient
    #[arg(long, default_value_t = 5.0)]
    coeff: f64,

    /// Prompt to measure
    #[arg(long, default_value = "I went up to my friend and said")]
    prompt: String,

    /// Seed for the random control vector
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> candle_steer::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let tokenizer = WordTokenizer::from_corpus([args.prompt.as_str(), "Anger Calm"]);
    let mut model =
        TinyResidualModel::new(TinyModelConfig::default(), tokenizer.into(), &Device::Cpu)?;
    let site = HookPoint::block(args.layer);

    let pair = steering_pair(&model, "Anger", "Calm", args.coeff, site.clone(), PairPadding::Space)?;
    let steering = steering_vec_magnitudes(&model, &pair)?;
    let prompt = prompt_magnitudes(&model, &args.prompt, &site)?;

    println!("pos\tprompt\tsteering\tratio");
    for (pos, p) in prompt.iter().enumerate() {
        match steering.get(pos) {
            Some(s) => println!("{pos}\t{p:.3}\t{s:.3}\t{:.3}", s / p),
            None => println!("{pos}\t{p:.3}\t-\t-"),
        }
    }

    // Random direction with the same per-position norms.
    let control = random_matched_vector(&steering, model.hidden_size(), args.seed, model.device())?;
    let mut hooks = HookMap::new();
    hooks.insert(site, hook_fn_from_activations(control)?);

    let tokens = model.to_tokens(&args.prompt)?;
    let clean = mean_loss(&model, &tokens)?;
    let random = with_hooks(&mut model, &hooks, |m| mean_loss(m, &tokens))?;
    info!(clean, random, "loss under random control vector");
    println!("loss: clean {clean:.4}, random control {random:.4}");
    Ok(())
}

/// Mean next-token loss of `tokens`.
fn mean_loss(model: &TinyResidualModel, tokens: &[u32]) -> candle_steer::Result<f32> {
    let losses = candle_steer::token_losses(&model.logits(tokens)?, tokens)?;
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let n = losses.len().max(1) as f32;
    Ok(losses.iter().sum::<f32>() / n)
}
