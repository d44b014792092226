// SPDX-License-Identifier: MIT OR Apache-2.0

//! Completion sweep on the tiny reference model.
//!
//! ```bash
//! cargo run --example sweep_tiny -- --out-dir sweep_out
//! cargo run --example sweep_tiny -- --config experiment.json --out-dir sweep_out
//! ```
//!
//! Without `--config`, sweeps a "Love" minus "Hate" pair over blocks 0 and
//! 5 at coefficients 1 and 10. Writes `normal.json`, `patched.json`,
//! `reduced_normal.json` and `reduced_patched.json` to `--out-dir`.

use std::path::PathBuf;

use candle_core::Device;
use candle_steer::{
    reduce_sweep_results, sweep_over_prompts, ExperimentConfig, HookPoint, LossMetric, MetricSet,
    SweepConfig, TinyResidualModel, WordCountMetric, WordTokenizer,
};
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(name = "sweep_tiny")]
#[command(about = "Sweep activation additions over the tiny reference model")]
struct Args {
    /// Experiment JSON file (prompts, phrases, sites, coeffs, sweep, model)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the JSON result tables
    #[arg(long, default_value = "sweep_out")]
    out_dir: PathBuf,

    /// Override the sweep seed
    #[arg(long)]
    seed: Option<u64>,
}

fn default_experiment() -> ExperimentConfig {
    ExperimentConfig {
        prompts: vec!["I hate you because".into(), "I went up to my friend and said".into()],
        phrases: vec![vec![("Love".into(), 1.0), ("Hate".into(), -1.0)]],
        sites: vec![HookPoint::block(0), HookPoint::block(5)],
        coeffs: vec![1.0, 10.0],
        sweep: SweepConfig {
            num_normal_completions: 4,
            num_patched_completions: 4,
            tokens_to_generate: 12,
            seed: Some(0),
            ..SweepConfig::default()
        },
        ..ExperimentConfig::default()
    }
}

fn main() -> candle_steer::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut experiment = match &args.config {
        Some(path) => ExperimentConfig::from_file(path)?,
        None => default_experiment(),
    };
    if args.seed.is_some() {
        experiment.sweep.seed = args.seed;
    }

    // Vocabulary: every prompt and phrase, plus some words to generate.
    let corpus = experiment
        .prompts
        .iter()
        .cloned()
        .chain(experiment.phrases.iter().flatten().map(|(p, _)| p.clone()))
        .chain(std::iter::once(
            "love wedding happy kind hate angry sad because friend".to_string(),
        ));
    let tokenizer = WordTokenizer::from_corpus(corpus);
    let mut model =
        TinyResidualModel::new(experiment.model.clone(), tokenizer.into(), &Device::Cpu)?;

    let sweep = experiment.sweep_spec().build(Some(&model))?;
    info!(sets = sweep.len(), prompts = experiment.prompts.len(), "starting sweep");

    let metrics = MetricSet::new()
        .with("love", WordCountMetric::new(["love", "happy", "kind", "wedding"]))
        .with("clean", LossMetric);

    let out = sweep_over_prompts(
        &mut model,
        &experiment.prompts,
        sweep.sets(),
        &experiment.sweep,
        Some(&metrics),
    )?;
    let reduced = reduce_sweep_results(&out.normal, &out.patched, &sweep.provenance_table()?)?;

    std::fs::create_dir_all(&args.out_dir)?;
    out.normal.write_json(args.out_dir.join("normal.json"))?;
    out.patched.write_json(args.out_dir.join("patched.json"))?;
    reduced.normal.write_json(args.out_dir.join("reduced_normal.json"))?;
    reduced.patched.write_json(args.out_dir.join("reduced_patched.json"))?;

    println!("{}", reduced.patched.columns().join("\t"));
    for row in reduced.patched.rows() {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| serde_json::to_string(cell).unwrap_or_default())
            .collect();
        println!("{}", cells.join("\t"));
    }
    info!(out_dir = %args.out_dir.display(), "wrote result tables");
    Ok(())
}
