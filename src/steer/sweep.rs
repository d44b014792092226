// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sweep runners: completions and metrics over every addition set.
//!
//! Both runners compile every addition set before touching the model's
//! hook state, then visit the sets strictly in order, one
//! [`InterventionSession`](crate::InterventionSession) at a time.

use tracing::info;

use crate::backend::{GenerationResult, SteerableModel};
use crate::config::{GenerationConfig, SweepConfig};
use crate::error::Result;
use crate::hooks::HookMap;
use crate::metrics::MetricSet;
use crate::steer::addition::AdditionSet;
use crate::steer::compile::hook_fns_from_additions;
use crate::steer::session::with_hooks;
use crate::table::{Cell, ResultTable};

/// Column tagging intervened rows with their addition set.
pub const SET_INDEX_COLUMN: &str = "rich_prompt_index";

/// Columns of a completion table before metrics are added.
const COMPLETION_COLUMNS: [&str; 5] = ["completion_index", "prompts", "completions", "loss", "is_modified"];

/// Output of [`sweep_over_prompts`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSweep {
    /// Baseline completions, no `rich_prompt_index`.
    pub normal: ResultTable,
    /// Intervened completions, tagged with `rich_prompt_index`.
    pub patched: ResultTable,
}

/// Generate baseline and intervened completions for every prompt.
///
/// For each prompt: `num_normal_completions` completions with no hooks,
/// then `num_patched_completions` completions under each addition set.
/// Every generation call uses `config.seed`. When `metrics` is given, it
/// is applied afterwards to `prompts + completions` of both tables on the
/// un-hooked model.
///
/// Columns: `completion_index` (trial within its batch), `prompts`,
/// `completions`, `loss`, `is_modified`, metric columns, and
/// `rich_prompt_index` for intervened rows.
///
/// # Errors
///
/// Returns [`SteerError::Config`](crate::SteerError::Config) for an invalid
/// config before any work. Compilation, generation and metric errors abort
/// the sweep.
pub fn sweep_over_prompts<M: SteerableModel>(
    model: &mut M,
    prompts: &[String],
    sets: &[AdditionSet],
    config: &SweepConfig,
    metrics: Option<&MetricSet<M>>,
) -> Result<CompletionSweep> {
    config.validate()?;
    let compiled = compile_sets(model, sets)?;
    let generation = config.generation_config();

    let mut normal = Vec::with_capacity(prompts.len());
    let mut patched = Vec::with_capacity(prompts.len() * compiled.len());

    for (prompt_idx, prompt) in prompts.iter().enumerate() {
        info!(prompt = prompt_idx, of = prompts.len(), "sweeping prompt");

        let baseline = generate_batch(
            model,
            &HookMap::new(),
            prompt,
            config.num_normal_completions,
            &generation,
        )?;
        normal.push(completion_table(&baseline, false)?);

        for (set_idx, hooks) in compiled.iter().enumerate() {
            let results = generate_batch(
                model,
                hooks,
                prompt,
                config.num_patched_completions,
                &generation,
            )?;
            let mut table = completion_table(&results, true)?;
            table.add_constant_column(SET_INDEX_COLUMN, &Cell::from(set_idx))?;
            patched.push(table);
        }
    }

    let mut normal = concat_or_empty(&normal, &COMPLETION_COLUMNS, false);
    let mut patched = concat_or_empty(&patched, &COMPLETION_COLUMNS, true);

    if let Some(metrics) = metrics {
        normal = metrics.add_metric_cols(&normal, &["prompts", "completions"], model)?;
        patched = metrics.add_metric_cols(&patched, &["prompts", "completions"], model)?;
    }

    Ok(CompletionSweep { normal, patched })
}

/// Score fixed texts under every addition set.
///
/// Metrics run inside each set's session and receive the hooked model, so
/// their values reflect the intervention. Columns: `text_index`, `text`,
/// metric columns, `rich_prompt_index`. With no sets the table is empty
/// but keeps that layout.
///
/// # Errors
///
/// Compilation, installation and metric errors abort the sweep.
pub fn sweep_over_metrics<M: SteerableModel>(
    model: &mut M,
    texts: &[String],
    sets: &[AdditionSet],
    metrics: &MetricSet<M>,
) -> Result<ResultTable> {
    let compiled = compile_sets(model, sets)?;

    let mut base = ResultTable::new(["text_index", "text"]);
    for (idx, text) in texts.iter().enumerate() {
        base.push_row(vec![Cell::from(idx), Cell::from(text.as_str())])?;
    }

    let mut tables = Vec::with_capacity(compiled.len());
    for (set_idx, hooks) in compiled.iter().enumerate() {
        info!(set = set_idx, of = compiled.len(), "scoring texts");
        let mut table =
            with_hooks(model, hooks, |hooked| metrics.add_metric_cols(&base, &["text"], hooked))?;
        table.add_constant_column(SET_INDEX_COLUMN, &Cell::from(set_idx))?;
        tables.push(table);
    }

    if tables.is_empty() {
        // Zero-row scoring still yields every metric column.
        let empty = ResultTable::new(["text_index", "text"]);
        let mut table = metrics.add_metric_cols(&empty, &["text"], &*model)?;
        table.add_constant_column(SET_INDEX_COLUMN, &Cell::Null)?;
        return Ok(table);
    }
    Ok(ResultTable::concat(&tables))
}

/// Compile every set against the clean model.
fn compile_sets<M: SteerableModel>(model: &mut M, sets: &[AdditionSet]) -> Result<Vec<HookMap>> {
    // Phrase activations must not see hooks left by an earlier caller.
    with_hooks(model, &HookMap::new(), |clean| {
        sets.iter()
            .map(|set| hook_fns_from_additions(clean, set))
            .collect()
    })
}

/// `n` completions of one prompt under `hooks`.
fn generate_batch<M: SteerableModel>(
    model: &mut M,
    hooks: &HookMap,
    prompt: &str,
    n: usize,
    generation: &GenerationConfig,
) -> Result<Vec<GenerationResult>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let batch = vec![prompt.to_string(); n];
    with_hooks(model, hooks, |hooked| hooked.generate(&batch, generation))
}

/// Rows for one generated batch.
fn completion_table(results: &[GenerationResult], is_modified: bool) -> Result<ResultTable> {
    let mut table = ResultTable::new(COMPLETION_COLUMNS);
    for (idx, result) in results.iter().enumerate() {
        table.push_row(vec![
            Cell::from(idx),
            Cell::from(result.prompt.as_str()),
            Cell::from(result.completion.as_str()),
            Cell::from(result.loss),
            Cell::Bool(is_modified),
        ])?;
    }
    Ok(table)
}

/// Concatenate batches, keeping the column layout when there are none.
fn concat_or_empty(tables: &[ResultTable], columns: &[&str], tagged: bool) -> ResultTable {
    if tables.is_empty() {
        let names = columns.iter().copied().chain(tagged.then_some(SET_INDEX_COLUMN));
        ResultTable::new(names)
    } else {
        ResultTable::concat(tables)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::config::TinyModelConfig;
    use crate::error::SteerError;
    use crate::metrics::{LossMetric, WordCountMetric};
    use crate::steer::addition::ActivationAddition;
    use crate::tiny::TinyResidualModel;
    use crate::tokenizer::WordTokenizer;

    fn model() -> TinyResidualModel {
        let tok = WordTokenizer::from_corpus(["I think you are nice Love Hate"]);
        TinyResidualModel::new(TinyModelConfig::default(), tok.into(), &Device::Cpu).unwrap()
    }

    fn config() -> SweepConfig {
        SweepConfig {
            num_normal_completions: 2,
            num_patched_completions: 3,
            tokens_to_generate: 4,
            seed: Some(0),
            ..SweepConfig::default()
        }
    }

    fn sets() -> Vec<AdditionSet> {
        vec![
            vec![ActivationAddition::from_phrase("Love", 5.0, 1_usize)],
            vec![
                ActivationAddition::from_phrase("Love", 2.0, 3_usize),
                ActivationAddition::from_phrase("Hate", -2.0, 3_usize),
            ],
        ]
    }

    #[test]
    fn completion_sweep_shapes_and_tags() {
        let mut m = model();
        let prompts = vec!["I think".to_string(), "you are".to_string()];
        let out = sweep_over_prompts(&mut m, &prompts, &sets(), &config(), None).unwrap();

        assert_eq!(out.normal.len(), 4);
        assert_eq!(out.patched.len(), 12);
        assert!(!out.normal.has_column(SET_INDEX_COLUMN));
        assert_eq!(out.patched.get(0, SET_INDEX_COLUMN), Some(&Cell::Int(0)));
        assert_eq!(out.patched.get(3, SET_INDEX_COLUMN), Some(&Cell::Int(1)));
        assert_eq!(out.patched.get(6, "prompts"), Some(&Cell::Text("you are".into())));
        assert_eq!(out.patched.get(2, "completion_index"), Some(&Cell::Int(2)));
        assert_eq!(out.normal.get(0, "is_modified"), Some(&Cell::Bool(false)));
        assert_eq!(out.patched.get(0, "is_modified"), Some(&Cell::Bool(true)));
        assert_eq!(m.num_hooks(), 0);
    }

    #[test]
    fn same_seed_same_baselines() {
        let mut m = model();
        let prompts = vec!["I think".to_string()];
        let a = sweep_over_prompts(&mut m, &prompts, &[], &config(), None).unwrap();
        let b = sweep_over_prompts(&mut m, &prompts, &[], &config(), None).unwrap();
        assert_eq!(a.normal, b.normal);
        assert!(a.patched.is_empty());
        assert!(a.patched.has_column(SET_INDEX_COLUMN));
    }

    #[test]
    fn metrics_are_added_to_both_tables() {
        let mut m = model();
        let metrics = MetricSet::new()
            .with("nice", WordCountMetric::new(["nice"]))
            .with("clean", LossMetric);
        let out = sweep_over_prompts(
            &mut m,
            &["I think".to_string()],
            &sets(),
            &config(),
            Some(&metrics),
        )
        .unwrap();
        for table in [&out.normal, &out.patched] {
            assert!(table.has_column("nice_count"));
            assert!(table.has_column("clean_loss"));
        }
    }

    #[test]
    fn invalid_config_fails_before_generation() {
        let mut m = model();
        let bad = SweepConfig {
            tokens_to_generate: 0,
            ..config()
        };
        let err = sweep_over_prompts(&mut m, &["I".to_string()], &sets(), &bad, None);
        assert!(matches!(err, Err(SteerError::Config(_))));
    }

    #[test]
    fn metric_sweep_scores_under_each_set() {
        let mut m = model();
        let texts = vec!["I think you are nice".to_string(), "Love".to_string()];
        let metrics = MetricSet::new().with("steered", LossMetric);
        let table = sweep_over_metrics(&mut m, &texts, &sets(), &metrics).unwrap();

        assert_eq!(table.columns(), ["text_index", "text", "steered_loss", SET_INDEX_COLUMN]);
        assert_eq!(table.len(), 4);
        assert_eq!(table.get(2, "text_index"), Some(&Cell::Int(0)));
        assert_eq!(table.get(2, SET_INDEX_COLUMN), Some(&Cell::Int(1)));
        // Different interventions give different losses for the same text.
        assert_ne!(table.get(0, "steered_loss"), table.get(2, "steered_loss"));
        assert_eq!(m.num_hooks(), 0);
    }

    #[test]
    fn empty_metric_sweep_keeps_layout_and_reduces() {
        let mut m = model();
        let metrics = MetricSet::new()
            .with("nice", WordCountMetric::new(["nice"]))
            .with("steered", LossMetric);
        let table = sweep_over_metrics(&mut m, &["I think".to_string()], &[], &metrics).unwrap();
        assert!(table.is_empty());
        assert_eq!(
            table.columns(),
            ["text_index", "text", "nice_count", "steered_loss", SET_INDEX_COLUMN]
        );

        let provenance = ResultTable::new([SET_INDEX_COLUMN, "act_name", "coeff"]);
        let reduced = crate::steer::reduce::reduce_metric_sweep(&table, &provenance).unwrap();
        assert!(reduced.is_empty());
        assert!(reduced.has_column(SET_INDEX_COLUMN));
        assert!(reduced.has_column("act_name"));
    }
}
