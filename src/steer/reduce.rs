// SPDX-License-Identifier: MIT OR Apache-2.0

//! Averaging repeated trials and joining provenance.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::steer::sweep::SET_INDEX_COLUMN;
use crate::table::ResultTable;

/// Per-row counters that are not averaged, even though they are numeric.
pub const INDEX_COLUMNS: [&str; 2] = ["completion_index", "text_index"];

/// Reduced completion sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedSweep {
    /// Baseline means, one row per prompt.
    pub normal: ResultTable,
    /// Intervened means, one row per `(prompt, rich_prompt_index)`, joined
    /// with the provenance columns.
    pub patched: ResultTable,
}

/// Average trials and attach provenance.
///
/// Baseline rows are grouped by `prompts`; intervened rows by `prompts` and
/// `rich_prompt_index`, then left-joined with `provenance` on
/// `rich_prompt_index`. Every numeric column except [`INDEX_COLUMNS`] is
/// averaged; text and boolean columns are dropped. This is narrower than
/// a mean over all numeric columns: `completion_index` is never averaged,
/// and `is_modified` is dropped rather than averaged as 0/1.
///
/// # Errors
///
/// Returns [`SteerError::Table`](crate::SteerError::Table) if a grouping
/// column is missing or provenance shares a column name with the averages.
pub fn reduce_sweep_results(
    normal: &ResultTable,
    patched: &ResultTable,
    provenance: &ResultTable,
) -> Result<ReducedSweep> {
    let normal = normal.group_mean(&["prompts"], &INDEX_COLUMNS)?;
    let patched = patched
        .group_mean(&["prompts", SET_INDEX_COLUMN], &INDEX_COLUMNS)?
        .left_join(provenance, SET_INDEX_COLUMN)?;
    Ok(ReducedSweep { normal, patched })
}

/// Average a metric sweep over its texts, one row per addition set, joined
/// with `provenance`.
///
/// # Errors
///
/// As [`reduce_sweep_results`].
pub fn reduce_metric_sweep(patched: &ResultTable, provenance: &ResultTable) -> Result<ResultTable> {
    patched
        .group_mean(&[SET_INDEX_COLUMN], &INDEX_COLUMNS)?
        .left_join(provenance, SET_INDEX_COLUMN)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::table::Cell;

    fn provenance() -> ResultTable {
        let mut table = ResultTable::new([SET_INDEX_COLUMN, "act_name", "coeff"]);
        table
            .push_row(vec![Cell::Int(0), "blocks.0.hook_resid_pre".into(), Cell::Float(1.0)])
            .unwrap();
        table
            .push_row(vec![Cell::Int(1), "blocks.5.hook_resid_pre".into(), Cell::Float(10.0)])
            .unwrap();
        table
    }

    /// 2 prompts x 2 sets x 3 trials; loss = 10 * prompt + set + trial.
    fn patched() -> ResultTable {
        let mut table = ResultTable::new([
            "completion_index",
            "prompts",
            "completions",
            "loss",
            "is_modified",
            SET_INDEX_COLUMN,
        ]);
        for (p, prompt) in ["I think", "You are"].iter().enumerate() {
            for set in 0..2_usize {
                for trial in 0..3_usize {
                    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
                    let loss = (10 * p + set + trial) as f64;
                    table
                        .push_row(vec![
                            Cell::from(trial),
                            Cell::from(*prompt),
                            "...".into(),
                            Cell::Float(loss),
                            Cell::Bool(true),
                            Cell::from(set),
                        ])
                        .unwrap();
                }
            }
        }
        table
    }

    #[test]
    fn four_rows_with_trial_means_and_provenance() {
        let normal = ResultTable::new(["completion_index", "prompts", "completions", "loss"]);
        let reduced = reduce_sweep_results(&normal, &patched(), &provenance()).unwrap();
        let table = &reduced.patched;

        assert_eq!(table.len(), 4);
        assert_eq!(
            table.columns(),
            ["prompts", SET_INDEX_COLUMN, "loss", "act_name", "coeff"]
        );
        // mean of {s, s+1, s+2} + 10 p = 10 p + s + 1
        assert_eq!(table.get(0, "loss"), Some(&Cell::Float(1.0)));
        assert_eq!(table.get(1, "loss"), Some(&Cell::Float(2.0)));
        assert_eq!(table.get(2, "loss"), Some(&Cell::Float(11.0)));
        assert_eq!(table.get(3, "loss"), Some(&Cell::Float(12.0)));
        assert_eq!(table.get(3, "coeff"), Some(&Cell::Float(10.0)));
        assert_eq!(
            table.get(2, "act_name"),
            Some(&Cell::Text("blocks.0.hook_resid_pre".into()))
        );
        assert!(reduced.normal.is_empty());
    }

    #[test]
    fn baseline_is_grouped_by_prompt_only() {
        let mut normal = ResultTable::new(["completion_index", "prompts", "loss"]);
        for (i, (prompt, loss)) in [("a", 1.0), ("a", 2.0), ("b", 4.0)].into_iter().enumerate() {
            normal
                .push_row(vec![Cell::from(i), Cell::from(prompt), Cell::Float(loss)])
                .unwrap();
        }
        let reduced = reduce_sweep_results(&normal, &patched(), &provenance()).unwrap();
        assert_eq!(reduced.normal.columns(), ["prompts", "loss"]);
        assert_eq!(reduced.normal.get(0, "loss"), Some(&Cell::Float(1.5)));
        assert_eq!(reduced.normal.get(1, "loss"), Some(&Cell::Float(4.0)));
    }

    #[test]
    fn metric_sweep_reduces_per_set() {
        let mut sweep = ResultTable::new(["text_index", "text", "m_loss", SET_INDEX_COLUMN]);
        for (set, loss) in [(0_usize, 1.0), (0, 3.0), (1, 5.0), (1, 9.0)] {
            sweep
                .push_row(vec![Cell::Int(0), "t".into(), Cell::Float(loss), Cell::from(set)])
                .unwrap();
        }
        let reduced = reduce_metric_sweep(&sweep, &provenance()).unwrap();
        assert_eq!(reduced.columns(), [SET_INDEX_COLUMN, "m_loss", "act_name", "coeff"]);
        assert_eq!(reduced.get(0, "m_loss"), Some(&Cell::Float(2.0)));
        assert_eq!(reduced.get(1, "m_loss"), Some(&Cell::Float(7.0)));
    }
}
