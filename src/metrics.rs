// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text metrics scored against a model.
//!
//! A [`Metric`] receives the model explicitly. Inside an
//! [`InterventionSession`](crate::InterventionSession) that is the hooked
//! model, so a metric such as [`LossMetric`] reports the intervened value.
//! Callers decide the hook state by choosing where they call the metric.

use tracing::debug;

use crate::backend::{mean, token_losses, SteerableModel};
use crate::error::{Result, SteerError};
use crate::table::{Cell, ResultTable};

// ---------------------------------------------------------------------------
// Metric trait
// ---------------------------------------------------------------------------

/// Scores a batch of texts, one output row per input text.
///
/// Closures `Fn(&M, &[String]) -> Result<ResultTable>` implement this trait.
pub trait Metric<M: ?Sized> {
    /// Score `texts` against `model` in its current hook state.
    ///
    /// # Errors
    ///
    /// Implementation-defined; errors abort the sweep.
    fn score(&self, model: &M, texts: &[String]) -> Result<ResultTable>;
}

impl<M: ?Sized, F> Metric<M> for F
where
    F: Fn(&M, &[String]) -> Result<ResultTable>,
{
    fn score(&self, model: &M, texts: &[String]) -> Result<ResultTable> {
        self(model, texts)
    }
}

// ---------------------------------------------------------------------------
// MetricSet
// ---------------------------------------------------------------------------

/// Named metrics, applied in insertion order.
///
/// # Example
///
/// ```
/// use candle_steer::{LossMetric, MetricSet, TinyResidualModel, WordCountMetric};
///
/// let metrics: MetricSet<TinyResidualModel> = MetricSet::new()
///     .with("wedding_words", WordCountMetric::new(["wedding", "bride"]))
///     .with("loss", LossMetric);
/// assert_eq!(metrics.names().collect::<Vec<_>>(), ["wedding_words", "loss"]);
/// ```
pub struct MetricSet<M: ?Sized> {
    /// `(name, metric)` pairs.
    // TRAIT_OBJECT: metrics are heterogeneous user types and closures
    metrics: Vec<(String, Box<dyn Metric<M>>)>,
}

impl<M: ?Sized> Default for MetricSet<M> {
    fn default() -> Self {
        Self {
            metrics: Vec::new(),
        }
    }
}

impl<M: ?Sized> MetricSet<M> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metric, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, metric: impl Metric<M> + 'static) -> Self {
        self.push(name, metric);
        self
    }

    /// Add a metric.
    pub fn push(&mut self, name: impl Into<String>, metric: impl Metric<M> + 'static) {
        self.metrics.push((name.into(), Box::new(metric)));
    }

    /// Metric names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|(name, _)| name.as_str())
    }

    /// Number of metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Append every metric's columns to `table`, prefixed `"{name}_"`.
    ///
    /// Each row's text is the concatenation of its `text_columns` values
    /// (null cells contribute nothing).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Table`] if a text column is missing or a
    /// produced column name already exists, [`SteerError::Metric`] if a
    /// metric returns the wrong number of rows, and any metric error.
    pub fn add_metric_cols(
        &self,
        table: &ResultTable,
        text_columns: &[&str],
        model: &M,
    ) -> Result<ResultTable> {
        let columns = text_columns
            .iter()
            .map(|name| table.column(name))
            .collect::<Result<Vec<_>>>()?;
        let texts: Vec<String> = (0..table.len())
            .map(|row| {
                columns
                    .iter()
                    .filter_map(|col| col.get(row).and_then(|cell| cell.as_str()))
                    .collect()
            })
            .collect();

        let mut out = table.clone();
        for (name, metric) in &self.metrics {
            debug!(metric = %name, texts = texts.len(), "scoring");
            let scores = metric.score(model, &texts)?;
            if scores.len() != texts.len() {
                return Err(SteerError::Metric(format!(
                    "metric `{name}` returned {} rows for {} texts",
                    scores.len(),
                    texts.len()
                )));
            }
            for column in scores.columns() {
                let values = scores.column(column)?.into_iter().cloned().collect();
                out.add_column(format!("{name}_{column}"), values)?;
            }
        }
        Ok(out)
    }
}

impl<M: ?Sized> std::fmt::Debug for MetricSet<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in metrics
// ---------------------------------------------------------------------------

/// Case-insensitive count of whole-word occurrences of a word list.
///
/// Produces one `Int` column, `count`. Words are maximal runs of
/// alphanumeric characters and `_`.
#[derive(Debug, Clone)]
pub struct WordCountMetric {
    /// Lowercased words to count.
    words: Vec<String>,
}

impl WordCountMetric {
    /// Count occurrences of any of `words`.
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words.into_iter().map(|w| w.as_ref().to_lowercase()).collect(),
        }
    }

    /// Occurrences in one text.
    #[must_use]
    pub fn count(&self, text: &str) -> usize {
        text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|word| !word.is_empty())
            .filter(|word| {
                let lower = word.to_lowercase();
                self.words.iter().any(|w| *w == lower)
            })
            .count()
    }
}

impl<M: ?Sized> Metric<M> for WordCountMetric {
    fn score(&self, _model: &M, texts: &[String]) -> Result<ResultTable> {
        let mut table = ResultTable::new(["count"]);
        for text in texts {
            table.push_row(vec![Cell::from(self.count(text))])?;
        }
        Ok(table)
    }
}

/// Mean next-token negative log-likelihood of each text under the model.
///
/// Produces one `Float` column, `loss`; texts shorter than one token after
/// BOS get [`Cell::Null`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LossMetric;

impl<M: SteerableModel + ?Sized> Metric<M> for LossMetric {
    fn score(&self, model: &M, texts: &[String]) -> Result<ResultTable> {
        let mut table = ResultTable::new(["loss"]);
        for text in texts {
            let tokens = model.to_tokens(text)?;
            let loss = if tokens.len() < 2 {
                None
            } else {
                mean(&token_losses(&model.logits(&tokens)?, &tokens)?)
            };
            table.push_row(vec![Cell::from(loss)])?;
        }
        Ok(table)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;

    use candle_core::{Device, Tensor};

    use super::*;
    use crate::config::TinyModelConfig;
    use crate::hooks::{HookFn, HookPoint};
    use crate::tiny::TinyResidualModel;
    use crate::tokenizer::WordTokenizer;

    fn model() -> TinyResidualModel {
        let tok = WordTokenizer::from_corpus(["I went to a wedding with the bride"]);
        TinyResidualModel::new(TinyModelConfig::default(), tok.into(), &Device::Cpu).unwrap()
    }

    fn texts() -> ResultTable {
        let mut table = ResultTable::new(["prompts", "completions"]);
        table.push_row(vec!["I went to a ".into(), "Wedding!".into()]).unwrap();
        table.push_row(vec!["I went".into(), " to the bride, bride".into()]).unwrap();
        table
    }

    #[test]
    fn word_count_is_case_insensitive_and_whole_word() {
        let metric = WordCountMetric::new(["wedding"]);
        assert_eq!(metric.count("Wedding weddings WEDDING, wedding-day"), 3);
    }

    #[test]
    fn metric_columns_are_prefixed_and_use_joined_text() {
        let m = model();
        let metrics: MetricSet<TinyResidualModel> =
            MetricSet::new().with("wedding_words", WordCountMetric::new(["wedding", "bride"]));
        let out = metrics
            .add_metric_cols(&texts(), &["prompts", "completions"], &m)
            .unwrap();
        assert_eq!(out.columns(), ["prompts", "completions", "wedding_words_count"]);
        assert_eq!(out.get(0, "wedding_words_count"), Some(&Cell::Int(1)));
        assert_eq!(out.get(1, "wedding_words_count"), Some(&Cell::Int(2)));
    }

    #[test]
    fn closures_are_metrics() {
        let m = model();
        let metrics = MetricSet::new().with(
            "len",
            |_: &TinyResidualModel, texts: &[String]| -> Result<ResultTable> {
                let mut table = ResultTable::new(["chars"]);
                for text in texts {
                    table.push_row(vec![Cell::from(text.len())])?;
                }
                Ok(table)
            },
        );
        let out = metrics.add_metric_cols(&texts(), &["completions"], &m).unwrap();
        assert_eq!(out.get(0, "len_chars"), Some(&Cell::Int(8)));
    }

    #[test]
    fn wrong_row_count_is_a_metric_error() {
        let m = model();
        let metrics = MetricSet::new().with(
            "broken",
            |_: &TinyResidualModel, _: &[String]| -> Result<ResultTable> {
                Ok(ResultTable::new(["x"]))
            },
        );
        let err = metrics.add_metric_cols(&texts(), &["prompts"], &m);
        assert!(matches!(err, Err(SteerError::Metric(_))));
    }

    #[test]
    fn loss_metric_reads_the_hook_state() {
        let mut m = model();
        let texts = vec!["I went to a wedding".to_string(), String::new()];
        let clean = LossMetric.score(&m, &texts).unwrap();
        assert!(clean.get(0, "loss").and_then(Cell::as_f64).is_some());
        assert_eq!(clean.get(1, "loss"), Some(&Cell::Null));

        let shift: HookFn = Arc::new(|t: &Tensor| -> Result<Tensor> { Ok((t * 3.0)?) });
        m.add_hook(HookPoint::block(2), shift).unwrap();
        let hooked = LossMetric.score(&m, &texts).unwrap();
        assert_ne!(clean.get(0, "loss"), hooked.get(0, "loss"));
    }
}
