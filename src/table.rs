// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tabular sweep results.
//!
//! [`ResultTable`] is the data contract between the sweep engine and any
//! reporting code: named columns, rows of [`Cell`] values, plus the few
//! relational operations the reducer needs (concatenation, group-mean,
//! left join).

use serde::{Deserialize, Serialize};

use crate::error::{Result, SteerError};

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

/// A single table value.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    /// Missing value.
    Null,
    /// Boolean flag (not averaged by [`ResultTable::group_mean`]).
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Text value.
    Text(String),
}

impl Cell {
    /// Numeric view of the cell (`Int` and `Float` only).
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Null | Self::Bool(_) | Self::Text(_) => None,
        }
    }

    /// Integer view of the cell.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view of the cell.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether the cell is [`Cell::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether the cell holds a number.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Cell {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for Cell {
    fn from(v: usize) -> Self {
        i64::try_from(v).map_or(Self::Null, Self::Int)
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl<T: Into<Self>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// ResultTable
// ---------------------------------------------------------------------------

/// Column-named table of sweep results.
///
/// # Example
///
/// ```
/// use candle_steer::{Cell, ResultTable};
///
/// let mut table = ResultTable::new(["prompts", "loss"]);
/// table.push_row(vec!["I think".into(), Cell::Float(2.0)]).unwrap();
/// table.push_row(vec!["I think".into(), Cell::Float(4.0)]).unwrap();
///
/// let reduced = table.group_mean(&["prompts"], &[]).unwrap();
/// assert_eq!(reduced.len(), 1);
/// assert_eq!(reduced.get(0, "loss"), Some(&Cell::Float(3.0)));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultTable {
    /// Column names, in order.
    columns: Vec<String>,
    /// Rows; every row has exactly `columns.len()` cells.
    rows: Vec<Vec<Cell>>,
}

impl ResultTable {
    /// Create an empty table with the given columns.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Column names, in order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Whether a column exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cell at `row` in column `name`.
    #[must_use]
    pub fn get(&self, row: usize, name: &str) -> Option<&Cell> {
        let col = self.column_index(name)?;
        self.rows.get(row)?.get(col)
    }

    /// Every value of one column, in row order.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Table`] if the column does not exist.
    pub fn column(&self, name: &str) -> Result<Vec<&Cell>> {
        let col = self.require_column(name)?;
        Ok(self.rows.iter().filter_map(|row| row.get(col)).collect())
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Table`] if the row width differs from the
    /// column count.
    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(SteerError::Table(format!(
                "row has {} cells but table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append a column with one value per row.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Table`] if the column already exists or the
    /// value count differs from the row count.
    pub fn add_column(&mut self, name: impl Into<String>, values: Vec<Cell>) -> Result<()> {
        let name = name.into();
        if self.has_column(&name) {
            return Err(SteerError::Table(format!("column `{name}` already exists")));
        }
        if values.len() != self.rows.len() {
            return Err(SteerError::Table(format!(
                "column `{name}` has {} values but table has {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        self.columns.push(name);
        Ok(())
    }

    /// Append a column holding the same value in every row.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Table`] if the column already exists.
    pub fn add_constant_column(&mut self, name: impl Into<String>, value: &Cell) -> Result<()> {
        let values = vec![value.clone(); self.rows.len()];
        self.add_column(name, values)
    }

    /// Stack tables vertically.
    ///
    /// The result has the union of all columns (first-seen order); cells a
    /// table does not have are [`Cell::Null`].
    #[must_use]
    pub fn concat(tables: &[Self]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for table in tables {
            for name in &table.columns {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }

        let mut rows = Vec::with_capacity(tables.iter().map(Self::len).sum());
        for table in tables {
            let mapping: Vec<Option<usize>> =
                columns.iter().map(|name| table.column_index(name)).collect();
            for row in &table.rows {
                rows.push(
                    mapping
                        .iter()
                        .map(|col| col.and_then(|c| row.get(c)).cloned().unwrap_or(Cell::Null))
                        .collect(),
                );
            }
        }

        Self { columns, rows }
    }

    /// Columns whose non-null values are all numeric (at least one value).
    #[must_use]
    pub fn numeric_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(col, _)| {
                let mut any = false;
                for row in &self.rows {
                    match row.get(*col) {
                        Some(cell) if cell.is_numeric() => any = true,
                        Some(Cell::Null) | None => {}
                        Some(_) => return false,
                    }
                }
                any
            })
            .map(|(_, name)| name.as_str())
            .collect()
    }

    /// Group rows by `keys` and average every numeric column.
    ///
    /// The result has the key columns followed by one `Float` column per
    /// numeric column (key and `skip` columns excluded). Groups appear in
    /// order of first occurrence. Nulls are ignored; a group with no values
    /// in a column gets [`Cell::Null`].
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Table`] if a key column does not exist.
    pub fn group_mean(&self, keys: &[&str], skip: &[&str]) -> Result<Self> {
        let key_cols = keys
            .iter()
            .map(|k| self.require_column(k))
            .collect::<Result<Vec<_>>>()?;

        let value_names: Vec<&str> = self
            .numeric_columns()
            .into_iter()
            .filter(|name| !keys.contains(name) && !skip.contains(name))
            .collect();
        let value_cols = value_names
            .iter()
            .map(|name| self.require_column(name))
            .collect::<Result<Vec<_>>>()?;

        // (key values, per-column (sum, count))
        let mut groups: Vec<(Vec<Cell>, Vec<(f64, usize)>)> = Vec::new();
        for row in &self.rows {
            let key: Vec<Cell> = key_cols
                .iter()
                .map(|&c| row.get(c).cloned().unwrap_or(Cell::Null))
                .collect();
            let idx = if let Some(idx) = groups.iter().position(|(k, _)| *k == key) {
                idx
            } else {
                groups.push((key, vec![(0.0, 0); value_cols.len()]));
                groups.len() - 1
            };
            if let Some((_, acc)) = groups.get_mut(idx) {
                for (slot, &col) in acc.iter_mut().zip(&value_cols) {
                    if let Some(v) = row.get(col).and_then(Cell::as_f64) {
                        slot.0 += v;
                        slot.1 += 1;
                    }
                }
            }
        }

        let mut out = Self::new(keys.iter().copied().chain(value_names.iter().copied()));
        for (key, acc) in groups {
            let mut row = key;
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            row.extend(acc.into_iter().map(|(sum, n)| {
                if n == 0 {
                    Cell::Null
                } else {
                    Cell::Float(sum / n as f64)
                }
            }));
            out.rows.push(row);
        }
        Ok(out)
    }

    /// Left-join `other` on column `on`.
    ///
    /// Each row of `self` gains every column of `other` except `on`, taken
    /// from the first row of `other` whose `on` value is equal; rows
    /// without a match get [`Cell::Null`].
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Table`] if either table lacks `on` or the
    /// tables share any other column name.
    pub fn left_join(&self, other: &Self, on: &str) -> Result<Self> {
        let left_on = self.require_column(on)?;
        let right_on = other.require_column(on)?;

        let extra: Vec<(usize, &String)> = other
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != right_on)
            .collect();
        if let Some((_, name)) = extra.iter().find(|(_, name)| self.has_column(name)) {
            return Err(SteerError::Table(format!(
                "column `{name}` exists in both tables"
            )));
        }

        let mut columns = self.columns.clone();
        columns.extend(extra.iter().map(|(_, name)| (*name).clone()));

        let rows = self
            .rows
            .iter()
            .map(|row| {
                let key = row.get(left_on);
                let matched = other.rows.iter().find(|r| r.get(right_on) == key);
                let mut joined = row.clone();
                joined.extend(extra.iter().map(|(c, _)| {
                    matched
                        .and_then(|r| r.get(*c))
                        .cloned()
                        .unwrap_or(Cell::Null)
                }));
                joined
            })
            .collect();

        Ok(Self { columns, rows })
    }

    /// One JSON object per row, keyed by column name.
    #[must_use]
    pub fn to_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(name, cell)| {
                        (
                            name.clone(),
                            serde_json::to_value(cell).unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect()
            })
            .collect()
    }

    /// Write the rows to `path` as a JSON array of records.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] or [`SteerError::Json`] on failure.
    pub fn write_json(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.to_records())?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Position of a column, or a [`SteerError::Table`] naming it.
    fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| SteerError::Table(format!("no column named `{name}`")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn trials() -> ResultTable {
        let mut table = ResultTable::new(["prompts", "rich_prompt_index", "completions", "loss"]);
        for (prompt, idx, loss) in [("a", 0, 1.0_f64), ("a", 0, 3.0), ("a", 1, 5.0), ("b", 0, 7.0)] {
            table
                .push_row(vec![
                    prompt.into(),
                    Cell::Int(idx),
                    "text".into(),
                    loss.into(),
                ])
                .unwrap();
        }
        table
    }

    #[test]
    fn push_row_checks_width() {
        let mut table = ResultTable::new(["a", "b"]);
        assert!(table.push_row(vec![Cell::Int(1)]).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn add_column_checks_length_and_duplicates() {
        let mut table = trials();
        assert!(table.add_column("extra", vec![Cell::Null]).is_err());
        assert!(table.add_column("loss", vec![Cell::Null; 4]).is_err());
        table.add_constant_column("flag", &Cell::Bool(true)).unwrap();
        assert_eq!(table.get(3, "flag"), Some(&Cell::Bool(true)));
    }

    #[test]
    fn numeric_columns_skip_text_and_bools() {
        let mut table = trials();
        table.add_constant_column("is_modified", &Cell::Bool(false)).unwrap();
        assert_eq!(table.numeric_columns(), vec!["rich_prompt_index", "loss"]);
    }

    #[test]
    fn group_mean_averages_per_key() {
        let reduced = trials().group_mean(&["prompts", "rich_prompt_index"], &[]).unwrap();
        assert_eq!(reduced.columns(), ["prompts", "rich_prompt_index", "loss"]);
        assert_eq!(reduced.len(), 3);
        assert_eq!(reduced.get(0, "loss"), Some(&Cell::Float(2.0)));
        assert_eq!(reduced.get(1, "loss"), Some(&Cell::Float(5.0)));
        assert_eq!(reduced.get(2, "prompts"), Some(&Cell::Text("b".into())));
    }

    #[test]
    fn group_mean_unknown_key_is_an_error() {
        assert!(trials().group_mean(&["nope"], &[]).is_err());
    }

    #[test]
    fn left_join_fills_unmatched_with_null() {
        let mut info = ResultTable::new(["rich_prompt_index", "coeff"]);
        info.push_row(vec![Cell::Int(0), Cell::Float(10.0)]).unwrap();

        let joined = trials().left_join(&info, "rich_prompt_index").unwrap();
        assert_eq!(joined.get(0, "coeff"), Some(&Cell::Float(10.0)));
        assert_eq!(joined.get(2, "coeff"), Some(&Cell::Null));
    }

    #[test]
    fn left_join_rejects_overlapping_columns() {
        let mut info = ResultTable::new(["rich_prompt_index", "loss"]);
        info.push_row(vec![Cell::Int(0), Cell::Float(1.0)]).unwrap();
        assert!(trials().left_join(&info, "rich_prompt_index").is_err());
    }

    #[test]
    fn concat_unions_columns() {
        let mut extra = ResultTable::new(["prompts", "score"]);
        extra.push_row(vec!["c".into(), Cell::Float(0.5)]).unwrap();
        let all = ResultTable::concat(&[trials(), extra]);
        assert_eq!(all.len(), 5);
        assert!(all.has_column("score"));
        assert_eq!(all.get(0, "score"), Some(&Cell::Null));
        assert_eq!(all.get(4, "loss"), Some(&Cell::Null));
    }

    #[test]
    fn records_serialize_by_column_name() {
        let records = trials().to_records();
        assert_eq!(records[0]["prompts"], serde_json::json!("a"));
        assert_eq!(records[0]["loss"], serde_json::json!(1.0));
        assert_eq!(records[0]["rich_prompt_index"], serde_json::json!(0));
    }
}
