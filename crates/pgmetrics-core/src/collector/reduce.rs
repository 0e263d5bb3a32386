//! Folding a [`ResultTable`] into per-entity statistic records.
//!
//! Rows are grouped by a composite key built from the designated key columns.
//! Every other column is parsed as a number and summed across rows sharing a
//! key, since the same entity can legitimately appear in several rows.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Cell, ResultTable, StatError};

/// Separator between key-column values in a composite key.
pub const KEY_SEPARATOR: &str = "/";

/// Joins key values in the given order into a composite key.
pub fn composite_key<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(KEY_SEPARATOR)
}

/// What to do with rows whose key-column cells are all null or empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyKeyPolicy {
    /// Skip such rows.
    #[default]
    Drop,
    /// Fold such rows under the key built from empty strings.
    Aggregate,
}

impl FromStr for EmptyKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(EmptyKeyPolicy::Drop),
            "aggregate" => Ok(EmptyKeyPolicy::Aggregate),
            other => Err(format!(
                "invalid empty key policy '{}' (expected 'drop' or 'aggregate')",
                other
            )),
        }
    }
}

/// Accumulated value of one column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    /// Every contribution was an integer; the sum is exact.
    Int(i128),
    /// At least one contribution had a fraction or an exponent.
    Float(f64),
}

impl StatValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            StatValue::Int(v) => *v as f64,
            StatValue::Float(v) => *v,
        }
    }

    /// Exact integer sum, or `None` for a float column.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            StatValue::Int(v) => Some(*v),
            StatValue::Float(_) => None,
        }
    }
}

/// Running sum of one column for one key.
///
/// Integer contributions are summed exactly. Float contributions are kept
/// and summed in sorted order on finish, so the result does not depend on
/// row order.
#[derive(Debug, Default)]
struct ColumnSum {
    int: i128,
    floats: Vec<f64>,
}

impl ColumnSum {
    /// Adds a cell; returns false if it is neither null nor a number.
    fn add(&mut self, cell: &Cell) -> bool {
        if let Some(v) = cell.as_int() {
            self.int = self.int.saturating_add(v);
        } else if let Some(v) = cell.as_f64() {
            self.floats.push(v);
        } else {
            return cell.is_null();
        }
        true
    }

    fn finish(mut self) -> StatValue {
        if self.floats.is_empty() {
            return StatValue::Int(self.int);
        }
        self.floats.sort_by(f64::total_cmp);
        let floats: f64 = self.floats.iter().sum();
        StatValue::Float(self.int as f64 + floats)
    }
}

/// Labels and running sums of one key during a reduction.
struct PendingRecord {
    labels: Vec<(String, String)>,
    sums: Vec<ColumnSum>,
}

/// Accumulated statistics of one entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatRecord {
    /// Key-column name and value, in key-column order.
    pub labels: Vec<(String, String)>,
    /// Value-column name and accumulated value, in table order.
    pub values: Vec<(String, StatValue)>,
}

impl StatRecord {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Accumulated value of a column as a float.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.exact(name).map(|v| v.as_f64())
    }

    /// Accumulated value of a column as summed.
    pub fn exact(&self, name: &str) -> Option<StatValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

/// Reduces result tables into keyed statistic records.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatReducer {
    empty_keys: EmptyKeyPolicy,
}

impl StatReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the policy for rows whose key cells are all null or empty.
    pub fn with_empty_keys(mut self, policy: EmptyKeyPolicy) -> Self {
        self.empty_keys = policy;
        self
    }

    pub fn empty_keys(&self) -> EmptyKeyPolicy {
        self.empty_keys
    }

    /// Groups `table` rows by the composite key of `key_columns`.
    ///
    /// Null or unparsable value cells contribute zero. Integer columns are
    /// summed exactly; the result is the same for any order of the rows.
    /// A key column missing from the table fails the whole call before any
    /// row is read. With no key columns every row folds into the key `""`.
    pub fn reduce<S: AsRef<str>>(
        &self,
        table: &ResultTable,
        key_columns: &[S],
    ) -> Result<HashMap<String, StatRecord>, StatError> {
        let key_idx = key_columns
            .iter()
            .map(|name| {
                let name = name.as_ref();
                table
                    .column_index(name)
                    .ok_or_else(|| StatError::MissingKeyColumn(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let value_idx: Vec<usize> = (0..table.column_count())
            .filter(|i| !key_idx.contains(i))
            .collect();

        let names = table.column_names();
        let mut pending: HashMap<String, PendingRecord> = HashMap::new();
        let mut dropped = 0usize;
        let mut unparsable = 0usize;

        for row in table.rows() {
            let parts: Vec<&str> = key_idx
                .iter()
                .map(|&i| row[i].as_str().unwrap_or(""))
                .collect();

            if self.empty_keys == EmptyKeyPolicy::Drop
                && !parts.is_empty()
                && parts.iter().all(|p| p.is_empty())
            {
                dropped += 1;
                continue;
            }

            let record = pending
                .entry(composite_key(&parts))
                .or_insert_with(|| PendingRecord {
                    labels: key_idx
                        .iter()
                        .zip(&parts)
                        .map(|(&i, p)| (names[i].clone(), p.to_string()))
                        .collect(),
                    sums: value_idx.iter().map(|_| ColumnSum::default()).collect(),
                });

            for (sum, &i) in record.sums.iter_mut().zip(&value_idx) {
                if !sum.add(&row[i]) {
                    unparsable += 1;
                }
            }
        }

        if dropped > 0 {
            debug!(rows = dropped, "dropped rows with empty key");
        }
        if unparsable > 0 {
            trace!(cells = unparsable, "non-numeric cells counted as zero");
        }

        Ok(pending
            .into_iter()
            .map(|(key, record)| {
                let values = value_idx
                    .iter()
                    .zip(record.sums)
                    .map(|(&i, sum)| (names[i].clone(), sum.finish()))
                    .collect();
                let record = StatRecord {
                    labels: record.labels,
                    values,
                };
                (key, record)
            })
            .collect())
    }
}

/// Reduces `table` with the default reducer (empty keys dropped).
pub fn reduce<S: AsRef<str>>(
    table: &ResultTable,
    key_columns: &[S],
) -> Result<HashMap<String, StatRecord>, StatError> {
    StatReducer::default().reduce(table, key_columns)
}
