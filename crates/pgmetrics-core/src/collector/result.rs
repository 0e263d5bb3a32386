//! Type-erased query results.
//!
//! Every column is materialized as text regardless of its server-side type.
//! Numeric interpretation is deferred to reduction time, so SQL `NULL` is kept
//! as [`Cell::Null`] and never collapses into an empty string or zero here.

use super::StatError;

/// A single nullable text value from a query result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Cell {
    /// SQL `NULL`.
    #[default]
    Null,
    /// Text representation of a non-null value (may be empty).
    Text(String),
}

impl Cell {
    /// Creates a non-null cell.
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    /// True for SQL `NULL`; an empty string is not null.
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Returns the text value, or `None` for `NULL`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Null => None,
            Cell::Text(s) => Some(s),
        }
    }

    /// Parses the cell as an integer.
    ///
    /// Covers the whole `bigint` and `numeric(38,0)` range without rounding.
    /// Returns `None` for `NULL` and for text with a fraction or exponent.
    pub fn as_int(&self) -> Option<i128> {
        self.as_str()?.trim().parse::<i128>().ok()
    }

    /// Parses the cell as a finite number.
    ///
    /// Accepts integer and float text (`"10"`, `"1.5"`, `"-3"`, `"1e3"`).
    /// Returns `None` for `NULL`, non-numeric text, `NaN` and infinities.
    pub fn as_f64(&self) -> Option<f64> {
        let value = self.as_str()?.trim().parse::<f64>().ok()?;
        value.is_finite().then_some(value)
    }
}

impl From<Option<&str>> for Cell {
    fn from(value: Option<&str>) -> Self {
        match value {
            Some(s) => Cell::Text(s.to_string()),
            None => Cell::Null,
        }
    }
}

/// Rectangular result of a single query execution.
///
/// Column names keep server order and may contain duplicates. Every row has
/// exactly `column_count()` cells; rows are kept in acquisition order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultTable {
    column_names: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl ResultTable {
    /// Creates an empty table with the given columns.
    pub fn new(column_names: Vec<String>) -> Self {
        Self {
            column_names,
            rows: Vec::new(),
        }
    }

    /// Appends a row, rejecting it if its width differs from the column count.
    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), StatError> {
        if row.len() != self.column_names.len() {
            return Err(StatError::RowWidth {
                expected: self.column_names.len(),
                got: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows kept.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns, duplicates included.
    pub fn column_count(&self) -> usize {
        self.column_names.len()
    }

    /// Column names in server order.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Rows in acquisition order.
    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    /// Position of the first column with the given name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }

    /// Cell at `row` and `column`, or `None` when out of bounds.
    pub fn cell(&self, row: usize, column: usize) -> Option<&Cell> {
        self.rows.get(row)?.get(column)
    }

    /// True if the query returned no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends the rows of `other`, which must have the same column names.
    ///
    /// Used to merge the results of one query run on several databases.
    pub fn append(&mut self, other: ResultTable) -> Result<(), StatError> {
        if other.column_names != self.column_names {
            return Err(StatError::ColumnMismatch {
                expected: self.column_names.join(","),
                got: other.column_names.join(","),
            });
        }
        self.rows.extend(other.rows);
        Ok(())
    }
}
