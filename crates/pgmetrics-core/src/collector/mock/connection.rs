//! In-memory scripted connection for testing without a server.
//!
//! Each query text maps to a scripted response. Responses are replayed on
//! every execution, so the same connection can serve several poll cycles.

use std::collections::HashMap;

use crate::collector::{Cell, Connection, RowCursor, StatError};

/// One scripted row.
#[derive(Debug, Clone, PartialEq)]
pub enum MockRow {
    /// Row scanned successfully into these cells.
    Cells(Vec<Cell>),
    /// Row scan fails with this message.
    ScanError(String),
}

impl MockRow {
    /// Builds a row from optional text values (`None` is SQL `NULL`).
    pub fn cells(values: &[Option<&str>]) -> Self {
        MockRow::Cells(values.iter().map(|v| Cell::from(*v)).collect())
    }
}

/// Scripted outcome of executing a query.
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// Query succeeds with these columns and rows.
    Rows {
        columns: Vec<String>,
        rows: Vec<MockRow>,
    },
    /// Server rejects the query.
    QueryError(String),
    /// Connection is gone.
    ConnectionLost(String),
}

/// In-memory connection for testing.
///
/// Counts opened and closed cursors and records every executed query.
/// Queries without a scripted response fail with a "does not exist" error,
/// which is what a server reports for an unknown relation.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    responses: HashMap<String, MockResponse>,
    executed: Vec<String>,
    opened: usize,
    closed: usize,
}

impl MockConnection {
    /// Creates a connection with no scripted queries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts `query` to return the given rows.
    pub fn with_rows(
        self,
        query: impl Into<String>,
        columns: &[&str],
        rows: Vec<Vec<Option<&str>>>,
    ) -> Self {
        let rows = rows.iter().map(|r| MockRow::cells(r)).collect();
        self.with_script(query, columns, rows)
    }

    /// Scripts `query` with rows that may fail to scan.
    pub fn with_script(
        mut self,
        query: impl Into<String>,
        columns: &[&str],
        rows: Vec<MockRow>,
    ) -> Self {
        self.responses.insert(
            query.into(),
            MockResponse::Rows {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
        self
    }

    /// Scripts `query` to be rejected by the server.
    pub fn with_query_error(mut self, query: impl Into<String>, message: &str) -> Self {
        self.responses
            .insert(query.into(), MockResponse::QueryError(message.to_string()));
        self
    }

    /// Scripts `query` to fail because the connection dropped.
    pub fn with_connection_lost(mut self, query: impl Into<String>, message: &str) -> Self {
        self.responses.insert(
            query.into(),
            MockResponse::ConnectionLost(message.to_string()),
        );
        self
    }

    /// Replaces or adds a scripted response.
    pub fn set_response(&mut self, query: impl Into<String>, response: MockResponse) {
        self.responses.insert(query.into(), response);
    }

    /// Number of cursors handed out.
    pub fn cursors_opened(&self) -> usize {
        self.opened
    }

    /// Number of `close()` calls across all cursors.
    pub fn cursors_closed(&self) -> usize {
        self.closed
    }

    /// Every query text executed so far, in order.
    pub fn executed(&self) -> &[String] {
        &self.executed
    }
}

impl Connection for MockConnection {
    type Cursor<'c> = MockCursor<'c>;

    fn query(&mut self, sql: &str) -> Result<Self::Cursor<'_>, StatError> {
        self.executed.push(sql.to_string());

        match self.responses.get(sql) {
            Some(MockResponse::Rows { columns, rows }) => {
                let columns = columns.clone();
                let rows = rows.clone();
                self.opened += 1;
                Ok(MockCursor {
                    columns,
                    rows: rows.into_iter(),
                    closed: &mut self.closed,
                })
            }
            Some(MockResponse::QueryError(msg)) => Err(StatError::Query(msg.clone())),
            Some(MockResponse::ConnectionLost(msg)) => Err(StatError::Connection(msg.clone())),
            None => Err(StatError::Query(format!(
                "ERROR: relation referenced by \"{}\" does not exist",
                sql
            ))),
        }
    }
}

/// Cursor over scripted rows.
pub struct MockCursor<'c> {
    columns: Vec<String>,
    rows: std::vec::IntoIter<MockRow>,
    closed: &'c mut usize,
}

impl RowCursor for MockCursor<'_> {
    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn next_row(&mut self) -> Option<Result<Vec<Cell>, StatError>> {
        self.rows.next().map(|row| match row {
            MockRow::Cells(cells) => Ok(cells),
            MockRow::ScanError(msg) => Err(StatError::RowScan(msg)),
        })
    }

    fn close(&mut self) {
        *self.closed += 1;
    }
}
