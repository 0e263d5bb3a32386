//! Abstractions over a database connection to enable testing and mocking.
//!
//! The `Connection` trait lets the acquirer run against a real PostgreSQL
//! client or a scripted mock that never touches the network.

use super::{Cell, StatError};

/// A connection able to execute a query and hand back a row cursor.
///
/// Implementations are used by one caller at a time; serializing access to a
/// shared connection is the caller's responsibility.
pub trait Connection {
    /// Cursor over the rows of one query result.
    type Cursor<'c>: RowCursor
    where
        Self: 'c;

    /// Executes `sql` and returns a cursor positioned before the first row.
    ///
    /// Fails with [`StatError::Query`] when the server rejects the query, or
    /// [`StatError::Connection`] when the connection itself is gone.
    fn query(&mut self, sql: &str) -> Result<Self::Cursor<'_>, StatError>;
}

/// Row-by-row access to a query result.
pub trait RowCursor {
    /// Column names from the result metadata, in server order.
    fn column_names(&self) -> Vec<String>;

    /// Scans the next row into nullable text cells.
    ///
    /// Returns `None` when the cursor is exhausted and `Some(Err(_))` when a
    /// single row cannot be scanned; the cursor stays usable after that.
    fn next_row(&mut self) -> Option<Result<Vec<Cell>, StatError>>;

    /// Releases the cursor.
    fn close(&mut self);
}

/// A connection to one specific database of the cluster.
///
/// Views like `pg_stat_user_tables` only cover the connected database, so
/// per-database sources run once over each of these.
#[derive(Debug)]
pub struct DatabaseConnection<C> {
    pub datname: String,
    pub conn: C,
}
