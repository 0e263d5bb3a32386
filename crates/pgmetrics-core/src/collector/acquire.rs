//! Query execution into a [`ResultTable`].

use tracing::{debug, warn};

use super::{Connection, ResultTable, RowCursor, StatError};

/// Closes the wrapped cursor when dropped, on every exit path.
struct CursorGuard<C: RowCursor>(C);

impl<C: RowCursor> Drop for CursorGuard<C> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Executes `query` and materializes its result as nullable text cells.
///
/// A query-level failure is returned as an error with no partial table.
/// Rows that fail to scan are logged and skipped, so `row_count()` may be
/// lower than the number of rows the server sent.
pub fn acquire<C: Connection>(conn: &mut C, query: &str) -> Result<ResultTable, StatError> {
    let mut cursor = CursorGuard(conn.query(query)?);
    let mut table = ResultTable::new(cursor.0.column_names());
    let mut skipped = 0usize;

    while let Some(row) = cursor.0.next_row() {
        if let Err(e) = row.and_then(|cells| table.push_row(cells)) {
            skipped += 1;
            warn!(error = %e, "skip collecting stats row");
        }
    }

    debug!(
        rows = table.row_count(),
        columns = table.column_count(),
        skipped,
        "query result acquired"
    );

    Ok(table)
}
