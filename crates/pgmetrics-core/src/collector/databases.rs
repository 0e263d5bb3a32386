//! Discovery of the databases a collector can connect to.

use tracing::debug;

use super::{Connection, StatError, acquire};

/// Databases that accept connections, templates excluded.
pub const DATABASES_QUERY: &str = "SELECT datname FROM pg_database \
     WHERE NOT datistemplate AND datallowconn ORDER BY datname";

/// Lists connectable databases, in name order.
///
/// NULL and empty names are skipped.
pub fn list_databases<C: Connection>(conn: &mut C) -> Result<Vec<String>, StatError> {
    let table = acquire(conn, DATABASES_QUERY)?;
    let databases: Vec<String> = table
        .rows()
        .iter()
        .filter_map(|row| row.first()?.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    debug!(count = databases.len(), "listed databases");
    Ok(databases)
}
