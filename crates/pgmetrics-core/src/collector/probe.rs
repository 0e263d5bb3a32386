//! Availability checks for optional statistics views.
//!
//! Extension views such as `pg_stat_statements` may be missing, or present
//! but unusable when the library is not in `shared_preload_libraries`.
//! Callers get a plain boolean and re-check on every cycle.

use tracing::debug;

use super::{Connection, StatError, acquire};

/// Returns true if `view` is registered in the catalog and answers a
/// trivial query with at least one row.
///
/// Never fails: catalog errors, a missing view and an unqueryable or empty
/// view all yield `false`, each with its own debug message.
pub fn is_available<C: Connection>(conn: &mut C, view: &str) -> bool {
    check_available(conn, view).unwrap_or(false)
}

/// Same as [`is_available`], but a lost connection is returned as an error
/// instead of being reported as an unavailable view.
pub fn check_available<C: Connection>(conn: &mut C, view: &str) -> Result<bool, StatError> {
    debug!(view, "check view availability");

    if !is_identifier(view) {
        debug!(view, "view name is not a plain identifier");
        return Ok(false);
    }

    let exists = match acquire(conn, &exists_query(view)) {
        Ok(table) => table
            .cell(0, 0)
            .and_then(|c| c.as_str())
            .is_some_and(|v| v == "t" || v == "true"),
        Err(e) if e.is_connection() => return Err(e),
        Err(e) => {
            debug!(view, error = %e, "failed to check view in information_schema");
            return Ok(false);
        }
    };
    if !exists {
        debug!(view, "view is not available in this database");
        return Ok(false);
    }

    match acquire(conn, &probe_query(view)) {
        Ok(table) if !table.is_empty() => Ok(true),
        Ok(_) => {
            debug!(view, "view exists but returned no rows");
            Ok(false)
        }
        Err(e) if e.is_connection() => Err(e),
        Err(e) => {
            debug!(view, error = %e, "view exists but not queryable");
            Ok(false)
        }
    }
}

/// Catalog lookup for a view by name.
pub(crate) fn exists_query(view: &str) -> String {
    format!(
        "SELECT EXISTS (SELECT 1 FROM information_schema.views WHERE table_name = '{}')",
        view
    )
}

/// Trivial bounded query against a view.
pub(crate) fn probe_query(view: &str) -> String {
    format!("SELECT 1 FROM {} LIMIT 1", view)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockConnection;

    const EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM information_schema.views \
                          WHERE table_name = 'pg_stat_statements')";
    const PROBE: &str = "SELECT 1 FROM pg_stat_statements LIMIT 1";

    fn exists(value: &str) -> MockConnection {
        MockConnection::new().with_rows(EXISTS, &["exists"], vec![vec![Some(value)]])
    }

    #[test]
    fn available_when_view_exists_and_answers() {
        let mut conn = exists("t").with_rows(PROBE, &["?column?"], vec![vec![Some("1")]]);
        assert!(is_available(&mut conn, "pg_stat_statements"));
        assert_eq!(conn.cursors_closed(), 2);
    }

    #[test]
    fn unavailable_when_catalog_query_fails() {
        let mut conn = MockConnection::new()
            .with_query_error(EXISTS, "permission denied for schema information_schema");
        assert!(!is_available(&mut conn, "pg_stat_statements"));
        assert_eq!(conn.executed(), &[EXISTS]);
    }

    #[test]
    fn unavailable_when_view_not_registered() {
        let mut conn = exists("f");
        assert!(!is_available(&mut conn, "pg_stat_statements"));
        assert_eq!(conn.executed().len(), 1);
    }

    #[test]
    fn unavailable_when_view_not_queryable() {
        let mut conn = exists("t").with_query_error(
            PROBE,
            "pg_stat_statements must be loaded via shared_preload_libraries",
        );
        assert!(!is_available(&mut conn, "pg_stat_statements"));
    }

    #[test]
    fn unavailable_when_view_is_empty() {
        let mut conn = exists("t").with_rows(PROBE, &["?column?"], vec![]);
        assert!(!is_available(&mut conn, "pg_stat_statements"));
    }

    #[test]
    fn lost_connection_is_reported_by_check() {
        let mut conn = exists("t").with_connection_lost(PROBE, "connection reset by peer");

        assert_eq!(
            check_available(&mut conn, "pg_stat_statements"),
            Err(StatError::Connection("connection reset by peer".to_string()))
        );
        assert!(!is_available(&mut conn, "pg_stat_statements"));
    }

    #[test]
    fn query_errors_are_not_reported_by_check() {
        let mut conn = MockConnection::new().with_query_error(EXISTS, "permission denied");
        assert_eq!(check_available(&mut conn, "pg_stat_statements"), Ok(false));
    }

    #[test]
    fn unavailable_for_non_identifier_without_querying() {
        let mut conn = MockConnection::new();
        assert!(!is_available(&mut conn, "x'; DROP TABLE t; --"));
        assert!(!is_available(&mut conn, ""));
        assert!(conn.executed().is_empty());
    }

    #[test]
    fn probe_queries_match_catalog_text() {
        assert_eq!(exists_query("pg_stat_statements"), EXISTS);
        assert_eq!(probe_query("pg_stat_statements"), PROBE);
    }

    #[test]
    fn identifier_check() {
        assert!(is_identifier("pg_stat_statements"));
        assert!(is_identifier("_v1"));
        assert!(!is_identifier("1view"));
        assert!(!is_identifier("public.view"));
    }
}
