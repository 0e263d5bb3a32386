//! Pre-built mock server scenarios for testing.
//!
//! These scenarios script every builtin statistic-source query with
//! realistic rows, including the duplicates and NULLs real servers return.

use super::connection::MockConnection;
use crate::collector::probe::{exists_query, probe_query};
use crate::sources::{
    BGWRITER_QUERY, DATABASE_QUERY, FUNCTIONS_QUERY, STATEMENTS_QUERY, TABLES_QUERY,
};

const STATEMENTS_VIEW: &str = "pg_stat_statements";

const FUNCTION_COLUMNS: [&str; 6] = [
    "datname",
    "schemaname",
    "funcname",
    "calls",
    "total_time",
    "self_time",
];

const DATABASE_COLUMNS: [&str; 16] = [
    "datname",
    "xact_commit",
    "xact_rollback",
    "blks_read",
    "blks_hit",
    "tup_returned",
    "tup_fetched",
    "tup_inserted",
    "tup_updated",
    "tup_deleted",
    "conflicts",
    "temp_files",
    "temp_bytes",
    "deadlocks",
    "blk_read_time",
    "blk_write_time",
];

const TABLE_COLUMNS: [&str; 17] = [
    "datname",
    "schemaname",
    "relname",
    "seq_scan",
    "seq_tup_read",
    "idx_scan",
    "idx_tup_fetch",
    "n_tup_ins",
    "n_tup_upd",
    "n_tup_del",
    "n_tup_hot_upd",
    "n_live_tup",
    "n_dead_tup",
    "vacuum_count",
    "autovacuum_count",
    "analyze_count",
    "autoanalyze_count",
];

const STATEMENT_COLUMNS: [&str; 9] = [
    "datname",
    "usename",
    "queryid",
    "calls",
    "rows",
    "shared_blks_hit",
    "shared_blks_read",
    "shared_blks_written",
    "temp_blks_written",
];

/// Splits whitespace-separated values into a row; `NULL` is SQL `NULL`.
fn row(values: &str) -> Vec<Option<&str>> {
    values
        .split_whitespace()
        .map(|v| (v != "NULL").then_some(v))
        .collect()
}

fn rows<'a>(lines: &[&'a str]) -> Vec<Vec<Option<&'a str>>> {
    lines.iter().map(|l| row(*l)).collect()
}

impl MockConnection {
    /// A server with two user databases and `pg_stat_statements` loaded.
    ///
    /// Includes: a function reported twice (merged to 15 calls), the shared
    /// objects row of `pg_stat_database` with NULL `datname`, and a statement
    /// reported both top-level and nested (merged to 120 calls).
    pub fn typical_server() -> Self {
        Self::without_statements()
            .with_rows(exists_query(STATEMENTS_VIEW), &["exists"], rows(&["t"]))
            .with_rows(probe_query(STATEMENTS_VIEW), &["?column?"], rows(&["1"]))
            .with_rows(
                STATEMENTS_QUERY,
                &STATEMENT_COLUMNS,
                rows(&[
                    "app alice 4242 100 1000 5000 20 0 0",
                    "app alice 4242 20 200 300 1 0 0",
                    "postgres postgres -77 3 3 12 0 0 0",
                ]),
            )
    }

    /// Same as [`typical_server`](Self::typical_server) but
    /// `pg_stat_statements` is not installed.
    pub fn without_statements() -> Self {
        Self::new()
            .with_rows(exists_query(STATEMENTS_VIEW), &["exists"], rows(&["f"]))
            .with_rows(
                FUNCTIONS_QUERY,
                &FUNCTION_COLUMNS,
                rows(&[
                    "app public calc_totals 10 1000.5 900.25",
                    "app public calc_totals 5 500 400",
                    "app billing close_period 1 12000 11000",
                ]),
            )
            .with_rows(
                DATABASE_QUERY,
                &DATABASE_COLUMNS,
                rows(&[
                    "NULL 0 0 120 4000 900 300 0 0 0 0 0 0 0 0 0",
                    "app 52000 31 1800 920000 1200000 400000 5000 2200 90 0 4 81920 0 12.5 3.25",
                    "postgres 700 2 300 15000 22000 6000 0 0 0 0 0 0 0 0 0",
                ]),
            )
            .with_rows(
                TABLES_QUERY,
                &TABLE_COLUMNS,
                rows(&[
                    "app public orders 12 48000 9100 9050 4000 1500 30 1200 3970 41 0 3 0 5",
                    // Table without indexes: idx_* columns are NULL.
                    "app public audit_log 3 900 NULL NULL 900 0 0 0 900 0 0 1 0 1",
                ]),
            )
            .with_rows(
                BGWRITER_QUERY,
                &["buffers_clean", "maxwritten_clean", "buffers_alloc"],
                rows(&["3120 7 95000"]),
            )
    }

    /// A connection to database `datname` answering the per-database
    /// function and table queries with one function and one table.
    pub fn single_database(datname: &str) -> Self {
        let function = format!("{} public refresh_totals 4 80 60", datname);
        let table = format!("{} public events 2 100 7 7 50 5 1 2 49 1 0 1 0 1", datname);
        Self::new()
            .with_rows(FUNCTIONS_QUERY, &FUNCTION_COLUMNS, rows(&[function.as_str()]))
            .with_rows(TABLES_QUERY, &TABLE_COLUMNS, rows(&[table.as_str()]))
    }

    /// Scripts the connection to drop while checking whether `view` exists.
    pub fn with_view_check_lost(self, view: &str) -> Self {
        self.with_connection_lost(exists_query(view), "connection reset by peer")
    }
}
