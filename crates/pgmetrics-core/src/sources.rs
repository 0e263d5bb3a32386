//! Statistic-source registry.
//!
//! A source is a query plus the key columns that identify one entity in its
//! result, and the metrics emitted from its value columns. The registry is
//! immutable once built; the daemon loads it at start-up, either the builtin
//! set or a JSON file with the same shape.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::collector::StatError;
use crate::metrics::MetricKind;

/// Query of the builtin per-function source.
pub const FUNCTIONS_QUERY: &str = "SELECT current_database() AS datname, schemaname, funcname, \
     calls, total_time, self_time FROM pg_stat_user_functions";

/// Query of the builtin per-database source.
pub const DATABASE_QUERY: &str = "SELECT datname, xact_commit, xact_rollback, blks_read, \
     blks_hit, tup_returned, tup_fetched, tup_inserted, tup_updated, tup_deleted, conflicts, \
     temp_files, temp_bytes, deadlocks, blk_read_time, blk_write_time FROM pg_stat_database";

/// Query of the builtin per-table source.
pub const TABLES_QUERY: &str = "SELECT current_database() AS datname, schemaname, relname, \
     seq_scan, seq_tup_read, idx_scan, idx_tup_fetch, n_tup_ins, n_tup_upd, n_tup_del, \
     n_tup_hot_upd, n_live_tup, n_dead_tup, vacuum_count, autovacuum_count, analyze_count, \
     autoanalyze_count FROM pg_stat_user_tables";

/// Query of the builtin background writer source.
pub const BGWRITER_QUERY: &str =
    "SELECT buffers_clean, maxwritten_clean, buffers_alloc FROM pg_stat_bgwriter";

/// Query of the builtin pg_stat_statements source.
///
/// Since PostgreSQL 14 the same statement may appear twice (top-level and
/// nested); the reducer sums those rows.
pub const STATEMENTS_QUERY: &str = "SELECT d.datname, r.rolname AS usename, s.queryid, \
     s.calls, s.rows, s.shared_blks_hit, s.shared_blks_read, s.shared_blks_written, \
     s.temp_blks_written FROM pg_stat_statements s \
     JOIN pg_database d ON d.oid = s.dbid JOIN pg_roles r ON r.oid = s.userid";

fn default_scale() -> f64 {
    1.0
}

/// How one value column is exposed as a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Value column in the query result.
    pub column: String,
    /// Metric name.
    pub name: String,
    #[serde(default)]
    pub help: String,
    pub kind: MetricKind,
    /// Multiplier applied to the accumulated value (e.g. 0.001 for ms -> s).
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl MetricSpec {
    fn new(column: &str, name: &str, help: &str, kind: MetricKind) -> Self {
        Self {
            column: column.to_string(),
            name: name.to_string(),
            help: help.to_string(),
            kind,
            scale: 1.0,
        }
    }

    fn counter(column: &str, name: &str, help: &str) -> Self {
        Self::new(column, name, help, MetricKind::Counter)
    }

    fn gauge(column: &str, name: &str, help: &str) -> Self {
        Self::new(column, name, help, MetricKind::Gauge)
    }

    fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }
}

/// One family of statistics: query, identity columns and emitted metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSource {
    pub name: String,
    pub query: String,
    /// Key columns, in composite-key order.
    #[serde(default)]
    pub key_columns: Vec<String>,
    /// Optional view that must be available before the query is run.
    #[serde(default)]
    pub requires_view: Option<String>,
    /// Run the query in every database and merge the results. For views
    /// that only cover the connected database, like `pg_stat_user_tables`.
    #[serde(default)]
    pub per_database: bool,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

/// Immutable set of statistic sources.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    sources: Vec<StatSource>,
}

impl SourceRegistry {
    /// Builds a registry, rejecting duplicate names and empty queries.
    pub fn new(sources: Vec<StatSource>) -> Result<Self, StatError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if source.name.trim().is_empty() {
                return Err(StatError::Config("source with empty name".to_string()));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(StatError::Config(format!(
                    "duplicate source '{}'",
                    source.name
                )));
            }
            if source.query.trim().is_empty() {
                return Err(StatError::Config(format!(
                    "source '{}' has an empty query",
                    source.name
                )));
            }
            if let Some(m) = source.metrics.iter().find(|m| !m.scale.is_finite()) {
                return Err(StatError::Config(format!(
                    "metric '{}' of source '{}' has a non-finite scale",
                    m.name, source.name
                )));
            }
        }
        Ok(Self { sources })
    }

    /// Parses a registry from JSON (`{"sources": [...]}`).
    pub fn from_json(json: &str) -> Result<Self, StatError> {
        let parsed: SourceRegistry =
            serde_json::from_str(json).map_err(|e| StatError::Config(e.to_string()))?;
        Self::new(parsed.sources)
    }

    /// Loads a registry from a JSON file.
    pub fn load(path: &Path) -> Result<Self, StatError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| StatError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Builtin PostgreSQL sources.
    pub fn builtin() -> Self {
        Self {
            sources: vec![
                functions_source(),
                database_source(),
                tables_source(),
                bgwriter_source(),
                statements_source(),
            ],
        }
    }

    pub fn sources(&self) -> &[StatSource] {
        &self.sources
    }

    pub fn get(&self, name: &str) -> Option<&StatSource> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn functions_source() -> StatSource {
    StatSource {
        name: "postgres_functions".to_string(),
        query: FUNCTIONS_QUERY.to_string(),
        key_columns: keys(&["datname", "schemaname", "funcname"]),
        requires_view: None,
        per_database: true,
        metrics: vec![
            MetricSpec::counter(
                "calls",
                "postgres_function_calls_total",
                "Total number of times functions had been called.",
            ),
            MetricSpec::counter(
                "total_time",
                "postgres_function_total_time_seconds",
                "Total time spent in function and all functions called by it, in seconds.",
            )
            .scaled(0.001),
            MetricSpec::counter(
                "self_time",
                "postgres_function_self_time_seconds",
                "Total time spent in function itself, without functions called by it, in seconds.",
            )
            .scaled(0.001),
        ],
    }
}

fn database_source() -> StatSource {
    StatSource {
        name: "postgres_database".to_string(),
        query: DATABASE_QUERY.to_string(),
        key_columns: keys(&["datname"]),
        requires_view: None,
        per_database: false,
        metrics: vec![
            MetricSpec::counter(
                "xact_commit",
                "postgres_database_xact_commits_total",
                "Total number of transactions committed.",
            ),
            MetricSpec::counter(
                "xact_rollback",
                "postgres_database_xact_rollbacks_total",
                "Total number of transactions rolled back.",
            ),
            MetricSpec::counter(
                "blks_read",
                "postgres_database_blocks_read_total",
                "Total number of disk blocks read.",
            ),
            MetricSpec::counter(
                "blks_hit",
                "postgres_database_blocks_hit_total",
                "Total number of buffer cache hits.",
            ),
            MetricSpec::counter(
                "tup_returned",
                "postgres_database_tuples_returned_total",
                "Total number of rows returned by queries.",
            ),
            MetricSpec::counter(
                "tup_fetched",
                "postgres_database_tuples_fetched_total",
                "Total number of rows fetched by queries.",
            ),
            MetricSpec::counter(
                "tup_inserted",
                "postgres_database_tuples_inserted_total",
                "Total number of rows inserted.",
            ),
            MetricSpec::counter(
                "tup_updated",
                "postgres_database_tuples_updated_total",
                "Total number of rows updated.",
            ),
            MetricSpec::counter(
                "tup_deleted",
                "postgres_database_tuples_deleted_total",
                "Total number of rows deleted.",
            ),
            MetricSpec::counter(
                "conflicts",
                "postgres_database_conflicts_total",
                "Total number of queries canceled due to recovery conflicts.",
            ),
            MetricSpec::counter(
                "temp_files",
                "postgres_database_temp_files_total",
                "Total number of temporary files created.",
            ),
            MetricSpec::counter(
                "temp_bytes",
                "postgres_database_temp_bytes_total",
                "Total amount of data written to temporary files.",
            ),
            MetricSpec::counter(
                "deadlocks",
                "postgres_database_deadlocks_total",
                "Total number of deadlocks detected.",
            ),
            MetricSpec::counter(
                "blk_read_time",
                "postgres_database_blk_read_time_seconds",
                "Time spent reading data file blocks, in seconds.",
            )
            .scaled(0.001),
            MetricSpec::counter(
                "blk_write_time",
                "postgres_database_blk_write_time_seconds",
                "Time spent writing data file blocks, in seconds.",
            )
            .scaled(0.001),
        ],
    }
}

fn tables_source() -> StatSource {
    StatSource {
        name: "postgres_tables".to_string(),
        query: TABLES_QUERY.to_string(),
        key_columns: keys(&["datname", "schemaname", "relname"]),
        requires_view: None,
        per_database: true,
        metrics: vec![
            MetricSpec::counter(
                "seq_scan",
                "postgres_table_seq_scan_total",
                "Total number of sequential scans.",
            ),
            MetricSpec::counter(
                "seq_tup_read",
                "postgres_table_seq_tup_read_total",
                "Total number of rows fetched by sequential scans.",
            ),
            MetricSpec::counter(
                "idx_scan",
                "postgres_table_idx_scan_total",
                "Total number of index scans.",
            ),
            MetricSpec::counter(
                "idx_tup_fetch",
                "postgres_table_idx_tup_fetch_total",
                "Total number of rows fetched by index scans.",
            ),
            MetricSpec::counter(
                "n_tup_ins",
                "postgres_table_tuples_inserted_total",
                "Total number of rows inserted.",
            ),
            MetricSpec::counter(
                "n_tup_upd",
                "postgres_table_tuples_updated_total",
                "Total number of rows updated.",
            ),
            MetricSpec::counter(
                "n_tup_del",
                "postgres_table_tuples_deleted_total",
                "Total number of rows deleted.",
            ),
            MetricSpec::counter(
                "n_tup_hot_upd",
                "postgres_table_tuples_hot_updated_total",
                "Total number of rows HOT updated.",
            ),
            MetricSpec::gauge(
                "n_live_tup",
                "postgres_table_tuples_live",
                "Estimated number of live rows.",
            ),
            MetricSpec::gauge(
                "n_dead_tup",
                "postgres_table_tuples_dead",
                "Estimated number of dead rows.",
            ),
            MetricSpec::counter(
                "vacuum_count",
                "postgres_table_vacuum_total",
                "Total number of manual vacuums.",
            ),
            MetricSpec::counter(
                "autovacuum_count",
                "postgres_table_autovacuum_total",
                "Total number of autovacuums.",
            ),
            MetricSpec::counter(
                "analyze_count",
                "postgres_table_analyze_total",
                "Total number of manual analyzes.",
            ),
            MetricSpec::counter(
                "autoanalyze_count",
                "postgres_table_autoanalyze_total",
                "Total number of autoanalyzes.",
            ),
        ],
    }
}

fn bgwriter_source() -> StatSource {
    StatSource {
        name: "postgres_bgwriter".to_string(),
        query: BGWRITER_QUERY.to_string(),
        key_columns: Vec::new(),
        requires_view: None,
        per_database: false,
        metrics: vec![
            MetricSpec::counter(
                "buffers_clean",
                "postgres_bgwriter_buffers_clean_total",
                "Total number of buffers written by the background writer.",
            ),
            MetricSpec::counter(
                "maxwritten_clean",
                "postgres_bgwriter_maxwritten_clean_total",
                "Total number of times the background writer stopped a cleaning scan.",
            ),
            MetricSpec::counter(
                "buffers_alloc",
                "postgres_bgwriter_buffers_alloc_total",
                "Total number of buffers allocated.",
            ),
        ],
    }
}

fn statements_source() -> StatSource {
    StatSource {
        name: "postgres_statements".to_string(),
        query: STATEMENTS_QUERY.to_string(),
        key_columns: keys(&["datname", "usename", "queryid"]),
        requires_view: Some("pg_stat_statements".to_string()),
        per_database: false,
        metrics: vec![
            MetricSpec::counter(
                "calls",
                "postgres_statements_calls_total",
                "Total number of times statement has been executed.",
            ),
            MetricSpec::counter(
                "rows",
                "postgres_statements_rows_total",
                "Total number of rows retrieved or affected by the statement.",
            ),
            MetricSpec::counter(
                "shared_blks_hit",
                "postgres_statements_shared_hit_blocks_total",
                "Total number of shared block cache hits by the statement.",
            ),
            MetricSpec::counter(
                "shared_blks_read",
                "postgres_statements_shared_read_blocks_total",
                "Total number of shared blocks read by the statement.",
            ),
            MetricSpec::counter(
                "shared_blks_written",
                "postgres_statements_shared_written_blocks_total",
                "Total number of shared blocks written by the statement.",
            ),
            MetricSpec::counter(
                "temp_blks_written",
                "postgres_statements_temp_written_blocks_total",
                "Total number of temp blocks written by the statement.",
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_valid() {
        let builtin = SourceRegistry::builtin();
        let rebuilt = SourceRegistry::new(builtin.sources().to_vec()).unwrap();
        assert_eq!(rebuilt, builtin);
        assert_eq!(builtin.len(), 5);
    }

    #[test]
    fn builtin_functions_source_matches_expected_metrics() {
        let registry = SourceRegistry::builtin();
        let source = registry.get("postgres_functions").unwrap();

        assert_eq!(source.key_columns, vec!["datname", "schemaname", "funcname"]);
        let names: Vec<&str> = source.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "postgres_function_calls_total",
                "postgres_function_total_time_seconds",
                "postgres_function_self_time_seconds",
            ]
        );
    }

    #[test]
    fn only_statements_requires_a_view() {
        let registry = SourceRegistry::builtin();
        let optional: Vec<&str> = registry
            .sources()
            .iter()
            .filter(|s| s.requires_view.is_some())
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(optional, vec!["postgres_statements"]);
    }

    #[test]
    fn only_user_object_sources_run_per_database() {
        let registry = SourceRegistry::builtin();
        let per_database: Vec<&str> = registry
            .sources()
            .iter()
            .filter(|s| s.per_database)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(per_database, vec!["postgres_functions", "postgres_tables"]);
    }

    #[test]
    fn from_json_applies_defaults() {
        let json = r#"{
            "sources": [{
                "name": "locks",
                "query": "SELECT mode, count(*) AS locks FROM pg_locks GROUP BY mode",
                "key_columns": ["mode"],
                "metrics": [{
                    "column": "locks",
                    "name": "postgres_locks_in_flight",
                    "kind": "gauge"
                }]
            }]
        }"#;

        let registry = SourceRegistry::from_json(json).unwrap();
        let source = registry.get("locks").unwrap();

        assert_eq!(source.requires_view, None);
        assert!(!source.per_database);
        assert_eq!(source.metrics[0].kind, MetricKind::Gauge);
        assert_eq!(source.metrics[0].scale, 1.0);
        assert_eq!(source.metrics[0].help, "");
    }

    #[test]
    fn duplicate_source_names_are_rejected() {
        let json = r#"{"sources": [
            {"name": "a", "query": "SELECT 1"},
            {"name": "a", "query": "SELECT 2"}
        ]}"#;
        let err = SourceRegistry::from_json(json).unwrap_err();
        assert_eq!(err, StatError::Config("duplicate source 'a'".to_string()));
    }

    #[test]
    fn empty_query_is_rejected() {
        let json = r#"{"sources": [{"name": "a", "query": "  "}]}"#;
        assert!(matches!(
            SourceRegistry::from_json(json),
            Err(StatError::Config(_))
        ));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            SourceRegistry::from_json("{not json"),
            Err(StatError::Config(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = SourceRegistry::load(Path::new("/nonexistent/sources.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/sources.json"));
    }
}
