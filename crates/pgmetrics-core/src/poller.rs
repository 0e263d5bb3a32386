//! One collection cycle over the statistic-source registry.
//!
//! For each source: check availability if it depends on an optional view,
//! acquire the query result, reduce it and emit samples. Per-database sources
//! run in every database and their results are merged before reduction. A
//! failing source is logged and skipped; only a lost main connection ends the
//! cycle early.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::collector::{
    Connection, DatabaseConnection, ResultTable, StatError, StatReducer, acquire, check_available,
};
use crate::metrics::{Sample, emit};
use crate::sources::{SourceRegistry, StatSource};

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub samples: Vec<Sample>,
    /// Sources whose query or reduction failed, with the error. Failures in
    /// a single database are named `source@database`.
    pub failed: Vec<(String, StatError)>,
    /// Optional sources skipped because their view is unavailable.
    pub skipped: Vec<String>,
    /// Sources that produced samples.
    pub collected: Vec<String>,
    /// True if the main connection was lost; remaining sources were not polled.
    pub connection_lost: bool,
    /// Databases whose per-database connection was lost.
    pub lost_databases: Vec<String>,
    pub elapsed: Duration,
}

/// Runs poll cycles with a fixed registry and reducer.
#[derive(Debug, Clone)]
pub struct Poller {
    registry: SourceRegistry,
    reducer: StatReducer,
}

impl Poller {
    pub fn new(registry: SourceRegistry, reducer: StatReducer) -> Self {
        Self { registry, reducer }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Polls every source once over `conn`.
    ///
    /// Per-database sources only see the database `conn` is connected to.
    pub fn poll_once<C: Connection>(&self, conn: &mut C) -> PollReport {
        self.poll_cluster::<C, C>(conn, &mut [])
    }

    /// Polls every source once: cluster-wide sources over `conn`,
    /// per-database sources over each of `databases`.
    ///
    /// With no database connections, per-database sources run over `conn`.
    pub fn poll_cluster<C: Connection, D: Connection>(
        &self,
        conn: &mut C,
        databases: &mut [DatabaseConnection<D>],
    ) -> PollReport {
        let start = Instant::now();
        let mut report = PollReport::default();

        for source in self.registry.sources() {
            if let Some(view) = source.requires_view.as_deref() {
                match check_available(conn, view) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(source = %source.name, view, "source unavailable, skipping");
                        report.skipped.push(source.name.clone());
                        continue;
                    }
                    Err(e) => {
                        warn!(source = %source.name, view, error = %e, "connection lost");
                        report.failed.push((source.name.clone(), e));
                        report.connection_lost = true;
                        break;
                    }
                }
            }

            let samples = if source.per_database && !databases.is_empty() {
                self.collect_per_database(databases, source, &mut report)
            } else {
                match self.collect_source(conn, source) {
                    Ok(samples) => Some(samples),
                    Err(e) => {
                        warn!(source = %source.name, error = %e, "failed to collect source");
                        let lost = e.is_connection();
                        report.failed.push((source.name.clone(), e));
                        if lost {
                            report.connection_lost = true;
                            break;
                        }
                        None
                    }
                }
            };

            if let Some(samples) = samples {
                debug!(source = %source.name, samples = samples.len(), "source collected");
                report.samples.extend(samples);
                report.collected.push(source.name.clone());
            }
        }

        report.elapsed = start.elapsed();
        report
    }

    fn collect_source<C: Connection>(
        &self,
        conn: &mut C,
        source: &StatSource,
    ) -> Result<Vec<Sample>, StatError> {
        let table = acquire(conn, &source.query)?;
        let records = self.reducer.reduce(&table, &source.key_columns)?;
        Ok(emit(source, &records))
    }

    /// Runs `source` in every database, merges the results and reduces them
    /// once. Returns `None` if no database answered or the reduction failed.
    fn collect_per_database<D: Connection>(
        &self,
        databases: &mut [DatabaseConnection<D>],
        source: &StatSource,
        report: &mut PollReport,
    ) -> Option<Vec<Sample>> {
        let mut merged: Option<ResultTable> = None;

        for db in databases.iter_mut() {
            let result = match acquire(&mut db.conn, &source.query) {
                Ok(table) => match merged.as_mut() {
                    Some(all) => all.append(table),
                    None => {
                        merged = Some(table);
                        Ok(())
                    }
                },
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(source = %source.name, database = %db.datname, error = %e,
                    "failed to collect source in database");
                if e.is_connection() && !report.lost_databases.contains(&db.datname) {
                    report.lost_databases.push(db.datname.clone());
                }
                report
                    .failed
                    .push((format!("{}@{}", source.name, db.datname), e));
            }
        }

        let table = merged?;
        match self.reducer.reduce(&table, &source.key_columns) {
            Ok(records) => Some(emit(source, &records)),
            Err(e) => {
                warn!(source = %source.name, error = %e, "failed to collect source");
                report.failed.push((source.name.clone(), e));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::EmptyKeyPolicy;
    use crate::collector::mock::{MockConnection, MockResponse};
    use crate::sources::{
        BGWRITER_QUERY, DATABASE_QUERY, FUNCTIONS_QUERY, STATEMENTS_QUERY, TABLES_QUERY,
    };

    fn poller() -> Poller {
        Poller::new(SourceRegistry::builtin(), StatReducer::default())
    }

    fn sample<'a>(report: &'a PollReport, name: &str, label: &str) -> Option<&'a Sample> {
        report
            .samples
            .iter()
            .find(|s| s.name == name && s.labels.iter().any(|(_, v)| v == label))
    }

    #[test]
    fn typical_server_collects_every_source() {
        let mut conn = MockConnection::typical_server();

        let report = poller().poll_once(&mut conn);

        assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
        assert!(report.skipped.is_empty());
        assert!(!report.connection_lost);
        assert_eq!(report.collected.len(), 5);

        let calls = sample(&report, "postgres_function_calls_total", "calc_totals").unwrap();
        assert_eq!(calls.value, 15.0);

        // Same statement reported top-level and nested is merged.
        let stmt = sample(&report, "postgres_statements_calls_total", "4242").unwrap();
        assert_eq!(stmt.value, 120.0);

        // Every cursor handed out was closed.
        assert_eq!(conn.cursors_opened(), conn.cursors_closed());
    }

    #[test]
    fn unavailable_statements_view_is_skipped_each_cycle() {
        let mut conn = MockConnection::without_statements();
        let poller = poller();

        for _ in 0..2 {
            let report = poller.poll_once(&mut conn);
            assert_eq!(report.skipped, vec!["postgres_statements".to_string()]);
            assert!(report.failed.is_empty());
        }

        assert!(!conn.executed().iter().any(|q| q == STATEMENTS_QUERY));
    }

    #[test]
    fn failing_source_does_not_stop_the_cycle() {
        let mut conn = MockConnection::typical_server()
            .with_query_error(FUNCTIONS_QUERY, "ERROR: permission denied for view");

        let report = poller().poll_once(&mut conn);

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "postgres_functions");
        assert!(report.collected.contains(&"postgres_database".to_string()));
        assert!(sample(&report, "postgres_database_xact_commits_total", "app").is_some());
    }

    #[test]
    fn lost_connection_ends_the_cycle() {
        let mut conn = MockConnection::typical_server()
            .with_connection_lost(DATABASE_QUERY, "connection closed");

        let report = poller().poll_once(&mut conn);

        assert!(report.connection_lost);
        assert_eq!(report.collected, vec!["postgres_functions".to_string()]);
        assert!(!conn.executed().iter().any(|q| q == BGWRITER_QUERY));
    }

    #[test]
    fn lost_connection_during_view_check_ends_the_cycle() {
        let mut conn = MockConnection::typical_server().with_view_check_lost("pg_stat_statements");

        let report = poller().poll_once(&mut conn);

        assert!(report.connection_lost);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "postgres_statements");
        assert!(report.failed[0].1.is_connection());
        assert!(report.skipped.is_empty());
        assert_eq!(report.collected.len(), 4);
    }

    fn databases(names: &[&str]) -> Vec<DatabaseConnection<MockConnection>> {
        names
            .iter()
            .map(|name| DatabaseConnection {
                datname: name.to_string(),
                conn: MockConnection::single_database(name),
            })
            .collect()
    }

    #[test]
    fn per_database_sources_run_in_every_database() {
        let mut conn = MockConnection::typical_server();
        let mut dbs = databases(&["orders", "shop"]);

        let report = poller().poll_cluster(&mut conn, &mut dbs);

        assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
        assert_eq!(report.collected.len(), 5);
        let calls: Vec<(&str, f64)> = report
            .samples
            .iter()
            .filter(|s| s.name == "postgres_function_calls_total")
            .map(|s| (s.labels[0].1.as_str(), s.value))
            .collect();
        assert_eq!(calls, vec![("orders", 4.0), ("shop", 4.0)]);
        assert!(sample(&report, "postgres_table_seq_scan_total", "shop").is_some());

        // Cluster-wide sources stay on the main connection.
        assert!(sample(&report, "postgres_database_xact_commits_total", "app").is_some());
        assert!(!conn.executed().iter().any(|q| q == FUNCTIONS_QUERY));
        assert!(!conn.executed().iter().any(|q| q == TABLES_QUERY));
        assert!(dbs.iter().all(|d| d.conn.cursors_opened() == 2));
    }

    #[test]
    fn failing_database_does_not_stop_the_others() {
        let mut conn = MockConnection::typical_server();
        let mut dbs = databases(&["orders", "shop"]);
        dbs[1].conn.set_response(
            TABLES_QUERY,
            MockResponse::ConnectionLost("server closed the connection".to_string()),
        );

        let report = poller().poll_cluster(&mut conn, &mut dbs);

        assert!(!report.connection_lost);
        assert_eq!(report.lost_databases, vec!["shop".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "postgres_tables@shop");
        assert!(report.collected.contains(&"postgres_tables".to_string()));
        assert!(report.collected.contains(&"postgres_bgwriter".to_string()));
        assert!(sample(&report, "postgres_table_seq_scan_total", "orders").is_some());
        assert!(sample(&report, "postgres_table_seq_scan_total", "shop").is_none());
    }

    #[test]
    fn per_database_source_with_no_answer_is_not_collected() {
        let mut conn = MockConnection::typical_server();
        let mut dbs = databases(&["orders"]);
        dbs[0].conn.set_response(
            FUNCTIONS_QUERY,
            MockResponse::QueryError("permission denied".to_string()),
        );

        let report = poller().poll_cluster(&mut conn, &mut dbs);

        assert!(!report.collected.contains(&"postgres_functions".to_string()));
        assert_eq!(report.failed[0].0, "postgres_functions@orders");
        assert!(report.lost_databases.is_empty());
    }

    #[test]
    fn empty_key_policy_controls_shared_database_row() {
        let mut conn = MockConnection::typical_server();

        let dropped = poller().poll_once(&mut conn);
        let aggregated = Poller::new(
            SourceRegistry::builtin(),
            StatReducer::new().with_empty_keys(EmptyKeyPolicy::Aggregate),
        )
        .poll_once(&mut conn);

        let count = |r: &PollReport| {
            r.samples
                .iter()
                .filter(|s| s.name == "postgres_database_xact_commits_total")
                .count()
        };
        assert_eq!(count(&dropped), 2);
        assert_eq!(count(&aggregated), 3);
    }

    #[test]
    fn registry_with_missing_key_column_fails_that_source() {
        let registry = SourceRegistry::new(vec![StatSource {
            name: "broken".to_string(),
            query: BGWRITER_QUERY.to_string(),
            key_columns: vec!["datname".to_string()],
            requires_view: None,
            per_database: false,
            metrics: Vec::new(),
        }])
        .unwrap();
        let mut conn = MockConnection::typical_server();

        let report = Poller::new(registry, StatReducer::default()).poll_once(&mut conn);

        assert_eq!(
            report.failed,
            vec![(
                "broken".to_string(),
                StatError::MissingKeyColumn("datname".to_string())
            )]
        );
    }
}
