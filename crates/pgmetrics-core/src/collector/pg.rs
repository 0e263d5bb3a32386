//! PostgreSQL connection backed by the synchronous `postgres` client.
//!
//! Queries run over the simple query protocol, so the server sends every
//! value in its text form and `NULL` stays distinguishable from `''`. This
//! also keeps the collector usable through pgbouncer.

use std::time::{Duration, Instant};

use postgres::{Client, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, info, warn};

use super::{Cell, Connection, DatabaseConnection, RowCursor, StatError, list_databases};

/// How often the per-database connection pool is refreshed.
const DATABASE_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

impl Connection for Client {
    type Cursor<'c> = SimpleCursor;

    fn query(&mut self, sql: &str) -> Result<Self::Cursor<'_>, StatError> {
        let messages = self.simple_query(sql).map_err(|e| classify_error(&e))?;
        Ok(SimpleCursor::from_messages(messages))
    }
}

/// Cursor over the first result set of a simple query.
///
/// The simple protocol delivers the whole result at once; the cursor walks
/// the buffered rows and `close()` releases them.
pub struct SimpleCursor {
    columns: Vec<String>,
    rows: std::vec::IntoIter<SimpleQueryRow>,
}

impl SimpleCursor {
    fn from_messages(messages: Vec<SimpleQueryMessage>) -> Self {
        let mut columns: Option<Vec<String>> = None;
        let mut rows = Vec::new();

        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(desc) => {
                    if columns.is_none() {
                        columns = Some(desc.iter().map(|c| c.name().to_string()).collect());
                    }
                }
                SimpleQueryMessage::Row(row) => {
                    if columns.is_none() {
                        columns =
                            Some(row.columns().iter().map(|c| c.name().to_string()).collect());
                    }
                    rows.push(row);
                }
                // Only the first statement's result is materialized.
                SimpleQueryMessage::CommandComplete(_) => break,
                _ => {}
            }
        }

        Self {
            columns: columns.unwrap_or_default(),
            rows: rows.into_iter(),
        }
    }
}

impl RowCursor for SimpleCursor {
    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn next_row(&mut self) -> Option<Result<Vec<Cell>, StatError>> {
        let row = self.rows.next()?;
        let cells: Result<Vec<Cell>, StatError> = (0..row.len())
            .map(|i| {
                row.try_get(i)
                    .map(Cell::from)
                    .map_err(|e| StatError::RowScan(e.to_string()))
            })
            .collect();
        Some(cells)
    }

    fn close(&mut self) {
        self.rows = Vec::new().into_iter();
    }
}

/// Maps a driver error to a connection-level or query-level failure.
///
/// Only errors reported by the server are query-level; I/O, protocol and
/// closed-connection errors leave the client unusable.
fn classify_error(e: &postgres::Error) -> StatError {
    let msg = format_postgres_error(e);
    if e.is_closed() || e.as_db_error().is_none() {
        StatError::Connection(msg)
    } else {
        StatError::Query(msg)
    }
}

/// A lazily (re)connected PostgreSQL session.
///
/// Connects using standard environment variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
///
/// Unless PGDATABASE is set, the session also keeps one connection per
/// connectable database for per-database sources.
pub struct PgSession {
    connection_string: String,
    endpoint: String,
    client: Option<Client>,
    last_error: Option<String>,
    /// true if PGDATABASE was set (disables multi-database collection).
    explicit_database: bool,
    databases: Vec<DatabaseConnection<Client>>,
    databases_checked: Option<Instant>,
}

impl PgSession {
    /// Creates a session from environment variables. Does not connect yet.
    ///
    /// Uses $USER as default if PGUSER is not set.
    pub fn from_env() -> Result<Self, StatError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| StatError::EnvNotSet("PGUSER or USER".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let explicit_database = std::env::var("PGDATABASE").is_ok();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let connection_string =
            build_connection_string(&host, &port, &user, &password, &database);
        Ok(Self {
            connection_string,
            endpoint: format!("{}:{}", host, port),
            client: None,
            last_error: None,
            explicit_database,
            databases: Vec::new(),
            databases_checked: None,
        })
    }

    /// Creates a session with an explicit libpq-style connection string.
    ///
    /// Per-database collection is enabled unless the string names a database.
    pub fn with_connection_string(connection_string: String) -> Self {
        Self {
            endpoint: endpoint_of(&connection_string),
            explicit_database: connection_string
                .split_whitespace()
                .any(|t| t.starts_with("dbname=")),
            connection_string,
            client: None,
            last_error: None,
            databases: Vec::new(),
            databases_checked: None,
        }
    }

    /// `host:port` this session connects to, for logging.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the last error message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Returns the connected client, connecting first if needed.
    pub fn client(&mut self) -> Result<&mut Client, StatError> {
        if self.client.is_none() {
            match Client::connect(&self.connection_string, NoTls) {
                Ok(client) => {
                    info!(endpoint = %self.endpoint, "connected to PostgreSQL");
                    self.client = Some(client);
                    self.last_error = None;
                }
                Err(e) => {
                    let msg = format_postgres_error(&e);
                    self.last_error = Some(msg.clone());
                    return Err(StatError::Connection(msg));
                }
            }
        }

        self.client
            .as_mut()
            .ok_or_else(|| StatError::Connection("not connected".to_string()))
    }

    /// Returns the main client and the per-database connections, connecting
    /// and refreshing the pool first if needed.
    ///
    /// The per-database list is empty when PGDATABASE is set or no database
    /// could be reached; per-database sources then run on the main client.
    pub fn connections(
        &mut self,
    ) -> Result<(&mut Client, &mut [DatabaseConnection<Client>]), StatError> {
        self.client()?;
        self.refresh_databases();

        let client = self
            .client
            .as_mut()
            .ok_or_else(|| StatError::Connection("not connected".to_string()))?;
        Ok((client, &mut self.databases))
    }

    /// Names of the databases with an open per-database connection.
    pub fn databases(&self) -> Vec<&str> {
        self.databases.iter().map(|d| d.datname.as_str()).collect()
    }

    /// Drops the connection to one database; it is reopened on the next refresh.
    pub fn drop_database(&mut self, datname: &str) {
        let before = self.databases.len();
        self.databases.retain(|d| d.datname != datname);
        if self.databases.len() < before {
            debug!(database = %datname, "dropping per-database connection");
            self.databases_checked = None;
        }
    }

    /// Drops the current connection; the next `client()` call reconnects.
    pub fn disconnect(&mut self, reason: &str) {
        if self.client.take().is_some() {
            debug!(endpoint = %self.endpoint, reason, "dropping PostgreSQL connection");
        }
        self.databases.clear();
        self.databases_checked = None;
        self.last_error = Some(reason.to_string());
    }

    /// Keeps one connection per connectable database.
    ///
    /// Lists databases over the main client at most every
    /// [`DATABASE_REFRESH_INTERVAL`], connects to new ones and drops the
    /// connections of databases that are gone.
    fn refresh_databases(&mut self) {
        if self.explicit_database {
            return;
        }
        if let Some(checked) = self.databases_checked
            && checked.elapsed() < DATABASE_REFRESH_INTERVAL
            && !self.databases.is_empty()
        {
            return;
        }
        self.databases_checked = Some(Instant::now());

        let Some(client) = self.client.as_mut() else {
            return;
        };
        let names = match list_databases(client) {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to list databases");
                return;
            }
        };

        let before = self.databases.len();
        self.databases.retain(|d| names.contains(&d.datname));
        let removed = before - self.databases.len();

        let mut added = 0;
        for name in &names {
            if self.databases.iter().any(|d| d.datname == *name) {
                continue;
            }
            let conn_str = replace_dbname(&self.connection_string, name);
            match Client::connect(&conn_str, NoTls) {
                Ok(conn) => {
                    self.databases.push(DatabaseConnection {
                        datname: name.clone(),
                        conn,
                    });
                    added += 1;
                }
                Err(e) => {
                    warn!(database = %name, error = %format_postgres_error(&e),
                        "failed to connect for per-database sources");
                }
            }
        }
        self.databases.sort_by(|a, b| a.datname.cmp(&b.datname));

        if added > 0 || removed > 0 {
            info!(
                databases = ?self.databases(), added, removed,
                "per-database connection pool updated"
            );
        }
    }
}

fn build_connection_string(
    host: &str,
    port: &str,
    user: &str,
    password: &str,
    database: &str,
) -> String {
    if password.is_empty() {
        format!(
            "host={} port={} user={} dbname={}",
            host, port, user, database
        )
    } else {
        format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, user, password, database
        )
    }
}

/// Replaces the `dbname=` parameter of a libpq key=value connection string,
/// appending it if absent.
fn replace_dbname(connection_string: &str, datname: &str) -> String {
    let mut found = false;
    let parts: Vec<String> = connection_string
        .split_whitespace()
        .map(|token| {
            if token.starts_with("dbname=") {
                found = true;
                format!("dbname={}", datname)
            } else {
                token.to_string()
            }
        })
        .collect();

    if found {
        parts.join(" ")
    } else {
        format!("{} dbname={}", connection_string, datname)
    }
}

/// Extracts `host:port` from a libpq key=value connection string.
fn endpoint_of(connection_string: &str) -> String {
    let mut host = "localhost";
    let mut port = "5432";
    for token in connection_string.split_whitespace() {
        if let Some(v) = token.strip_prefix("host=") {
            host = v;
        } else if let Some(v) = token.strip_prefix("port=") {
            port = v;
        }
    }
    format!("{}:{}", host, port)
}

/// Formats PostgreSQL error message for display.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_omits_empty_password() {
        assert_eq!(
            build_connection_string("db1", "5433", "app", "", "appdb"),
            "host=db1 port=5433 user=app dbname=appdb"
        );
        assert_eq!(
            build_connection_string("db1", "5433", "app", "secret", "appdb"),
            "host=db1 port=5433 user=app password=secret dbname=appdb"
        );
    }

    #[test]
    fn endpoint_is_parsed_from_connection_string() {
        assert_eq!(endpoint_of("host=pg1 port=6432 user=app"), "pg1:6432");
        assert_eq!(endpoint_of("user=app dbname=x"), "localhost:5432");
    }

    #[test]
    fn session_starts_disconnected() {
        let mut session = PgSession::with_connection_string("host=pg1 user=app".to_string());
        assert!(!session.is_connected());
        assert_eq!(session.endpoint(), "pg1:5432");
        assert!(session.databases().is_empty());

        session.disconnect("query failed");
        assert_eq!(session.last_error(), Some("query failed"));
    }

    #[test]
    fn named_database_disables_per_database_pool() {
        let named = PgSession::with_connection_string("host=pg1 dbname=app".to_string());
        let unnamed = PgSession::with_connection_string("host=pg1 user=app".to_string());
        assert!(named.explicit_database);
        assert!(!unnamed.explicit_database);
    }

    #[test]
    fn replace_dbname_replaces_or_appends() {
        assert_eq!(
            replace_dbname("host=pg1 port=5432 user=app dbname=postgres", "orders"),
            "host=pg1 port=5432 user=app dbname=orders"
        );
        assert_eq!(
            replace_dbname("host=pg1 user=app", "orders"),
            "host=pg1 user=app dbname=orders"
        );
        assert_eq!(
            replace_dbname("dbname=old host=pg1", "new"),
            "dbname=new host=pg1"
        );
    }

    #[test]
    fn empty_message_list_yields_empty_cursor() {
        let mut cursor = SimpleCursor::from_messages(Vec::new());
        assert!(cursor.column_names().is_empty());
        assert!(cursor.next_row().is_none());
    }
}
