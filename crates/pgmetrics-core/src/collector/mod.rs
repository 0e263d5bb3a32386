//! Generic statistics acquisition for PostgreSQL.
//!
//! Every statistic source goes through the same two phases: a query result is
//! materialized into a type-erased [`ResultTable`], then folded by the
//! [`StatReducer`] into [`StatRecord`]s keyed by a composite identity.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Connection (trait)                   │
//! │   ┌───────────────────────┐      ┌────────────────────────┐  │
//! │   │ postgres::Client      │      │ MockConnection         │  │
//! │   │ (simple query, text)  │      │ (scripted, testing)    │  │
//! │   └───────────┬───────────┘      └───────────┬────────────┘  │
//! └───────────────┼──────────────────────────────┼───────────────┘
//!                 └──────────────┬───────────────┘
//!                         ┌──────▼──────┐
//!                         │  acquire()  │ ──► ResultTable
//!                         └──────┬──────┘
//!                         ┌──────▼──────┐
//!                         │ StatReducer │ ──► HashMap<key, StatRecord>
//!                         └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use pgmetrics_core::collector::mock::MockConnection;
//! use pgmetrics_core::collector::{StatValue, acquire, reduce};
//!
//! let mut conn = MockConnection::new().with_rows(
//!     "SELECT datname, xact_commit FROM pg_stat_database",
//!     &["datname", "xact_commit"],
//!     vec![vec![Some("app"), Some("10")], vec![Some("app"), Some("5")]],
//! );
//! let table = acquire(&mut conn, "SELECT datname, xact_commit FROM pg_stat_database")
//!     .unwrap();
//! let stats = reduce(&table, &["datname"]).unwrap();
//! assert_eq!(stats["app"].value("xact_commit"), Some(15.0));
//! assert_eq!(stats["app"].exact("xact_commit"), Some(StatValue::Int(15)));
//! ```

mod acquire;
mod connection;
mod databases;
pub mod functions;
pub mod mock;
pub mod pg;
pub(crate) mod probe;
mod reduce;
mod result;

pub use acquire::acquire;
pub use connection::{Connection, DatabaseConnection, RowCursor};
pub use databases::{DATABASES_QUERY, list_databases};
pub use functions::{FunctionStat, parse_function_stats};
pub use pg::{PgSession, format_postgres_error};
pub use probe::{check_available, is_available};
pub use reduce::{
    EmptyKeyPolicy, KEY_SEPARATOR, StatReducer, StatRecord, StatValue, composite_key, reduce,
};
pub use result::{Cell, ResultTable};

/// Error type for statistics collection.
#[derive(Debug, Clone, PartialEq)]
pub enum StatError {
    /// Environment variable not set.
    EnvNotSet(String),
    /// Connection failed or was lost while querying.
    Connection(String),
    /// Query execution failed.
    Query(String),
    /// A single row could not be converted to text cells.
    RowScan(String),
    /// A row's cell count does not match the table's column count.
    RowWidth { expected: usize, got: usize },
    /// Results of the same query differ in their columns.
    ColumnMismatch { expected: String, got: String },
    /// A key column named by a statistic source is absent from the result.
    MissingKeyColumn(String),
    /// Invalid statistic-source configuration.
    Config(String),
}

impl StatError {
    /// Returns true if the error means the connection must be re-established.
    pub fn is_connection(&self) -> bool {
        matches!(self, StatError::Connection(_))
    }
}

impl std::fmt::Display for StatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatError::EnvNotSet(var) => write!(f, "PostgreSQL: {} not set", var),
            StatError::Connection(msg) => write!(f, "PostgreSQL: {}", msg),
            StatError::Query(msg) => write!(f, "PostgreSQL query error: {}", msg),
            StatError::RowScan(msg) => write!(f, "row scan failed: {}", msg),
            StatError::RowWidth { expected, got } => {
                write!(f, "row has {} cells, expected {}", got, expected)
            }
            StatError::ColumnMismatch { expected, got } => {
                write!(f, "result columns [{}] differ from [{}]", got, expected)
            }
            StatError::MissingKeyColumn(column) => {
                write!(f, "key column '{}' not found in query result", column)
            }
            StatError::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for StatError {}
