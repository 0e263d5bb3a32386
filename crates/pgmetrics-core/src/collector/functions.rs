//! Per-function statistics from `pg_stat_user_functions`.

use std::collections::HashMap;

use super::{ResultTable, StatError, StatReducer, StatRecord, StatValue};

/// Key columns identifying a function, in composite-key order.
pub const FUNCTION_KEY_COLUMNS: [&str; 3] = ["datname", "schemaname", "funcname"];

/// Accumulated statistics of one function.
///
/// Times are in milliseconds, as reported by the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionStat {
    pub datname: String,
    pub schemaname: String,
    pub funcname: String,
    pub calls: u64,
    pub total_time: f64,
    pub self_time: f64,
}

impl From<&StatRecord> for FunctionStat {
    fn from(rec: &StatRecord) -> Self {
        let label = |name| rec.label(name).unwrap_or_default().to_string();
        let value = |name| rec.value(name).unwrap_or(0.0);
        Self {
            datname: label("datname"),
            schemaname: label("schemaname"),
            funcname: label("funcname"),
            calls: rec.exact("calls").map(count).unwrap_or(0),
            total_time: value("total_time"),
            self_time: value("self_time"),
        }
    }
}

/// Converts an accumulated call count, clamping to the `u64` range.
fn count(value: StatValue) -> u64 {
    match value {
        StatValue::Int(v) => u64::try_from(v.max(0)).unwrap_or(u64::MAX),
        StatValue::Float(v) => v.max(0.0) as u64,
    }
}

/// Parses function statistics keyed by `datname/schemaname/funcname`.
pub fn parse_function_stats(
    table: &ResultTable,
) -> Result<HashMap<String, FunctionStat>, StatError> {
    parse_function_stats_with(&StatReducer::default(), table)
}

/// Same as [`parse_function_stats`] with an explicit reducer.
pub fn parse_function_stats_with(
    reducer: &StatReducer,
    table: &ResultTable,
) -> Result<HashMap<String, FunctionStat>, StatError> {
    Ok(reducer
        .reduce(table, &FUNCTION_KEY_COLUMNS)?
        .iter()
        .map(|(key, rec)| (key.clone(), FunctionStat::from(rec)))
        .collect())
}
