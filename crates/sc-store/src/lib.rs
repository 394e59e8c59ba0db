#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use sc_match::{MatchError, MatchPolicy, MatchReport, RowMatcher};
use sc_normalize::{NormalizeError, Normalizer, ResultFormat};
use sc_types::SourceRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[cfg(feature = "sql-sqlite")]
mod sqlite;

#[cfg(feature = "sql-sqlite")]
pub use sqlite::SqliteExecutor;

/// Text-search predicate used by [`Verifier::count_rows_with_emoji`].
pub const EMOJI_PATTERN: &str = "%\u{1F600}%";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Row serialization for [`QueryExecutor::query_lines`]. Executors pick
    /// their own default when unset.
    #[serde(default)]
    pub format: Option<ResultFormat>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl QueryOptions {
    #[must_use]
    pub fn with_format(format: ResultFormat) -> Self {
        Self {
            format: Some(format),
            settings: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn setting(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(name.into(), value.into());
        self
    }
}

/// The store seam. Implementations own the connection; nothing in this crate
/// opens or closes one.
pub trait QueryExecutor {
    /// One serialized row per line, in `options.format`.
    fn query_lines(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Rows as text cells, in column order.
    fn query_rows(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> impl Future<Output = Result<Vec<Vec<String>>, StoreError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeouts {
    pub count: Duration,
    /// Sum and filtered count.
    pub aggregate: Duration,
    /// Full-table reads for verification.
    pub rows: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            count: Duration::from_secs(120),
            aggregate: Duration::from_secs(30),
            rows: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} did not complete within {bound:?}")]
    Timeout {
        operation: &'static str,
        bound: Duration,
    },
    #[error("query `{query}` failed: {source}")]
    Execution {
        query: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("query `{query}` returned no scalar")]
    EmptyResult { query: String },
    #[error("scalar {value:?} is not a valid {expected}")]
    InvalidScalar {
        value: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Parse(#[from] NormalizeError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

impl StoreError {
    pub fn execution(
        query: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Execution {
            query: query.into(),
            source: source.into(),
        }
    }
}

/// Backtick-quotes an identifier, doubling embedded backticks.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Waits at most `bound` for `future`. On expiry the future is dropped and
/// the call reported as timed out; there is no retry.
pub async fn bounded<T, F>(
    operation: &'static str,
    bound: Duration,
    future: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(bound, future).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, ?bound, "store call timed out");
            Err(StoreError::Timeout { operation, bound })
        }
    }
}

/// Verification queries over one executor.
#[derive(Debug, Clone)]
pub struct Verifier<E> {
    executor: E,
    timeouts: StoreTimeouts,
}

impl<E: QueryExecutor> Verifier<E> {
    #[must_use]
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            timeouts: StoreTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: StoreTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    #[must_use]
    pub fn timeouts(&self) -> StoreTimeouts {
        self.timeouts
    }

    /// First cell of the first row.
    pub async fn read_first_scalar(
        &self,
        query: &str,
        operation: &'static str,
        bound: Duration,
    ) -> Result<String, StoreError> {
        tracing::debug!(operation, query, "reading scalar");
        let rows = bounded(
            operation,
            bound,
            self.executor.query_rows(query, &QueryOptions::default()),
        )
        .await?;
        rows.into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .ok_or_else(|| StoreError::EmptyResult {
                query: query.to_owned(),
            })
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        let value = self
            .read_first_scalar(&query, "count_rows", self.timeouts.count)
            .await?;
        parse_integer(&value)
    }

    /// Sum of `column`, truncated toward zero. A `NULL` aggregate (empty table
    /// or all-null column) reads as `0`.
    pub async fn sum_rows(&self, table: &str, column: &str) -> Result<i64, StoreError> {
        let query = format!(
            "SELECT SUM({}) FROM {}",
            quote_identifier(column),
            quote_identifier(table)
        );
        let value = self
            .read_first_scalar(&query, "sum_rows", self.timeouts.aggregate)
            .await?;
        parse_sum(&value)
    }

    /// Rows whose `str` column contains the grinning-face emoji.
    pub async fn count_rows_with_emoji(&self, table: &str) -> Result<i64, StoreError> {
        let query = format!(
            "SELECT COUNT(*) FROM {} WHERE str LIKE '{EMOJI_PATTERN}'",
            quote_identifier(table)
        );
        let value = self
            .read_first_scalar(&query, "count_rows_with_emoji", self.timeouts.aggregate)
            .await?;
        parse_truncated(&value)
    }

    pub async fn all_rows_as_json(
        &self,
        table: &str,
    ) -> Result<Vec<Map<String, Value>>, StoreError> {
        let lines = self
            .select_all(table, ResultFormat::JsonEachRow, "all_rows_as_json")
            .await?;
        let mut rows = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: Value = serde_json::from_str(line).map_err(|err| NormalizeError::Parse {
                line: idx + 1,
                reason: err.to_string(),
            })?;
            match parsed {
                Value::Object(object) => rows.push(object),
                _ => {
                    return Err(NormalizeError::Parse {
                        line: idx + 1,
                        reason: "expected a JSON object".to_owned(),
                    }
                    .into());
                }
            }
        }
        Ok(rows)
    }

    /// First-row check over the string-quoted row format.
    pub async fn validate_rows(
        &self,
        table: &str,
        records: &[SourceRecord],
    ) -> Result<bool, StoreError> {
        let report = self
            .verify_rows(table, records, MatchPolicy::FirstRow)
            .await?;
        tracing::info!(table, matched = report.is_match(), "match?");
        Ok(report.is_match())
    }

    pub async fn verify_rows(
        &self,
        table: &str,
        records: &[SourceRecord],
        policy: MatchPolicy,
    ) -> Result<MatchReport, StoreError> {
        let matcher = RowMatcher::new(
            Normalizer::for_format(ResultFormat::JsonStringsEachRow),
            policy,
        );
        self.verify_rows_with(table, records, &matcher).await
    }

    /// The matcher's normalizer decides which row format is requested.
    pub async fn verify_rows_with(
        &self,
        table: &str,
        records: &[SourceRecord],
        matcher: &RowMatcher,
    ) -> Result<MatchReport, StoreError> {
        let format = matcher.normalizer().options().format;
        let lines = self.select_all(table, format, "verify_rows").await?;
        Ok(matcher.match_rows(&lines, records)?)
    }

    async fn select_all(
        &self,
        table: &str,
        format: ResultFormat,
        operation: &'static str,
    ) -> Result<Vec<String>, StoreError> {
        let query = format!("SELECT * FROM {}", quote_identifier(table));
        let options = QueryOptions::with_format(format);
        let lines = bounded(
            operation,
            self.timeouts.rows,
            self.executor.query_lines(&query, &options),
        )
        .await?;
        tracing::info!(table, %format, read_rows = lines.len(), "read rows");
        Ok(lines)
    }
}

fn parse_integer(value: &str) -> Result<i64, StoreError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| StoreError::InvalidScalar {
            value: value.to_owned(),
            expected: "integer",
        })
}

fn parse_sum(value: &str) -> Result<i64, StoreError> {
    if value.trim().eq_ignore_ascii_case("null") {
        return Ok(0);
    }
    parse_truncated(value)
}

fn parse_truncated(value: &str) -> Result<i64, StoreError> {
    let invalid = || StoreError::InvalidScalar {
        value: value.to_owned(),
        expected: "number",
    };
    let truncated = value.trim().parse::<f64>().map_err(|_| invalid())?.trunc();
    if !truncated.is_finite() || truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(invalid());
    }
    Ok(truncated as i64)
}
