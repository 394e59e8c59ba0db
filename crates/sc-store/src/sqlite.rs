use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use sc_normalize::ResultFormat;
use serde_json::{Map, Number, Value};

use crate::{QueryExecutor, QueryOptions, StoreError};

/// In-process store backed by SQLite. Renders `SELECT` results in either
/// row-per-line JSON format so verification can run without a live server.
#[derive(Debug)]
pub struct SqliteExecutor {
    conn: Mutex<Connection>,
}

struct Selected {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

impl SqliteExecutor {
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| StoreError::execution("<open in-memory database>", err))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|err| StoreError::execution(format!("<open {}>", path.display()), err))?;
        Ok(Self::from_connection(conn))
    }

    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Runs statements that return no rows (schema setup, inserts).
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.with_connection(sql, |conn| conn.execute_batch(sql))
    }

    fn with_connection<T>(
        &self,
        query: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::execution(query, "sqlite connection lock is poisoned"))?;
        f(&conn).map_err(|err| StoreError::execution(query, err))
    }

    fn select(&self, query: &str, options: &QueryOptions) -> Result<Selected, StoreError> {
        if !options.settings.is_empty() {
            tracing::debug!(settings = ?options.settings, "sqlite ignores query settings");
        }
        self.with_connection(query, |conn| {
            let mut stmt = conn.prepare(query)?;
            let columns = stmt
                .column_names()
                .into_iter()
                .map(str::to_owned)
                .collect::<Vec<_>>();
            let width = columns.len();
            let mut rows = Vec::new();
            let mut cursor = stmt.query([])?;
            while let Some(row) = cursor.next()? {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(row.get::<_, SqlValue>(idx)?);
                }
                rows.push(values);
            }
            Ok(Selected { columns, rows })
        })
    }
}

impl QueryExecutor for SqliteExecutor {
    async fn query_lines(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<String>, StoreError> {
        let format = options.format.unwrap_or(ResultFormat::JsonEachRow);
        let selected = self.select(query, options)?;
        Ok(selected
            .rows
            .iter()
            .map(|row| render_line(&selected.columns, row, format))
            .collect())
    }

    async fn query_rows(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let selected = self.select(query, options)?;
        Ok(selected
            .rows
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }
}

fn render_line(columns: &[String], row: &[SqlValue], format: ResultFormat) -> String {
    let object = columns
        .iter()
        .zip(row)
        .map(|(name, value)| {
            let json = match format {
                ResultFormat::JsonEachRow => typed_json(value),
                ResultFormat::JsonStringsEachRow => match value {
                    SqlValue::Null => Value::Null,
                    other => Value::String(cell_text(other)),
                },
            };
            (name.clone(), json)
        })
        .collect::<Map<_, _>>();
    Value::Object(object).to_string()
}

fn typed_json(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::from(*v),
        SqlValue::Real(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        SqlValue::Text(v) => Value::String(v.clone()),
        SqlValue::Blob(bytes) => Value::String(hex(bytes)),
    }
}

fn cell_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "null".to_owned(),
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Real(v) => v.to_string(),
        SqlValue::Text(v) => v.clone(),
        SqlValue::Blob(bytes) => hex(bytes),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
