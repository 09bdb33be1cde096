use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{
    DateTime,
    NaiveDateTime,
    Utc,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{
    Column,
    Row as SqlxRow,
    SqlitePool,
    TypeInfo,
    ValueRef,
};
use tidemark_source_api::{
    ChangeQuery,
    FieldValue,
    Record,
    Source,
    SourceError,
    SourceMetadata,
    SourceResult,
};

/// Timestamps are compared in SQL at millisecond precision in this format
const SQL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%fZ";

const BIND_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reads changed rows from a SQLite table
///
/// `id_column` and `time_column` become the record identifier and event
/// time; every other column becomes a record field.
pub struct SqlSource {
    metadata: SourceMetadata,
    pool: SqlitePool,
    table: String,
    id_column: String,
    time_column: String,
}

impl SqlSource {
    pub fn new(
        source_id: impl Into<String>, pool: SqlitePool, table: &str, id_column: &str,
        time_column: &str,
    ) -> SourceResult<Self> {
        for identifier in [table, id_column, time_column] {
            if !valid_identifier(identifier) {
                return Err(SourceError::InvalidConfig(format!(
                    "'{}' is not a valid SQL identifier",
                    identifier
                )));
            }
        }

        Ok(Self {
            metadata: SourceMetadata::new(source_id, "sqlite")
                .with_description(format!("SQLite table {}", table)),
            pool,
            table: table.to_string(),
            id_column: id_column.to_string(),
            time_column: time_column.to_string(),
        })
    }

    fn time_expr(&self) -> String {
        format!("strftime('{}', {})", SQL_TIME_FORMAT, self.time_column)
    }

    fn id_expr(&self) -> String {
        format!("CAST({} AS TEXT)", self.id_column)
    }

    fn bind_time(ts: DateTime<Utc>) -> String {
        ts.format(BIND_TIME_FORMAT).to_string()
    }

    fn map_sqlx_error(e: sqlx::Error) -> SourceError {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                SourceError::Unreachable(e.to_string())
            }
            other => SourceError::QueryFailed(other.to_string()),
        }
    }

    fn decode_value(row: &SqliteRow, index: usize) -> SourceResult<FieldValue> {
        let type_name = {
            let raw = row
                .try_get_raw(index)
                .map_err(|e| SourceError::InvalidRecord(e.to_string()))?;
            if raw.is_null() {
                return Ok(FieldValue::Null);
            }
            raw.type_info().name().to_ascii_uppercase()
        };

        let value = match type_name.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "INT8" => row.try_get::<i64, _>(index).map(FieldValue::Int),
            "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row.try_get::<f64, _>(index).map(FieldValue::Float),
            "BOOLEAN" | "BOOL" => row.try_get::<bool, _>(index).map(FieldValue::Bool),
            _ => row.try_get::<String, _>(index).map(FieldValue::String),
        };

        value.map_err(|e| SourceError::InvalidRecord(e.to_string()))
    }

    fn parse_event_time(value: &FieldValue) -> SourceResult<DateTime<Utc>> {
        let text = value.as_str().ok_or_else(|| {
            SourceError::InvalidRecord(format!("Event time is not a timestamp: {:?}", value))
        })?;

        if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
            return Ok(ts.with_timezone(&Utc));
        }

        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| SourceError::InvalidRecord(format!("Invalid event time '{}': {}", text, e)))
    }

    fn record_from_row(&self, row: &SqliteRow) -> SourceResult<Record> {
        let mut id = None;
        let mut event_time = None;
        let mut fields = BTreeMap::new();

        for column in row.columns() {
            let value = Self::decode_value(row, column.ordinal())?;
            let name = column.name();

            if name == self.id_column {
                id = match value {
                    FieldValue::String(s) => Some(s),
                    FieldValue::Int(i) => Some(i.to_string()),
                    other => {
                        return Err(SourceError::InvalidRecord(format!(
                            "Unsupported identifier value: {:?}",
                            other
                        )))
                    }
                };
            } else if name == self.time_column {
                event_time = Some(Self::parse_event_time(&value)?);
            } else {
                fields.insert(name.to_string(), value);
            }
        }

        let id = id.ok_or_else(|| {
            SourceError::InvalidRecord(format!("Row has no {} value", self.id_column))
        })?;
        let event_time = event_time.ok_or_else(|| {
            SourceError::InvalidRecord(format!("Row {} has no {} value", id, self.time_column))
        })?;

        Ok(Record {
            id,
            event_time,
            extracted_at: None,
            fields,
        })
    }
}

#[async_trait]
impl Source for SqlSource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn fetch_changes(&self, query: &ChangeQuery) -> SourceResult<Vec<Record>> {
        let time = self.time_expr();
        let id = self.id_expr();

        let keyset = if query.after.is_some() {
            format!(" AND ({t} > ? OR ({t} = ? AND {id} > ?))", t = time, id = id)
        } else {
            String::new()
        };

        let sql = format!(
            "SELECT * FROM {table} WHERE {t} > ? AND {t} <= ?{keyset} ORDER BY {t}, {id} LIMIT ?",
            table = self.table,
            t = time,
            keyset = keyset,
            id = id
        );

        let mut statement = sqlx::query(&sql)
            .bind(Self::bind_time(query.since))
            .bind(Self::bind_time(query.until));

        if let Some(after) = &query.after {
            let after_time = Self::bind_time(after.event_time);
            statement = statement
                .bind(after_time.clone())
                .bind(after_time)
                .bind(after.id.clone());
        }

        let rows = statement
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::map_sqlx_error)?;

        rows.iter().map(|row| self.record_from_row(row)).collect()
    }

    async fn count_changes(
        &self, since: DateTime<Utc>, until: DateTime<Utc>,
    ) -> SourceResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE {t} > ? AND {t} <= ?",
            table = self.table,
            t = self.time_expr()
        );

        let count: i64 = sqlx::query_scalar(&sql)
            .bind(Self::bind_time(since))
            .bind(Self::bind_time(until))
            .fetch_one(&self.pool)
            .await
            .map_err(Self::map_sqlx_error)?;

        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> SourceResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Self::map_sqlx_error)?;
        Ok(())
    }
}
