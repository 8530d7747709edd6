//! [`DatabaseHandle`] over a `sqlx` MySQL pool.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dbguard_core::{DatabaseHandle, MonitorError, Row};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Executor, Row as _};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MySqlHandle {
    pool: MySqlPool,
}

impl MySqlHandle {
    /// Build a pool without connecting; the first query opens the connection.
    ///
    /// # Errors
    /// Returns an error when the URL cannot be parsed.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(url)
            .context("invalid MySQL connection URL")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DatabaseHandle for MySqlHandle {
    async fn query_row(&self, sql: &str) -> Result<Option<Row>, MonitorError> {
        // Unprepared text-protocol query; SHOW statements are not always preparable.
        let row = (&self.pool).fetch_optional(sql).await.map_err(classify)?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn query_column(&self, sql: &str) -> Result<Vec<String>, MonitorError> {
        let rows = (&self.pool).fetch_all(sql).await.map_err(classify)?;
        rows.iter()
            .map(|row| {
                decode_text(row, 0)?.ok_or_else(|| {
                    MonitorError::UnexpectedResult(format!("`{sql}` returned a NULL name"))
                })
            })
            .collect()
    }
}

fn decode_row(row: &MySqlRow) -> Result<Row, MonitorError> {
    let columns = row
        .columns()
        .iter()
        .map(|column| Ok((column.name().to_string(), decode_text(row, column.ordinal())?)))
        .collect::<Result<Vec<_>, MonitorError>>()?;
    Ok(Row::new(columns))
}

fn decode_text(row: &MySqlRow, index: usize) -> Result<Option<String>, MonitorError> {
    match row.try_get::<Option<String>, _>(index) {
        Ok(value) => Ok(value),
        // Some server versions report identifier columns as binary strings.
        Err(sqlx::Error::ColumnDecode { .. }) => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map(|value| value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
            .map_err(classify),
        Err(err) => Err(classify(err)),
    }
}

fn classify(err: sqlx::Error) -> MonitorError {
    let message = err.to_string();
    match err {
        sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_) => MonitorError::UnexpectedResult(message),
        _ => MonitorError::Connection(message),
    }
}
