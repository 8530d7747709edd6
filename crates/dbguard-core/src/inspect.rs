//! Read-only inspection of the monitored server.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Facts, MonitorError};

pub const SKIP_GRANT_TABLES_SQL: &str = "SHOW VARIABLES LIKE 'skip_grant_tables'";
pub const SHOW_DATABASES_SQL: &str = "SHOW DATABASES";
pub const CURRENT_DATABASE_SQL: &str = "SELECT DATABASE() AS name";

/// A single result row keyed by column name. `None` values are SQL NULLs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Row {
    columns: Vec<(String, Option<String>)>,
}

impl Row {
    #[must_use]
    pub fn new(columns: Vec<(String, Option<String>)>) -> Self {
        Self { columns }
    }

    /// Non-NULL value of `column`, matched exactly first and then ASCII
    /// case-insensitively.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .or_else(|| self.columns.iter().find(|(name, _)| name.eq_ignore_ascii_case(column)))
            .and_then(|(_, value)| value.as_deref())
    }
}

/// Narrow handle onto the monitored database.
///
/// Implementations report execution failures as [`MonitorError::Connection`] and
/// malformed result shapes as [`MonitorError::UnexpectedResult`].
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    async fn query_row(&self, sql: &str) -> Result<Option<Row>, MonitorError>;

    async fn query_column(&self, sql: &str) -> Result<Vec<String>, MonitorError>;
}

pub struct Inspector<'a> {
    handle: &'a dyn DatabaseHandle,
}

impl<'a> Inspector<'a> {
    #[must_use]
    pub fn new(handle: &'a dyn DatabaseHandle) -> Self {
        Self { handle }
    }

    /// Query live server state. Issues exactly two statements and never retries.
    ///
    /// # Errors
    /// Returns [`MonitorError::Connection`] when a statement cannot run and
    /// [`MonitorError::UnexpectedResult`] when the flag row is malformed.
    pub async fn inspect(&self) -> Result<Facts, MonitorError> {
        let row = self.handle.query_row(SKIP_GRANT_TABLES_SQL).await?;
        let skip_grant_tables_on = match row {
            // Servers that dropped the variable cannot be running with it.
            None => false,
            Some(row) => parse_switch(&row)?,
        };

        let listed = self.handle.query_column(SHOW_DATABASES_SQL).await?;
        let mut seen = BTreeSet::new();
        let database_names =
            listed.into_iter().filter(|name| seen.insert(name.clone())).collect::<Vec<_>>();

        tracing::debug!(
            skip_grant_tables_on,
            databases = database_names.len(),
            "inspected database server"
        );
        Ok(Facts { skip_grant_tables_on, database_names })
    }

    /// Name of the schema selected by the connection, if any.
    ///
    /// # Errors
    /// Returns [`MonitorError::Connection`] when the statement cannot run.
    pub async fn current_database(&self) -> Result<Option<String>, MonitorError> {
        let row = self.handle.query_row(CURRENT_DATABASE_SQL).await?;
        Ok(row.and_then(|row| row.get("name").map(str::to_string)))
    }
}

fn parse_switch(row: &Row) -> Result<bool, MonitorError> {
    let Some(value) = row.get("Value") else {
        return Err(MonitorError::UnexpectedResult(
            "skip_grant_tables row has no Value column".to_string(),
        ));
    };
    match value.trim().to_ascii_uppercase().as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        other => Err(MonitorError::UnexpectedResult(format!(
            "skip_grant_tables has unrecognized value `{other}`"
        ))),
    }
}
