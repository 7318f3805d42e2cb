//! Storage seam between the pipeline and Postgres.
//!
//! The loader and the pipeline only talk to these traits. [`crate::postgres`]
//! implements them over `tokio-postgres`; tests implement them in memory.

use std::{fmt, future::Future, path::Path, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use log::{error, warn};
use pg_escape::quote_identifier;
use serde::Serialize;

use crate::error::{DbError, DbResult};

/// Identifier of a `load_history` row.
pub type LoadId = i32;

/// Opens sessions against the staging database.
pub trait Connector: Send + Sync {
    type Session: StagingSession + LoadHistory + Send + Sync;

    fn connect(&self) -> impl Future<Output = DbResult<Self::Session>> + Send;
}

/// Bulk operations on staging tables.
pub trait StagingSession {
    /// Cheap round trip used to confirm a fresh session is usable.
    fn ping(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Streams a UTF-8 CSV file with a header row into `table`. Returns the
    /// number of rows the server reports as copied.
    fn copy_csv(
        &self,
        table: &TableRef,
        columns: &[String],
        path: &Path,
    ) -> impl Future<Output = DbResult<u64>> + Send;

    /// Creates a session-scoped table shaped like `like`.
    fn create_temp_table_like(
        &self,
        temp: &TableRef,
        like: &TableRef,
    ) -> impl Future<Output = DbResult<()>> + Send;

    /// Deletes every row of `target` whose key matches a row in `temp`, then
    /// inserts all of `temp`, atomically.
    fn replace_by_key(
        &self,
        target: &TableRef,
        temp: &TableRef,
        key: &[String],
        columns: &[String],
    ) -> impl Future<Output = DbResult<ReplaceCounts>> + Send;

    fn drop_temp_table(&self, temp: &TableRef) -> impl Future<Output = DbResult<()>> + Send;

    /// Rows in `target` attributed to `file_name` through the provenance column.
    fn count_rows_for_file(
        &self,
        target: &TableRef,
        file_name: &str,
    ) -> impl Future<Output = DbResult<u64>> + Send;
}

/// The `load_history` audit table.
pub trait LoadHistory {
    fn start_load(&self, record: &NewLoadRecord) -> impl Future<Output = DbResult<LoadId>> + Send;

    fn update_progress(
        &self,
        id: LoadId,
        stage: &str,
        percent: u8,
    ) -> impl Future<Output = DbResult<()>> + Send;

    fn finish_load(
        &self,
        id: LoadId,
        outcome: &LoadOutcome,
    ) -> impl Future<Output = DbResult<()>> + Send;

    fn recent_loads(&self, limit: u32) -> impl Future<Output = DbResult<Vec<LoadRecord>>> + Send;

    fn fetch_load(&self, id: LoadId) -> impl Future<Output = DbResult<Option<LoadRecord>>> + Send;
}

/// Progress is best-effort: a failed update is logged and otherwise ignored.
pub async fn record_progress<S: LoadHistory>(session: &S, id: LoadId, stage: &str, percent: u8) {
    if let Err(err) = session.update_progress(id, stage, percent).await {
        warn!("Progress update for load {id} failed: {err}");
    }
}

pub async fn record_outcome<S: LoadHistory>(session: &S, id: LoadId, outcome: &LoadOutcome) {
    if let Err(err) = session.finish_load(id, outcome).await {
        error!("Could not record outcome of load {id}: {err}");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceCounts {
    pub deleted: u64,
    pub inserted: u64,
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Splits `schema.table`; a bare name has no schema.
    pub fn parse(qualified: &str) -> Result<Self, DbError> {
        let mut parts = qualified.trim().split('.');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(DbError::new(format!("invalid table name '{qualified}'")));
        }
        let (schema, name) = match second {
            Some(name) => (Some(first), name),
            None => (None, first),
        };
        if name.is_empty() || schema.is_some_and(str::is_empty) {
            return Err(DbError::new(format!("invalid table name '{qualified}'")));
        }
        Ok(Self::new(schema, name))
    }

    /// Session-scoped temp tables live in `pg_temp` and take no schema.
    pub fn temp(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// Identifier-quoted form safe to splice into SQL.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.name)),
            None => quote_identifier(&self.name).into_owned(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Running,
    Success,
    Failed,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Running => "running",
            LoadStatus::Success => "success",
            LoadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadStatus::Running)
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadStatus {
    type Err = DbError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "running" => Ok(LoadStatus::Running),
            "success" => Ok(LoadStatus::Success),
            "failed" => Ok(LoadStatus::Failed),
            other => Err(DbError::new(format!("unknown load status '{other}'"))),
        }
    }
}

/// Fields written when a load record is opened in the `running` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLoadRecord {
    pub load_date: NaiveDate,
    pub target_table: String,
    pub file_name: String,
    pub mapping_file: String,
    pub stage: String,
}

/// Terminal state written by [`LoadHistory::finish_load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub status: LoadStatus,
    pub rows_loaded: Option<u64>,
    pub error_message: Option<String>,
    pub stage: String,
    pub percent: u8,
    pub quarantine_path: Option<String>,
}

impl LoadOutcome {
    pub fn success(rows_loaded: u64) -> Self {
        Self {
            status: LoadStatus::Success,
            rows_loaded: Some(rows_loaded),
            error_message: None,
            stage: "Complete".to_string(),
            percent: 100,
            quarantine_path: None,
        }
    }

    pub fn failed(stage: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            status: LoadStatus::Failed,
            rows_loaded: None,
            error_message: Some(error_message.into()),
            stage: stage.into(),
            percent: 100,
            quarantine_path: None,
        }
    }

    pub fn with_quarantine(mut self, path: Option<String>) -> Self {
        self.quarantine_path = path;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadRecord {
    pub id: LoadId,
    pub load_date: NaiveDate,
    pub target_table: String,
    pub file_name: String,
    pub mapping_file: String,
    pub status: LoadStatus,
    pub rows_loaded: Option<u64>,
    pub error_message: Option<String>,
    pub current_stage: Option<String>,
    pub progress_percent: Option<u8>,
    pub quarantine_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
