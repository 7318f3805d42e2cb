//! Error taxonomy for ingestion runs.
//!
//! File-level plumbing (encoding, CSV streaming, quarantine) reports failures as
//! [`anyhow::Error`] with path/row context. Anything that decides the fate of a
//! whole invocation is lifted into [`IngestError`], whose variants map one to
//! one onto the outcomes a caller has to tell apart:
//!
//! - [`IngestError::Configuration`] / [`IngestError::MappingNotFound`]: nothing
//!   was read or written, fix the mapping or settings and rerun.
//! - [`IngestError::Connectivity`]: the retry budget was exhausted.
//! - [`IngestError::Validation`]: the file was rejected and quarantined.
//! - [`IngestError::Load`]: the bulk import failed after the load started.

use std::{error::Error as StdError, io, path::PathBuf};

use thiserror::Error;

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Failure reported by a database session.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DbError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        // The driver's Display hides the server message behind "db error".
        let message = match err.as_db_error() {
            Some(db) => format!("{}: {}", db.severity(), db.message()),
            None => err.to_string(),
        };
        Self::with_source(message, err)
    }
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        Self::with_source(err.to_string(), err)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("mapping '{name}' not found at {path:?}")]
    MappingNotFound { name: String, path: PathBuf },

    #[error("database unreachable after {attempts} attempt(s): {source}")]
    Connectivity {
        attempts: u32,
        #[source]
        source: DbError,
    },

    #[error("QA validation failed for '{file}' ({} error(s))", errors.len())]
    Validation {
        file: String,
        errors: Vec<String>,
        quarantine_path: Option<PathBuf>,
    },

    #[error("loading into {table} failed: {source}")]
    Load {
        table: String,
        #[source]
        source: DbError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn configuration(message: impl Into<String>) -> Self {
        IngestError::Configuration(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, IngestError::Validation { .. })
    }
}
