//! Runtime settings.
//!
//! Everything has a default, so the settings file is optional. A file given
//! with `--config` is read first; `DATABASE_URL` and command-line flags are
//! applied on top by the caller.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{connection::RetryPolicy, error::IngestError};

pub const DEFAULT_ALLOWED_TABLES: &[&str] = &[
    "staging.contacts",
    "staging.form_submission",
    "staging.job_applicant",
    "staging.jobs_and_placements",
    "staging.contacts_with_jobs",
    "staging.job_applicant_history",
    "staging.placement_history",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,
    pub mappings_dir: PathBuf,
    /// Holds intermediate transformed files.
    pub work_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub allowed_tables: Vec<String>,
    pub connection: ConnectionSettings,
    /// Validation reports progress every this many rows.
    pub progress_interval_rows: usize,
    pub remove_source_on_success: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            mappings_dir: PathBuf::from("Mappings"),
            work_dir: PathBuf::from("uploads"),
            quarantine_dir: PathBuf::from("quarantine"),
            allowed_tables: DEFAULT_ALLOWED_TABLES
                .iter()
                .map(|table| table.to_string())
                .collect(),
            connection: ConnectionSettings::default(),
            progress_interval_rows: crate::validate::DEFAULT_PROGRESS_INTERVAL,
            remove_source_on_success: false,
        }
    }
}

impl Settings {
    /// Reads `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, IngestError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = File::open(path).with_context(|| format!("Opening settings file {path:?}"))?;
        let settings: Settings = serde_yaml::from_reader(BufReader::new(file)).map_err(|err| {
            IngestError::configuration(format!("settings file {path:?} is not valid: {err}"))
        })?;
        settings.check()?;
        Ok(settings)
    }

    pub fn with_database_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url.filter(|url| !url.trim().is_empty()) {
            self.database_url = Some(url);
        }
        self
    }

    pub fn database_url(&self) -> Result<&str, IngestError> {
        self.database_url.as_deref().ok_or_else(|| {
            IngestError::configuration("no database url: set DATABASE_URL or pass --database-url")
        })
    }

    fn check(&self) -> Result<(), IngestError> {
        if self.connection.max_attempts == 0 {
            return Err(IngestError::configuration(
                "connection.max_attempts must be at least 1",
            ));
        }
        if self.progress_interval_rows == 0 {
            return Err(IngestError::configuration(
                "progress_interval_rows must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub max_attempts: u32,
    /// Delay before retry `n` (counting from 1) is `backoff_base_ms * 2^n`.
    pub backoff_base_ms: u64,
    pub connect_timeout_secs: u64,
    pub keepalive: KeepaliveSettings,
    pub application_name: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1000,
            connect_timeout_secs: 10,
            keepalive: KeepaliveSettings::default(),
            application_name: Some(env!("CARGO_PKG_NAME").to_string()),
        }
    }
}

impl ConnectionSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_base_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSettings {
    pub idle_secs: u64,
    pub interval_secs: u64,
    pub retries: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            interval_secs: 10,
            retries: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.mappings_dir, PathBuf::from("Mappings"));
        assert_eq!(settings.allowed_tables.len(), 7);
        assert_eq!(settings.connection.max_attempts, 5);
        assert_eq!(settings.connection.keepalive.idle_secs, 30);
        assert_eq!(settings.progress_interval_rows, 50_000);
        assert!(settings.database_url().is_err());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "work_dir: /tmp/work\nconnection:\n  max_attempts: 2").unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.work_dir, PathBuf::from("/tmp/work"));
        assert_eq!(settings.connection.max_attempts, 2);
        assert_eq!(settings.connection.backoff_base_ms, 1000);
        assert_eq!(settings.quarantine_dir, PathBuf::from("quarantine"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection:\n  max_attempts: 0").unwrap();
        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(_)));
    }

    #[test]
    fn explicit_url_overrides_file_value() {
        let settings = Settings {
            database_url: Some("postgres://file".into()),
            ..Settings::default()
        }
        .with_database_url(Some("postgres://flag".into()));
        assert_eq!(settings.database_url().unwrap(), "postgres://flag");
        let unchanged = settings.with_database_url(None);
        assert_eq!(unchanged.database_url().unwrap(), "postgres://flag");
    }
}
