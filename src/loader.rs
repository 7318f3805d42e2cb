//! Bulk loading of transformed files into allow-listed staging tables.
//!
//! Append mode streams the file straight into the target with `COPY`. Upsert
//! mode (a natural key is given) copies into a temp table named after the
//! load, then swaps: target rows whose key appears in the temp table are
//! deleted and every temp row is inserted, in one transaction. Either way the
//! reported row count is what the target holds for the file afterwards.

use std::{collections::BTreeSet, fmt, path::Path};

use anyhow::Context;
use chrono::NaiveDate;
use log::{debug, error, info, warn};

use crate::{
    config::DEFAULT_ALLOWED_TABLES,
    connection::ConnectionManager,
    db::{
        Connector, LoadHistory, LoadId, LoadOutcome, NewLoadRecord, ReplaceCounts,
        StagingSession, TableRef, record_outcome, record_progress,
    },
    encoding::{DecodePolicy, DetectedEncoding},
    error::{DbError, IngestError},
    io_utils,
};

/// The closed set of tables a load may target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedTables {
    tables: BTreeSet<String>,
}

impl AllowedTables {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }

    /// Exact, case-sensitive membership; nothing else reaches SQL.
    pub fn resolve(&self, requested: &str) -> Result<TableRef, IngestError> {
        if !self.contains(requested) {
            return Err(IngestError::configuration(format!(
                "table '{requested}' is not an allowed load target"
            )));
        }
        TableRef::parse(requested).map_err(|err| IngestError::configuration(err.to_string()))
    }
}

impl Default for AllowedTables {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_TABLES.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Append,
    Upsert,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Append => f.write_str("append"),
            LoadMode::Upsert => f.write_str("upsert"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadRequest<'r> {
    /// Load-ready CSV produced by the transformer.
    pub file: &'r Path,
    pub table: &'r str,
    /// Value of the `_file_name` provenance column in `file`.
    pub file_name: &'r str,
    pub mapping_name: &'r str,
    pub partition_date: NaiveDate,
    /// Target columns; empty means append.
    pub natural_key: &'r [String],
    /// Existing load record to report into. When `None` the loader opens and
    /// closes its own record.
    pub load_id: Option<LoadId>,
}

impl LoadRequest<'_> {
    pub fn mode(&self) -> LoadMode {
        if self.natural_key.is_empty() {
            LoadMode::Append
        } else {
            LoadMode::Upsert
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub load_id: LoadId,
    pub table: TableRef,
    pub mode: LoadMode,
    pub rows_copied: u64,
    /// Rows in the target attributed to the file after the load.
    pub rows_loaded: u64,
    pub replaced: Option<ReplaceCounts>,
}

pub struct BulkLoader<'a, C> {
    connections: &'a ConnectionManager<C>,
    allowed: &'a AllowedTables,
}

impl<'a, C: Connector> BulkLoader<'a, C> {
    pub fn new(connections: &'a ConnectionManager<C>, allowed: &'a AllowedTables) -> Self {
        Self {
            connections,
            allowed,
        }
    }

    pub async fn load(&self, request: &LoadRequest<'_>) -> Result<LoadSummary, IngestError> {
        let table = self.allowed.resolve(request.table)?;
        let columns = file_columns(request.file)?;
        if let Some(missing) = request.natural_key.iter().find(|key| !columns.contains(key)) {
            return Err(IngestError::configuration(format!(
                "natural key column '{missing}' is not a column of {:?}",
                request.file
            )));
        }

        let session = self.connections.acquire().await?;
        let (load_id, owned) = match request.load_id {
            Some(id) => (id, false),
            None => {
                let record = NewLoadRecord {
                    load_date: request.partition_date,
                    target_table: table.to_string(),
                    file_name: request.file_name.to_string(),
                    mapping_file: request.mapping_name.to_string(),
                    stage: "Loading to staging".to_string(),
                };
                let id = session.start_load(&record).await.map_err(|source| IngestError::Load {
                    table: table.to_string(),
                    source,
                })?;
                (id, true)
            }
        };
        info!(
            "Load {load_id}: {} {:?} into {table} ({} column(s))",
            request.mode(),
            request.file,
            columns.len()
        );

        let result = self
            .run(&session, &table, &columns, request, load_id)
            .await;
        match result {
            Ok(summary) => {
                if owned {
                    record_outcome(&session, load_id, &LoadOutcome::success(summary.rows_loaded)).await;
                }
                info!(
                    "Load {load_id}: {} row(s) of '{}' now in {table}",
                    summary.rows_loaded, request.file_name
                );
                Ok(summary)
            }
            Err(source) => {
                error!("Load {load_id} into {table} failed: {source}");
                if owned {
                    let outcome = LoadOutcome::failed("Failed: load error", source.to_string());
                    record_outcome(&session, load_id, &outcome).await;
                }
                Err(IngestError::Load {
                    table: table.to_string(),
                    source,
                })
            }
        }
    }

    async fn run(
        &self,
        session: &C::Session,
        table: &TableRef,
        columns: &[String],
        request: &LoadRequest<'_>,
        load_id: LoadId,
    ) -> Result<LoadSummary, DbError> {
        let (rows_copied, replaced) = match request.mode() {
            LoadMode::Append => {
                record_progress(session, load_id, &format!("Copying into {table}"), 60).await;
                (session.copy_csv(table, columns, request.file).await?, None)
            }
            LoadMode::Upsert => {
                let temp = TableRef::temp(format!("{}_load_{load_id}", table.name));
                session.create_temp_table_like(&temp, table).await?;
                let swapped = self
                    .copy_and_swap(session, table, &temp, columns, request, load_id)
                    .await;
                if let Err(err) = session.drop_temp_table(&temp).await {
                    warn!("Could not drop temp table {temp}: {err}");
                }
                swapped?
            }
        };
        record_progress(session, load_id, "Counting loaded rows", 90).await;
        let rows_loaded = session
            .count_rows_for_file(table, request.file_name)
            .await?;
        Ok(LoadSummary {
            load_id,
            table: table.clone(),
            mode: request.mode(),
            rows_copied,
            rows_loaded,
            replaced,
        })
    }

    async fn copy_and_swap(
        &self,
        session: &C::Session,
        table: &TableRef,
        temp: &TableRef,
        columns: &[String],
        request: &LoadRequest<'_>,
        load_id: LoadId,
    ) -> Result<(u64, Option<ReplaceCounts>), DbError> {
        record_progress(session, load_id, "Copying into temporary table", 60).await;
        let copied = session.copy_csv(temp, columns, request.file).await?;
        record_progress(session, load_id, "Replacing rows by natural key", 80).await;
        let counts = session
            .replace_by_key(table, temp, request.natural_key, columns)
            .await?;
        debug!(
            "Load {load_id}: replaced {} existing row(s), inserted {}",
            counts.deleted, counts.inserted
        );
        Ok((copied, Some(counts)))
    }
}

/// Column list of a load-ready file, in file order.
fn file_columns(path: &Path) -> Result<Vec<String>, IngestError> {
    let mut reader = io_utils::open_csv_reader_from_path(path)?;
    let utf8 = DetectedEncoding {
        encoding: encoding_rs::UTF_8,
        policy: DecodePolicy::Strict,
    };
    let columns = io_utils::reader_headers(&mut reader, &utf8)
        .with_context(|| format!("Reading columns of {path:?}"))?;
    columns.ok_or_else(|| {
        IngestError::configuration(format!("{path:?} has no header row to load"))
    })
}
