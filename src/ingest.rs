//! End-to-end ingestion of one CRM export: validate, transform, load.
//!
//! The mapping and target table are checked before any connection is made.
//! From the moment a load record exists it is always closed as `success` or
//! `failed`; a file that fails any stage is moved to the quarantine directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Local, NaiveDate, Utc};
use log::{error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    config::Settings,
    connection::ConnectionManager,
    db::{
        Connector, LoadHistory, LoadId, LoadOutcome, NewLoadRecord, record_outcome,
        record_progress,
    },
    error::IngestError,
    loader::{AllowedTables, BulkLoader, LoadMode, LoadRequest},
    mapping::{MappingCatalog, MappingSpec},
    quarantine,
    transform::{RowError, TransformContext, TransformOutcome, Transformer},
    validate::{ValidationProgress, ValidationReport, Validator},
};

const SKIPPED_ROWS_LOGGED: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Starting,
    Validating,
    Transforming,
    Loading,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Stage::Starting => "Starting",
            Stage::Validating => "Running QA validation",
            Stage::Transforming => "Transforming data",
            Stage::Loading => "Loading to staging",
        }
    }

    fn percent(self) -> u8 {
        match self {
            Stage::Starting => 0,
            Stage::Validating => 10,
            Stage::Transforming => 30,
            Stage::Loading => 50,
        }
    }
}

/// Maps validation progress onto the 10..=30 band of the overall load.
fn validation_band(percent: u8) -> u8 {
    10 + (u16::from(percent.min(100)) * 20 / 100) as u8
}

#[derive(Debug, Clone)]
pub struct IngestRequest<'r> {
    pub source: &'r Path,
    pub mapping_name: &'r str,
    /// Name recorded in `_file_name`; defaults to the source file name.
    pub file_name: Option<&'r str>,
    /// Defaults to today's local date.
    pub partition_date: Option<NaiveDate>,
    pub extract_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub load_id: LoadId,
    pub target_table: String,
    pub mode: LoadMode,
    pub rows_transformed: usize,
    pub rows_loaded: u64,
    pub skipped_rows: Vec<RowError>,
    pub warnings: Vec<String>,
}

pub struct Pipeline<'a, C> {
    settings: &'a Settings,
    catalog: MappingCatalog,
    allowed: AllowedTables,
    connections: &'a ConnectionManager<C>,
}

impl<'a, C: Connector> Pipeline<'a, C> {
    pub fn new(settings: &'a Settings, connections: &'a ConnectionManager<C>) -> Self {
        Self {
            settings,
            catalog: MappingCatalog::new(&settings.mappings_dir),
            allowed: AllowedTables::new(settings.allowed_tables.iter().cloned()),
            connections,
        }
    }

    pub async fn ingest(&self, request: &IngestRequest<'_>) -> Result<IngestSummary, IngestError> {
        let mapping = self.catalog.load(request.mapping_name)?;
        let target_table = mapping.target_table()?;
        self.allowed.resolve(&target_table)?;
        if !request.source.is_file() {
            return Err(anyhow!("input file {:?} does not exist", request.source).into());
        }
        let file_name = match request.file_name {
            Some(name) => name.to_string(),
            None => display_name(request.source),
        };
        let partition_date = request
            .partition_date
            .unwrap_or_else(|| Local::now().date_naive());

        let session = self.connections.acquire().await?;
        let record = NewLoadRecord {
            load_date: partition_date,
            target_table: target_table.clone(),
            file_name: file_name.clone(),
            mapping_file: mapping.name.clone(),
            stage: Stage::Starting.label().to_string(),
        };
        let load_id = session
            .start_load(&record)
            .await
            .map_err(|source| IngestError::Load {
                table: target_table.clone(),
                source,
            })?;
        info!("Load {load_id}: ingesting {:?} with mapping '{}'", request.source, mapping.name);

        let run = Run {
            mapping: &mapping,
            target_table: &target_table,
            file_name: &file_name,
            partition_date,
            load_id,
        };
        let mut stage = Stage::Starting;
        let result = self.run_stages(&session, &run, request, &mut stage).await;
        match result {
            Ok(summary) => {
                record_outcome(&session, load_id, &LoadOutcome::success(summary.rows_loaded)).await;
                if self.settings.remove_source_on_success {
                    if let Err(err) = fs::remove_file(request.source) {
                        warn!("Could not remove source {:?}: {err}", request.source);
                    }
                }
                info!(
                    "Load {load_id}: complete, {} row(s) in {target_table}",
                    summary.rows_loaded
                );
                Ok(summary)
            }
            Err(err) => Err(self.fail(&session, &run, request.source, stage, err).await),
        }
    }

    async fn run_stages(
        &self,
        session: &C::Session,
        run: &Run<'_>,
        request: &IngestRequest<'_>,
        stage: &mut Stage,
    ) -> Result<IngestSummary, IngestError> {
        *stage = Stage::Validating;
        record_progress(session, run.load_id, stage.label(), stage.percent()).await;
        let report = self.validate(session, run, request.source).await?;
        for warning in &report.warnings {
            warn!("Load {}: {warning}", run.load_id);
        }
        if !report.is_valid() {
            return Err(IngestError::Validation {
                file: run.file_name.to_string(),
                errors: report.errors,
                quarantine_path: None,
            });
        }

        *stage = Stage::Transforming;
        record_progress(session, run.load_id, stage.label(), stage.percent()).await;
        fs::create_dir_all(&self.settings.work_dir)
            .with_context(|| format!("Creating work directory {:?}", self.settings.work_dir))?;
        let transformed = self
            .settings
            .work_dir
            .join(format!(
                "transformed_{}_{}",
                Uuid::new_v4(),
                quarantine::sanitize(run.file_name)
            ));
        let context = TransformContext {
            partition_date: run.partition_date,
            file_name: run.file_name.to_string(),
            source_report: run.mapping.source_report().to_string(),
            extract_ts: request.extract_ts,
        };

        let loaded = async {
            let outcome = transform_blocking(run.mapping, request.source, &transformed, context).await?;
            log_skipped_rows(run.load_id, &outcome.errors);

            *stage = Stage::Loading;
            record_progress(session, run.load_id, stage.label(), stage.percent()).await;
            let summary = BulkLoader::new(self.connections, &self.allowed)
                .load(&LoadRequest {
                    file: &transformed,
                    table: run.target_table,
                    file_name: run.file_name,
                    mapping_name: &run.mapping.name,
                    partition_date: run.partition_date,
                    natural_key: &run.mapping.natural_key,
                    load_id: Some(run.load_id),
                })
                .await?;
            Ok::<_, IngestError>((outcome, summary))
        }
        .await;
        if transformed.exists() {
            if let Err(err) = fs::remove_file(&transformed) {
                warn!("Could not remove intermediate file {transformed:?}: {err}");
            }
        }
        let (outcome, summary) = loaded?;

        Ok(IngestSummary {
            load_id: run.load_id,
            target_table: run.target_table.to_string(),
            mode: summary.mode,
            rows_transformed: outcome.rows_written,
            rows_loaded: summary.rows_loaded,
            skipped_rows: outcome.errors,
            warnings: report.warnings,
        })
    }

    /// Runs the validator on a blocking thread and forwards its progress to
    /// the load record as it arrives.
    async fn validate(
        &self,
        session: &C::Session,
        run: &Run<'_>,
        source: &Path,
    ) -> Result<ValidationReport, IngestError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ValidationProgress>();
        let mapping = run.mapping.clone();
        let path = source.to_path_buf();
        let interval = self.settings.progress_interval_rows;
        let task = tokio::task::spawn_blocking(move || {
            let mut forward = |update: &ValidationProgress| {
                // The receiver only goes away if the pipeline is gone too.
                let _ = sender.send(update.clone());
            };
            Validator::new(&mapping)
                .with_progress_interval(interval)
                .validate_file(&path, Some(&mut forward))
        });
        while let Some(update) = receiver.recv().await {
            let stage = format!("{}: {}", Stage::Validating.label(), update.stage);
            record_progress(session, run.load_id, &stage, validation_band(update.percent)).await;
        }
        let report = task
            .await
            .map_err(|err| anyhow!("validation task failed: {err}"))??;
        Ok(report)
    }

    /// Quarantines the source and closes the load record as failed.
    async fn fail(
        &self,
        session: &C::Session,
        run: &Run<'_>,
        source: &Path,
        stage: Stage,
        err: IngestError,
    ) -> IngestError {
        error!("Load {} failed during '{}': {err}", run.load_id, stage.label());
        let quarantined = if source.exists() {
            match quarantine::quarantine_file(
                source,
                &self.settings.quarantine_dir,
                Some(run.load_id),
                run.file_name,
            ) {
                Ok(path) => Some(path),
                Err(quarantine_err) => {
                    error!("Could not quarantine {source:?}: {quarantine_err:#}");
                    None
                }
            }
        } else {
            None
        };
        let quarantine_text = quarantined.as_ref().map(|path| path.display().to_string());

        let (failed_stage, message) = match &err {
            IngestError::Validation { errors, .. } => {
                ("Failed: QA validation errors".to_string(), errors.join("\n"))
            }
            other => (format!("Failed: {}", stage.label()), format!("{other:#}")),
        };
        let outcome = LoadOutcome::failed(failed_stage, message).with_quarantine(quarantine_text);
        record_outcome(session, run.load_id, &outcome).await;

        match err {
            IngestError::Validation { file, errors, .. } => IngestError::Validation {
                file,
                errors,
                quarantine_path: quarantined,
            },
            other => other,
        }
    }
}

struct Run<'r> {
    mapping: &'r MappingSpec,
    target_table: &'r str,
    file_name: &'r str,
    partition_date: NaiveDate,
    load_id: LoadId,
}

async fn transform_blocking(
    mapping: &MappingSpec,
    source: &Path,
    output: &Path,
    context: TransformContext,
) -> Result<TransformOutcome, IngestError> {
    let mapping = mapping.clone();
    let source = source.to_path_buf();
    let output: PathBuf = output.to_path_buf();
    let outcome = tokio::task::spawn_blocking(move || {
        Transformer::new(&mapping).transform_file(&source, &output, &context)
    })
    .await
    .map_err(|err| anyhow!("transform task failed: {err}"))??;
    Ok(outcome)
}

fn log_skipped_rows(load_id: LoadId, errors: &[RowError]) {
    if errors.is_empty() {
        return;
    }
    warn!("Load {load_id}: {} row(s) skipped during transform", errors.len());
    for row in errors.iter().take(SKIPPED_ROWS_LOGGED) {
        warn!("Load {load_id}: {row}");
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_progress_is_rescaled_into_its_band() {
        assert_eq!(validation_band(0), 10);
        assert_eq!(validation_band(50), 20);
        assert_eq!(validation_band(100), 30);
        assert_eq!(validation_band(250), 30);
    }

    #[test]
    fn stage_percentages_increase() {
        let stages = [
            Stage::Starting,
            Stage::Validating,
            Stage::Transforming,
            Stage::Loading,
        ];
        assert!(stages.windows(2).all(|w| w[0].percent() < w[1].percent()));
    }

    #[test]
    fn display_name_uses_final_component() {
        assert_eq!(display_name(Path::new("/tmp/in/contacts.csv")), "contacts.csv");
    }
}
