pub mod cli;
pub mod coerce;
pub mod config;
pub mod connection;
pub mod db;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod history;
pub mod ingest;
pub mod io_utils;
pub mod loader;
pub mod mapping;
pub mod postgres;
pub mod quarantine;
pub mod table;
pub mod transform;
pub mod validate;

use std::{env, future::Future, sync::OnceLock};

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{LevelFilter, info, warn};

use crate::{
    cli::{Cli, Commands},
    config::Settings,
    connection::ConnectionManager,
    db::{Connector, LoadHistory},
    error::IngestError,
    ingest::{IngestRequest, Pipeline},
    loader::{AllowedTables, BulkLoader, LoadRequest},
    mapping::{MappingCatalog, MappingSpec},
    postgres::PgConnector,
    table::Column,
    transform::{TransformContext, Transformer},
    validate::{ValidationReport, Validator},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("crm_stage_loader", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<(), IngestError> {
    init_logging();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?.with_database_url(cli.database_url);
    if let Some(dir) = cli.mappings_dir {
        settings.mappings_dir = dir;
    }
    let settings = &settings;
    let catalog = MappingCatalog::new(&settings.mappings_dir);

    match cli.command {
        Commands::Mappings => handle_mappings(&catalog),
        Commands::ShowMapping(args) => handle_show_mapping(&catalog.load(&args.mapping)?),
        Commands::Validate(args) => handle_validate(settings, &catalog, &args),
        Commands::Transform(args) => handle_transform(&catalog, &args),
        Commands::Load(args) => with_database(settings, |connections| async move {
            handle_load(settings, &connections, &args).await
        }),
        Commands::Ingest(args) => with_database(settings, |connections| async move {
            handle_ingest(settings, &connections, &args).await
        }),
        Commands::History(args) => with_database(settings, |connections| async move {
            let session = connections.acquire().await?;
            let records = session
                .recent_loads(args.limit)
                .await
                .context("Reading load history")?;
            print!("{}", history::render_history(&records));
            Ok(())
        }),
        Commands::Status(args) => with_database(settings, |connections| async move {
            let session = connections.acquire().await?;
            let record = session
                .fetch_load(args.id)
                .await
                .context("Reading load history")?
                .ok_or_else(|| IngestError::configuration(format!("no load with id {}", args.id)))?;
            print!("{}", history::render_status(&record));
            Ok(())
        }),
    }
}

/// Runs `body` on a single-threaded runtime with a retrying Postgres
/// connection manager.
fn with_database<F, Fut>(settings: &Settings, body: F) -> Result<(), IngestError>
where
    F: FnOnce(ConnectionManager<PgConnector>) -> Fut,
    Fut: Future<Output = Result<(), IngestError>>,
{
    let connector = PgConnector::new(settings.database_url()?, &settings.connection)
        .map_err(|err| IngestError::configuration(err.to_string()))?;
    let connections = ConnectionManager::new(connector, settings.connection.retry_policy());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Starting async runtime")?;
    runtime.block_on(body(connections))
}

fn handle_mappings(catalog: &MappingCatalog) -> Result<(), IngestError> {
    let names = catalog.available()?;
    if names.is_empty() {
        info!("No mappings found in {:?}", catalog.dir());
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn handle_show_mapping(mapping: &MappingSpec) -> Result<(), IngestError> {
    println!("mapping:       {}", mapping.name);
    println!("target table:  {}", mapping.target_table()?);
    println!("source report: {}", mapping.source_report());
    if mapping.is_upsert() {
        println!("load mode:     upsert on ({})", mapping.natural_key.join(", "));
    } else {
        println!("load mode:     append");
    }
    println!("null-like:     {:?}", mapping.null_like);
    if !mapping.reject_rules.is_empty() {
        println!("reject rules:  {}", mapping.reject_rules.join("; "));
    }
    println!();
    let rows = mapping
        .columns
        .iter()
        .map(|(source, target)| {
            vec![
                source.clone(),
                target.clone(),
                mapping.coercion_for(target).unwrap_or_default().to_string(),
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(
        &[
            Column::left("source header"),
            Column::left("target column"),
            Column::left("coercions"),
        ],
        &rows,
    );
    Ok(())
}

fn handle_validate(
    settings: &Settings,
    catalog: &MappingCatalog,
    args: &cli::ValidateArgs,
) -> Result<(), IngestError> {
    let mapping = catalog.load(&args.mapping)?;
    let report = Validator::new(&mapping)
        .with_progress_interval(settings.progress_interval_rows)
        .validate_file(&args.input, None)?;
    if args.json {
        let json = serde_json::to_string_pretty(&report).context("Serializing report")?;
        println!("{json}");
    } else {
        print_report(&report);
    }
    if report.is_valid() {
        return Ok(());
    }
    Err(IngestError::Validation {
        file: args.input.display().to_string(),
        errors: report.errors,
        quarantine_path: None,
    })
}

fn print_report(report: &ValidationReport) {
    let verdict = if report.is_valid() { "PASSED" } else { "FAILED" };
    println!("QA validation {verdict}");
    println!("encoding:     {}", report.encoding);
    println!("rows:         {}", report.stats.total_rows);
    println!("duplicates:   {}", report.stats.duplicates);
    println!("missing keys: {}", report.stats.missing_keys);
    for error in &report.errors {
        println!("error:   {error}");
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
}

fn handle_transform(catalog: &MappingCatalog, args: &cli::TransformArgs) -> Result<(), IngestError> {
    let mapping = catalog.load(&args.mapping)?;
    let file_name = args
        .provenance
        .file_name
        .clone()
        .unwrap_or_else(|| file_name_of(&args.input));
    let context = TransformContext {
        partition_date: args
            .provenance
            .partition_date
            .unwrap_or_else(|| Local::now().date_naive()),
        file_name,
        source_report: mapping.source_report().to_string(),
        extract_ts: args.extract_ts,
    };
    let outcome = Transformer::new(&mapping).transform_file(&args.input, &args.output, &context)?;
    for error in &outcome.errors {
        warn!("{error}");
    }
    println!(
        "{} row(s) written to {} ({} skipped)",
        outcome.rows_written,
        args.output.display(),
        outcome.errors.len()
    );
    Ok(())
}

async fn handle_load<C: Connector>(
    settings: &Settings,
    connections: &ConnectionManager<C>,
    args: &cli::LoadArgs,
) -> Result<(), IngestError> {
    let allowed = AllowedTables::new(settings.allowed_tables.iter().cloned());
    let summary = BulkLoader::new(connections, &allowed)
        .load(&LoadRequest {
            file: &args.input,
            table: &args.table,
            file_name: &args.file_name,
            mapping_name: &args.mapping,
            partition_date: args
                .partition_date
                .unwrap_or_else(|| Local::now().date_naive()),
            natural_key: &args.natural_key,
            load_id: None,
        })
        .await?;
    println!(
        "load {}: {} {} row(s) into {}",
        summary.load_id, summary.mode, summary.rows_loaded, summary.table
    );
    Ok(())
}

async fn handle_ingest<C: Connector>(
    settings: &Settings,
    connections: &ConnectionManager<C>,
    args: &cli::IngestArgs,
) -> Result<(), IngestError> {
    let summary = Pipeline::new(settings, connections)
        .ingest(&IngestRequest {
            source: &args.input,
            mapping_name: &args.mapping,
            file_name: args.provenance.file_name.as_deref(),
            partition_date: args.provenance.partition_date,
            extract_ts: None,
        })
        .await?;
    println!(
        "load {}: {} row(s) in {} ({}, {} row(s) skipped)",
        summary.load_id,
        summary.rows_loaded,
        summary.target_table,
        summary.mode,
        summary.skipped_rows.len()
    );
    Ok(())
}

fn file_name_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
