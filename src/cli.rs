use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Load CRM CSV exports into Postgres staging tables", long_about = None)]
pub struct Cli {
    /// Settings file (YAML); every setting has a default
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Postgres connection URL
    #[arg(long = "database-url", env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,
    /// Directory holding mapping documents (overrides the settings file)
    #[arg(long = "mappings-dir", global = true)]
    pub mappings_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List the mapping documents available for ingestion
    Mappings,
    /// Show how a mapping resolves: target table, columns, coercions and load mode
    ShowMapping(ShowMappingArgs),
    /// Run the QA validation checks against a CSV export without loading it
    Validate(ValidateArgs),
    /// Write the load-ready staging file for a CSV export without loading it
    Transform(TransformArgs),
    /// Bulk load an already transformed file into a staging table
    Load(LoadArgs),
    /// Validate, transform and load a CSV export in one run
    Ingest(IngestArgs),
    /// Show the most recent loads
    History(HistoryArgs),
    /// Show the status and progress of one load
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct ShowMappingArgs {
    /// Mapping name (file stem in the mappings directory)
    #[arg(short, long)]
    pub mapping: String,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Mapping name (file stem in the mappings directory)
    #[arg(short, long)]
    pub mapping: String,
    /// CSV export to validate
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct TransformArgs {
    /// Mapping name (file stem in the mappings directory)
    #[arg(short, long)]
    pub mapping: String,
    /// CSV export to transform
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Destination for the load-ready CSV
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
    #[command(flatten)]
    pub provenance: ProvenanceArgs,
    /// Fixed extraction timestamp (RFC 3339); defaults to the current time
    #[arg(long = "extract-ts", value_parser = parse_timestamp)]
    pub extract_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
pub struct ProvenanceArgs {
    /// Partition date stamped on every row (YYYY-MM-DD); defaults to today
    #[arg(long = "partition-date", value_parser = parse_date)]
    pub partition_date: Option<NaiveDate>,
    /// File name recorded in `_file_name`; defaults to the input file name
    #[arg(long = "file-name")]
    pub file_name: Option<String>,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    /// Load-ready CSV produced by `transform`
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Schema-qualified target table, e.g. staging.contacts
    #[arg(short, long)]
    pub table: String,
    /// Value of `_file_name` in the input, used to count loaded rows
    #[arg(long = "file-name")]
    pub file_name: String,
    /// Mapping name recorded in the load history
    #[arg(long)]
    pub mapping: String,
    /// Partition date recorded in the load history; defaults to today
    #[arg(long = "partition-date", value_parser = parse_date)]
    pub partition_date: Option<NaiveDate>,
    /// Natural key column; repeat for composite keys. Omit to append.
    #[arg(long = "natural-key", action = clap::ArgAction::Append)]
    pub natural_key: Vec<String>,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Mapping name (file stem in the mappings directory)
    #[arg(short, long)]
    pub mapping: String,
    /// CSV export to ingest
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    #[command(flatten)]
    pub provenance: ProvenanceArgs,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Number of loads to show
    #[arg(long, default_value_t = 100)]
    pub limit: u32,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Load id as shown by `history`
    pub id: i32,
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|err| format!("expected YYYY-MM-DD: {err}"))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("expected an RFC 3339 timestamp: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn load_accepts_composite_natural_key() {
        let cli = Cli::try_parse_from([
            "crm-stage-loader",
            "load",
            "-i",
            "out.csv",
            "-t",
            "staging.contacts",
            "--file-name",
            "contacts.csv",
            "--mapping",
            "contacts",
            "--natural-key",
            "account",
            "--natural-key",
            "number",
        ])
        .unwrap();
        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };
        assert_eq!(args.natural_key, vec!["account", "number"]);
    }

    #[test]
    fn bad_partition_date_is_rejected() {
        let result = Cli::try_parse_from([
            "crm-stage-loader",
            "ingest",
            "-m",
            "contacts",
            "-i",
            "in.csv",
            "--partition-date",
            "03/07/2024",
        ]);
        assert!(result.is_err());
    }
}
