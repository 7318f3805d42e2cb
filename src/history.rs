//! Plain-text views of `load_history` records.

use std::fmt::Write as _;

use chrono::{DateTime, Local, Utc};

use crate::{
    db::LoadRecord,
    table::{self, Column},
};

const HISTORY_COLUMNS: [Column; 9] = [
    Column::right("id"),
    Column::left("load_date"),
    Column::left("table"),
    Column::left("file"),
    Column::left("mapping"),
    Column::left("status"),
    Column::right("rows"),
    Column::left("started"),
    Column::left("error"),
];

pub fn render_history(records: &[LoadRecord]) -> String {
    if records.is_empty() {
        return "No loads recorded.\n".to_string();
    }
    let rows = records
        .iter()
        .map(|record| {
            vec![
                record.id.to_string(),
                record.load_date.to_string(),
                record.target_table.clone(),
                record.file_name.clone(),
                record.mapping_file.clone(),
                record.status.to_string(),
                optional(record.rows_loaded),
                timestamp(&record.started_at),
                record.error_message.clone().unwrap_or_default(),
            ]
        })
        .collect::<Vec<_>>();
    table::render_table(&HISTORY_COLUMNS, &rows)
}

/// Detail view of one record, as polled while a load is running.
pub fn render_status(record: &LoadRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "load:      {}", record.id);
    let _ = writeln!(out, "table:     {}", record.target_table);
    let _ = writeln!(out, "file:      {}", record.file_name);
    let _ = writeln!(out, "mapping:   {}", record.mapping_file);
    let _ = writeln!(out, "status:    {}", record.status);
    let _ = writeln!(
        out,
        "stage:     {}",
        record.current_stage.as_deref().unwrap_or("Processing")
    );
    let _ = writeln!(out, "progress:  {}%", record.progress_percent.unwrap_or(0));
    let _ = writeln!(out, "rows:      {}", optional(record.rows_loaded));
    let _ = writeln!(out, "started:   {}", timestamp(&record.started_at));
    if let Some(completed) = &record.completed_at {
        let _ = writeln!(out, "completed: {}", timestamp(completed));
    }
    if let Some(path) = &record.quarantine_path {
        let _ = writeln!(out, "quarantine: {path}");
    }
    if let Some(message) = &record.error_message {
        let _ = writeln!(out, "error:\n{message}");
    }
    out
}

fn optional(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
