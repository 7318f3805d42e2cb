//! Streaming transform from a raw CRM export to a load-ready staging file.
//!
//! One pass over the input: every record is projected onto the mapping's
//! target columns (in mapping order), coerced, stamped with provenance
//! columns, and written as UTF-8 CSV. A record that cannot be read or decoded
//! is skipped and reported as a [`RowError`]; the file as a whole only fails
//! on I/O problems or a missing header row.

use std::{
    collections::HashMap,
    fmt,
    io::{Read, Write},
    path::Path,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use log::{debug, info, warn};

use crate::{
    coerce::{CellValue, CoercionPipeline},
    encoding::{self, DetectedEncoding},
    headers::normalize_duplicate_headers,
    io_utils,
    mapping::MappingSpec,
};

pub const PARTITION_DATE_COLUMN: &str = "_partition_date";
pub const FILE_NAME_COLUMN: &str = "_file_name";
pub const SOURCE_REPORT_COLUMN: &str = "_source_report";
pub const EXTRACT_TS_COLUMN: &str = "_extract_ts";

pub const PROVENANCE_COLUMNS: [&str; 4] = [
    PARTITION_DATE_COLUMN,
    FILE_NAME_COLUMN,
    SOURCE_REPORT_COLUMN,
    EXTRACT_TS_COLUMN,
];

#[derive(Debug, Clone)]
pub struct TransformContext {
    pub partition_date: NaiveDate,
    pub file_name: String,
    pub source_report: String,
    /// Fixed extraction timestamp; `None` stamps each row with the current time.
    pub extract_ts: Option<DateTime<Utc>>,
}

impl TransformContext {
    fn extract_ts(&self) -> String {
        self.extract_ts
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Micros, false)
    }
}

/// A source record that could not be transformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Line-style row number; the header is row 1.
    pub row: usize,
    pub message: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Row {}: {}", self.row, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub rows_written: usize,
    pub errors: Vec<RowError>,
    pub columns: Vec<String>,
    pub encoding: DetectedEncoding,
}

/// A source record keyed by normalized header name.
#[derive(Debug, Clone, Copy)]
pub struct SourceRow<'a> {
    positions: &'a HashMap<String, usize>,
    values: &'a [String],
}

impl<'a> SourceRow<'a> {
    pub fn new(positions: &'a HashMap<String, usize>, values: &'a [String]) -> Self {
        Self { positions, values }
    }

    pub fn get(&self, header: &str) -> Option<&'a str> {
        self.positions
            .get(header)
            .and_then(|idx| self.values.get(*idx))
            .map(String::as_str)
    }
}

/// Target-column values for one row, aligned with [`Transformer::output_columns`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRow {
    pub cells: Vec<CellValue>,
}

impl TransformedRow {
    pub fn render(&self) -> Vec<String> {
        self.cells.iter().map(CellValue::render).collect()
    }
}

pub struct Transformer<'a> {
    mapping: &'a MappingSpec,
    pipelines: HashMap<&'a str, CoercionPipeline>,
}

impl<'a> Transformer<'a> {
    pub fn new(mapping: &'a MappingSpec) -> Self {
        let pipelines = mapping
            .coercions
            .iter()
            .map(|(target, rules)| (target.as_str(), CoercionPipeline::parse(rules)))
            .collect();
        Self { mapping, pipelines }
    }

    pub fn output_columns(&self) -> Vec<String> {
        self.mapping
            .target_columns()
            .chain(PROVENANCE_COLUMNS)
            .map(str::to_string)
            .collect()
    }

    /// Coerces one value for `target`; null-like input becomes NULL first.
    pub fn coerce(&self, target: &str, raw: &str) -> CellValue {
        if self.mapping.is_null_like(raw) {
            return CellValue::Null;
        }
        match self.pipelines.get(target) {
            Some(pipeline) => pipeline.apply(raw),
            None => CellValue::Text(raw.to_string()),
        }
    }

    pub fn transform_row(&self, row: &SourceRow<'_>, ctx: &TransformContext) -> TransformedRow {
        let mut cells = Vec::with_capacity(self.mapping.columns.len() + PROVENANCE_COLUMNS.len());
        for (source, target) in &self.mapping.columns {
            let raw = row.get(source).unwrap_or("");
            cells.push(self.coerce(target, raw));
        }
        cells.push(CellValue::Date(ctx.partition_date));
        cells.push(CellValue::Text(ctx.file_name.clone()));
        cells.push(CellValue::Text(ctx.source_report.clone()));
        cells.push(CellValue::Text(ctx.extract_ts()));
        TransformedRow { cells }
    }

    pub fn transform_file(
        &self,
        input: &Path,
        output: &Path,
        ctx: &TransformContext,
    ) -> Result<TransformOutcome> {
        let detected = encoding::detect_encoding(input)?;
        let reader = io_utils::open_csv_reader_from_path(input)?;
        let writer = io_utils::open_csv_writer(output)?;
        let outcome = self
            .transform_stream(reader, writer, detected, ctx)
            .with_context(|| format!("Transforming {input:?} into {output:?}"))?;
        info!(
            "Transformed {} row(s) from {:?} ({} encoding, {} skipped)",
            outcome.rows_written,
            input,
            outcome.encoding.name(),
            outcome.errors.len()
        );
        Ok(outcome)
    }

    pub fn transform_stream<R, W>(
        &self,
        mut reader: csv::Reader<R>,
        mut writer: csv::Writer<W>,
        detected: DetectedEncoding,
        ctx: &TransformContext,
    ) -> Result<TransformOutcome>
    where
        R: Read,
        W: Write,
    {
        let Some(raw_headers) = io_utils::reader_headers(&mut reader, &detected)? else {
            bail!("CSV file has no headers");
        };
        let headers = normalize_duplicate_headers(&raw_headers);
        let positions: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        for source in self.mapping.source_columns() {
            if !positions.contains_key(source) {
                debug!("Source column '{source}' absent; its target will be NULL");
            }
        }

        let columns = self.output_columns();
        writer
            .write_record(&columns)
            .context("Writing output header")?;

        let mut rows_written = 0usize;
        let mut errors = Vec::new();
        let mut record = csv::ByteRecord::new();
        let mut row_number = 1usize;
        loop {
            row_number += 1;
            match reader.read_byte_record(&mut record) {
                Ok(false) => break,
                Ok(true) => {}
                Err(err) if !err.is_io_error() => {
                    warn!("Skipping row {row_number}: {err}");
                    errors.push(RowError {
                        row: row_number,
                        message: err.to_string(),
                    });
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("Reading row {row_number}"));
                }
            }
            let values = match io_utils::decode_record(&record, &detected) {
                Ok(values) => values,
                Err(err) => {
                    warn!("Skipping row {row_number}: {err}");
                    errors.push(RowError {
                        row: row_number,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            let transformed = self.transform_row(&SourceRow::new(&positions, &values), ctx);
            writer
                .write_record(transformed.render())
                .with_context(|| format!("Writing row {row_number}"))?;
            rows_written += 1;
        }
        writer.flush().context("Flushing transformed output")?;

        Ok(TransformOutcome {
            rows_written,
            errors,
            columns,
            encoding: detected,
        })
    }
}
