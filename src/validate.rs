//! QA gate run before anything touches the database.
//!
//! A single streaming pass checks that the header row exists and carries every
//! mapped source column, then collects natural-key tuples to find duplicates
//! and empty keys. The file is valid when no errors accumulated; unmapped
//! extra columns are reported as warnings only.
//!
//! Key values are compared trimmed. When a key column carries no `trim`
//! coercion the loaded values keep their whitespace, so keys that differ only
//! in surrounding whitespace produce a warning.

use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::Path,
};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info};
use serde::Serialize;

use crate::{
    coerce::CoercionPipeline,
    encoding::{self, DecodePolicy, DetectedEncoding},
    headers::normalize_duplicate_headers,
    io_utils,
    mapping::MappingSpec,
};

pub const DEFAULT_PROGRESS_INTERVAL: usize = 50_000;
const DUPLICATE_REPORT_LIMIT: usize = 5;
const MISSING_KEY_REPORT_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    pub total_rows: usize,
    /// Distinct key tuples seen more than once.
    pub duplicates: usize,
    /// Key cells that were empty or null-like, counted per row and column.
    pub missing_keys: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateKey {
    pub values: Vec<String>,
    pub occurrences: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: ValidationStats,
    pub duplicate_keys: Vec<DuplicateKey>,
    pub encoding: String,
}

impl ValidationReport {
    fn new(encoding: &DetectedEncoding) -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            stats: ValidationStats::default(),
            duplicate_keys: Vec::new(),
            encoding: encoding.name().to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_summary(&self) -> String {
        self.errors.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationProgress {
    pub rows_scanned: usize,
    /// Share of the file scanned so far, 0-100; never decreases.
    pub percent: u8,
    pub stage: String,
}

pub type ProgressCallback<'p> = &'p mut dyn FnMut(&ValidationProgress);

pub struct Validator<'a> {
    mapping: &'a MappingSpec,
    progress_interval: usize,
}

impl<'a> Validator<'a> {
    pub fn new(mapping: &'a MappingSpec) -> Self {
        Self {
            mapping,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, rows: usize) -> Self {
        self.progress_interval = rows.max(1);
        self
    }

    pub fn validate_file(
        &self,
        path: &Path,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<ValidationReport> {
        let detected = encoding::detect_encoding(path)?;
        let total_bytes = fs::metadata(path)
            .with_context(|| format!("Reading metadata for {path:?}"))?
            .len();
        let reader = io_utils::open_csv_reader_from_path(path)?;
        let report = self
            .validate_reader(reader, Some(total_bytes), detected, progress)
            .with_context(|| format!("Validating {path:?}"))?;
        info!(
            "Validated {:?}: {} row(s), {} duplicate key(s), {} missing key value(s), {} error(s)",
            path,
            report.stats.total_rows,
            report.stats.duplicates,
            report.stats.missing_keys,
            report.errors.len()
        );
        Ok(report)
    }

    pub fn validate_reader<R: Read>(
        &self,
        mut reader: csv::Reader<R>,
        total_bytes: Option<u64>,
        detected: DetectedEncoding,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<ValidationReport> {
        // Structure and keys are what matter here, so decode leniently.
        let lenient = DetectedEncoding {
            policy: DecodePolicy::Replace,
            ..detected
        };
        let mut report = ValidationReport::new(&detected);

        let Some(raw_headers) = io_utils::reader_headers(&mut reader, &lenient)? else {
            report.errors.push("CSV file has no headers".to_string());
            return Ok(report);
        };
        let headers = normalize_duplicate_headers(&raw_headers);
        self.check_headers(&headers, &mut report);
        let key_positions = self.key_positions(&headers, &mut report);

        let mut key_counts: HashMap<Vec<String>, usize> = HashMap::new();
        let mut key_order: Vec<Vec<String>> = Vec::new();
        let mut missing_reported = 0usize;
        let key_trimmed: Vec<bool> = key_positions
            .iter()
            .flatten()
            .map(|(column, _)| self.trims_on_load(column))
            .collect();
        let mut padded_keys = vec![false; key_trimmed.len()];
        let mut last_percent = 0u8;
        let mut record = csv::ByteRecord::new();

        loop {
            let row_number = report.stats.total_rows + 2;
            match reader.read_byte_record(&mut record) {
                Ok(false) => break,
                Ok(true) => {}
                Err(err) if !err.is_io_error() => {
                    report.stats.total_rows += 1;
                    report
                        .errors
                        .push(format!("Row {row_number}: unreadable record ({err})"));
                    continue;
                }
                Err(err) => return Err(err).with_context(|| format!("Reading row {row_number}")),
            }
            report.stats.total_rows += 1;

            if let Some(positions) = &key_positions {
                let mut tuple = Vec::with_capacity(positions.len());
                for (slot, (column, idx)) in positions.iter().enumerate() {
                    let raw = record.get(*idx).unwrap_or_default();
                    let value = io_utils::decode_field(raw, &lenient)?;
                    let trimmed = value.trim();
                    if trimmed.is_empty() || self.mapping.is_null_like(trimmed) {
                        report.stats.missing_keys += 1;
                        if missing_reported < MISSING_KEY_REPORT_LIMIT {
                            report.errors.push(format!(
                                "Row {row_number}: Missing required field '{column}'"
                            ));
                            missing_reported += 1;
                        }
                    }
                    if !trimmed.is_empty() && trimmed.len() != value.len() && !key_trimmed[slot] {
                        padded_keys[slot] = true;
                    }
                    tuple.push(trimmed.to_string());
                }
                let count = key_counts.entry(tuple).or_insert_with_key(|key| {
                    key_order.push(key.clone());
                    0
                });
                *count += 1;
            }

            if report.stats.total_rows % self.progress_interval == 0 {
                if let Some(callback) = progress.as_mut() {
                    let percent = scanned_percent(reader.position().byte(), total_bytes).max(last_percent);
                    last_percent = percent;
                    callback(&ValidationProgress {
                        rows_scanned: report.stats.total_rows,
                        percent,
                        stage: format!("Validated {} rows", report.stats.total_rows),
                    });
                }
            }
        }

        if report.stats.missing_keys > MISSING_KEY_REPORT_LIMIT {
            report.errors.push(format!(
                "... and {} more rows with missing keys",
                report.stats.missing_keys - MISSING_KEY_REPORT_LIMIT
            ));
        }
        self.summarize_duplicates(&key_counts, key_order, &mut report);
        for (column, _) in key_positions
            .iter()
            .flatten()
            .zip(&padded_keys)
            .filter(|(_, padded)| **padded)
            .map(|(position, _)| position)
        {
            report.warnings.push(format!(
                "Natural key '{column}' has values with surrounding whitespace but no trim coercion"
            ));
        }

        if let Some(callback) = progress.as_mut() {
            callback(&ValidationProgress {
                rows_scanned: report.stats.total_rows,
                percent: 100,
                stage: format!("Validated {} rows", report.stats.total_rows),
            });
        }
        Ok(report)
    }

    fn check_headers(&self, headers: &[String], report: &mut ValidationReport) {
        let missing: Vec<&str> = self
            .mapping
            .source_columns()
            .filter(|source| !headers.iter().any(|h| h.as_str() == *source))
            .sorted()
            .collect();
        if !missing.is_empty() {
            report
                .errors
                .push(format!("Missing expected headers: {}", missing.join(", ")));
        }
        let extra: Vec<&str> = headers
            .iter()
            .map(String::as_str)
            .filter(|header| !self.mapping.source_columns().any(|source| source == *header))
            .sorted()
            .collect();
        if !extra.is_empty() {
            report
                .warnings
                .push(format!("Extra headers not in mapping: {}", extra.join(", ")));
        }
    }

    /// Header positions of the natural key columns, resolved through the
    /// mapping. `None` when there is no key or a key column cannot be located.
    fn key_positions(
        &self,
        headers: &[String],
        report: &mut ValidationReport,
    ) -> Option<Vec<(String, usize)>> {
        if self.mapping.natural_key.is_empty() {
            return None;
        }
        let mut positions = Vec::with_capacity(self.mapping.natural_key.len());
        for column in &self.mapping.natural_key {
            let mapped = self.mapping.source_for_target(column);
            let source = mapped.unwrap_or(column);
            match headers.iter().position(|h| h.as_str() == source) {
                Some(idx) => positions.push((column.clone(), idx)),
                None => {
                    // A mapped source column is already reported as a missing header.
                    if mapped.is_none() {
                        report.errors.push(format!(
                            "Natural key column '{column}' is not mapped and not present in the file"
                        ));
                    }
                    debug!("Skipping key checks: '{column}' cannot be located");
                    return None;
                }
            }
        }
        Some(positions)
    }

    fn trims_on_load(&self, target: &str) -> bool {
        self.mapping
            .coercion_for(target)
            .is_some_and(|spec| CoercionPipeline::parse(spec).rule_names().contains(&"trim"))
    }

    fn summarize_duplicates(
        &self,
        key_counts: &HashMap<Vec<String>, usize>,
        key_order: Vec<Vec<String>>,
        report: &mut ValidationReport,
    ) {
        let duplicates: Vec<DuplicateKey> = key_order
            .into_iter()
            .filter_map(|values| {
                let occurrences = key_counts.get(&values).copied().unwrap_or_default();
                (occurrences > 1).then_some(DuplicateKey {
                    values,
                    occurrences,
                })
            })
            .collect();
        report.stats.duplicates = duplicates.len();
        for duplicate in duplicates.iter().take(DUPLICATE_REPORT_LIMIT) {
            let rendered = self
                .mapping
                .natural_key
                .iter()
                .zip(&duplicate.values)
                .map(|(column, value)| format!("{column}: {value}"))
                .join(", ");
            report.errors.push(format!(
                "Duplicate key {{{rendered}}}: {} occurrences",
                duplicate.occurrences
            ));
        }
        if duplicates.len() > DUPLICATE_REPORT_LIMIT {
            report.errors.push(format!(
                "... and {} more duplicate keys",
                duplicates.len() - DUPLICATE_REPORT_LIMIT
            ));
        }
        report.duplicate_keys = duplicates;
    }
}

fn scanned_percent(position: u64, total_bytes: Option<u64>) -> u8 {
    match total_bytes {
        Some(total) if total > 0 => ((position.min(total) * 99) / total) as u8,
        _ => 0,
    }
}
