//! CSV reader/writer construction and field decoding.
//!
//! Source files are read as raw byte records and decoded field by field with
//! the encoding picked by [`crate::encoding`]. Intermediate files are always
//! written as UTF-8, comma-delimited, with minimal quoting: an unquoted empty
//! field is how `COPY ... (FORMAT csv)` spells NULL, so quoting everything
//! would turn every NULL into an empty string.

use std::{
    borrow::Cow,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use csv::QuoteStyle;

use crate::encoding::{DecodePolicy, DetectedEncoding};

pub const CSV_DELIMITER: u8 = b',';

const BYTE_ORDER_MARK: char = '\u{feff}';

pub fn open_csv_reader<R>(reader: R) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(true)
        .delimiter(CSV_DELIMITER)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

pub fn open_csv_reader_from_path(path: &Path) -> Result<csv::Reader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
    Ok(open_csv_reader(BufReader::new(file)))
}

pub fn open_csv_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>> {
    let file = File::create(path).with_context(|| format!("Creating output file {path:?}"))?;
    Ok(csv_writer(BufWriter::new(file)))
}

pub fn csv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(CSV_DELIMITER)
        .quote_style(QuoteStyle::Necessary)
        .double_quote(true);
    builder.from_writer(writer)
}

pub fn decode_field<'a>(bytes: &'a [u8], detected: &DetectedEncoding) -> Result<Cow<'a, str>> {
    match detected.policy {
        DecodePolicy::Replace => {
            let (text, _) = detected.encoding.decode_without_bom_handling(bytes);
            Ok(text)
        }
        DecodePolicy::Strict => detected
            .encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .ok_or_else(|| {
                anyhow!(
                    "Failed to decode text with encoding {}",
                    detected.encoding.name()
                )
            }),
    }
}

pub fn decode_record(record: &csv::ByteRecord, detected: &DetectedEncoding) -> Result<Vec<String>> {
    record
        .iter()
        .map(|field| decode_field(field, detected).map(Cow::into_owned))
        .collect()
}

/// Reads and decodes the header row. Returns `None` for a file without one.
pub fn reader_headers<R>(
    reader: &mut csv::Reader<R>,
    detected: &DetectedEncoding,
) -> Result<Option<Vec<String>>>
where
    R: Read,
{
    let raw = reader.byte_headers().context("Reading header row")?.clone();
    if raw.is_empty() || (raw.len() == 1 && raw[0].is_empty()) {
        return Ok(None);
    }
    let mut headers = decode_record(&raw, detected).context("Decoding header row")?;
    if let Some(first) = headers.first_mut() {
        if first.starts_with(BYTE_ORDER_MARK) {
            *first = first.trim_start_matches(BYTE_ORDER_MARK).to_string();
        }
    }
    Ok(Some(headers))
}
