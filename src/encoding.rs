//! Input encoding detection.
//!
//! CRM exports arrive as UTF-8 most of the time and as Windows-1252 whenever
//! somebody round-trips them through a spreadsheet. Only a leading sample is
//! inspected, so the result also says how strictly the rest of the file may
//! be decoded: a choice that was verified against the whole file is `Strict`,
//! anything that was only verified against the sample is `Replace`.

use std::{
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Context, Result};
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use log::debug;

/// Number of leading bytes inspected.
pub const SAMPLE_BYTES: usize = 100_000;

/// Encodings tried in order when the statistical guess is not usable.
const FALLBACK_LABELS: &[&str] = &["utf-8", "windows-1252", "iso-8859-1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Undecodable bytes are an error.
    Strict,
    /// Undecodable bytes become U+FFFD.
    Replace,
}

impl fmt::Display for DecodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodePolicy::Strict => f.write_str("strict"),
            DecodePolicy::Replace => f.write_str("replace"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedEncoding {
    pub encoding: &'static Encoding,
    pub policy: DecodePolicy,
}

impl DetectedEncoding {
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }
}

pub fn detect_encoding(path: &Path) -> Result<DetectedEncoding> {
    let file = File::open(path).with_context(|| format!("Opening {path:?} for encoding detection"))?;
    let mut sample = Vec::with_capacity(SAMPLE_BYTES);
    BufReader::new(file)
        .take(SAMPLE_BYTES as u64 + 1)
        .read_to_end(&mut sample)
        .with_context(|| format!("Reading encoding sample from {path:?}"))?;
    let complete = sample.len() <= SAMPLE_BYTES;
    sample.truncate(SAMPLE_BYTES);
    let detected = detect_from_sample(&sample, complete);
    debug!(
        "Detected encoding {} ({}) for {:?}",
        detected.name(),
        detected.policy,
        path
    );
    Ok(detected)
}

/// Chooses an encoding for `sample`. `complete` is true when the sample is the
/// entire file.
pub fn detect_from_sample(sample: &[u8], complete: bool) -> DetectedEncoding {
    if let Some(encoding) = confident_guess(sample, complete) {
        return DetectedEncoding {
            encoding,
            policy: policy_for(complete),
        };
    }
    for label in FALLBACK_LABELS {
        let Some(encoding) = Encoding::for_label(label.as_bytes()) else {
            continue;
        };
        if decodes_cleanly(sample, encoding, complete) {
            return DetectedEncoding {
                encoding,
                policy: policy_for(complete),
            };
        }
    }
    DetectedEncoding {
        encoding: UTF_8,
        policy: DecodePolicy::Replace,
    }
}

fn confident_guess(sample: &[u8], complete: bool) -> Option<&'static Encoding> {
    if sample.is_ascii() {
        return Some(UTF_8);
    }
    let mut detector = EncodingDetector::new();
    detector.feed(sample, complete);
    let (guess, confident) = detector.guess_assess(None, true);
    if !confident {
        debug!("Encoding guess {} below confidence threshold", guess.name());
        return None;
    }
    match canonical_family(guess) {
        Some(encoding) if encoding == UTF_8 => {
            decodes_cleanly(sample, UTF_8, complete).then_some(UTF_8)
        }
        other => other,
    }
}

/// Folds the labels the loader understands onto one canonical encoding each.
fn canonical_family(encoding: &'static Encoding) -> Option<&'static Encoding> {
    match encoding.name().to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "ascii" | "us-ascii" => Some(UTF_8),
        "windows-1252" | "cp1252" | "iso-8859-1" | "latin-1" | "latin1" => Some(WINDOWS_1252),
        _ => None,
    }
}

fn policy_for(complete: bool) -> DecodePolicy {
    if complete {
        DecodePolicy::Strict
    } else {
        DecodePolicy::Replace
    }
}

/// A sample cut mid-character still counts as clean as long as the only
/// problem is the incomplete trailing sequence.
fn decodes_cleanly(sample: &[u8], encoding: &'static Encoding, complete: bool) -> bool {
    if encoding == UTF_8 {
        return match std::str::from_utf8(sample) {
            Ok(_) => true,
            Err(err) => !complete && err.error_len().is_none(),
        };
    }
    encoding
        .decode_without_bom_handling_and_without_replacement(sample)
        .is_some()
}
