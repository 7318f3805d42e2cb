use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{info, warn};

use crate::db::LoadId;

/// Moves a rejected source file aside as
/// `<dir>/<YYYYmmdd_HHMMSS>_<load id>_<file name>`.
pub fn quarantine_file(
    source: &Path,
    quarantine_dir: &Path,
    load_id: Option<LoadId>,
    file_name: &str,
) -> Result<PathBuf> {
    quarantine_file_at(source, quarantine_dir, load_id, file_name, Local::now())
}

pub fn quarantine_file_at(
    source: &Path,
    quarantine_dir: &Path,
    load_id: Option<LoadId>,
    file_name: &str,
    now: DateTime<Local>,
) -> Result<PathBuf> {
    fs::create_dir_all(quarantine_dir)
        .with_context(|| format!("Creating quarantine directory {quarantine_dir:?}"))?;
    let id = load_id.map_or_else(|| "none".to_string(), |id| id.to_string());
    let destination = quarantine_dir.join(format!(
        "{}_{id}_{}",
        now.format("%Y%m%d_%H%M%S"),
        sanitize(file_name)
    ));
    if let Err(err) = fs::rename(source, &destination) {
        // Renames fail across filesystems; fall back to copy + remove.
        warn!("Rename into quarantine failed ({err}); copying instead");
        fs::copy(source, &destination)
            .with_context(|| format!("Copying {source:?} to {destination:?}"))?;
        fs::remove_file(source).with_context(|| format!("Removing {source:?}"))?;
    }
    info!("Quarantined {source:?} as {destination:?}");
    Ok(destination)
}

/// Final path component of `file_name` with control characters replaced.
pub(crate) fn sanitize(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload.csv");
    base.chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect()
}
