//! Mapping documents: which source headers land in which staging columns,
//! how each column is coerced, and which columns form the natural key.
//!
//! Mappings live as `<name>.yaml` files in a mappings directory:
//!
//! ```yaml
//! target_object: contacts
//! source_report: Contacts Daily
//! columns:
//!   Contact ID: contact_sfid
//!   Email Opt Out: email_opt_out
//! coercions:
//!   email_opt_out: trim|boolean
//! natural_key: [contact_sfid]
//! ```
//!
//! `columns` is order-sensitive: the normalized output file lists target
//! columns in the order they are declared here.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{
    Deserialize, Deserializer,
    de::{self, MapAccess, Visitor},
};

use crate::error::IngestError;

pub const STAGING_SCHEMA: &str = "staging";
pub const DEFAULT_SOURCE_REPORT: &str = "Unknown";

const MAPPING_EXTENSIONS: &[&str] = &["yaml", "yml"];

pub fn default_null_like() -> Vec<String> {
    ["", "NULL", "N/A", "n/a", "null"]
        .iter()
        .map(|token| token.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingSpec {
    /// Identifier the mapping was loaded under; recorded on every load.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub target_object: Option<String>,
    #[serde(default)]
    pub source_report: Option<String>,
    #[serde(default, deserialize_with = "ordered_columns")]
    pub columns: Vec<(String, String)>,
    #[serde(default)]
    pub coercions: BTreeMap<String, String>,
    #[serde(default = "default_null_like")]
    pub null_like: Vec<String>,
    #[serde(default)]
    pub natural_key: Vec<String>,
    /// Advisory only; carried for reporting.
    #[serde(default)]
    pub reject_rules: Vec<String>,
}

impl MappingSpec {
    pub fn from_yaml_str(name: &str, yaml: &str) -> Result<Self, IngestError> {
        let mut spec: MappingSpec = serde_yaml::from_str(yaml).map_err(|err| {
            IngestError::configuration(format!("mapping '{name}' is not valid: {err}"))
        })?;
        spec.name = name.to_string();
        spec.check_consistency()?;
        Ok(spec)
    }

    pub fn target_table(&self) -> Result<String, IngestError> {
        match self.target_object.as_deref().map(str::trim) {
            Some(object) if !object.is_empty() => Ok(format!("{STAGING_SCHEMA}.{object}")),
            _ => Err(IngestError::configuration(format!(
                "mapping '{}' is missing 'target_object'",
                self.name
            ))),
        }
    }

    pub fn source_report(&self) -> &str {
        self.source_report
            .as_deref()
            .unwrap_or(DEFAULT_SOURCE_REPORT)
    }

    pub fn coercion_for(&self, target: &str) -> Option<&str> {
        self.coercions.get(target).map(String::as_str)
    }

    pub fn is_null_like(&self, value: &str) -> bool {
        self.null_like.iter().any(|token| token == value)
    }

    /// Upsert when a natural key is declared, append otherwise.
    pub fn is_upsert(&self) -> bool {
        !self.natural_key.is_empty()
    }

    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(source, _)| source.as_str())
    }

    pub fn target_columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(_, target)| target.as_str())
    }

    /// Source header feeding `target`, if the mapping declares one.
    pub fn source_for_target(&self, target: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(_, mapped)| mapped == target)
            .map(|(source, _)| source.as_str())
    }

    fn check_consistency(&self) -> Result<(), IngestError> {
        let mut targets = HashSet::with_capacity(self.columns.len());
        for (source, target) in &self.columns {
            if target.trim().is_empty() {
                return Err(IngestError::configuration(format!(
                    "mapping '{}' maps '{source}' to an empty target column",
                    self.name
                )));
            }
            if !targets.insert(target.as_str()) {
                return Err(IngestError::configuration(format!(
                    "mapping '{}' maps more than one source column to '{target}'",
                    self.name
                )));
            }
        }
        let mut key = HashSet::with_capacity(self.natural_key.len());
        for column in &self.natural_key {
            if !key.insert(column.as_str()) {
                return Err(IngestError::configuration(format!(
                    "mapping '{}' lists '{column}' twice in natural_key",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

fn ordered_columns<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ColumnsVisitor;

    impl<'de> Visitor<'de> for ColumnsVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a mapping of source header to target column")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut seen = HashSet::new();
            let mut columns = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((source, target)) = map.next_entry::<String, String>()? {
                if !seen.insert(source.clone()) {
                    return Err(de::Error::custom(format!(
                        "duplicate source column '{source}'"
                    )));
                }
                columns.push((source, target));
            }
            Ok(columns)
        }
    }

    deserializer.deserialize_any(ColumnsVisitor)
}

/// Directory of mapping documents addressed by name.
#[derive(Debug, Clone)]
pub struct MappingCatalog {
    dir: PathBuf,
}

impl MappingCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn available(&self) -> Result<Vec<String>, IngestError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Listing mappings in {:?}", self.dir))?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry.with_context(|| format!("Listing mappings in {:?}", self.dir))?.path();
            let is_mapping = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| MAPPING_EXTENSIONS.contains(&ext));
            if !is_mapping {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<MappingSpec, IngestError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(IngestError::configuration(format!(
                "invalid mapping name '{name}'"
            )));
        }
        let path = self.resolve(name).ok_or_else(|| IngestError::MappingNotFound {
            name: name.to_string(),
            path: self.dir.join(format!("{name}.yaml")),
        })?;
        let file = File::open(&path).with_context(|| format!("Opening mapping file {path:?}"))?;
        let mut spec: MappingSpec = serde_yaml::from_reader(BufReader::new(file)).map_err(|err| {
            IngestError::configuration(format!("mapping '{name}' ({path:?}) is not valid: {err}"))
        })?;
        spec.name = name.to_string();
        spec.check_consistency()?;
        Ok(spec)
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        MAPPING_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{name}.{ext}")))
            .find(|path| path.is_file())
    }
}
