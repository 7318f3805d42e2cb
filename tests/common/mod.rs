#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crm_stage_loader::db::{
    Connector, LoadHistory, LoadId, LoadOutcome, LoadRecord, LoadStatus, NewLoadRecord,
    ReplaceCounts, StagingSession, TableRef,
};
use crm_stage_loader::error::{DbError, DbResult};
use itertools::Itertools;
use tempfile::{TempDir, tempdir};

pub const CONTACTS_MAPPING: &str = r#"
target_object: contacts
source_report: Contacts Daily
columns:
  Contact ID: contact_sfid
  First Name: first_name
  Email Opt Out: email_opt_out
  Created: created_at
coercions:
  first_name: trim
  email_opt_out: trim|boolean
  created_at: timestamptz
natural_key: [contact_sfid]
"#;

pub const CONTACT_COLUMNS: &[&str] = &[
    "contact_sfid",
    "first_name",
    "email_opt_out",
    "created_at",
    "_partition_date",
    "_file_name",
    "_source_report",
    "_extract_ts",
];

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }

    /// Creates `Mappings/<name>.yaml` and returns the mappings directory.
    pub fn mapping(&self, name: &str, yaml: &str) -> PathBuf {
        self.write(&format!("Mappings/{name}.yaml"), yaml);
        self.path().join("Mappings")
    }
}

pub type Row = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemTable>,
    history: Vec<LoadRecord>,
    connect_failures: u32,
    connect_attempts: u32,
    fail_copies: bool,
    fail_progress: bool,
}

/// In-memory stand-in for the staging database: tables, COPY, session temp
/// tables and the `load_history` table.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str, columns: &[&str]) -> Self {
        self.state.lock().unwrap().tables.insert(
            name.to_string(),
            MemTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
        self
    }

    /// The next `count` connection attempts are refused.
    pub fn fail_connects(self, count: u32) -> Self {
        self.state.lock().unwrap().connect_failures = count;
        self
    }

    pub fn fail_copies(self) -> Self {
        self.state.lock().unwrap().fail_copies = true;
        self
    }

    pub fn fail_progress_updates(self) -> Self {
        self.state.lock().unwrap().fail_progress = true;
        self
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().unwrap().tables[table].rows.clone()
    }

    pub fn insert_row(&self, table: &str, values: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        let target = state.tables.get_mut(table).expect("table exists");
        let row = target
            .columns
            .iter()
            .map(|column| {
                let value = values
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, value)| value.to_string());
                (column.clone(), value)
            })
            .collect();
        target.rows.push(row);
    }

    pub fn history(&self) -> Vec<LoadRecord> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn progress_log(&self, id: LoadId) -> Option<(String, u8)> {
        let state = self.state.lock().unwrap();
        let record = state.history.iter().find(|r| r.id == id)?;
        Some((
            record.current_stage.clone().unwrap_or_default(),
            record.progress_percent.unwrap_or_default(),
        ))
    }
}

impl Connector for MemoryDatabase {
    type Session = MemorySession;

    async fn connect(&self) -> DbResult<MemorySession> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(DbError::new("connection refused"));
        }
        Ok(MemorySession {
            state: Arc::clone(&self.state),
            temp: Mutex::new(HashMap::new()),
        })
    }
}

pub struct MemorySession {
    state: Arc<Mutex<State>>,
    temp: Mutex<HashMap<String, MemTable>>,
}

impl MemorySession {
    fn with_table<T>(
        &self,
        table: &TableRef,
        f: impl FnOnce(&mut MemTable) -> DbResult<T>,
    ) -> DbResult<T> {
        if table.schema.is_none() {
            if let Some(temp) = self.temp.lock().unwrap().get_mut(&table.name) {
                return f(temp);
            }
        }
        let mut state = self.state.lock().unwrap();
        let target = state
            .tables
            .get_mut(&table.to_string())
            .ok_or_else(|| DbError::new(format!("relation \"{table}\" does not exist")))?;
        f(target)
    }

    fn snapshot(&self, table: &TableRef) -> DbResult<MemTable> {
        self.with_table(table, |t| Ok(t.clone()))
    }
}

fn key_of(row: &Row, key: &[String]) -> Vec<Option<String>> {
    key.iter().map(|k| row.get(k).cloned().flatten()).collect()
}

impl StagingSession for MemorySession {
    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }

    async fn copy_csv(&self, table: &TableRef, columns: &[String], path: &Path) -> DbResult<u64> {
        if self.state.lock().unwrap().fail_copies {
            return Err(DbError::new("ERROR: COPY failed: disk full"));
        }
        let mut reader = csv::Reader::from_path(path)
            .map_err(|err| DbError::with_source("cannot read copy source", err))?;
        let mut parsed = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| DbError::with_source("malformed csv", err))?;
            let row: Row = columns
                .iter()
                .zip(record.iter())
                .map(|(column, value)| {
                    let value = (!value.is_empty()).then(|| value.to_string());
                    (column.clone(), value)
                })
                .collect();
            parsed.push(row);
        }
        self.with_table(table, |target| {
            if let Some(unknown) = columns.iter().find(|c| !target.columns.contains(c)) {
                return Err(DbError::new(format!("column \"{unknown}\" does not exist")));
            }
            let copied = parsed.len() as u64;
            for mut row in parsed {
                for column in &target.columns {
                    row.entry(column.clone()).or_insert(None);
                }
                target.rows.push(row);
            }
            Ok(copied)
        })
    }

    async fn create_temp_table_like(&self, temp: &TableRef, like: &TableRef) -> DbResult<()> {
        let shape = self.snapshot(like)?;
        let mut temps = self.temp.lock().unwrap();
        if temps.contains_key(&temp.name) {
            return Err(DbError::new(format!("relation \"{temp}\" already exists")));
        }
        temps.insert(
            temp.name.clone(),
            MemTable {
                columns: shape.columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn replace_by_key(
        &self,
        target: &TableRef,
        temp: &TableRef,
        key: &[String],
        _columns: &[String],
    ) -> DbResult<ReplaceCounts> {
        let incoming = self.snapshot(temp)?;
        let repeated = incoming
            .rows
            .iter()
            .map(|row| key_of(row, key))
            .counts()
            .values()
            .filter(|&&n| n > 1)
            .count();
        if repeated > 0 {
            return Err(DbError::new(format!(
                "{repeated} natural key value(s) appear more than once in the load file; upsert needs one row per key"
            )));
        }
        self.with_table(target, |table| {
            let before = table.rows.len();
            table
                .rows
                .retain(|row| !incoming.rows.iter().any(|new| key_of(new, key) == key_of(row, key)));
            let deleted = (before - table.rows.len()) as u64;
            table.rows.extend(incoming.rows.iter().cloned());
            Ok(ReplaceCounts {
                deleted,
                inserted: incoming.rows.len() as u64,
            })
        })
    }

    async fn drop_temp_table(&self, temp: &TableRef) -> DbResult<()> {
        self.temp.lock().unwrap().remove(&temp.name);
        Ok(())
    }

    async fn count_rows_for_file(&self, target: &TableRef, file_name: &str) -> DbResult<u64> {
        self.with_table(target, |table| {
            Ok(table
                .rows
                .iter()
                .filter(|row| row.get("_file_name").cloned().flatten().as_deref() == Some(file_name))
                .count() as u64)
        })
    }
}

impl LoadHistory for MemorySession {
    async fn start_load(&self, record: &NewLoadRecord) -> DbResult<LoadId> {
        let mut state = self.state.lock().unwrap();
        let id = state.history.len() as LoadId + 1;
        state.history.push(LoadRecord {
            id,
            load_date: record.load_date,
            target_table: record.target_table.clone(),
            file_name: record.file_name.clone(),
            mapping_file: record.mapping_file.clone(),
            status: LoadStatus::Running,
            rows_loaded: None,
            error_message: None,
            current_stage: Some(record.stage.clone()),
            progress_percent: Some(0),
            quarantine_path: None,
            started_at: Utc::now(),
            completed_at: None,
        });
        Ok(id)
    }

    async fn update_progress(&self, id: LoadId, stage: &str, percent: u8) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_progress {
            return Err(DbError::new("progress table locked"));
        }
        let record = state
            .history
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DbError::new(format!("load record {id} does not exist")))?;
        record.current_stage = Some(stage.to_string());
        record.progress_percent = Some(percent);
        Ok(())
    }

    async fn finish_load(&self, id: LoadId, outcome: &LoadOutcome) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .history
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DbError::new(format!("load record {id} does not exist")))?;
        record.status = outcome.status;
        record.rows_loaded = outcome.rows_loaded;
        record.error_message = outcome.error_message.clone();
        record.current_stage = Some(outcome.stage.clone());
        record.progress_percent = Some(outcome.percent);
        record.quarantine_path = outcome.quarantine_path.clone();
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn recent_loads(&self, limit: u32) -> DbResult<Vec<LoadRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .history
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn fetch_load(&self, id: LoadId) -> DbResult<Option<LoadRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.history.iter().find(|r| r.id == id).cloned())
    }
}
