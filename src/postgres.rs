//! `tokio-postgres` implementation of the [`crate::db`] traits.

use std::{path::Path, str::FromStr, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use futures::{SinkExt, pin_mut};
use log::{debug, error, info};
use pg_escape::quote_identifier;
use tokio::{io::AsyncReadExt, sync::Mutex};
use tokio_postgres::{Client, Config, NoTls, Row};

use crate::{
    config::ConnectionSettings,
    db::{
        Connector, LoadHistory, LoadId, LoadOutcome, LoadRecord, LoadStatus, NewLoadRecord,
        ReplaceCounts, StagingSession, TableRef,
    },
    error::{DbError, DbResult},
    transform::FILE_NAME_COLUMN,
};

const COPY_CHUNK_BYTES: usize = 256 * 1024;

const LOAD_RECORD_COLUMNS: &str = "id, load_date, target_table, file_name, mapping_file, status, \
     rows_loaded, error_message, current_stage, progress_percent, quarantine_path, started_at, completed_at";

/// Builds driver configuration from a connection URL plus the timeout and
/// keepalive settings.
pub fn build_config(database_url: &str, settings: &ConnectionSettings) -> DbResult<Config> {
    let mut config = Config::from_str(database_url)
        .map_err(|err| DbError::with_source("invalid database url", err))?;
    config.connect_timeout(Duration::from_secs(settings.connect_timeout_secs));
    let keepalive = &settings.keepalive;
    config
        .keepalives(true)
        .keepalives_idle(Duration::from_secs(keepalive.idle_secs))
        .keepalives_interval(Duration::from_secs(keepalive.interval_secs))
        .keepalives_retries(keepalive.retries);
    if let Some(name) = &settings.application_name {
        config.application_name(name);
    }
    Ok(config)
}

#[derive(Debug, Clone)]
pub struct PgConnector {
    config: Config,
}

impl PgConnector {
    pub fn new(database_url: &str, settings: &ConnectionSettings) -> DbResult<Self> {
        Ok(Self {
            config: build_config(database_url, settings)?,
        })
    }
}

impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self) -> DbResult<PgSession> {
        let (client, connection) = self.config.connect(NoTls).await?;
        // The client terminates the connection task when it is dropped.
        tokio::spawn(async move {
            match connection.await {
                Err(err) => error!("an error occurred during the postgres connection: {err}"),
                Ok(()) => debug!("postgres connection terminated"),
            }
        });
        info!("connected to postgres without tls");
        Ok(PgSession {
            client: Mutex::new(client),
        })
    }
}

/// One connection. Calls are serialized so the upsert swap can open a
/// transaction on the same session that created the temp table.
pub struct PgSession {
    client: Mutex<Client>,
}

impl StagingSession for PgSession {
    async fn ping(&self) -> DbResult<()> {
        self.client.lock().await.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn copy_csv(&self, table: &TableRef, columns: &[String], path: &Path) -> DbResult<u64> {
        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
            table.quoted(),
            quoted_list(columns)
        );
        debug!("{statement}");
        let mut file = tokio::fs::File::open(path).await?;
        let client = self.client.lock().await;
        let sink = client.copy_in::<_, Bytes>(statement.as_str()).await?;
        pin_mut!(sink);
        let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            sink.send(Bytes::copy_from_slice(&buffer[..read])).await?;
        }
        let copied = sink.as_mut().finish().await?;
        Ok(copied)
    }

    async fn create_temp_table_like(&self, temp: &TableRef, like: &TableRef) -> DbResult<()> {
        let statement = format!(
            "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS)",
            temp.quoted(),
            like.quoted()
        );
        debug!("{statement}");
        self.client.lock().await.batch_execute(&statement).await?;
        Ok(())
    }

    async fn replace_by_key(
        &self,
        target: &TableRef,
        temp: &TableRef,
        key: &[String],
        columns: &[String],
    ) -> DbResult<ReplaceCounts> {
        if key.is_empty() {
            return Err(DbError::new("replace_by_key requires at least one key column"));
        }
        let key_list = quoted_list(key);
        let duplicates = format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {} GROUP BY {key_list} HAVING COUNT(*) > 1) AS d",
            temp.quoted()
        );
        let matches = key
            .iter()
            .map(|column| {
                let column = quote_identifier(column);
                format!("t.{column} = s.{column}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let delete = format!(
            "DELETE FROM {} AS t USING {} AS s WHERE {matches}",
            target.quoted(),
            temp.quoted()
        );
        let column_list = quoted_list(columns);
        let insert = format!(
            "INSERT INTO {} ({column_list}) SELECT {column_list} FROM {}",
            target.quoted(),
            temp.quoted()
        );
        debug!("{delete}");
        debug!("{insert}");

        let mut client = self.client.lock().await;
        let repeated: i64 = client.query_one(duplicates.as_str(), &[]).await?.try_get(0)?;
        if repeated > 0 {
            return Err(DbError::new(format!(
                "{repeated} natural key value(s) appear more than once in the load file; upsert needs one row per key"
            )));
        }
        let transaction = client.transaction().await?;
        let deleted = transaction.execute(delete.as_str(), &[]).await?;
        let inserted = transaction.execute(insert.as_str(), &[]).await?;
        transaction.commit().await?;
        Ok(ReplaceCounts { deleted, inserted })
    }

    async fn drop_temp_table(&self, temp: &TableRef) -> DbResult<()> {
        let statement = format!("DROP TABLE IF EXISTS {}", temp.quoted());
        self.client.lock().await.batch_execute(&statement).await?;
        Ok(())
    }

    async fn count_rows_for_file(&self, target: &TableRef, file_name: &str) -> DbResult<u64> {
        let statement = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = $1",
            target.quoted(),
            quote_identifier(FILE_NAME_COLUMN)
        );
        let row = self
            .client
            .lock()
            .await
            .query_one(statement.as_str(), &[&file_name])
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }
}

impl LoadHistory for PgSession {
    async fn start_load(&self, record: &NewLoadRecord) -> DbResult<LoadId> {
        let row = self
            .client
            .lock()
            .await
            .query_one(
                "INSERT INTO load_history \
                 (load_date, target_table, file_name, mapping_file, status, current_stage, progress_percent, started_at) \
                 VALUES ($1, $2, $3, $4, 'running', $5, 0, now()) \
                 RETURNING id",
                &[
                    &record.load_date,
                    &record.target_table,
                    &record.file_name,
                    &record.mapping_file,
                    &record.stage,
                ],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn update_progress(&self, id: LoadId, stage: &str, percent: u8) -> DbResult<()> {
        self.client
            .lock()
            .await
            .execute(
                "UPDATE load_history SET current_stage = $1, progress_percent = $2 WHERE id = $3",
                &[&stage, &i32::from(percent), &id],
            )
            .await?;
        Ok(())
    }

    async fn finish_load(&self, id: LoadId, outcome: &LoadOutcome) -> DbResult<()> {
        let rows_loaded = outcome
            .rows_loaded
            .map(|rows| i32::try_from(rows).unwrap_or(i32::MAX));
        let updated = self
            .client
            .lock()
            .await
            .execute(
                "UPDATE load_history SET status = $1, rows_loaded = $2, error_message = $3, \
                 current_stage = $4, progress_percent = $5, quarantine_path = $6, completed_at = now() \
                 WHERE id = $7",
                &[
                    &outcome.status.as_str(),
                    &rows_loaded,
                    &outcome.error_message,
                    &outcome.stage,
                    &i32::from(outcome.percent),
                    &outcome.quarantine_path,
                    &id,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DbError::new(format!("load record {id} does not exist")));
        }
        Ok(())
    }

    async fn recent_loads(&self, limit: u32) -> DbResult<Vec<LoadRecord>> {
        let statement = format!(
            "SELECT {LOAD_RECORD_COLUMNS} FROM load_history ORDER BY started_at DESC LIMIT $1"
        );
        let rows = self
            .client
            .lock()
            .await
            .query(statement.as_str(), &[&i64::from(limit)])
            .await?;
        rows.iter().map(load_record_from_row).collect()
    }

    async fn fetch_load(&self, id: LoadId) -> DbResult<Option<LoadRecord>> {
        let statement = format!("SELECT {LOAD_RECORD_COLUMNS} FROM load_history WHERE id = $1");
        let row = self
            .client
            .lock()
            .await
            .query_opt(statement.as_str(), &[&id])
            .await?;
        row.as_ref().map(load_record_from_row).transpose()
    }
}

fn load_record_from_row(row: &Row) -> DbResult<LoadRecord> {
    let status: String = row.try_get("status")?;
    let rows_loaded: Option<i32> = row.try_get("rows_loaded")?;
    let progress: Option<i32> = row.try_get("progress_percent")?;
    let load_date: NaiveDate = row.try_get("load_date")?;
    let started_at: DateTime<Utc> = row.try_get("started_at")?;
    Ok(LoadRecord {
        id: row.try_get("id")?,
        load_date,
        target_table: row.try_get("target_table")?,
        file_name: row.try_get("file_name")?,
        mapping_file: row.try_get("mapping_file")?,
        status: LoadStatus::from_str(&status)?,
        rows_loaded: rows_loaded.map(|rows| rows.max(0) as u64),
        error_message: row.try_get("error_message")?,
        current_stage: row.try_get("current_stage")?,
        progress_percent: progress.map(|p| p.clamp(0, 100) as u8),
        quarantine_path: row.try_get("quarantine_path")?,
        started_at,
        completed_at: row.try_get("completed_at")?,
    })
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(column).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;

    #[test]
    fn config_carries_timeout_and_keepalives() {
        let settings = ConnectionSettings::default();
        let config = build_config("postgres://etl@localhost:5432/crm", &settings).unwrap();
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_secs(10)));
        assert!(config.get_keepalives());
        assert_eq!(config.get_keepalives_idle(), Duration::from_secs(30));
        assert_eq!(config.get_dbname(), Some("crm"));
    }

    #[test]
    fn invalid_url_is_reported() {
        let err = build_config("postgres://host:notaport/db", &ConnectionSettings::default())
            .unwrap_err();
        assert!(err.message().contains("invalid database url"));
    }

    #[test]
    fn column_lists_are_identifier_quoted() {
        let columns = vec!["contact_sfid".to_string(), "First Name".to_string()];
        assert_eq!(quoted_list(&columns), "contact_sfid, \"First Name\"");
    }
}
