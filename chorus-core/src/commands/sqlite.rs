use std::{fmt, path::Path, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

use super::{
    model::{
        CommandParameters, CommandRecord, CommandResult, CommandStatus,
        CommandTrigger,
    },
    store::CommandStore,
};
use crate::{
    error::{CoreError, Result},
    types::ids::CommandId,
};

/// Keeps each `DELETE ... IN (..)` under SQLite's bind limit.
const DELETE_CHUNK: usize = 500;

/// Command history in a SQLite database file.
#[derive(Clone)]
pub struct SqliteCommandStore {
    pool: SqlitePool,
}

impl fmt::Debug for SqliteCommandStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteCommandStore")
            .field("pool_size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .finish()
    }
}

impl SqliteCommandStore {
    /// Opens (creating if needed) the database at `path` and applies
    /// migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        tracing::info!(
            target: "commands::store",
            path = %path.display(),
            "opened command store"
        );
        Self::from_pool(pool).await
    }

    /// Private in-memory database. A single never-recycled connection keeps
    /// the data alive for the life of the pool.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl CommandStore for SqliteCommandStore {
    async fn save(&self, record: &CommandRecord) -> Result<()> {
        let result = record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO commands (
                id, name, parameters, status, trigger_kind,
                queued_at, started_at, ended_at, message, result
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                parameters = excluded.parameters,
                status = excluded.status,
                trigger_kind = excluded.trigger_kind,
                queued_at = excluded.queued_at,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                message = excluded.message,
                result = excluded.result
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.name.as_str())
        .bind(record.parameters.canonical())
        .bind(record.status.as_str())
        .bind(record.trigger.as_str())
        .bind(timestamp(record.queued_at))
        .bind(record.started_at.map(timestamp))
        .bind(record.ended_at.map(timestamp))
        .bind(record.message.as_deref())
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CommandRecord>> {
        let rows = sqlx::query_as::<_, CommandRow>(
            r#"
            SELECT
                id, name, parameters, status, trigger_kind,
                queued_at, started_at, ended_at, message, result
            FROM commands
            ORDER BY queued_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CommandRecord::try_from).collect()
    }

    async fn delete(&self, ids: &[CommandId]) -> Result<u64> {
        let mut removed = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let mut builder =
                QueryBuilder::<Sqlite>::new("DELETE FROM commands WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.to_string());
            }
            separated.push_unseparated(")");
            removed += builder
                .build()
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(removed)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| {
            CoreError::Internal(format!("invalid {column} timestamp `{value}`: {e}"))
        })
}

#[derive(sqlx::FromRow)]
struct CommandRow {
    id: String,
    name: String,
    parameters: String,
    status: String,
    trigger_kind: String,
    queued_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    message: Option<String>,
    result: Option<String>,
}

impl TryFrom<CommandRow> for CommandRecord {
    type Error = CoreError;

    fn try_from(row: CommandRow) -> Result<Self> {
        let id = CommandId::from_str(&row.id).map_err(|e| {
            CoreError::Internal(format!("invalid command id `{}`: {e}", row.id))
        })?;
        let parameters = CommandParameters::from_json(serde_json::from_str(
            &row.parameters,
        )?)?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<CommandResult>)
            .transpose()?;

        Ok(CommandRecord {
            id,
            name: row.name,
            parameters,
            status: CommandStatus::from_str(&row.status)?,
            trigger: CommandTrigger::from_str(&row.trigger_kind)?,
            queued_at: parse_timestamp("queued_at", &row.queued_at)?,
            started_at: row
                .started_at
                .as_deref()
                .map(|value| parse_timestamp("started_at", value))
                .transpose()?,
            ended_at: row
                .ended_at
                .as_deref()
                .map(|value| parse_timestamp("ended_at", value))
                .transpose()?,
            message: row.message,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_survive_a_round_trip() {
        let store = SqliteCommandStore::in_memory().await.expect("open store");
        let mut record = CommandRecord::queued(
            "AlbumSearch",
            CommandParameters::new().with("albumIds", json!([1, 2, 3])),
            CommandTrigger::Manual,
        );
        record.mark_started(Utc::now());
        record.message = Some("searching 3 albums".into());
        record.finish(
            CommandResult::Succeeded {
                output: json!({ "grabbed": 2 }),
            },
            Utc::now(),
        );
        store.save(&record).await.expect("save");

        let loaded = store.load_all().await.expect("load");
        assert_eq!(loaded.len(), 1);
        let loaded = &loaded[0];
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.status, CommandStatus::Completed);
        assert_eq!(loaded.parameters, record.parameters);
        assert_eq!(loaded.result, record.result);
        assert_eq!(loaded.message.as_deref(), Some("searching 3 albums"));
        assert_eq!(
            loaded.started_at.map(timestamp),
            record.started_at.map(timestamp)
        );
    }

    #[tokio::test]
    async fn delete_reports_removed_rows() {
        let store = SqliteCommandStore::in_memory().await.expect("open store");
        let record = CommandRecord::queued(
            "RefreshArtist",
            CommandParameters::new(),
            CommandTrigger::Scheduled,
        );
        store.save(&record).await.expect("save");

        let removed = store
            .delete(&[record.id, CommandId::new()])
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        assert!(store.load_all().await.expect("load").is_empty());
        assert_eq!(store.delete(&[]).await.expect("empty delete"), 0);
    }
}
