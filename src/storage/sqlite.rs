use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::config::{ConfigKey, ConfigPatch, QueueConfig};
use crate::job::{timestamp, DlqEntry, Expectation, Job, JobId, JobState, JobUpdate};

use super::{ClaimRequest, Result, Storage, StorageError};

const STOP_GENERATION: &str = "stop_generation";

/// Job store backed by a single SQLite database file.
///
/// Every mutation is one statement or one transaction, so the claim
/// protocol holds across every process that opens the same file.
pub struct SqliteStorage {
    pub pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database behind a `sqlite:` URL.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect(options).await
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    /// Create the schema if it does not exist yet
    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                command TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                next_retry_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_error TEXT,
                claimed_by TEXT,
                lease_expires_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_state_seq ON jobs(state, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                command TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                next_retry_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_error TEXT,
                claimed_by TEXT,
                lease_expires_at TEXT,
                dead_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS control (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(row: &SqliteRow) -> Result<Job> {
        let id: String = row.try_get("id")?;
        let state_str: String = row.try_get("state")?;
        let attempts: i64 = row.try_get("attempts")?;
        let max_retries: i64 = row.try_get("max_retries")?;

        let state = JobState::from_db(&state_str)
            .ok_or_else(|| StorageError::Corrupt(format!("job {id}: unknown state '{state_str}'")))?;

        let counter = |name: &str, value: i64| {
            u32::try_from(value)
                .map_err(|_| StorageError::Corrupt(format!("job {id}: {name} out of range ({value})")))
        };
        let attempts = counter("attempts", attempts)?;
        let max_retries = counter("max_retries", max_retries)?;

        Ok(Job {
            attempts,
            max_retries,
            command: row.try_get("command")?,
            state,
            next_retry_at: parse_optional_ts(row, "next_retry_at")?,
            created_at: parse_ts(row, "created_at")?,
            updated_at: parse_ts(row, "updated_at")?,
            last_error: row.try_get("last_error")?,
            claimed_by: row.try_get("claimed_by")?,
            lease_expires_at: parse_optional_ts(row, "lease_expires_at")?,
            id: JobId(id),
        })
    }

    fn row_to_entry(row: &SqliteRow) -> Result<DlqEntry> {
        Ok(DlqEntry {
            job: Self::row_to_job(row)?,
            dead_at: parse_ts(row, "dead_at")?,
        })
    }

    /// Insert unless the id is taken in either collection. `None` on collision.
    async fn insert_job<'e, E>(executor: E, job: &Job) -> Result<Option<Job>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, next_retry_at,
                              created_at, updated_at, last_error, claimed_by, lease_expires_at)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
            WHERE NOT EXISTS (SELECT 1 FROM dead_letters WHERE id = ?1)
            ON CONFLICT(id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(job.next_retry_at.as_ref().map(timestamp::format))
        .bind(timestamp::format(&job.created_at))
        .bind(timestamp::format(&job.updated_at))
        .bind(&job.last_error)
        .bind(&job.claimed_by)
        .bind(job.lease_expires_at.as_ref().map(timestamp::format))
        .fetch_optional(executor)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    /// Tell a guarded write that matched nothing apart from a missing job.
    async fn missing_or_conflict<'e, E>(executor: E, table: &str, id: &JobId) -> StorageError
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT 1 FROM {table} WHERE id = ?");
        match sqlx::query(&sql).bind(id.as_str()).fetch_optional(executor).await {
            Ok(Some(_)) => StorageError::Conflict(id.clone()),
            Ok(None) => StorageError::NotFound(id.clone()),
            Err(e) => StorageError::Database(e),
        }
    }
}

fn parse_ts(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    timestamp::parse(&raw)
        .map_err(|e| StorageError::Corrupt(format!("{column} '{raw}': {e}")))
}

fn parse_optional_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| {
        timestamp::parse(&raw).map_err(|e| StorageError::Corrupt(format!("{column} '{raw}': {e}")))
    })
    .transpose()
}

fn push_expectation(qb: &mut QueryBuilder<'_, Sqlite>, expect: Option<Expectation>) {
    let Some(expect) = expect else {
        return;
    };

    qb.push(" AND state = 'processing' AND claimed_by = ")
        .push_bind(expect.worker_id);
    if let Some(attempts) = expect.attempts {
        qb.push(" AND attempts = ").push_bind(i64::from(attempts));
    }
    if let Some(at) = expect.lease_expires_at {
        qb.push(" AND lease_expires_at = ").push_bind(timestamp::format(&at));
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create(&self, job: Job) -> Result<Job> {
        match Self::insert_job(&self.pool, &job).await? {
            Some(created) => {
                debug!(job_id = %created.id, "Job stored");
                Ok(created)
            }
            None => Err(StorageError::DuplicateId(job.id)),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_job(&row),
            None => Err(StorageError::NotFound(id.clone())),
        }
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE ?1 IS NULL OR state = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(state.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Job> {
        let now = timestamp::now();

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET updated_at = ");
        qb.push_bind(timestamp::format(&now));

        if let Some(state) = update.state {
            qb.push(", state = ").push_bind(state.as_str());
        }
        if let Some(attempts) = update.attempts {
            qb.push(", attempts = ").push_bind(i64::from(attempts));
        }
        if let Some(next_retry_at) = update.next_retry_at {
            qb.push(", next_retry_at = ")
                .push_bind(next_retry_at.as_ref().map(timestamp::format));
        }
        if let Some(last_error) = update.last_error {
            qb.push(", last_error = ").push_bind(last_error);
        }
        if update.release_lease {
            qb.push(", claimed_by = NULL, lease_expires_at = NULL");
        }

        qb.push(" WHERE id = ").push_bind(id.as_str());
        push_expectation(&mut qb, update.expect);
        qb.push(" RETURNING *");

        let row = qb.build().fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Self::row_to_job(&row),
            None => Err(Self::missing_or_conflict(&self.pool, "jobs", id).await),
        }
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<Job>> {
        // Selection and transition are one statement, so the row can only
        // leave 'pending' once.
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing', claimed_by = ?1, lease_expires_at = ?2, updated_at = ?3
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE state = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= ?3)
                ORDER BY seq ASC
                LIMIT 1
            )
              AND state = 'pending'
            RETURNING *
            "#,
        )
        .bind(&request.worker_id)
        .bind(timestamp::format(&request.lease_until))
        .bind(timestamp::format(&request.now))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE state = 'processing'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < ?
            ORDER BY seq ASC
            "#,
        )
        .bind(timestamp::format(&now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn move_to_dead_letter(&self, id: &JobId, update: JobUpdate) -> Result<DlqEntry> {
        let now = timestamp::now();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the lock from its first statement.
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM jobs WHERE id = ");
        qb.push_bind(id.as_str());
        push_expectation(&mut qb, update.expect.clone());
        qb.push(" RETURNING *");

        let Some(row) = qb.build().fetch_optional(&mut *tx).await? else {
            return Err(Self::missing_or_conflict(&mut *tx, "jobs", id).await);
        };

        let mut job = Self::row_to_job(&row)?;
        job.apply(&update, now);
        let entry = DlqEntry { job, dead_at: now };
        let job = &entry.job;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, command, state, attempts, max_retries, next_retry_at,
                                      created_at, updated_at, last_error, claimed_by,
                                      lease_expires_at, dead_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(job.next_retry_at.as_ref().map(timestamp::format))
        .bind(timestamp::format(&job.created_at))
        .bind(timestamp::format(&job.updated_at))
        .bind(&job.last_error)
        .bind(&job.claimed_by)
        .bind(job.lease_expires_at.as_ref().map(timestamp::format))
        .bind(timestamp::format(&entry.dead_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DlqEntry>> {
        let rows = sqlx::query("SELECT * FROM dead_letters ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn remove_from_dead_letter(&self, id: &JobId) -> Result<DlqEntry> {
        let row = sqlx::query("DELETE FROM dead_letters WHERE id = ? RETURNING *")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_entry(&row),
            None => Err(StorageError::NotFound(id.clone())),
        }
    }

    async fn restore_dead_letter(&self, id: &JobId, update: JobUpdate) -> Result<Job> {
        let now = timestamp::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("DELETE FROM dead_letters WHERE id = ? RETURNING *")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Err(StorageError::NotFound(id.clone()));
        };

        let mut job = Self::row_to_job(&row)?;
        job.apply(&update, now);

        let Some(restored) = Self::insert_job(&mut *tx, &job).await? else {
            return Err(StorageError::DuplicateId(id.clone()));
        };

        tx.commit().await?;
        Ok(restored)
    }

    async fn get_config(&self) -> Result<QueueConfig> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;

        let mut config = QueueConfig::default();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;

            let Ok(key) = key.parse::<ConfigKey>() else {
                warn!(key = %key, "Ignoring unknown configuration key");
                continue;
            };
            let patch = ConfigPatch::parse(key, &value)
                .map_err(|e| StorageError::Corrupt(format!("config {key} = '{value}': {e}")))?;
            config.apply(&patch);
        }

        Ok(config)
    }

    async fn merge_config(&self, patch: &ConfigPatch) -> Result<QueueConfig> {
        let entries = patch.entries();
        if entries.is_empty() {
            return self.get_config().await;
        }

        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO config (key, value) VALUES (?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(key.as_str())
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_config().await
    }

    async fn request_stop(&self) -> Result<u64> {
        let generation: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO control (key, value) VALUES (?, '1')
            ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1
            RETURNING CAST(value AS INTEGER)
            "#,
        )
        .bind(STOP_GENERATION)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(generation).unwrap_or_default())
    }

    async fn stop_generation(&self) -> Result<u64> {
        let generation: Option<i64> =
            sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM control WHERE key = ?")
                .bind(STOP_GENERATION)
                .fetch_optional(&self.pool)
                .await?;

        Ok(generation.and_then(|g| u64::try_from(g).ok()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, SqliteStorage) {
        let dir = TempDir::new().expect("temp dir");
        let storage = SqliteStorage::open(dir.path().join("queue.db"))
            .await
            .expect("open storage");
        (dir, storage)
    }

    fn claim_at(now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            now,
            worker_id: "worker-test".to_string(),
            lease_until: now + ChronoDuration::seconds(60),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let (_dir, storage) = open_temp().await;
        let job = Job::new("echo one").with_id("dup".into());

        storage.create(job.clone()).await.unwrap();
        let err = storage.create(Job::new("echo two").with_id("dup".into())).await.unwrap_err();

        assert!(matches!(err, StorageError::DuplicateId(id) if id.as_str() == "dup"));
        let jobs = storage.list(None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].command, "echo one");
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order_and_filters() {
        let (_dir, storage) = open_temp().await;
        for name in ["c", "a", "b"] {
            storage.create(Job::new("true").with_id(name.into())).await.unwrap();
        }
        storage
            .update(&"a".into(), JobUpdate::state(JobState::Completed))
            .await
            .unwrap();

        let all: Vec<String> = storage.list(None).await.unwrap().into_iter().map(|j| j.id.0).collect();
        assert_eq!(all, ["c", "a", "b"]);

        let pending: Vec<String> = storage
            .list(Some(JobState::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id.0)
            .collect();
        assert_eq!(pending, ["c", "b"]);
    }

    #[tokio::test]
    async fn test_update_missing_and_guarded() {
        let (_dir, storage) = open_temp().await;
        let err = storage
            .update(&"ghost".into(), JobUpdate::state(JobState::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        let job = storage.create(Job::new("true")).await.unwrap();
        let held = JobUpdate::state(JobState::Completed).expecting(Expectation::held_by("worker-test"));

        // Not claimed yet.
        let err = storage.update(&job.id, held.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let claimed = storage.claim(&claim_at(timestamp::now())).await.unwrap().unwrap();
        let other = JobUpdate::state(JobState::Completed).expecting(Expectation::held_by("worker-other"));
        let err = storage.update(&job.id, other).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let mut stale = Expectation::of(&claimed).unwrap();
        stale.lease_expires_at = Some(claimed.created_at);
        let err = storage
            .update(&job.id, JobUpdate::state(JobState::Pending).expecting(stale))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let updated = storage.update(&job.id, held.release_lease()).await.unwrap();
        assert_eq!(updated.state, JobState::Completed);
        assert!(updated.claimed_by.is_none());
        assert!(updated.updated_at >= job.updated_at);
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_eligible_job() {
        let (_dir, storage) = open_temp().await;
        let now = timestamp::now();

        let mut delayed = Job::new("true").with_id("delayed".into());
        delayed.next_retry_at = Some(now + ChronoDuration::seconds(30));
        storage.create(delayed).await.unwrap();
        storage.create(Job::new("true").with_id("ready".into())).await.unwrap();

        let first = storage.claim(&claim_at(now)).await.unwrap().unwrap();
        assert_eq!(first.id.as_str(), "ready");
        assert_eq!(first.state, JobState::Processing);
        assert_eq!(first.claimed_by.as_deref(), Some("worker-test"));
        assert!(first.lease_expires_at.is_some());

        assert!(storage.claim(&claim_at(now)).await.unwrap().is_none());

        let later = now + ChronoDuration::seconds(31);
        let second = storage.claim(&claim_at(later)).await.unwrap().unwrap();
        assert_eq!(second.id.as_str(), "delayed");
    }

    #[tokio::test]
    async fn test_dead_letter_round_trip() {
        let (_dir, storage) = open_temp().await;
        let job = storage.create(Job::new("false").with_id("doomed".into())).await.unwrap();

        let entry = storage
            .move_to_dead_letter(
                &job.id,
                JobUpdate::state(JobState::Dead)
                    .attempts(1)
                    .last_error(Some("Exit code 1".into())),
            )
            .await
            .unwrap();
        assert_eq!(entry.job.state, JobState::Dead);
        assert!(matches!(storage.get(&job.id).await, Err(StorageError::NotFound(_))));

        // Disjoint sets: the id cannot be reused while it is dead-lettered.
        let err = storage.create(Job::new("true").with_id("doomed".into())).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateId(_)));

        let letters = storage.list_dead_letters().await.unwrap();
        assert_eq!(letters, vec![entry.clone()]);

        let restored = storage
            .restore_dead_letter(&job.id, JobUpdate::state(JobState::Pending).attempts(0))
            .await
            .unwrap();
        assert_eq!(restored.state, JobState::Pending);
        assert_eq!(restored.last_error.as_deref(), Some("Exit code 1"));
        assert!(storage.list_dead_letters().await.unwrap().is_empty());

        assert!(matches!(
            storage.remove_from_dead_letter(&job.id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.move_to_dead_letter(&"ghost".into(), JobUpdate::default()).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_config_and_stop_generation_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");

        {
            let storage = SqliteStorage::open(&path).await.unwrap();
            assert_eq!(storage.get_config().await.unwrap(), QueueConfig::default());

            let patch = ConfigPatch::parse(ConfigKey::MaxRetries, "5").unwrap();
            let config = storage.merge_config(&patch).await.unwrap();
            assert_eq!(config.max_retries, 5);

            assert_eq!(storage.stop_generation().await.unwrap(), 0);
            assert_eq!(storage.request_stop().await.unwrap(), 1);
            assert_eq!(storage.request_stop().await.unwrap(), 2);
            storage.pool.close().await;
        }

        let reopened = SqliteStorage::open(&path).await.unwrap();
        assert_eq!(reopened.get_config().await.unwrap().max_retries, 5);
        assert_eq!(reopened.stop_generation().await.unwrap(), 2);
    }
}
