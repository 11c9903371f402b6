use super::traits::{
    IngestSummary, Job, JobStatus, JobStore, PendingCounts, Reading, ReadingStore, Rollup,
    RollupStore, Storage, StorageError, Tag,
};
use crate::aggregate::Aggregate;
use crate::bucket::Level;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, Connection, Row};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract the holder PID from a DuckDB "Could not set lock" error.
fn lock_holder_pid(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + "(PID ".len();
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_stale_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), "Removed stale database file");
        }
    }
    Ok(())
}

const SCHEMA: &str = "
    CREATE SEQUENCE IF NOT EXISTS tag_id_seq START 1;
    CREATE TABLE IF NOT EXISTS tag (
        id BIGINT PRIMARY KEY DEFAULT nextval('tag_id_seq'),
        name VARCHAR NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS history (
        tag_id BIGINT NOT NULL,
        ts BIGINT NOT NULL,
        value DOUBLE NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_history_tag_ts ON history(tag_id, ts);

    CREATE SEQUENCE IF NOT EXISTS job_id_seq START 1;
    CREATE TABLE IF NOT EXISTS job (
        id BIGINT PRIMARY KEY,
        tag_id BIGINT NOT NULL,
        level INTEGER NOT NULL,
        bucket_start BIGINT NOT NULL,
        status VARCHAR NOT NULL,
        worker_id BIGINT,
        revision BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ
    );

    -- One row per pending job; the key is what makes enqueue idempotent.
    CREATE TABLE IF NOT EXISTS pending_job (
        tag_id BIGINT NOT NULL,
        level INTEGER NOT NULL,
        bucket_start BIGINT NOT NULL,
        job_id BIGINT NOT NULL,
        PRIMARY KEY (tag_id, level, bucket_start)
    );

    CREATE TABLE IF NOT EXISTS rollup (
        tag_id BIGINT NOT NULL,
        level INTEGER NOT NULL,
        bucket_start BIGINT NOT NULL,
        vsum DOUBLE NOT NULL,
        vavg DOUBLE NOT NULL,
        vmax DOUBLE,
        vmin DOUBLE,
        vcount BIGINT NOT NULL,
        PRIMARY KEY (tag_id, level, bucket_start)
    );
";

const JOB_COLUMNS: &str =
    "id, tag_id, level, bucket_start, status, epoch_us(created_at), epoch_us(completed_at), worker_id, revision";

const ROLLUP_COLUMNS: &str = "tag_id, level, bucket_start, vsum, vavg, vmax, vmin, vcount";

fn conversion_error(index: usize, message: String) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(
        index,
        duckdb::types::Type::BigInt,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn level_column(row: &Row<'_>, index: usize) -> Result<Level, duckdb::Error> {
    let raw: i64 = row.get(index)?;
    u8::try_from(raw)
        .ok()
        .and_then(|v| Level::try_from(v).ok())
        .ok_or_else(|| conversion_error(index, format!("invalid level {}", raw)))
}

fn timestamp_column(row: &Row<'_>, index: usize) -> Result<Option<DateTime<Utc>>, duckdb::Error> {
    match row.get::<_, Option<i64>>(index)? {
        Some(micros) => DateTime::from_timestamp_micros(micros)
            .map(Some)
            .ok_or_else(|| conversion_error(index, "invalid timestamp".to_string())),
        None => Ok(None),
    }
}

fn job_from_row(row: &Row<'_>) -> Result<Job, duckdb::Error> {
    let status: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        tag_id: row.get(1)?,
        level: level_column(row, 2)?,
        bucket_start: row.get(3)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| conversion_error(4, format!("invalid job status {}", status)))?,
        created_at: timestamp_column(row, 5)?
            .ok_or_else(|| conversion_error(5, "missing created_at".to_string()))?,
        completed_at: timestamp_column(row, 6)?,
        worker_id: row.get(7)?,
        revision: row.get::<_, i64>(8)?.max(0) as u64,
    })
}

fn rollup_from_row(row: &Row<'_>) -> Result<Rollup, duckdb::Error> {
    let count: i64 = row.get(7)?;
    Ok(Rollup {
        tag_id: row.get(0)?,
        level: level_column(row, 1)?,
        bucket_start: row.get(2)?,
        aggregate: Aggregate {
            sum: row.get(3)?,
            avg: row.get(4)?,
            max: row.get(5)?,
            min: row.get(6)?,
            count: u64::try_from(count)
                .map_err(|_| conversion_error(7, format!("negative count {}", count)))?,
        },
    })
}

fn level_param(level: Level) -> i64 {
    i64::from(level.as_u8())
}

/// Claim the pending slot for (tag, level, bucket) and create the job row.
/// When the slot is taken, the pending job's revision is bumped so a result
/// computed from older inputs cannot complete it.
/// Must run inside the caller's transaction.
fn enqueue_in(
    conn: &Connection,
    tag_id: i64,
    level: Level,
    bucket_start: i64,
    now: DateTime<Utc>,
) -> Result<bool, duckdb::Error> {
    let bucket_start = level.truncate(bucket_start);
    let job_id: i64 = conn.query_row("SELECT nextval('job_id_seq')", [], |row| row.get(0))?;

    let claimed = conn.execute(
        "INSERT INTO pending_job (tag_id, level, bucket_start, job_id)
         VALUES (?, ?, ?, ?)
         ON CONFLICT DO NOTHING",
        params![tag_id, level_param(level), bucket_start, job_id],
    )?;
    if claimed == 0 {
        conn.execute(
            "UPDATE job SET revision = revision + 1
             WHERE id = (SELECT job_id FROM pending_job
                         WHERE tag_id = ? AND level = ? AND bucket_start = ?)",
            params![tag_id, level_param(level), bucket_start],
        )?;
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO job (id, tag_id, level, bucket_start, status, created_at)
         VALUES (?, ?, ?, ?, 'pending', to_timestamp(? / 1000000.0))",
        params![job_id, tag_id, level_param(level), bucket_start, now.timestamp_micros()],
    )?;
    Ok(true)
}

/// DuckDB implementation of the job, rollup and reading stores
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    /// Open (or create) a database file, clearing a lock left behind by a
    /// process that is no longer running.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(e) => {
                let error_msg = e.to_string();
                let stale_pid = lock_holder_pid(&error_msg).filter(|pid| !is_process_running(*pid));
                match stale_pid {
                    Some(pid) => {
                        tracing::warn!(pid = pid, "Database lock held by a dead process, removing stale lock files");
                        remove_stale_lock_files(path)
                            .map_err(|io_err| StorageError::Database(io_err.to_string()))?;
                        Connection::open(path)?
                    }
                    None => return Err(e.into()),
                }
            }
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))?
    }
}

#[async_trait]
impl Storage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl JobStore for DuckDbStorage {
    async fn enqueue(&self, tag_id: i64, level: Level, bucket_start: i64) -> Result<bool, StorageError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let created = enqueue_in(&tx, tag_id, level, bucket_start, Utc::now())?;
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn fetch_pending(
        &self,
        level: Level,
        batch_size: usize,
        after_id: i64,
    ) -> Result<Vec<Job>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM job
                 WHERE level = ? AND status = 'pending' AND id > ?
                 ORDER BY tag_id, id
                 LIMIT ?"
            ))?;
            let rows = stmt.query_map(
                params![level_param(level), after_id, batch_size as i64],
                job_from_row,
            )?;

            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row?);
            }
            Ok(jobs)
        })
        .await
    }

    async fn mark_done(&self, job_id: i64, worker_id: i64, revision: u64) -> Result<bool, StorageError> {
        let revision = i64::try_from(revision).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE job
                 SET status = 'done', completed_at = to_timestamp(? / 1000000.0), worker_id = ?
                 WHERE id = ? AND status = 'pending' AND revision = ?",
                params![Utc::now().timestamp_micros(), worker_id, job_id, revision],
            )?;
            if updated > 0 {
                tx.execute("DELETE FROM pending_job WHERE job_id = ?", params![job_id])?;
            }
            tx.commit()?;
            Ok(updated > 0)
        })
        .await
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM job WHERE id = ?"))?;
            let mut rows = stmt.query(params![job_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(job_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn pending_counts(&self) -> Result<PendingCounts, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT level, count(*) FROM job WHERE status = 'pending' GROUP BY level",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((level_column(row, 0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = PendingCounts::default();
            for row in rows {
                let (level, count) = row?;
                counts.set(level, count.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }

    async fn stuck_jobs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM job
                 WHERE status = 'pending' AND created_at < to_timestamp(? / 1000000.0)
                 ORDER BY created_at, id
                 LIMIT ?"
            ))?;
            let rows = stmt.query_map(
                params![older_than.timestamp_micros(), limit as i64],
                job_from_row,
            )?;

            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row?);
            }
            Ok(jobs)
        })
        .await
    }
}

#[async_trait]
impl RollupStore for DuckDbStorage {
    async fn upsert_rollup(&self, rollup: &Rollup) -> Result<(), StorageError> {
        let rollup = rollup.clone();
        self.with_conn(move |conn| {
            let aggregate = rollup.aggregate;
            conn.execute(
                "INSERT INTO rollup (tag_id, level, bucket_start, vsum, vavg, vmax, vmin, vcount)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (tag_id, level, bucket_start) DO UPDATE SET
                    vsum = excluded.vsum,
                    vavg = excluded.vavg,
                    vmax = excluded.vmax,
                    vmin = excluded.vmin,
                    vcount = excluded.vcount",
                params![
                    rollup.tag_id,
                    level_param(rollup.level),
                    rollup.bucket_start,
                    aggregate.sum,
                    aggregate.avg,
                    aggregate.max,
                    aggregate.min,
                    i64::try_from(aggregate.count).unwrap_or(i64::MAX),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_rollup(
        &self,
        tag_id: i64,
        level: Level,
        bucket_start: i64,
    ) -> Result<Option<Rollup>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROLLUP_COLUMNS} FROM rollup
                 WHERE tag_id = ? AND level = ? AND bucket_start = ?"
            ))?;
            let mut rows = stmt.query(params![tag_id, level_param(level), bucket_start])?;
            match rows.next()? {
                Some(row) => Ok(Some(rollup_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn rollups_in_range(
        &self,
        tag_id: i64,
        level: Level,
        from: i64,
        to: i64,
    ) -> Result<Vec<Rollup>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROLLUP_COLUMNS} FROM rollup
                 WHERE tag_id = ? AND level = ? AND bucket_start >= ? AND bucket_start < ?
                 ORDER BY bucket_start"
            ))?;
            let rows = stmt.query_map(
                params![tag_id, level_param(level), from, to],
                rollup_from_row,
            )?;

            let mut rollups = Vec::new();
            for row in rows {
                rollups.push(row?);
            }
            Ok(rollups)
        })
        .await
    }
}

#[async_trait]
impl ReadingStore for DuckDbStorage {
    async fn create_tag(&self, name: &str) -> Result<Tag, StorageError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tag (name) VALUES (?) ON CONFLICT DO NOTHING",
                params![name],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM tag WHERE name = ?",
                params![name],
                |row| row.get(0),
            )?;
            Ok(Tag { id, name })
        })
        .await
    }

    async fn get_tag_by_name(&self, name: &str) -> Result<Option<Tag>, StorageError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM tag WHERE name = ?")?;
            let mut rows = stmt.query(params![name])?;
            match rows.next()? {
                Some(row) => Ok(Some(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_tags(&self) -> Result<Vec<Tag>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM tag ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?;

            let mut tags = Vec::new();
            for row in rows {
                tags.push(row?);
            }
            Ok(tags)
        })
        .await
    }

    async fn ingest(&self, readings: &[Reading]) -> Result<IngestSummary, StorageError> {
        if readings.is_empty() {
            return Ok(IngestSummary::default());
        }

        let readings = readings.to_vec();
        self.with_conn(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;

            let mut buckets = BTreeSet::new();
            {
                let mut stmt = tx.prepare("INSERT INTO history (tag_id, ts, value) VALUES (?, ?, ?)")?;
                for reading in &readings {
                    stmt.execute(params![reading.tag_id, reading.ts, reading.value])?;
                    buckets.insert((reading.tag_id, Level::Hour.bucket_for(reading.ts)));
                }
            }

            let mut jobs_created = 0;
            for (tag_id, bucket) in buckets {
                if enqueue_in(&tx, tag_id, Level::Hour, bucket, now)? {
                    jobs_created += 1;
                }
            }

            tx.commit()?;
            Ok(IngestSummary {
                readings: readings.len(),
                jobs_created,
            })
        })
        .await
    }

    async fn readings_in_window(
        &self,
        tag_id: i64,
        after: i64,
        until: i64,
    ) -> Result<Vec<f64>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT value FROM history
                 WHERE tag_id = ? AND ts > ? AND ts <= ?
                 ORDER BY ts",
            )?;
            let rows = stmt.query_map(params![tag_id, after, until], |row| row.get::<_, f64>(0))?;

            let mut values = Vec::new();
            for row in rows {
                values.push(row?);
            }
            Ok(values)
        })
        .await
    }
}
