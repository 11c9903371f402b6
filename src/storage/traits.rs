use crate::aggregate::Aggregate;
use crate::bucket::Level;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A named measurement stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// One time-stamped value. `ts` is UTC epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub tag_id: i64,
    pub ts: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "done" => Some(JobStatus::Done),
            _ => None,
        }
    }
}

/// Durable aggregation task for one (tag, level, bucket).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub tag_id: i64,
    pub level: Level,
    pub bucket_start: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<i64>,
    /// Bumped each time the bucket's inputs change while the job is pending.
    pub revision: u64,
}

/// Committed aggregate for one (tag, level, bucket).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rollup {
    pub tag_id: i64,
    pub level: Level,
    pub bucket_start: i64,
    #[serde(flatten)]
    pub aggregate: Aggregate,
}

/// Number of pending jobs per level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub hour: u64,
    pub day: u64,
    pub month: u64,
    pub year: u64,
}

impl PendingCounts {
    pub fn get(&self, level: Level) -> u64 {
        match level {
            Level::Hour => self.hour,
            Level::Day => self.day,
            Level::Month => self.month,
            Level::Year => self.year,
        }
    }

    pub fn set(&mut self, level: Level, count: u64) {
        match level {
            Level::Hour => self.hour = count,
            Level::Day => self.day = count,
            Level::Month => self.month = count,
            Level::Year => self.year = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.hour + self.day + self.month + self.year
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub readings: usize,
    pub jobs_created: usize,
}

/// Durable queue of aggregation jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job for the bucket containing `bucket_start` at
    /// `level`. Returns `false` when an identical job is already pending; in
    /// that case the pending job's revision is bumped instead.
    async fn enqueue(&self, tag_id: i64, level: Level, bucket_start: i64) -> Result<bool, StorageError>;

    /// Up to `batch_size` pending jobs of `level` with `id > after_id`,
    /// ordered by (tag_id, id).
    async fn fetch_pending(
        &self,
        level: Level,
        batch_size: usize,
        after_id: i64,
    ) -> Result<Vec<Job>, StorageError>;

    /// Mark a pending job done if it is still at `revision`. Returns `false`
    /// (and changes nothing) when the job is unknown, already done, or was
    /// revised after its inputs were read.
    async fn mark_done(&self, job_id: i64, worker_id: i64, revision: u64) -> Result<bool, StorageError>;

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StorageError>;

    async fn pending_counts(&self) -> Result<PendingCounts, StorageError>;

    /// Pending jobs created before `older_than`, oldest first.
    async fn stuck_jobs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError>;
}

/// Durable table of committed aggregates.
#[async_trait]
pub trait RollupStore: Send + Sync {
    /// Insert, or fully replace the existing row with the same key.
    async fn upsert_rollup(&self, rollup: &Rollup) -> Result<(), StorageError>;

    async fn get_rollup(
        &self,
        tag_id: i64,
        level: Level,
        bucket_start: i64,
    ) -> Result<Option<Rollup>, StorageError>;

    /// Rollups of `level` whose bucket key lies in `[from, to)`, by key.
    async fn rollups_in_range(
        &self,
        tag_id: i64,
        level: Level,
        from: i64,
        to: i64,
    ) -> Result<Vec<Rollup>, StorageError>;
}

/// Tags and raw readings.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Create a tag, or return the existing one with the same name.
    async fn create_tag(&self, name: &str) -> Result<Tag, StorageError>;

    async fn get_tag_by_name(&self, name: &str) -> Result<Option<Tag>, StorageError>;

    async fn list_tags(&self) -> Result<Vec<Tag>, StorageError>;

    /// Append readings and enqueue their hour jobs in one transaction.
    async fn ingest(&self, readings: &[Reading]) -> Result<IngestSummary, StorageError>;

    /// Values of readings with `after < ts <= until`, by timestamp.
    async fn readings_in_window(
        &self,
        tag_id: i64,
        after: i64,
        until: i64,
    ) -> Result<Vec<f64>, StorageError>;
}

#[async_trait]
pub trait Storage: JobStore + RollupStore + ReadingStore {
    async fn init_schema(&self) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Lock contention or a write conflict; worth retrying.
    #[error("store busy: {0}")]
    Busy(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid stored data: {0}")]
    Decode(String),

    #[error("task join error: {0}")]
    Join(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        let message = e.to_string();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("conflict") || lowered.contains("could not set lock") || lowered.contains("busy") {
            StorageError::Busy(message)
        } else {
            StorageError::Database(message)
        }
    }
}
