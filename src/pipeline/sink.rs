use super::channel::Receiver;
use super::message::ResultMessage;
use crate::storage::traits::{JobStatus, JobStore, Rollup, RollupStore, StorageError};
use crate::storage::{with_retry, RetryPolicy};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{stage} failed for job {job_id}: {source}")]
    Store {
        stage: &'static str,
        job_id: i64,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Empty bucket: job marked done, no rollup written, nothing cascaded.
    Empty,
    Committed {
        /// Whether a new parent job was enqueued.
        cascaded: bool,
    },
    /// The job is unknown or already done; nothing was written.
    Discarded,
    /// The bucket's inputs changed after this result was computed. The job
    /// stays pending and is dispatched again with the new inputs.
    Superseded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub committed: u64,
    pub empty: u64,
    pub cascaded: u64,
    pub discarded: u64,
    pub superseded: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Commit point of the cascade.
///
/// A result only counts if its job is still pending at the revision the
/// inputs were read at. For such a result the sink writes the rollup,
/// schedules the parent bucket and finally marks the job done, guarded by
/// that revision. Marking done last means a crash at any step leaves the
/// job pending, and replaying it is harmless because every step is
/// idempotent.
///
/// Results for done jobs are discarded before anything is written, so a
/// late duplicate never overwrites a newer rollup.
pub struct Sink {
    jobs: Arc<dyn JobStore>,
    rollups: Arc<dyn RollupStore>,
    retry: RetryPolicy,
}

impl Sink {
    pub fn new(jobs: Arc<dyn JobStore>, rollups: Arc<dyn RollupStore>, retry: RetryPolicy) -> Self {
        Self { jobs, rollups, retry }
    }

    pub async fn commit(&self, result: &ResultMessage) -> Result<CommitOutcome, SinkError> {
        let job_id = result.job_id;
        let level = result.level;
        let tag_id = result.tag_id;
        let bucket_start = result.bucket_start;

        let jobs = self.jobs.clone();
        let job = with_retry(&self.retry, "get_job", || jobs.get_job(job_id))
            .await
            .map_err(|source| SinkError::Store {
                stage: "load job",
                job_id,
                source,
            })?;

        match job {
            Some(job) if job.status == JobStatus::Pending => {
                if job.revision != result.revision {
                    debug!(
                        job_id = job_id,
                        revision = result.revision,
                        current = job.revision,
                        "Result computed from outdated inputs"
                    );
                    return Ok(CommitOutcome::Superseded);
                }
            }
            _ => {
                debug!(job_id = job_id, "Job already done or unknown, result discarded");
                return Ok(CommitOutcome::Discarded);
            }
        }

        let aggregate = result.aggregate;
        if aggregate.is_empty() {
            if !self.mark_done(result).await? {
                return Ok(CommitOutcome::Superseded);
            }
            debug!(job_id = job_id, level = %level, "Empty bucket, nothing to commit");
            return Ok(CommitOutcome::Empty);
        }

        let rollup = Rollup {
            tag_id,
            level,
            bucket_start,
            aggregate,
        };
        let rollups = self.rollups.clone();
        with_retry(&self.retry, "upsert_rollup", || rollups.upsert_rollup(&rollup))
            .await
            .map_err(|source| SinkError::Store {
                stage: "upsert rollup",
                job_id,
                source,
            })?;

        let mut cascaded = false;
        if let Some((parent, parent_bucket)) = level.parent_bucket(bucket_start) {
            let jobs = self.jobs.clone();
            cascaded = with_retry(&self.retry, "enqueue", || {
                jobs.enqueue(tag_id, parent, parent_bucket)
            })
            .await
            .map_err(|source| SinkError::Store {
                stage: "enqueue parent",
                job_id,
                source,
            })?;
        }

        if !self.mark_done(result).await? {
            // Inputs arrived while committing; the rerun overwrites this row.
            return Ok(CommitOutcome::Superseded);
        }

        debug!(
            job_id = job_id,
            tag_id = tag_id,
            level = %level,
            bucket_start = bucket_start,
            count = aggregate.count,
            cascaded = cascaded,
            "Committed rollup"
        );
        Ok(CommitOutcome::Committed { cascaded })
    }

    /// Returns `false` when the job was revised since the result's inputs
    /// were read.
    async fn mark_done(&self, result: &ResultMessage) -> Result<bool, SinkError> {
        let jobs = self.jobs.clone();
        with_retry(&self.retry, "mark_done", || {
            jobs.mark_done(result.job_id, result.worker_id, result.revision)
        })
        .await
        .map_err(|source| SinkError::Store {
            stage: "mark done",
            job_id: result.job_id,
            source,
        })
    }
}

/// Commit results until the channel closes.
///
/// Shutdown does not interrupt the sink: it keeps committing until every
/// worker has dropped its sender, so nothing already aggregated is lost.
pub async fn run_sink(mut input: Receiver, sink: Sink, mut shutdown: watch::Receiver<bool>) -> SinkStats {
    let mut stats = SinkStats::default();
    let mut shutdown_seen = false;

    info!("Sink started");

    loop {
        let payload = if shutdown_seen {
            input.recv().await
        } else {
            tokio::select! {
                payload = input.recv() => payload,
                _ = shutdown.changed() => {
                    shutdown_seen = true;
                    info!("Sink draining remaining results");
                    continue;
                }
            }
        };

        let Some(payload) = payload else {
            break;
        };

        let result = match ResultMessage::decode(&payload) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Rejected result message");
                stats.rejected += 1;
                continue;
            }
        };

        match sink.commit(&result).await {
            Ok(CommitOutcome::Empty) => stats.empty += 1,
            Ok(CommitOutcome::Committed { cascaded }) => {
                stats.committed += 1;
                if cascaded {
                    stats.cascaded += 1;
                }
            }
            Ok(CommitOutcome::Discarded) => stats.discarded += 1,
            Ok(CommitOutcome::Superseded) => stats.superseded += 1,
            Err(e) => {
                error!(job_id = result.job_id, error = %e, "Commit failed, job left pending");
                stats.failed += 1;
            }
        }
    }

    info!(
        committed = stats.committed,
        empty = stats.empty,
        cascaded = stats.cascaded,
        superseded = stats.superseded,
        failed = stats.failed,
        "Sink stopped"
    );
    stats
}
