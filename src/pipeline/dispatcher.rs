use super::backpressure::{PublishOutcome, Publisher};
use super::message::{WorkUnit, WorkValues};
use crate::bucket::{hour_window, AggregationSource, Level};
use crate::storage::traits::{Job, JobStore, ReadingStore, RollupStore, Storage, StorageError};
use crate::storage::{with_retry, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("work channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// How long a published job is considered in flight before it may be
    /// published again.
    pub redelivery_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval: Duration::from_millis(200),
            max_poll_interval: Duration::from_secs(5),
            redelivery_timeout: Duration::from_secs(60),
        }
    }
}

/// Counters for one or more polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub polls: u64,
    pub published: u64,
    pub dropped: u64,
    pub skipped_in_flight: u64,
    pub failed: u64,
}

impl SweepStats {
    pub fn merge(&mut self, other: SweepStats) {
        self.polls += other.polls;
        self.published += other.published;
        self.dropped += other.dropped;
        self.skipped_in_flight += other.skipped_in_flight;
        self.failed += other.failed;
    }
}

/// Turns pending jobs into work units.
///
/// Each poll reads one page of pending jobs per level, loads the inputs of
/// every job (raw readings for hours, committed child rollups above that)
/// and publishes a work unit. Publishing is fire-and-forget: jobs are only
/// marked done by the sink.
pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    publisher: Publisher,
    settings: DispatcherSettings,
    retry: RetryPolicy,
    cursors: HashMap<Level, i64>,
    /// Published jobs by id, with the revision they were published at.
    in_flight: HashMap<i64, (u64, Instant)>,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        publisher: Publisher,
        settings: DispatcherSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            publisher,
            settings,
            retry,
            cursors: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Number of jobs currently considered in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub async fn poll_once(&mut self) -> Result<SweepStats, DispatchError> {
        let mut stats = SweepStats {
            polls: 1,
            ..SweepStats::default()
        };

        let timeout = self.settings.redelivery_timeout;
        self.in_flight.retain(|_, (_, published_at)| published_at.elapsed() < timeout);

        for level in Level::ALL {
            let after_id = self.cursors.get(&level).copied().unwrap_or(0);
            let storage = self.storage.clone();
            let batch_size = self.settings.batch_size;
            let page = with_retry(&self.retry, "fetch_pending", || {
                storage.fetch_pending(level, batch_size, after_id)
            })
            .await;

            let jobs = match page {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(level = %level, error = %e, "Failed to fetch pending jobs");
                    stats.failed += 1;
                    continue;
                }
            };

            if jobs.is_empty() {
                self.cursors.insert(level, 0);
                continue;
            }

            let last_id = jobs.iter().map(|job| job.id).max().unwrap_or(after_id);
            self.cursors.insert(level, last_id);

            for job in jobs {
                // A revised job is republished right away with its new inputs.
                if self.in_flight.get(&job.id).is_some_and(|(revision, _)| *revision == job.revision) {
                    stats.skipped_in_flight += 1;
                    continue;
                }

                let values = match self.load_inputs(&job).await {
                    Ok(values) => values,
                    Err(e) => {
                        error!(job_id = job.id, level = %level, error = %e, "Failed to load job inputs");
                        stats.failed += 1;
                        continue;
                    }
                };

                let unit = WorkUnit {
                    job_id: job.id,
                    tag_id: job.tag_id,
                    level: job.level,
                    bucket_start: job.bucket_start,
                    revision: job.revision,
                    values,
                };
                let payload = match unit.encode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(job_id = job.id, error = %e, "Failed to encode work unit");
                        stats.failed += 1;
                        continue;
                    }
                };

                match self.publisher.publish(payload).await {
                    PublishOutcome::Sent => {
                        debug!(
                            job_id = job.id,
                            tag_id = job.tag_id,
                            level = %level,
                            bucket_start = job.bucket_start,
                            inputs = unit.values.len(),
                            "Published work unit"
                        );
                        self.in_flight.insert(job.id, (job.revision, Instant::now()));
                        stats.published += 1;
                    }
                    PublishOutcome::Dropped => {
                        debug!(job_id = job.id, "Work channel full, job left pending");
                        stats.dropped += 1;
                    }
                    PublishOutcome::Closed => return Err(DispatchError::ChannelClosed),
                }
            }
        }

        Ok(stats)
    }

    async fn load_inputs(&self, job: &Job) -> Result<WorkValues, StorageError> {
        let storage = self.storage.clone();
        let (tag_id, bucket) = (job.tag_id, job.bucket_start);

        match job.level.source() {
            AggregationSource::Readings => {
                let (after, until) = hour_window(bucket);
                let values = with_retry(&self.retry, "readings_in_window", || {
                    storage.readings_in_window(tag_id, after, until)
                })
                .await?;
                Ok(WorkValues::Readings(values))
            }
            AggregationSource::Rollups(_) => {
                let Some((child, from, to)) = job.level.child_range(bucket) else {
                    return Ok(WorkValues::Rollups(Vec::new()));
                };
                let children = with_retry(&self.retry, "rollups_in_range", || {
                    storage.rollups_in_range(tag_id, child, from, to)
                })
                .await?;
                Ok(WorkValues::Rollups(
                    children.into_iter().map(|rollup| rollup.aggregate).collect(),
                ))
            }
        }
    }

    /// Poll until shutdown, backing off while there is nothing to publish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<SweepStats, DispatchError> {
        info!(
            batch_size = self.settings.batch_size,
            strategy = ?self.publisher.strategy(),
            "Dispatcher started"
        );

        let mut totals = SweepStats::default();
        let mut idle_delay = self.settings.poll_interval;

        while !*shutdown.borrow() {
            let stats = self.poll_once().await?;
            totals.merge(stats);

            if stats.published > 0 {
                idle_delay = self.settings.poll_interval;
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(idle_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            idle_delay = (idle_delay * 2).min(self.settings.max_poll_interval);
        }

        info!(
            polls = totals.polls,
            published = totals.published,
            dropped = totals.dropped,
            "Dispatcher stopped"
        );
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;
    use crate::config::types::BackpressureStrategy;
    use crate::pipeline::channel::create_channel;
    use crate::storage::duckdb::DuckDbStorage;
    use crate::storage::traits::{Reading, Rollup};

    const T0: i64 = 1_388_534_400; // 2014-01-01T00:00:00Z

    async fn setup_storage() -> Arc<dyn Storage> {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        Arc::new(storage)
    }

    fn settings(redelivery_timeout: Duration) -> DispatcherSettings {
        DispatcherSettings {
            batch_size: 10,
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(20),
            redelivery_timeout,
        }
    }

    fn decode_all(rx: &mut crate::pipeline::channel::Receiver) -> Vec<WorkUnit> {
        let mut units = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            units.push(WorkUnit::decode(&payload).unwrap());
        }
        units
    }

    #[tokio::test]
    async fn test_hour_job_carries_window_readings() {
        let storage = setup_storage().await;
        let tag = storage.create_tag("t").await.unwrap();
        let readings: Vec<Reading> = [(T0 + 900, 1.0), (T0 + 3600, 2.0), (T0 + 3601, 9.0)]
            .iter()
            .map(|&(ts, value)| Reading { tag_id: tag.id, ts, value })
            .collect();
        storage.ingest(&readings).await.unwrap();

        let (tx, mut rx) = create_channel(16);
        let publisher = Publisher::new(tx, BackpressureStrategy::Block);
        let mut dispatcher = Dispatcher::new(
            storage.clone(),
            publisher,
            settings(Duration::from_secs(60)),
            RetryPolicy::default(),
        );

        let stats = dispatcher.poll_once().await.unwrap();
        assert_eq!(stats.published, 2);

        let units = decode_all(&mut rx);
        let first = units.iter().find(|u| u.bucket_start == T0 + 3600).unwrap();
        assert_eq!(first.level, Level::Hour);
        assert_eq!(first.values, WorkValues::Readings(vec![1.0, 2.0]));
        let second = units.iter().find(|u| u.bucket_start == T0 + 7200).unwrap();
        assert_eq!(second.values, WorkValues::Readings(vec![9.0]));
    }

    #[tokio::test]
    async fn test_day_job_carries_child_rollups() {
        let storage = setup_storage().await;
        // Hour keys 00:00 and 25:00 belong to the neighbouring days.
        for (bucket, value) in [(T0, 7.0), (T0 + 3600, 1.0), (T0 + 86_400, 2.0), (T0 + 90_000, 5.0)] {
            storage
                .upsert_rollup(&Rollup {
                    tag_id: 1,
                    level: Level::Hour,
                    bucket_start: bucket,
                    aggregate: Aggregate::from_values(&[value]),
                })
                .await
                .unwrap();
        }
        storage.enqueue(1, Level::Day, T0).await.unwrap();

        let (tx, mut rx) = create_channel(16);
        let mut dispatcher = Dispatcher::new(
            storage,
            Publisher::new(tx, BackpressureStrategy::Block),
            settings(Duration::from_secs(60)),
            RetryPolicy::default(),
        );
        dispatcher.poll_once().await.unwrap();

        let units = decode_all(&mut rx);
        assert_eq!(units.len(), 1);
        match &units[0].values {
            WorkValues::Rollups(children) => {
                assert_eq!(children.len(), 2);
                assert_eq!(Aggregate::combine(children).sum, 3.0);
            }
            other => panic!("expected child rollups, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_in_flight_jobs_are_not_republished() {
        let storage = setup_storage().await;
        storage.enqueue(1, Level::Hour, T0).await.unwrap();

        let (tx, mut rx) = create_channel(16);
        let mut dispatcher = Dispatcher::new(
            storage,
            Publisher::new(tx, BackpressureStrategy::Block),
            settings(Duration::from_secs(60)),
            RetryPolicy::default(),
        );

        assert_eq!(dispatcher.poll_once().await.unwrap().published, 1);
        // Empty page rewinds the cursor.
        dispatcher.poll_once().await.unwrap();
        let stats = dispatcher.poll_once().await.unwrap();
        assert_eq!(stats.published, 0);
        assert_eq!(stats.skipped_in_flight, 1);
        assert_eq!(decode_all(&mut rx).len(), 1);
        assert_eq!(dispatcher.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_revised_job_is_republished_while_in_flight() {
        let storage = setup_storage().await;
        let tag = storage.create_tag("t").await.unwrap();
        storage.ingest(&[Reading { tag_id: tag.id, ts: T0 + 900, value: 1.0 }]).await.unwrap();

        let (tx, mut rx) = create_channel(16);
        let mut dispatcher = Dispatcher::new(
            storage.clone(),
            Publisher::new(tx, BackpressureStrategy::Block),
            settings(Duration::from_secs(60)),
            RetryPolicy::default(),
        );
        assert_eq!(dispatcher.poll_once().await.unwrap().published, 1);

        storage.ingest(&[Reading { tag_id: tag.id, ts: T0 + 2700, value: 2.0 }]).await.unwrap();
        dispatcher.poll_once().await.unwrap(); // cursor rewind
        assert_eq!(dispatcher.poll_once().await.unwrap().published, 1);

        let units = decode_all(&mut rx);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].job_id, units[1].job_id);
        assert_eq!((units[0].revision, units[1].revision), (0, 1));
        assert_eq!(units[1].values, WorkValues::Readings(vec![1.0, 2.0]));
    }

    #[tokio::test]
    async fn test_pending_job_is_redelivered_after_timeout() {
        let storage = setup_storage().await;
        storage.enqueue(1, Level::Hour, T0).await.unwrap();

        let (tx, mut rx) = create_channel(16);
        let mut dispatcher = Dispatcher::new(
            storage,
            Publisher::new(tx, BackpressureStrategy::Block),
            settings(Duration::from_millis(10)),
            RetryPolicy::default(),
        );

        dispatcher.poll_once().await.unwrap();
        dispatcher.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = dispatcher.poll_once().await.unwrap();

        assert_eq!(stats.published, 1);
        let units = decode_all(&mut rx);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].job_id, units[1].job_id);
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_keeps_job_pending() {
        let storage = setup_storage().await;
        storage.enqueue(1, Level::Hour, T0).await.unwrap();
        storage.enqueue(1, Level::Hour, T0 + 3600).await.unwrap();

        let (tx, mut rx) = create_channel(1);
        let mut dispatcher = Dispatcher::new(
            storage.clone(),
            Publisher::new(tx, BackpressureStrategy::Drop),
            settings(Duration::from_secs(60)),
            RetryPolicy::default(),
        );

        let stats = dispatcher.poll_once().await.unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(storage.pending_counts().await.unwrap().hour, 2);

        decode_all(&mut rx);
        dispatcher.poll_once().await.unwrap(); // cursor rewind
        let stats = dispatcher.poll_once().await.unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.skipped_in_flight, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_stops_dispatch() {
        let storage = setup_storage().await;
        storage.enqueue(1, Level::Hour, T0).await.unwrap();

        let (tx, rx) = create_channel(4);
        drop(rx);
        let mut dispatcher = Dispatcher::new(
            storage,
            Publisher::new(tx, BackpressureStrategy::Block),
            settings(Duration::from_secs(60)),
            RetryPolicy::default(),
        );
        assert!(matches!(dispatcher.poll_once().await, Err(DispatchError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let storage = setup_storage().await;
        let (tx, _rx) = create_channel(4);
        let dispatcher = Dispatcher::new(
            storage,
            Publisher::new(tx, BackpressureStrategy::Block),
            settings(Duration::from_secs(60)),
            RetryPolicy::default(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        let totals = handle.await.unwrap().unwrap();
        assert!(totals.polls >= 1);
        assert_eq!(totals.published, 0);
    }
}
