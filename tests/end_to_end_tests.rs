//! Cascade scenarios run through the public pipeline API against an
//! in-memory store.

use chrono::DateTime;
use domino::aggregate::Aggregate;
use domino::bucket::Level;
use domino::config::types::BackpressureStrategy;
use domino::pipeline::{
    self, create_channel, process_unit, CommitOutcome, Dispatcher, DispatcherSettings,
    PipelineSettings, Publisher, Sink, WorkUnit,
};
use domino::storage::duckdb::DuckDbStorage;
use domino::storage::{JobStore, Reading, ReadingStore, RetryPolicy, RollupStore, Storage};
use std::sync::Arc;
use std::time::Duration;

fn ts(s: &str) -> i64 {
    DateTime::parse_from_rfc3339(s).unwrap().timestamp()
}

async fn setup_storage() -> Arc<DuckDbStorage> {
    let storage = Arc::new(DuckDbStorage::in_memory().unwrap());
    storage.init_schema().await.unwrap();
    storage
}

fn settings(workers: usize, backpressure: BackpressureStrategy, capacity: usize) -> PipelineSettings {
    PipelineSettings {
        workers,
        channel_capacity: capacity,
        backpressure,
        dispatcher: DispatcherSettings {
            batch_size: 100,
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(25),
            redelivery_timeout: Duration::from_secs(30),
        },
        retry: RetryPolicy::default(),
    }
}

async fn run_until_idle(storage: Arc<DuckDbStorage>, settings: PipelineSettings) -> pipeline::PipelineReport {
    let handle = pipeline::start(storage, settings);
    assert!(
        handle.wait_idle(Duration::from_secs(30)).await.unwrap(),
        "pipeline did not go idle"
    );
    handle.shutdown().await.unwrap()
}

fn readings(tag_id: i64, points: &[(&str, f64)]) -> Vec<Reading> {
    points
        .iter()
        .map(|&(at, value)| Reading {
            tag_id,
            ts: ts(at),
            value,
        })
        .collect()
}

fn ones() -> Aggregate {
    Aggregate {
        sum: 4.0,
        avg: 1.0,
        max: Some(1.0),
        min: Some(1.0),
        count: 4,
    }
}

#[tokio::test]
async fn test_four_readings_cascade_step_by_step() {
    let storage = setup_storage().await;
    let tag = storage.create_tag("T").await.unwrap();
    storage
        .ingest(&readings(
            tag.id,
            &[
                ("2014-01-01T00:15:00Z", 1.0),
                ("2014-01-01T00:30:00Z", 1.0),
                ("2014-01-01T00:45:00Z", 1.0),
                ("2014-01-01T01:00:00Z", 1.0),
            ],
        ))
        .await
        .unwrap();

    let (tx, mut rx) = create_channel(16);
    let mut dispatcher = Dispatcher::new(
        storage.clone(),
        Publisher::new(tx, BackpressureStrategy::Block),
        DispatcherSettings::default(),
        RetryPolicy::default(),
    );
    let sink = Sink::new(storage.clone(), storage.clone(), RetryPolicy::default());

    // Hour
    assert_eq!(dispatcher.poll_once().await.unwrap().published, 1);
    let unit = WorkUnit::decode(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(unit.bucket_start, ts("2014-01-01T01:00:00Z"));
    let outcome = sink.commit(&process_unit(1, &unit)).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Committed { cascaded: true });

    let hour = storage
        .get_rollup(tag.id, Level::Hour, ts("2014-01-01T01:00:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hour.aggregate, ones());

    let day_jobs = storage.fetch_pending(Level::Day, 10, 0).await.unwrap();
    assert_eq!(day_jobs.len(), 1);
    assert_eq!(day_jobs[0].bucket_start, ts("2014-01-01T00:00:00Z"));

    // Day, month and year follow one level per poll.
    for level in [Level::Day, Level::Month, Level::Year] {
        let mut unit = None;
        for _ in 0..3 {
            dispatcher.poll_once().await.unwrap();
            if let Ok(payload) = rx.try_recv() {
                unit = Some(WorkUnit::decode(&payload).unwrap());
                break;
            }
        }
        let unit = unit.expect("no unit published");
        assert_eq!(unit.level, level);
        sink.commit(&process_unit(1, &unit)).await.unwrap();
    }

    for (level, bucket) in [
        (Level::Day, "2014-01-01T00:00:00Z"),
        (Level::Month, "2014-01-01T00:00:00Z"),
        (Level::Year, "2014-01-01T00:00:00Z"),
    ] {
        let rollup = storage.get_rollup(tag.id, level, ts(bucket)).await.unwrap().unwrap();
        assert_eq!(rollup.aggregate, ones(), "{level}");
    }
    assert_eq!(storage.pending_counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_four_readings_through_running_pipeline() {
    let storage = setup_storage().await;
    let tag = storage.create_tag("T").await.unwrap();
    storage
        .ingest(&readings(
            tag.id,
            &[
                ("2014-01-01T00:15:00Z", 1.0),
                ("2014-01-01T00:30:00Z", 1.0),
                ("2014-01-01T00:45:00Z", 1.0),
                ("2014-01-01T01:00:00Z", 1.0),
            ],
        ))
        .await
        .unwrap();

    let report = run_until_idle(storage.clone(), settings(4, BackpressureStrategy::Block, 16)).await;
    assert!(report.sink.committed >= 4);
    assert_eq!(report.sink.failed, 0);

    let year = storage
        .get_rollup(tag.id, Level::Year, ts("2014-01-01T00:00:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(year.aggregate, ones());
}

#[tokio::test]
async fn test_hour_boundary_readings() {
    let storage = setup_storage().await;
    let tag = storage.create_tag("boundary").await.unwrap();
    storage
        .ingest(&readings(
            tag.id,
            &[("2014-03-10T12:00:00Z", 12.0), ("2014-03-10T13:00:00Z", 13.0)],
        ))
        .await
        .unwrap();

    run_until_idle(storage.clone(), settings(2, BackpressureStrategy::Block, 16)).await;

    let thirteen = storage
        .get_rollup(tag.id, Level::Hour, ts("2014-03-10T13:00:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(thirteen.aggregate, Aggregate::from_values(&[13.0]));

    let twelve = storage
        .get_rollup(tag.id, Level::Hour, ts("2014-03-10T12:00:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(twelve.aggregate, Aggregate::from_values(&[12.0]));

    let day = storage
        .get_rollup(tag.id, Level::Day, ts("2014-03-10T00:00:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(day.aggregate.count, 2);
}

#[tokio::test]
async fn test_concurrent_children_enqueue_one_parent() {
    let storage = setup_storage().await;
    let sink = Arc::new(Sink::new(storage.clone(), storage.clone(), RetryPolicy::default()));
    let day = ts("2014-05-05T00:00:00Z");

    let mut job_ids = Vec::new();
    for hour in 1..=24 {
        storage.enqueue(1, Level::Hour, day + hour * 3600).await.unwrap();
    }
    for job in storage.fetch_pending(Level::Hour, 100, 0).await.unwrap() {
        job_ids.push((job.id, job.bucket_start));
    }
    assert_eq!(job_ids.len(), 24);

    let mut commits = Vec::new();
    for (job_id, bucket) in job_ids {
        let sink = sink.clone();
        commits.push(tokio::spawn(async move {
            let unit = WorkUnit {
                job_id,
                tag_id: 1,
                level: Level::Hour,
                bucket_start: bucket,
                revision: 0,
                values: domino::pipeline::WorkValues::Readings(vec![1.0]),
            };
            sink.commit(&process_unit(1, &unit)).await.unwrap()
        }));
    }

    let mut cascaded = 0;
    for commit in commits {
        if commit.await.unwrap() == (CommitOutcome::Committed { cascaded: true }) {
            cascaded += 1;
        }
    }

    // Hour keys 01:00 ..= 24:00 all close windows of this day.
    assert_eq!(cascaded, 1);
    let day_jobs = storage.fetch_pending(Level::Day, 10, 0).await.unwrap();
    let buckets: Vec<i64> = day_jobs.iter().map(|job| job.bucket_start).collect();
    assert_eq!(buckets, vec![day]);
}

#[tokio::test]
async fn test_day_is_aggregate_of_its_hours() {
    let storage = setup_storage().await;
    let tag = storage.create_tag("law").await.unwrap();
    let day = ts("2015-06-01T00:00:00Z");

    let mut points = Vec::new();
    for i in 0..90 {
        let value = ((i * 37) % 11) as f64 - 4.5;
        points.push(Reading {
            tag_id: tag.id,
            ts: day + 1 + i * 877,
            value,
        });
    }
    storage.ingest(&points).await.unwrap();

    run_until_idle(storage.clone(), settings(3, BackpressureStrategy::Block, 8)).await;

    let (child, from, to) = Level::Day.child_range(day).unwrap();
    let hours = storage.rollups_in_range(tag.id, child, from, to).await.unwrap();
    let day_rollup = storage.get_rollup(tag.id, Level::Day, day).await.unwrap().unwrap();

    let expected = Aggregate::combine(hours.iter().map(|h| &h.aggregate));
    assert_eq!(day_rollup.aggregate.count, expected.count);
    assert_eq!(day_rollup.aggregate.max, expected.max);
    assert_eq!(day_rollup.aggregate.min, expected.min);
    assert!((day_rollup.aggregate.sum - expected.sum).abs() < 1e-9);
    assert_eq!(day_rollup.aggregate.count, 90);
}

#[tokio::test]
async fn test_empty_bucket_writes_nothing_and_cascades_nothing() {
    let storage = setup_storage().await;
    let bucket = ts("2014-01-01T05:00:00Z");
    storage.enqueue(9, Level::Hour, bucket).await.unwrap();

    let report = run_until_idle(storage.clone(), settings(1, BackpressureStrategy::Block, 4)).await;

    assert_eq!(report.sink.empty, 1);
    assert_eq!(report.sink.committed, 0);
    assert!(storage.get_rollup(9, Level::Hour, bucket).await.unwrap().is_none());
    assert!(storage.fetch_pending(Level::Day, 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_drop_backpressure_still_completes_every_job() {
    let storage = setup_storage().await;
    let tag = storage.create_tag("bursty").await.unwrap();
    let start = ts("2016-02-01T00:00:00Z");
    let points: Vec<Reading> = (0..(24 * 10))
        .map(|i| Reading {
            tag_id: tag.id,
            ts: start + 1800 + i * 3600,
            value: 2.0,
        })
        .collect();
    storage.ingest(&points).await.unwrap();

    let report = run_until_idle(storage.clone(), settings(2, BackpressureStrategy::Drop, 1)).await;
    assert!(report.dispatch.dropped > 0);

    let month = storage.get_rollup(tag.id, Level::Month, start).await.unwrap().unwrap();
    assert_eq!(month.aggregate.count, 240);
    assert_eq!(month.aggregate.sum, 480.0);
}

#[tokio::test]
async fn test_last_hour_of_year_rolls_into_that_year() {
    let storage = setup_storage().await;
    let tag = storage.create_tag("new-year").await.unwrap();
    storage
        .ingest(&readings(tag.id, &[("2013-12-31T23:30:00Z", 5.0)]))
        .await
        .unwrap();

    run_until_idle(storage.clone(), settings(2, BackpressureStrategy::Block, 8)).await;

    let hour = storage
        .get_rollup(tag.id, Level::Hour, ts("2014-01-01T00:00:00Z"))
        .await
        .unwrap();
    assert!(hour.is_some());

    for (level, bucket) in [
        (Level::Day, "2013-12-31T00:00:00Z"),
        (Level::Month, "2013-12-01T00:00:00Z"),
        (Level::Year, "2013-01-01T00:00:00Z"),
    ] {
        let rollup = storage.get_rollup(tag.id, level, ts(bucket)).await.unwrap();
        assert_eq!(rollup.map(|r| r.aggregate.sum), Some(5.0), "{level}");
    }
    for level in [Level::Day, Level::Month, Level::Year] {
        let next = storage
            .get_rollup(tag.id, level, ts("2014-01-01T00:00:00Z"))
            .await
            .unwrap();
        assert!(next.is_none(), "{level}");
    }
}

#[tokio::test]
async fn test_reading_arriving_after_dispatch_is_not_lost() {
    let storage = setup_storage().await;
    let tag = storage.create_tag("late").await.unwrap();
    storage
        .ingest(&readings(tag.id, &[("2014-01-01T00:15:00Z", 1.0)]))
        .await
        .unwrap();

    let (tx, mut rx) = create_channel(16);
    let mut dispatcher = Dispatcher::new(
        storage.clone(),
        Publisher::new(tx, BackpressureStrategy::Block),
        DispatcherSettings::default(),
        RetryPolicy::default(),
    );
    let sink = Sink::new(storage.clone(), storage.clone(), RetryPolicy::default());

    assert_eq!(dispatcher.poll_once().await.unwrap().published, 1);
    let stale = WorkUnit::decode(&rx.recv().await.unwrap()).unwrap();

    let late = storage
        .ingest(&readings(tag.id, &[("2014-01-01T00:45:00Z", 3.0)]))
        .await
        .unwrap();
    assert_eq!(late.jobs_created, 0);

    let outcome = sink.commit(&process_unit(1, &stale)).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Superseded);
    assert_eq!(storage.pending_counts().await.unwrap().hour, 1);

    dispatcher.poll_once().await.unwrap(); // cursor rewind
    assert_eq!(dispatcher.poll_once().await.unwrap().published, 1);
    let fresh = WorkUnit::decode(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(fresh.job_id, stale.job_id);

    let outcome = sink.commit(&process_unit(1, &fresh)).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Committed { cascaded: true });

    let hour = storage
        .get_rollup(tag.id, Level::Hour, ts("2014-01-01T01:00:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hour.aggregate, Aggregate::from_values(&[1.0, 3.0]));
    assert_eq!(storage.pending_counts().await.unwrap().hour, 0);
}
