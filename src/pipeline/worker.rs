use super::channel::{Sender, WorkReceiver};
use super::message::{ResultMessage, WorkUnit};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: i64,
    pub processed: u64,
    pub rejected: u64,
}

/// Aggregate one unit. Hour units reduce raw readings, higher levels combine
/// child aggregates. The revision is passed through so the sink can tell
/// whether the inputs are still current.
pub fn process_unit(worker_id: i64, unit: &WorkUnit) -> ResultMessage {
    ResultMessage {
        worker_id,
        job_id: unit.job_id,
        tag_id: unit.tag_id,
        level: unit.level,
        bucket_start: unit.bucket_start,
        revision: unit.revision,
        aggregate: unit.values.aggregate(),
    }
}

/// Consume work units until the work channel closes or shutdown is signalled.
///
/// After shutdown the worker keeps draining whatever is already buffered
/// and exits once the channel is closed and empty.
pub async fn run_worker(
    worker_id: i64,
    input: WorkReceiver,
    output: Sender,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerStats {
    let mut stats = WorkerStats {
        worker_id,
        ..WorkerStats::default()
    };
    let mut draining = *shutdown.borrow();

    info!(worker_id = worker_id, "Worker started");

    loop {
        let payload = if draining {
            input.recv().await
        } else {
            tokio::select! {
                payload = input.recv() => payload,
                _ = shutdown.changed() => {
                    draining = true;
                    continue;
                }
            }
        };

        let Some(payload) = payload else {
            break;
        };

        let unit = match WorkUnit::decode(&payload) {
            Ok(unit) => unit,
            Err(e) => {
                warn!(worker_id = worker_id, error = %e, "Rejected work unit");
                stats.rejected += 1;
                continue;
            }
        };

        let result = process_unit(worker_id, &unit);
        let encoded = match result.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(worker_id = worker_id, job_id = unit.job_id, error = %e, "Failed to encode result");
                stats.rejected += 1;
                continue;
            }
        };

        if output.send(encoded).await.is_err() {
            warn!(worker_id = worker_id, "Result channel closed");
            break;
        }

        debug!(
            worker_id = worker_id,
            job_id = unit.job_id,
            count = result.aggregate.count,
            "Processed work unit"
        );
        stats.processed += 1;
    }

    info!(
        worker_id = worker_id,
        processed = stats.processed,
        rejected = stats.rejected,
        "Worker stopped"
    );
    stats
}
