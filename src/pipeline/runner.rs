use super::backpressure::Publisher;
use super::channel::{create_channel, create_work_channel};
use super::dispatcher::{DispatchError, Dispatcher, DispatcherSettings, SweepStats};
use super::sink::{run_sink, Sink, SinkStats};
use super::worker::{run_worker, WorkerStats};
use crate::config::types::{BackpressureStrategy, Config};
use crate::storage::traits::{JobStore, Storage, StorageError};
use crate::storage::RetryPolicy;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Errors that can occur during pipeline operation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub workers: usize,
    pub channel_capacity: usize,
    pub backpressure: BackpressureStrategy,
    pub dispatcher: DispatcherSettings,
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 1000,
            backpressure: BackpressureStrategy::Block,
            dispatcher: DispatcherSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.pipeline.workers,
            channel_capacity: config.pipeline.channel_capacity,
            backpressure: config.pipeline.backpressure,
            dispatcher: DispatcherSettings {
                batch_size: config.dispatcher.batch_size,
                poll_interval: config.dispatcher.poll_interval,
                max_poll_interval: config.dispatcher.max_poll_interval,
                redelivery_timeout: config.dispatcher.redelivery_timeout,
            },
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                base_delay: config.retry.base_delay,
                max_delay: config.retry.max_delay,
            },
        }
    }
}

/// What the pipeline did between start and shutdown.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub dispatch: SweepStats,
    pub workers: Vec<WorkerStats>,
    pub sink: SinkStats,
}

impl PipelineReport {
    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }
}

/// Running dispatcher, worker pool and sink sharing one shutdown signal.
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    jobs: Arc<dyn JobStore>,
    dispatcher: JoinHandle<Result<SweepStats, DispatchError>>,
    workers: Vec<JoinHandle<WorkerStats>>,
    sink: JoinHandle<SinkStats>,
}

/// Spawn the pipeline tasks against `storage`.
pub fn start<S: Storage + 'static>(storage: Arc<S>, settings: PipelineSettings) -> PipelineHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (work_tx, work_rx) = create_work_channel(settings.channel_capacity);
    let (result_tx, result_rx) = create_channel(settings.channel_capacity);

    let host = hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string());
    info!(
        host = %host,
        workers = settings.workers,
        channel_capacity = settings.channel_capacity,
        "Starting rollup pipeline"
    );

    let sink = Sink::new(storage.clone(), storage.clone(), settings.retry);
    let sink_handle = tokio::spawn(run_sink(result_rx, sink, shutdown_rx.clone()));

    let worker_count = settings.workers.max(1);
    let mut worker_handles = Vec::with_capacity(worker_count);
    for worker_id in 1..=worker_count {
        worker_handles.push(tokio::spawn(run_worker(
            worker_id as i64,
            work_rx.clone(),
            result_tx.clone(),
            shutdown_rx.clone(),
        )));
    }
    // Only workers hold result senders, so the sink sees the channel close
    // once the last worker exits.
    drop(result_tx);
    drop(work_rx);

    let dispatcher = Dispatcher::new(
        storage.clone(),
        Publisher::new(work_tx, settings.backpressure),
        settings.dispatcher,
        settings.retry,
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx));

    PipelineHandle {
        shutdown_tx,
        jobs: storage,
        dispatcher: dispatcher_handle,
        workers: worker_handles,
        sink: sink_handle,
    }
}

impl PipelineHandle {
    /// A receiver for the pipeline's shutdown signal, for tasks that should
    /// stop alongside it.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Wait until no job is pending at any level. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<bool, StorageError> {
        let started = Instant::now();
        loop {
            if self.jobs.pending_counts().await?.total() == 0 {
                return Ok(true);
            }
            if started.elapsed() >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Signal shutdown, then join the dispatcher, the workers and the sink in
    /// that order so every published unit is committed before returning.
    pub async fn shutdown(self) -> Result<PipelineReport, PipelineError> {
        info!("Shutting down rollup pipeline");
        let _ = self.shutdown_tx.send(true);

        let dispatch = self.dispatcher.await?;
        if let Err(e) = &dispatch {
            error!(error = %e, "Dispatcher stopped with error");
        }

        let workers = join_all(self.workers)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        let sink = self.sink.await?;

        let report = PipelineReport {
            dispatch: dispatch?,
            workers,
            sink,
        };
        info!(
            published = report.dispatch.published,
            processed = report.processed(),
            committed = report.sink.committed,
            "Rollup pipeline stopped"
        );
        Ok(report)
    }
}
