pub mod backpressure;
pub mod channel;
pub mod dispatcher;
pub mod message;
pub mod runner;
pub mod sink;
pub mod worker;

pub use backpressure::{PublishOutcome, Publisher};
pub use channel::{create_channel, create_work_channel, Receiver, Sender, WorkReceiver};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherSettings, SweepStats};
pub use message::{MessageError, ResultMessage, WorkUnit, WorkValues};
pub use runner::{start, PipelineError, PipelineHandle, PipelineReport, PipelineSettings};
pub use sink::{run_sink, CommitOutcome, Sink, SinkError, SinkStats};
pub use worker::{process_unit, run_worker, WorkerStats};
