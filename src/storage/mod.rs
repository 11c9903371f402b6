pub mod duckdb;
pub mod retry;
pub mod traits;

pub use retry::{with_retry, RetryPolicy};
pub use traits::{
    IngestSummary, Job, JobStatus, JobStore, PendingCounts, Reading, ReadingStore, Rollup,
    RollupStore, Storage, StorageError, Tag,
};
