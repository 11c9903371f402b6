use crate::aggregate::Aggregate;
use crate::bucket::Level;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Inputs of one aggregation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkValues {
    /// Raw reading values of an hour bucket.
    Readings(Vec<f64>),
    /// Committed child aggregates of a day, month or year bucket.
    Rollups(Vec<Aggregate>),
}

impl WorkValues {
    pub fn len(&self) -> usize {
        match self {
            WorkValues::Readings(values) => values.len(),
            WorkValues::Rollups(children) => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn aggregate(&self) -> Aggregate {
        match self {
            WorkValues::Readings(values) => Aggregate::from_values(values),
            WorkValues::Rollups(children) => Aggregate::combine(children),
        }
    }
}

/// Work channel message, dispatcher to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    #[serde(rename = "jobid")]
    pub job_id: i64,
    #[serde(rename = "tagid")]
    pub tag_id: i64,
    #[serde(rename = "type")]
    pub level: Level,
    #[serde(rename = "ts")]
    pub bucket_start: i64,
    /// Job revision the inputs were read at.
    #[serde(rename = "rev", default)]
    pub revision: u64,
    pub values: WorkValues,
}

/// Result channel message, worker to sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "workerid")]
    pub worker_id: i64,
    #[serde(rename = "jobid")]
    pub job_id: i64,
    #[serde(rename = "tagid")]
    pub tag_id: i64,
    #[serde(rename = "type")]
    pub level: Level,
    #[serde(rename = "ts")]
    pub bucket_start: i64,
    #[serde(rename = "rev", default)]
    pub revision: u64,
    #[serde(rename = "values")]
    pub aggregate: Aggregate,
}

impl WorkUnit {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl ResultMessage {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
