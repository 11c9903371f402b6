use serde::{Deserialize, Serialize};

/// Summary statistics of one bucket.
///
/// `max` and `min` are `None` only for an empty bucket (`count == 0`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Aggregate {
    pub sum: f64,
    pub avg: f64,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub count: u64,
}

impl Aggregate {
    /// Aggregate raw readings.
    pub fn from_values(values: &[f64]) -> Self {
        let mut aggregate = Aggregate::default();
        for &value in values {
            aggregate.sum += value;
            aggregate.max = Some(aggregate.max.map_or(value, |m| m.max(value)));
            aggregate.min = Some(aggregate.min.map_or(value, |m| m.min(value)));
        }
        aggregate.count = values.len() as u64;
        aggregate.avg = average(aggregate.sum, aggregate.count);
        aggregate
    }

    /// Aggregate of aggregates: sums and counts add up, extremes are taken
    /// over the children, and the average is recomputed from the totals.
    /// Empty children contribute nothing.
    pub fn combine<'a>(children: impl IntoIterator<Item = &'a Aggregate>) -> Self {
        let mut aggregate = Aggregate::default();
        for child in children.into_iter().filter(|c| !c.is_empty()) {
            aggregate.sum += child.sum;
            aggregate.count += child.count;
            aggregate.max = max_option(aggregate.max, child.max);
            aggregate.min = min_option(aggregate.min, child.min);
        }
        aggregate.avg = average(aggregate.sum, aggregate.count);
        aggregate
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

fn average(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn min_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
