//! Synthetic readings for trying out and testing the cascade.

use crate::storage::traits::{IngestSummary, Reading, ReadingStore, StorageError, Tag};
use std::f64::consts::{PI, TAU};
use tracing::info;

/// Shape of the generated series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    /// The same value at every sample, which makes rollups easy to predict.
    Constant(f64),
    /// `sin(phase)`, advancing the phase by pi / `samples_per_half_cycle`.
    Sine { samples_per_half_cycle: f64 },
    /// `sin(phase / 2) * cos(2 * phase)`, with the phase wrapping every
    /// `samples_per_cycle` samples.
    SineCosine { samples_per_cycle: f64 },
}

impl Waveform {
    fn values(self) -> impl Iterator<Item = f64> {
        let mut phase = 0.0_f64;
        std::iter::from_fn(move || {
            let value = match self {
                Waveform::Constant(value) => value,
                Waveform::Sine { samples_per_half_cycle } => {
                    let value = phase.sin();
                    phase += PI / non_zero(samples_per_half_cycle);
                    value
                }
                Waveform::SineCosine { samples_per_cycle } => {
                    let value = (phase * 0.5).sin() * (phase * 2.0).cos();
                    phase += TAU / non_zero(samples_per_cycle);
                    if phase > TAU {
                        phase = 0.0;
                    }
                    value
                }
            };
            Some(value)
        })
    }
}

fn non_zero(value: f64) -> f64 {
    if value == 0.0 {
        1.0
    } else {
        value
    }
}

#[derive(Debug, Clone)]
pub struct SeedPlan {
    pub tag: String,
    /// First sample, epoch seconds.
    pub start: i64,
    /// Last possible sample (inclusive), epoch seconds.
    pub end: i64,
    /// Seconds between samples.
    pub interval: i64,
    pub waveform: Waveform,
}

impl SeedPlan {
    /// Readings of this series for `tag_id`, from `start` to `end` inclusive.
    /// Samples are produced on demand.
    pub fn readings(&self, tag_id: i64) -> impl Iterator<Item = Reading> {
        let (start, interval) = (self.start, self.interval);
        let count = if interval <= 0 || self.end < start {
            0
        } else {
            (self.end - start) / interval + 1
        };

        (0..count)
            .map(move |i| start + i * interval)
            .zip(self.waveform.values())
            .map(move |(ts, value)| Reading { tag_id, ts, value })
    }
}

#[derive(Debug, Clone)]
pub struct SeedSummary {
    pub tag: Tag,
    pub ingested: IngestSummary,
}

/// Create the tag if needed and ingest the generated series in batches.
pub async fn seed(
    store: &dyn ReadingStore,
    plan: &SeedPlan,
    batch_size: usize,
) -> Result<SeedSummary, StorageError> {
    let tag = store.create_tag(&plan.tag).await?;
    let mut readings = plan.readings(tag.id);

    let mut total = IngestSummary::default();
    loop {
        let batch: Vec<Reading> = readings.by_ref().take(batch_size.max(1)).collect();
        if batch.is_empty() {
            break;
        }
        let summary = store.ingest(&batch).await?;
        total.readings += summary.readings;
        total.jobs_created += summary.jobs_created;
    }

    info!(
        tag = %tag.name,
        tag_id = tag.id,
        readings = total.readings,
        hour_jobs = total.jobs_created,
        "Seeded sample data"
    );
    Ok(SeedSummary {
        tag,
        ingested: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Level;
    use crate::storage::duckdb::DuckDbStorage;
    use crate::storage::traits::{JobStore, Storage};

    const T0: i64 = 1_262_304_000; // 2010-01-01T00:00:00Z

    fn plan(waveform: Waveform) -> SeedPlan {
        SeedPlan {
            tag: "sample".to_string(),
            start: T0,
            end: T0 + 3 * 3600,
            interval: 900,
            waveform,
        }
    }

    #[test]
    fn test_constant_series_is_inclusive_of_end() {
        let readings = plan(Waveform::Constant(1.0)).readings(7).collect::<Vec<_>>();
        assert_eq!(readings.len(), 13);
        assert_eq!(readings[0].ts, T0);
        assert_eq!(readings[12].ts, T0 + 3 * 3600);
        assert!(readings.iter().all(|r| r.value == 1.0 && r.tag_id == 7));
    }

    #[test]
    fn test_sine_series_starts_at_zero_and_stays_bounded() {
        let readings = plan(Waveform::Sine { samples_per_half_cycle: 4.0 })
            .readings(1)
            .collect::<Vec<_>>();
        assert_eq!(readings[0].value, 0.0);
        assert!((readings[2].value - 1.0).abs() < 1e-9);
        assert!(readings.iter().all(|r| r.value.abs() <= 1.0));

        let mixed = plan(Waveform::SineCosine { samples_per_cycle: 8.0 })
            .readings(1)
            .collect::<Vec<_>>();
        assert_eq!(mixed[0].value, 0.0);
        assert!(mixed.iter().all(|r| r.value.abs() <= 1.0));
    }

    #[test]
    fn test_degenerate_ranges_produce_nothing() {
        let mut reversed = plan(Waveform::Constant(1.0));
        reversed.end = reversed.start - 1;
        assert_eq!(reversed.readings(1).count(), 0);

        let mut no_step = plan(Waveform::Constant(1.0));
        no_step.interval = 0;
        assert_eq!(no_step.readings(1).count(), 0);
    }

    #[test]
    fn test_unbounded_range_is_generated_on_demand() {
        let mut forever = plan(Waveform::Constant(2.0));
        forever.end = i64::MAX;
        forever.interval = 1;

        let head: Vec<i64> = forever.readings(1).take(3).map(|r| r.ts).collect();
        assert_eq!(head, vec![T0, T0 + 1, T0 + 2]);
    }

    #[tokio::test]
    async fn test_seed_ingests_in_batches() {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();

        let summary = seed(&storage, &plan(Waveform::Constant(1.0)), 5).await.unwrap();
        assert_eq!(summary.ingested.readings, 13);
        // Buckets 00:00, 01:00, 02:00 and 03:00.
        assert_eq!(summary.ingested.jobs_created, 4);
        assert_eq!(storage.pending_counts().await.unwrap().get(Level::Hour), 4);
    }
}
