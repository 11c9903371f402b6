use super::run::{open_storage, require_config};
use crate::ingest::{seed, SeedPlan, Waveform};
use chrono::DateTime;
use clap::{Args, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Wave {
    Constant,
    Sine,
    SineCos,
}

#[derive(Debug, Args)]
pub struct SeedArgs {
    /// Tag name; created when missing
    #[arg(long, default_value = "sample")]
    pub tag: String,

    /// First sample, RFC 3339
    #[arg(long, default_value = "2010-01-01T00:00:00Z")]
    pub from: String,

    /// Last sample, RFC 3339 (inclusive)
    #[arg(long, default_value = "2011-01-03T01:30:00Z")]
    pub to: String,

    /// Seconds between samples
    #[arg(long, default_value_t = 900)]
    pub interval: i64,

    #[arg(long, value_enum, default_value_t = Wave::Constant)]
    pub wave: Wave,

    /// Value of a constant wave
    #[arg(long, default_value_t = 1.0)]
    pub value: f64,

    /// Samples per half cycle (sine) or per cycle (sine-cos)
    #[arg(long, default_value_t = 32.0)]
    pub frequency: f64,

    /// Readings per ingest transaction
    #[arg(long, default_value_t = 10_000)]
    pub batch_size: usize,
}

fn parse_instant(flag: &str, value: &str) -> Result<i64, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .map_err(|e| format!("invalid --{} '{}': {}", flag, value, e))
}

impl SeedArgs {
    pub fn to_plan(&self) -> Result<SeedPlan, String> {
        let waveform = match self.wave {
            Wave::Constant => Waveform::Constant(self.value),
            Wave::Sine => Waveform::Sine {
                samples_per_half_cycle: self.frequency,
            },
            Wave::SineCos => Waveform::SineCosine {
                samples_per_cycle: self.frequency,
            },
        };
        if self.interval <= 0 {
            return Err("--interval must be positive".to_string());
        }

        Ok(SeedPlan {
            tag: self.tag.clone(),
            start: parse_instant("from", &self.from)?,
            end: parse_instant("to", &self.to)?,
            interval: self.interval,
            waveform,
        })
    }
}

pub async fn run(config_path: Option<PathBuf>, args: SeedArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = require_config(config_path);
    let plan = args.to_plan()?;
    let (_, storage) = open_storage(&config_path).await?;

    let summary = seed(storage.as_ref(), &plan, args.batch_size).await?;
    println!(
        "Seeded {} readings for tag '{}' (id {}), {} hour jobs queued",
        summary.ingested.readings, summary.tag.name, summary.tag.id, summary.ingested.jobs_created
    );
    Ok(())
}
