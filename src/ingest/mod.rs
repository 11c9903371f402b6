pub mod sample;

pub use sample::{seed, SeedPlan, SeedSummary, Waveform};
