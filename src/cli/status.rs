use super::run::{open_storage, require_config};
use crate::bucket::Level;
use crate::storage::traits::{JobStore, ReadingStore};
use chrono::Utc;
use std::path::PathBuf;

/// Print pending job counts, the oldest stuck jobs and the known tags.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = require_config(config_path);
    let (config, storage) = open_storage(&config_path).await?;

    let counts = storage.pending_counts().await?;
    println!("Pending jobs:");
    for level in Level::ALL {
        println!("  {:<6} {}", level.as_str(), counts.get(level));
    }
    println!("  {:<6} {}", "total", counts.total());

    let stuck_after = config
        .web
        .as_ref()
        .map(|web| web.stuck_after)
        .unwrap_or(std::time::Duration::from_secs(600));
    let older_than = Utc::now() - chrono::Duration::from_std(stuck_after)?;
    let stuck = storage.stuck_jobs(older_than, 10).await?;
    if !stuck.is_empty() {
        println!("\nOldest stuck jobs:");
        for job in stuck {
            println!(
                "  job {} tag {} {} {} (since {})",
                job.id, job.tag_id, job.level, job.bucket_start, job.created_at
            );
        }
    }

    let tags = storage.list_tags().await?;
    println!("\nTags: {}", tags.len());
    for tag in tags {
        println!("  {:>6}  {}", tag.id, tag.name);
    }
    Ok(())
}
