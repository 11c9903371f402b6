pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# DOMINO CONFIGURATION
# =============================================================================
# Rollup cascade settings: hourly aggregates of raw readings feed daily,
# monthly and yearly aggregates.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/domino/config.yml
#   3. /etc/domino/config.yml
#
# Values of the form $env{VAR} are replaced with environment variables.
# Durations accept forms like 250ms, 5s, 2m, 1h.

# =============================================================================
# STORAGE
# =============================================================================
# DuckDB file holding tags, readings, jobs and rollups. Created on first run.

storage:
  path: ~/.local/share/domino/rollup.duckdb

# =============================================================================
# PIPELINE
# =============================================================================

pipeline:
  # Number of aggregation workers sharing the work channel
  workers: 4
  # Capacity of the work and result channels
  channel_capacity: 1000
  # What the dispatcher does when the work channel is full:
  #   block - wait for room
  #   drop  - skip the job for now; it stays pending and is retried later
  backpressure: block

# =============================================================================
# DISPATCHER
# =============================================================================

dispatcher:
  # Pending jobs fetched per level and poll
  batch_size: 500
  # Delay after a poll that published nothing; doubles up to max_poll_interval
  poll_interval: 200ms
  max_poll_interval: 5s
  # A published job is not published again until this much time has passed
  redelivery_timeout: 60s

# =============================================================================
# STORE RETRIES
# =============================================================================
# Busy or conflicting writes are retried with delay base_delay * attempt,
# capped at max_delay.

retry:
  max_attempts: 5
  base_delay: 50ms
  max_delay: 1s

# =============================================================================
# STATUS API (optional)
# =============================================================================
# Remove this section to run without the HTTP status endpoints.

web:
  listen: 127.0.0.1:7106
  # Pending jobs older than this are listed as stuck
  stuck_after: 10m
"#
    .to_string()
}
