//! Named defaults from `spec.md`, collected in one place so they're
//! changed (or overridden by `config_push`) in exactly one spot.

use std::time::Duration;

/// §4.1: heartbeat cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// §4.1: consecutive misses before an agent is marked `disconnected`.
pub const DEFAULT_MISSED_HEARTBEATS: u32 = 3;

/// §4.2: reconnect backoff (base, factor, cap); jitter is applied as
/// +/-20% of the computed delay.
pub const RECONNECT_BACKOFF_BASE_MS: u64 = 1_000;
pub const RECONNECT_BACKOFF_FACTOR: f64 = 2.0;
pub const RECONNECT_BACKOFF_CAP_MS: u64 = 60_000;
pub const RECONNECT_BACKOFF_JITTER_PCT: f64 = 0.20;

/// §4.2: grace period for a `cancel_task` subprocess teardown.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// §4.3: keyspace planner chunk sizing.
pub const DEFAULT_CHUNK_TARGET: Duration = Duration::from_secs(600);
pub const DEFAULT_MIN_CHUNK_SECS: u64 = 10;
pub const DEFAULT_MAX_CHUNK_SECS: u64 = 3_600;

/// §4.4: dispatch and progress timeouts, retry ceiling.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROGRESS_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// §4.4 backpressure: the scheduler's own dispatch-tick backoff when no
/// eligible agent exists for the head of the pending queue.
pub const DISPATCH_BACKOFF_BASE_MS: u64 = 50;
pub const DISPATCH_BACKOFF_MAX_MS: u64 = 1_000;
pub const DISPATCH_BACKOFF_JITTER_MS: u64 = 50;

/// §4.6: agent-local artifact cache retention for non-pinned kinds.
pub const DEFAULT_RETENTION_DAYS: u64 = 3;
/// §4.6: file-sync retry ceiling before `task_failed{fatal}`.
pub const DEFAULT_SYNC_MAX_ATTEMPTS: u32 = 3;

/// §6: default bind address for the combined HTTP/WS listener.
pub const DEFAULT_SERVER_BIND_ADDR: &str = "0.0.0.0:7878";
/// §6: default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://krakenhashes.db?mode=rwc";
