// Tunables for the caching proxy, kept in one place so they are easy to adjust.

use std::time::Duration;

// === Loopback listener ===
pub const HOST: &str = "127.0.0.1";
/// Reserved path answered by the listener itself.
pub const PING: &str = "ping";
/// Payload returned for the reserved ping path.
pub const PONG: &str = "ping ok";

// === Streaming ===
pub const BUFFER_SIZE: usize = 32 * 1024;
pub const REDIRECT_COUNT: usize = 5;
pub const METADATA_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A seek below this fraction of the cached length replays disk first and
/// then catches up on the network; anything above opens a new connection.
pub const REPLAY_THRESHOLD: f64 = 0.75;

// === Disk usage ===
pub const DEFAULT_TOTAL_SIZE: u64 = 512 * 1024 * 1024;
pub const DOWNLOAD_SUFFIX: &str = ".download";
pub const MAX_EXTENSION_LENGTH: usize = 4;

// === Ping / callbacks ===
pub const ATTEMPTS: u32 = 3;
pub const TIMEOUT_MS: u64 = 70;
pub const CALLBACK_INTERVAL_MS: u64 = 1000;
