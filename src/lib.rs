// Caching loopback proxy for media playback.
// The binary in src/main.rs is a thin CLI over this library.

pub mod cache;
pub mod config;
pub mod constants;
pub mod server;
pub mod utils;

pub use cache::{CacheCallback, CacheEvent, DiskUsage, HeaderProvider, NameGenerator, UrlFilter};
pub use config::ProxyCacheConfig;
pub use server::{ProxyCacheServer, ProxyCacheServerBuilder};
pub use utils::{ProxyCacheError, Result};
