pub mod bypass;
pub mod callback;
pub mod client;
pub mod context;
pub mod engine;
pub mod headers;
pub mod metadata;
pub mod naming;
pub mod proxy;
pub mod request;
pub mod sink;
pub mod source;
pub mod stats;
pub mod storage;
pub mod usage;

#[cfg(test)]
mod integration_tests;

pub use bypass::{BypassGuard, ProxyBypass};
pub use callback::{CacheCallback, CacheEvent, Notifier};
pub use client::CacheClient;
pub use context::CacheContext;
pub use engine::CacheEngine;
pub use headers::HeaderProvider;
pub use metadata::SourceInfo;
pub use naming::{AcceptAll, HttpOnly, Md5NameGenerator, NameGenerator, UrlFilter};
pub use proxy::CacheProxy;
pub use request::CacheRequest;
pub use sink::{CacheSink, FileSink, FileSinkFactory, SinkFactory, SinkHooks};
pub use source::{CacheSource, HttpSource, HttpSourceFactory, SourceFactory};
pub use stats::ProxyStats;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use usage::{CountLimited, DiskUsage, FileSizeLimited, TotalSizeLimited, Unlimited};
