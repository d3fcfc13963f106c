//! Public entry point: turns media URLs into proxied (or local) URLs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
    CacheCallback, CacheContext, CacheProxy, CacheStorage, CountLimited, DiskUsage,
    FileSizeLimited, HeaderProvider, HttpOnly, MemoryStorage, NameGenerator, ProxyStats,
    SinkFactory, SourceFactory, SqliteStorage, TotalSizeLimited, UrlFilter, usage::touch_all,
};
use crate::config::{ProxyCacheConfig, UrlFilterKind};
use crate::utils::{ProxyCacheError, Result};

/// Running caching proxy plus the bookkeeping around it.
pub struct ProxyCacheServer {
    ctx: Arc<CacheContext>,
    proxy: Arc<CacheProxy>,
}

impl ProxyCacheServer {
    pub fn builder() -> ProxyCacheServerBuilder {
        ProxyCacheServerBuilder::default()
    }

    pub fn port(&self) -> u16 {
        self.proxy.port()
    }

    pub fn root_dir(&self) -> &Path {
        self.ctx.root_dir()
    }

    pub fn stats(&self) -> &ProxyStats {
        self.ctx.stats()
    }

    /// URL to hand to the player for `url`.
    ///
    /// Never fails: anything that prevents proxying yields `url` unchanged.
    pub async fn proxy_url(&self, url: &str) -> String {
        self.proxy_url_with(url, None, None).await
    }

    pub async fn proxy_url_with(
        &self,
        url: &str,
        headers: Option<Arc<dyn HeaderProvider>>,
        callback: Option<Arc<dyn CacheCallback>>,
    ) -> String {
        if url.is_empty() || !self.ctx.url_filter.accept(url) {
            return url.to_string();
        }

        if let Some(local) = self.local_url(url).await {
            debug!("{} is cached, serving {}", url, local);
            return local;
        }

        if let Some(callback) = callback {
            self.ctx.notifier.register(url, callback);
        }
        if let Some(headers) = headers {
            self.ctx.set_url_headers(url, headers);
        }

        if self.proxy.is_running() && self.proxy.ping().await {
            self.proxy.proxy_url(url)
        } else {
            warn!("Proxy not reachable, handing out original url {}", url);
            url.to_string()
        }
    }

    async fn local_url(&self, url: &str) -> Option<String> {
        let path = self.cached_file(url)?;
        touch_all(&self.ctx.usages, &path).await;
        if !path.exists() {
            return None;
        }
        Url::from_file_path(&path).ok().map(String::from)
    }

    /// Complete cache file for `url`, if there is one.
    pub fn cached_file(&self, url: &str) -> Option<PathBuf> {
        let path = self.ctx.cache_file(url);
        path.is_file().then_some(path)
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.cached_file(url).is_some()
    }

    /// Drop the client and any cache files for `url`.
    pub async fn clear_cache(&self, url: &str) -> Result<()> {
        self.proxy.destroy(url).await;
        for path in [self.ctx.cache_file(url), self.ctx.download_file(url)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove every cached file.
    pub async fn clear_caches(&self) -> Result<()> {
        let root = self.ctx.root_dir();
        info!("Clearing cache directory {:?}", root);
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(root).await?;
        Ok(())
    }

    /// The player for `url` is gone: forget its callback/headers and stop its client.
    pub async fn on_destroy(&self, url: &str) {
        self.ctx.notifier.unregister(url);
        self.ctx.remove_url_headers(url);
        self.proxy.destroy(url).await;
    }

    pub async fn on_destroy_all<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            self.on_destroy(url.as_ref()).await;
        }
    }

    pub async fn shutdown(&self) {
        self.proxy.shutdown().await;
        self.ctx.notifier.clear();
        self.ctx.clear_url_headers();
        self.ctx.storage.release().await;
    }
}

/// Builder for [`ProxyCacheServer`].
#[derive(Default)]
pub struct ProxyCacheServerBuilder {
    config: ProxyCacheConfig,
    root_dir: Option<PathBuf>,
    global_headers: Option<Arc<dyn HeaderProvider>>,
    source_factory: Option<Arc<dyn SourceFactory>>,
    sink_factory: Option<Arc<dyn SinkFactory>>,
    storage: Option<Arc<dyn CacheStorage>>,
    url_filter: Option<Arc<dyn UrlFilter>>,
    name_generator: Option<Arc<dyn NameGenerator>>,
    usages: Vec<Arc<dyn DiskUsage>>,
}

impl ProxyCacheServerBuilder {
    /// Start from a loaded configuration; explicit builder calls still win.
    pub fn config(mut self, config: ProxyCacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    /// Headers sent with every upstream request.
    pub fn append_headers(mut self, provider: Arc<dyn HeaderProvider>) -> Self {
        self.global_headers = Some(provider);
        self
    }

    pub fn cache_source(mut self, factory: Arc<dyn SourceFactory>) -> Self {
        self.source_factory = Some(factory);
        self
    }

    pub fn cache_sink(mut self, factory: Arc<dyn SinkFactory>) -> Self {
        self.sink_factory = Some(factory);
        self
    }

    pub fn cache_storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn url_filter(mut self, filter: Arc<dyn UrlFilter>) -> Self {
        self.url_filter = Some(filter);
        self
    }

    pub fn file_name_generator(mut self, generator: Arc<dyn NameGenerator>) -> Self {
        self.name_generator = Some(generator);
        self
    }

    /// Add an eviction policy; policies run in the order they were added.
    pub fn disk_usage(mut self, usage: Arc<dyn DiskUsage>) -> Self {
        self.usages.push(usage);
        self
    }

    pub fn max_file_count(mut self, count: u64) -> Self {
        self.config.max_file_count = Some(count);
        self
    }

    pub fn max_total_size(mut self, bytes: u64) -> Self {
        self.config.max_total_size = Some(bytes);
        self
    }

    /// Evict files at or above `bytes` and never cache resources larger than that.
    pub fn single_file_size(mut self, bytes: u64) -> Self {
        self.config.max_single_file_size = Some(bytes);
        self.config.max_file_size = bytes;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Timeout of the first ping attempt.
    pub fn max_timeouts(mut self, timeout: Duration) -> Self {
        self.config.max_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn callback_interval(mut self, interval: Duration) -> Self {
        self.config.callback_interval_ms = interval.as_millis() as u64;
        self
    }

    fn configured_usages(&self) -> Vec<Arc<dyn DiskUsage>> {
        let mut usages = self.usages.clone();
        if let Some(max) = self.config.max_file_count {
            usages.push(Arc::new(CountLimited { max }));
        }
        if let Some(max) = self.config.max_total_size {
            usages.push(Arc::new(TotalSizeLimited { max }));
        }
        if let Some(max) = self.config.max_single_file_size {
            usages.push(Arc::new(FileSizeLimited { max }));
        }
        usages
    }

    async fn default_storage() -> Arc<dyn CacheStorage> {
        let Some(data_dir) = dirs::data_dir() else {
            warn!("No data directory available, source info will not persist");
            return Arc::new(MemoryStorage::new());
        };
        let path = data_dir.join("streamcache").join("sources.db");
        match SqliteStorage::open(&path).await {
            Ok(storage) => Arc::new(storage),
            Err(e) => {
                warn!("Failed to open {:?} ({}), keeping source info in memory", path, e);
                Arc::new(MemoryStorage::new())
            }
        }
    }

    /// Bind the listener and return the running server.
    pub async fn build(self) -> Result<ProxyCacheServer> {
        self.config
            .validate()
            .map_err(|e| ProxyCacheError::Config(e.to_string()))?;

        let root_dir = match &self.root_dir {
            Some(dir) => dir.clone(),
            None => self
                .config
                .cache_directory()
                .map_err(|e| ProxyCacheError::Config(e.to_string()))?,
        };
        tokio::fs::create_dir_all(&root_dir).await?;

        let usages = self.configured_usages();
        let storage = match self.storage {
            Some(storage) => storage,
            None => Self::default_storage().await,
        };

        let mut ctx = CacheContext::new(root_dir, storage)?;
        ctx.max_file_size = self.config.max_file_size;
        ctx.max_attempts = self.config.max_attempts;
        ctx.ping_timeout = self.config.ping_timeout();
        ctx.callback_interval = self.config.callback_interval();
        if !usages.is_empty() {
            ctx.usages = usages;
        }
        if let Some(factory) = self.source_factory {
            ctx.source_factory = factory;
        }
        if let Some(factory) = self.sink_factory {
            ctx.sink_factory = factory;
        }
        if let Some(generator) = self.name_generator {
            ctx.name_generator = generator;
        }
        ctx.url_filter = match (self.url_filter, self.config.url_filter) {
            (Some(filter), _) => filter,
            (None, UrlFilterKind::Http) => Arc::new(HttpOnly),
            (None, UrlFilterKind::Any) => ctx.url_filter.clone(),
        };
        ctx.global_headers = match self.global_headers {
            Some(provider) => Some(provider),
            None if !self.config.headers.is_empty() => {
                let headers: Arc<dyn HeaderProvider> = Arc::new(self.config.headers);
                Some(headers)
            }
            None => None,
        };

        let ctx = Arc::new(ctx);
        let proxy = CacheProxy::start(ctx.clone()).await?;
        info!("Media cache at {:?} on port {}", ctx.root_dir(), proxy.port());

        Ok(ProxyCacheServer { ctx, proxy })
    }
}
