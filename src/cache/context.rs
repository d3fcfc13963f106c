use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::bypass::ProxyBypass;
use super::callback::Notifier;
use super::headers::{HeaderProvider, merge_headers};
use super::naming::{AcceptAll, Md5NameGenerator, NameGenerator, UrlFilter};
use super::sink::{FileSinkFactory, SinkFactory};
use super::source::{HttpSourceFactory, SourceFactory};
use super::stats::ProxyStats;
use super::storage::CacheStorage;
use super::usage::{DiskUsage, TotalSizeLimited};
use crate::constants::{
    ATTEMPTS, CALLBACK_INTERVAL_MS, DEFAULT_TOTAL_SIZE, DOWNLOAD_SUFFIX, TIMEOUT_MS,
};
use crate::utils::Result;

/// Everything the listener, engines, sources and sinks share.
pub struct CacheContext {
    pub(crate) root_dir: PathBuf,
    /// Resources larger than this are streamed but never written to disk
    pub(crate) max_file_size: u64,
    pub(crate) max_attempts: u32,
    /// Timeout of the first ping attempt, doubled on every retry
    pub(crate) ping_timeout: Duration,
    pub(crate) callback_interval: Duration,
    pub(crate) storage: Arc<dyn CacheStorage>,
    pub(crate) source_factory: Arc<dyn SourceFactory>,
    pub(crate) sink_factory: Arc<dyn SinkFactory>,
    pub(crate) name_generator: Arc<dyn NameGenerator>,
    pub(crate) url_filter: Arc<dyn UrlFilter>,
    pub(crate) usages: Vec<Arc<dyn DiskUsage>>,
    pub(crate) global_headers: Option<Arc<dyn HeaderProvider>>,
    url_headers: RwLock<HashMap<String, Arc<dyn HeaderProvider>>>,
    pub(crate) notifier: Notifier,
    pub(crate) bypass: ProxyBypass,
    /// Cancelled when the whole proxy shuts down
    pub(crate) cancel: CancellationToken,
    pub(crate) stats: ProxyStats,
    client: reqwest::Client,
    direct_client: reqwest::Client,
}

impl CacheContext {
    /// Context with default policies; must be called inside a tokio runtime.
    pub fn new(root_dir: PathBuf, storage: Arc<dyn CacheStorage>) -> Result<Self> {
        // Redirects are followed by the source itself so it can enforce its own cap.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let direct_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            root_dir,
            max_file_size: i32::MAX as u64,
            max_attempts: ATTEMPTS,
            ping_timeout: Duration::from_millis(TIMEOUT_MS),
            callback_interval: Duration::from_millis(CALLBACK_INTERVAL_MS),
            storage,
            source_factory: Arc::new(HttpSourceFactory),
            sink_factory: Arc::new(FileSinkFactory),
            name_generator: Arc::new(Md5NameGenerator),
            url_filter: Arc::new(AcceptAll),
            usages: vec![Arc::new(TotalSizeLimited {
                max: DEFAULT_TOTAL_SIZE,
            })],
            global_headers: None,
            url_headers: RwLock::new(HashMap::new()),
            notifier: Notifier::start(),
            bypass: ProxyBypass::new(),
            cancel: CancellationToken::new(),
            stats: ProxyStats::new(),
            client,
            direct_client,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Path of the complete cache file for `url`.
    pub fn cache_file(&self, url: &str) -> PathBuf {
        let mut name = self.name_generator.generate_name(url);
        if name.is_empty() {
            warn!("Name generator returned an empty name for {}, using md5", url);
            name = Md5NameGenerator.generate_name(url);
        }
        self.root_dir.join(name)
    }

    /// Path of the in-progress file for `url`.
    pub fn download_file(&self, url: &str) -> PathBuf {
        let complete = self.cache_file(url);
        let mut name = complete.into_os_string();
        name.push(DOWNLOAD_SUFFIX);
        PathBuf::from(name)
    }

    /// Whether `url` points at the proxy's own listener.
    pub fn is_ping_url(&self, url: &str) -> bool {
        self.bypass.is_exempt(url)
    }

    pub fn set_url_headers(&self, url: &str, provider: Arc<dyn HeaderProvider>) {
        if let Ok(mut headers) = self.url_headers.write() {
            headers.insert(url.to_string(), provider);
        }
    }

    pub fn remove_url_headers(&self, url: &str) {
        if let Ok(mut headers) = self.url_headers.write() {
            headers.remove(url);
        }
    }

    pub fn clear_url_headers(&self) {
        if let Ok(mut headers) = self.url_headers.write() {
            headers.clear();
        }
    }

    /// Headers for an upstream request: global first, per-URL overrides last.
    pub fn headers_for(&self, url: &str) -> Vec<(String, String)> {
        let per_url = self
            .url_headers
            .read()
            .ok()
            .and_then(|headers| headers.get(url).cloned());
        merge_headers(url, self.global_headers.as_deref(), per_url.as_deref())
    }

    /// Client for `url`; the proxy's own endpoint is always reached directly.
    pub fn http_client(&self, url: &str) -> &reqwest::Client {
        if self.bypass.is_exempt(url) {
            &self.direct_client
        } else {
            &self.client
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::MemoryStorage;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn context(root: &Path) -> CacheContext {
        CacheContext::new(root.to_path_buf(), Arc::new(MemoryStorage::new())).unwrap()
    }

    #[tokio::test]
    async fn test_cache_file_names() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path());

        let complete = ctx.cache_file("http://example.com/video.mp4");
        let downloading = ctx.download_file("http://example.com/video.mp4");

        assert_eq!(complete.parent(), Some(temp_dir.path()));
        assert!(complete.to_string_lossy().ends_with(".mp4"));
        assert_eq!(
            downloading.to_string_lossy(),
            format!("{}{}", complete.to_string_lossy(), DOWNLOAD_SUFFIX)
        );
    }

    #[tokio::test]
    async fn test_empty_generated_name_falls_back_to_md5() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path());
        ctx.name_generator = Arc::new(|_: &str| String::new());

        let url = "http://example.com/video.mp4";
        assert_eq!(
            ctx.cache_file(url),
            temp_dir.path().join(Md5NameGenerator.generate_name(url))
        );
    }

    #[tokio::test]
    async fn test_headers_for_merges_global_and_url() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path());
        let global: HashMap<String, String> =
            [("Authorization".to_string(), "global".to_string())].into();
        ctx.global_headers = Some(Arc::new(global));

        let url = "http://example.com/video.mp4";
        let per_url: HashMap<String, String> =
            [("Authorization".to_string(), "url".to_string())].into();
        ctx.set_url_headers(url, Arc::new(per_url));

        assert_eq!(
            ctx.headers_for(url),
            vec![("Authorization".to_string(), "url".to_string())]
        );
        assert_eq!(
            ctx.headers_for("http://example.com/other.mp4"),
            vec![("Authorization".to_string(), "global".to_string())]
        );

        ctx.remove_url_headers(url);
        assert_eq!(
            ctx.headers_for(url),
            vec![("Authorization".to_string(), "global".to_string())]
        );
    }
}
