use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Method, Response, StatusCode};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use super::context::CacheContext;
use super::metadata::SourceInfo;
use crate::constants::{METADATA_PROBE_TIMEOUT, REDIRECT_COUNT};
use crate::utils::{ProxyCacheError, Result};

/// Network side of a cached resource.
#[async_trait]
pub trait CacheSource: Send {
    /// Start reading at `offset`.
    async fn open(&mut self, offset: u64) -> Result<()>;

    /// Total length, `None` when the server does not say.
    async fn length(&mut self) -> Result<Option<u64>>;

    async fn mime(&mut self) -> Result<Option<String>>;

    /// Read into `buf`; `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn close(&mut self);
}

/// Produces a fresh source for every stream.
pub trait SourceFactory: Send + Sync {
    fn create(&self, url: &str, ctx: Arc<CacheContext>) -> Box<dyn CacheSource>;
}

impl<F> SourceFactory for F
where
    F: Fn(&str, Arc<CacheContext>) -> Box<dyn CacheSource> + Send + Sync,
{
    fn create(&self, url: &str, ctx: Arc<CacheContext>) -> Box<dyn CacheSource> {
        self(url, ctx)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpSourceFactory;

impl SourceFactory for HttpSourceFactory {
    fn create(&self, url: &str, ctx: Arc<CacheContext>) -> Box<dyn CacheSource> {
        Box::new(HttpSource::new(url, ctx))
    }
}

/// Fetches a resource over HTTP(S) with range requests and bounded redirects.
pub struct HttpSource {
    url: String,
    ctx: Arc<CacheContext>,
    info: Option<SourceInfo>,
    response: Option<Response>,
    pending: Bytes,
    /// Bytes still to drop when the server ignored our range request
    skip: u64,
}

impl HttpSource {
    pub fn new(url: &str, ctx: Arc<CacheContext>) -> Self {
        Self {
            url: url.to_string(),
            ctx,
            info: None,
            response: None,
            pending: Bytes::new(),
            skip: 0,
        }
    }

    async fn known_info(&mut self) -> Option<&SourceInfo> {
        if self.info.is_none() && !self.ctx.is_ping_url(&self.url) {
            self.info = self.ctx.storage.get(&self.url).await;
        }
        self.info.as_ref()
    }

    async fn remember(&mut self, info: SourceInfo) {
        if !self.ctx.is_ping_url(&self.url)
            && let Err(e) = self.ctx.storage.put(&self.url, info.clone()).await
        {
            warn!("Failed to store source info for {}: {}", self.url, e);
        }
        self.info = Some(info);
    }

    /// Metadata-only request used when nothing is known yet.
    async fn probe(&mut self) -> Result<()> {
        debug!("Probing metadata for {}", self.url);
        let probe = send(&self.ctx, &self.url, Method::HEAD, 0);
        let response = timeout(METADATA_PROBE_TIMEOUT, probe)
            .await
            .map_err(|_| {
                ProxyCacheError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("metadata probe for {} timed out", self.url),
                ))
            })??;
        let info = SourceInfo::new(
            self.url.clone(),
            header_string(&response, CONTENT_TYPE),
            content_length(&response),
        );
        self.remember(info).await;
        Ok(())
    }
}

#[async_trait]
impl CacheSource for HttpSource {
    async fn open(&mut self, offset: u64) -> Result<()> {
        self.close().await;

        let response = send(&self.ctx, &self.url, Method::GET, offset).await?;
        let status = response.status();
        let body_length = content_length(&response);

        let length = match status {
            StatusCode::PARTIAL_CONTENT => body_length.map(|len| len + offset),
            _ => body_length,
        };
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            debug!(
                "{} ignored range request, skipping {} bytes",
                self.url, offset
            );
            self.skip = offset;
        }

        let info = SourceInfo::new(
            self.url.clone(),
            header_string(&response, CONTENT_TYPE),
            length,
        );
        debug!("Opened {} at {}: {}", self.url, offset, info);
        self.remember(info).await;
        self.response = Some(response);
        Ok(())
    }

    async fn length(&mut self) -> Result<Option<u64>> {
        if let Some(length) = self.known_info().await.and_then(SourceInfo::known_length) {
            return Ok(Some(length));
        }
        self.probe().await?;
        Ok(self.info.as_ref().and_then(SourceInfo::known_length))
    }

    async fn mime(&mut self) -> Result<Option<String>> {
        if let Some(mime) = self.known_info().await.and_then(SourceInfo::known_mime) {
            return Ok(Some(mime.to_string()));
        }
        self.probe().await?;
        Ok(self
            .info
            .as_ref()
            .and_then(SourceInfo::known_mime)
            .map(str::to_string))
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending.split_to(n));
                return Ok(n);
            }

            let Some(response) = self.response.as_mut() else {
                return Err(ProxyCacheError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("source for {} is not open", self.url),
                )));
            };
            let Some(mut chunk) = response.chunk().await? else {
                return Ok(0);
            };

            if self.skip > 0 {
                let dropped = self.skip.min(chunk.len() as u64);
                let _ = chunk.split_to(dropped as usize);
                self.skip -= dropped;
            }
            self.pending = chunk;
        }
    }

    async fn close(&mut self) {
        self.response = None;
        self.pending = Bytes::new();
        self.skip = 0;
    }
}

/// Issue `method` against `url`, following up to `REDIRECT_COUNT` redirects.
async fn send(ctx: &CacheContext, url: &str, method: Method, offset: u64) -> Result<Response> {
    let headers = ctx.headers_for(url);
    let mut target = url.to_string();
    let mut redirects = 0;

    loop {
        let mut request = ctx.http_client(&target).request(method.clone(), &target);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_redirection() {
            redirects += 1;
            if redirects > REDIRECT_COUNT {
                return Err(ProxyCacheError::TooManyRedirects(redirects));
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| ProxyCacheError::UnexpectedStatus {
                    url: target.clone(),
                    status: status.as_u16(),
                })?;
            target = resolve(&target, location);
            debug!("Redirect #{} for {} -> {}", redirects, url, target);
            continue;
        }

        if !status.is_success() {
            return Err(ProxyCacheError::UnexpectedStatus {
                url: target,
                status: status.as_u16(),
            });
        }

        return Ok(response);
    }
}

fn resolve(base: &str, location: &str) -> String {
    match Url::parse(base).and_then(|base| base.join(location)) {
        Ok(url) => url.to_string(),
        Err(_) => location.to_string(),
    }
}

fn content_length(response: &Response) -> Option<u64> {
    header_string(response, CONTENT_LENGTH).and_then(|value| value.trim().parse().ok())
}

fn header_string(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}
