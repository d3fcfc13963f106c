use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::debug;

use super::context::CacheContext;
use super::engine::CacheEngine;
use super::request::CacheRequest;
use crate::utils::Result;

/// Holds the engine for one URL, recreating it after a shutdown.
pub struct CacheClient {
    url: String,
    ctx: Arc<CacheContext>,
    engine: Mutex<Option<Arc<CacheEngine>>>,
    /// Requests in flight; informational only
    clients: AtomicUsize,
}

impl CacheClient {
    pub fn new(url: &str, ctx: Arc<CacheContext>) -> Self {
        Self {
            url: url.to_string(),
            ctx,
            engine: Mutex::new(None),
            clients: AtomicUsize::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn clients_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub async fn process_request<W>(&self, request: &CacheRequest, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let engine = self.engine().await?;

        let count = self.clients.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{} client(s) streaming {}", count, self.url);
        let result = engine.process(request, out).await;
        let count = self.clients.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("{} client(s) left on {}", count, self.url);

        result
    }

    async fn engine(&self) -> Result<Arc<CacheEngine>> {
        let mut slot = self.engine.lock().await;
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        let engine = CacheEngine::new(&self.url, self.ctx.clone()).await?;
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// Tear the current engine down. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let engine = self.engine.lock().await.take();
        if let Some(engine) = engine {
            engine.shutdown().await;
        }
    }
}
