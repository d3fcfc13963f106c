//! Per-URL cache engine.
//!
//! An engine answers requests for one URL from a mix of cached bytes and live
//! network bytes:
//!
//! - offset 0 with an empty cache streams from the network and appends every
//!   chunk to the sink;
//! - any other request first makes sure a background catch-up task is filling
//!   the sink, then replays the cached prefix and/or opens a network stream at
//!   the requested offset.
//!
//! Each request takes a new stream generation. Older loops notice they were
//! superseded and stop at their next chunk. Only one writer appends at a time:
//! once the catch-up task has been claimed, live loops stop appending.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::context::CacheContext;
use super::request::CacheRequest;
use super::sink::CacheSink;
use super::source::CacheSource;
use crate::constants::{BUFFER_SIZE, REPLAY_THRESHOLD};
use crate::utils::{ProxyCacheError, Result};

/// How a network stream treats the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caching {
    /// Append chunks while they are contiguous and nobody else is writing
    Append,
    /// Relay only
    Skip,
}

pub struct CacheEngine {
    url: String,
    ctx: Arc<CacheContext>,
    sink: Arc<dyn CacheSink>,
    /// Used for length/mime lookups; streams get their own sources
    meta_source: Mutex<Box<dyn CacheSource>>,
    shutdown: AtomicBool,
    active_stream: AtomicU64,
    catch_up_claimed: AtomicBool,
    catch_up: std::sync::Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl CacheEngine {
    pub async fn new(url: &str, ctx: Arc<CacheContext>) -> Result<Arc<Self>> {
        let sink = ctx.sink_factory.create(url, &ctx).await?;
        let meta_source = ctx.source_factory.create(url, ctx.clone());

        Ok(Arc::new(Self {
            url: url.to_string(),
            ctx,
            sink,
            meta_source: Mutex::new(meta_source),
            shutdown: AtomicBool::new(false),
            active_stream: AtomicU64::new(0),
            catch_up_claimed: AtomicBool::new(false),
            catch_up: std::sync::Mutex::new(None),
            released: AtomicBool::new(false),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Write a complete HTTP response for `request` to `out`.
    pub async fn process<W>(self: &Arc<Self>, request: &CacheRequest, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if self.is_shutdown() {
            return Err(ProxyCacheError::Shutdown(self.url.clone()));
        }

        let stream_id = self.active_stream.fetch_add(1, Ordering::SeqCst) + 1;
        self.ctx.stats.stream_started();
        let result = self.serve(request, out, stream_id).await;
        self.ctx.stats.stream_finished();
        result
    }

    async fn serve<W>(
        self: &Arc<Self>,
        request: &CacheRequest,
        out: &mut W,
        stream_id: u64,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (length, mime) = self.source_info().await;
        let cacheable = length.is_none_or(|len| len <= self.ctx.max_file_size);
        if !cacheable {
            info!(
                "{} is {:?} bytes, above the {} byte limit; streaming without caching",
                self.url, length, self.ctx.max_file_size
            );
        }

        let head = response_head(request, length, mime.as_deref());
        out.write_all(head.as_bytes()).await?;
        out.flush().await?;

        debug!(
            "Serving {} from offset {} (cached: {}, complete: {})",
            self.url,
            request.offset,
            self.sink.available(),
            self.sink.is_completed()
        );

        let caching = if cacheable { Caching::Append } else { Caching::Skip };
        if request.offset == 0 {
            self.respond_from_start(out, stream_id, caching).await
        } else {
            self.respond_from(out, request.offset, stream_id, caching).await
        }
    }

    /// Length and mime used for the response head.
    async fn source_info(&self) -> (Option<u64>, Option<String>) {
        if self.sink.is_completed() {
            let mime = self
                .ctx
                .storage
                .get(&self.url)
                .await
                .and_then(|info| info.known_mime().map(str::to_string));
            return (Some(self.sink.available()), mime);
        }

        let mut source = self.meta_source.lock().await;
        let length = match source.length().await {
            Ok(length) => length,
            Err(e) => {
                warn!("Could not determine length of {}: {}", self.url, e);
                None
            }
        };
        let mime = match source.mime().await {
            Ok(mime) => mime,
            Err(e) => {
                debug!("Could not determine mime of {}: {}", self.url, e);
                None
            }
        };
        (length, mime)
    }

    async fn respond_from_start<W>(
        self: &Arc<Self>,
        out: &mut W,
        stream_id: u64,
        caching: Caching,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if self.sink.available() == 0 {
            return self.stream_network(out, 0, stream_id, caching).await;
        }

        let cached = self.sink.available();
        let sent = self.replay_cached(out, 0, cached, stream_id).await?;
        if sent < cached {
            // Superseded while replaying
            return Ok(());
        }
        self.respond_from(out, sent, stream_id, caching).await
    }

    async fn respond_from<W>(
        self: &Arc<Self>,
        out: &mut W,
        mut offset: u64,
        stream_id: u64,
        caching: Caching,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if caching == Caching::Append {
            self.continue_cache_if_necessary().await;
        }

        loop {
            if !self.is_active(stream_id) {
                return Ok(());
            }

            if self.sink.is_completed() {
                let available = self.sink.available();
                if offset < available {
                    self.replay_cached(out, offset, available, stream_id).await?;
                }
                return Ok(());
            }

            let available = self.sink.available();

            if available == 0 {
                // The initial fetch may still be in flight; don't race it on disk.
                return self
                    .stream_network(out, offset, stream_id, Caching::Skip)
                    .await;
            }

            if offset < available && (offset as f64) < available as f64 * REPLAY_THRESHOLD {
                let sent = self.replay_cached(out, offset, available, stream_id).await?;
                if sent == offset {
                    return Ok(());
                }
                offset = sent;
                continue;
            }

            return self.stream_network(out, offset, stream_id, caching).await;
        }
    }

    /// Copy `[from, to)` from the sink to `out`; returns the offset reached.
    async fn replay_cached<W>(
        &self,
        out: &mut W,
        from: u64,
        to: u64,
        stream_id: u64,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut offset = from;

        while offset < to && self.is_active(stream_id) {
            let want = buffer.len().min((to - offset) as usize);
            let read = self.sink.read(&mut buffer[..want], offset).await?;
            if read == 0 {
                break;
            }
            out.write_all(&buffer[..read]).await?;
            offset += read as u64;
            self.ctx.stats.add_cache_bytes(read as u64);
        }
        out.flush().await?;

        debug!("Replayed {}..{} of {} from cache", from, offset, self.url);
        Ok(offset)
    }

    /// Relay the network from `offset` to `out`, appending to the sink when allowed.
    async fn stream_network<W>(
        self: &Arc<Self>,
        out: &mut W,
        offset: u64,
        stream_id: u64,
        caching: Caching,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut source = self.ctx.source_factory.create(&self.url, self.ctx.clone());
        let result = self
            .relay(source.as_mut(), out, offset, stream_id, caching)
            .await;
        source.close().await;
        result
    }

    async fn relay<W>(
        &self,
        source: &mut dyn CacheSource,
        out: &mut W,
        offset: u64,
        stream_id: u64,
        caching: Caching,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        source.open(offset).await?;

        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut position = offset;
        let mut appending = caching == Caching::Append;

        loop {
            if !self.is_active(stream_id) {
                debug!("Stream {} of {} superseded at {}", stream_id, self.url, position);
                return Ok(());
            }

            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            let chunk = &buffer[..read];

            out.write_all(chunk).await?;
            out.flush().await?;
            self.ctx.stats.add_network_bytes(read as u64);

            if appending && !self.catch_up_claimed.load(Ordering::SeqCst) {
                appending = self.append_live(position, chunk).await;
            }
            position += read as u64;
        }

        if appending && !self.sink.is_completed() {
            let total = source.length().await.ok().flatten();
            if total == Some(self.sink.available()) {
                self.complete_sink().await;
            }
        }
        Ok(())
    }

    /// Append a live chunk; returns whether the loop should keep appending.
    async fn append_live(&self, position: u64, chunk: &[u8]) -> bool {
        if self.sink.is_completed() {
            return false;
        }
        match self.sink.append_at(position, chunk).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(
                    "Stopped caching live stream of {} at {} (cache holds {})",
                    self.url,
                    position,
                    self.sink.available()
                );
                false
            }
            Err(e) => {
                warn!("Failed to cache {} at {}: {}", self.url, position, e);
                false
            }
        }
    }

    /// Launch the background catch-up task once per engine.
    async fn continue_cache_if_necessary(self: &Arc<Self>) {
        if self.sink.is_completed() {
            return;
        }
        if self
            .catch_up_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.ctx.stats.increment_catch_up();
        let (started_tx, started_rx) = oneshot::channel();
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.run_catch_up(started_tx).await;
        });
        if let Ok(mut slot) = self.catch_up.lock() {
            *slot = Some(handle);
        }

        // Hand-off only: wait until the task runs, not until it finishes.
        let _ = started_rx.await;
    }

    async fn run_catch_up(self: Arc<Self>, started: oneshot::Sender<()>) {
        let _ = started.send(());
        info!(
            "Catch-up caching started for {} at {}",
            self.url,
            self.sink.available()
        );

        match self.cache_remaining().await {
            Ok(()) => debug!("Catch-up caching finished for {}", self.url),
            Err(e) => {
                error!("Catch-up caching failed for {}: {}", self.url, e);
                self.ctx.notifier.error(&self.url, e);
            }
        }
    }

    /// Fill the sink up to the end of the resource, independent of any client.
    async fn cache_remaining(&self) -> Result<()> {
        let mut buffer = vec![0u8; BUFFER_SIZE];

        'resume: loop {
            if self.sink.is_completed() || self.catch_up_stopped() {
                return Ok(());
            }

            let start = self.sink.available();
            let mut source = self.ctx.source_factory.create(&self.url, self.ctx.clone());
            source.open(start).await?;
            let total = source.length().await.ok().flatten();
            if total.is_some_and(|total| start >= total) {
                source.close().await;
                break 'resume;
            }

            let mut position = start;
            loop {
                if self.catch_up_stopped() {
                    debug!("Catch-up for {} stopped at {}", self.url, position);
                    source.close().await;
                    return Ok(());
                }
                let read = match source.read(&mut buffer).await {
                    Ok(read) => read,
                    Err(e) => {
                        source.close().await;
                        return Err(e);
                    }
                };
                if read == 0 {
                    break;
                }
                if !self.sink.append_at(position, &buffer[..read]).await? {
                    debug!(
                        "Cache for {} moved to {} underneath catch-up, resuming",
                        self.url,
                        self.sink.available()
                    );
                    source.close().await;
                    continue 'resume;
                }
                position += read as u64;
            }
            source.close().await;

            // Completion needs a known length to compare against.
            if total == Some(self.sink.available()) {
                break 'resume;
            }
            warn!(
                "{} ended at {} bytes but {:?} were announced; leaving cache incomplete",
                self.url,
                self.sink.available(),
                total
            );
            return Ok(());
        }

        self.complete_sink().await;
        Ok(())
    }

    async fn complete_sink(&self) {
        if self.sink.is_completed() {
            return;
        }
        match self.sink.complete().await {
            Ok(()) => {
                self.ctx.stats.increment_completed();
                info!("Cached {} completely", self.url);
            }
            Err(e) => error!("Failed to complete cache file for {}: {}", self.url, e),
        }
    }

    fn catch_up_stopped(&self) -> bool {
        self.is_shutdown() || self.ctx.cancel.is_cancelled()
    }

    fn is_active(&self, stream_id: u64) -> bool {
        !self.is_shutdown() && self.active_stream.load(Ordering::SeqCst) == stream_id
    }

    /// Stop every stream, wait for the catch-up task, then release handles.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down cache engine for {}", self.url);

        let catch_up = self.catch_up.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = catch_up
            && let Err(e) = handle.await
        {
            warn!("Catch-up task for {} ended abnormally: {}", self.url, e);
        }
        self.release().await;
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        // Live loops may still hold the sink; a closed sink refuses their appends.
        self.sink.close().await;
        self.meta_source.lock().await.close().await;
        debug!("Released cache resources for {}", self.url);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Status line and headers for a response starting at `request.offset`.
pub(crate) fn response_head(
    request: &CacheRequest,
    length: Option<u64>,
    mime: Option<&str>,
) -> String {
    let ranged = request.ranged && length.is_some_and(|length| request.offset < length);
    let mut head = String::new();

    if ranged {
        head.push_str("HTTP/1.1 206 PARTIAL CONTENT\r\n");
    } else {
        head.push_str("HTTP/1.1 200 OK\r\n");
    }
    head.push_str("Accept-Ranges: bytes\r\n");
    if let Some(length) = length {
        head.push_str(&format!(
            "Content-Length: {}\r\n",
            length.saturating_sub(request.offset)
        ));
        if ranged {
            head.push_str(&format!(
                "Content-Range: bytes {}-{}/{}\r\n",
                request.offset,
                length.saturating_sub(1),
                length
            ));
        }
    }
    if let Some(mime) = mime {
        head.push_str(&format!("Content-Type: {}\r\n", mime));
    }
    head.push_str("Connection: close\r\n\r\n");
    head
}
