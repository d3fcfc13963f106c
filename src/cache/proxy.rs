use futures::future::join_all;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bypass::BypassGuard;
use super::client::CacheClient;
use super::context::CacheContext;
use super::request::CacheRequest;
use crate::constants::{HOST, PING, PONG};
use crate::utils::{ProxyCacheError, Result};

/// Seconds between two statistics reports in the log
const STATS_INTERVAL_SECS: u64 = 60;

/// Loopback HTTP listener that routes requests to per-URL cache clients.
pub struct CacheProxy {
    ctx: Arc<CacheContext>,
    port: u16,
    clients: RwLock<HashMap<String, Arc<CacheClient>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    bypass: Mutex<Option<BypassGuard>>,
    stopped: AtomicBool,
}

impl CacheProxy {
    /// Bind an ephemeral loopback port and start accepting connections.
    ///
    /// Returns once the accept loop is running.
    pub async fn start(ctx: Arc<CacheContext>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((HOST, 0))
            .await
            .map_err(ProxyCacheError::Bind)?;
        let port = listener.local_addr().map_err(ProxyCacheError::Bind)?.port();
        let bypass = ctx.bypass.install(HOST, port);

        let proxy = Arc::new(Self {
            ctx,
            port,
            clients: RwLock::new(HashMap::new()),
            accept_task: Mutex::new(None),
            stats_task: Mutex::new(None),
            bypass: Mutex::new(Some(bypass)),
            stopped: AtomicBool::new(false),
        });

        let (started_tx, started_rx) = oneshot::channel();
        let accept_proxy = proxy.clone();
        let handle = tokio::spawn(async move {
            accept_proxy.accept_loop(listener, started_tx).await;
        });
        if let Ok(mut slot) = proxy.accept_task.lock() {
            *slot = Some(handle);
        }
        if started_rx.await.is_err() {
            warn!("Accept loop exited before signalling start");
        }

        proxy.start_stats_reporting();
        info!("Cache proxy listening on {}:{}", HOST, port);
        Ok(proxy)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL the player should open instead of `url`.
    pub fn proxy_url(&self, url: &str) -> String {
        format!(
            "http://{}:{}/{}",
            HOST,
            self.port,
            utf8_percent_encode(url, NON_ALPHANUMERIC)
        )
    }

    fn ping_url(&self) -> String {
        format!("http://{}:{}/{}", HOST, self.port, PING)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, started: oneshot::Sender<()>) {
        let _ = started.send(());
        let cancel = self.ctx.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let proxy = self.clone();
                        tokio::spawn(async move {
                            proxy.handle_connection(socket).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        debug!("Accept loop on port {} stopped", self.port);
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream) {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let request = match CacheRequest::read_from(&mut reader).await {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping connection with unreadable request: {}", e);
                return;
            }
        };

        if request.url == PING {
            self.ctx.stats.increment_ping();
            let response = format!("HTTP/1.1 200 OK\r\n\r\n{}", PONG);
            if let Err(e) = write_half.write_all(response.as_bytes()).await {
                debug!("Failed to answer ping: {}", e);
            }
            let _ = write_half.shutdown().await;
            return;
        }

        debug!("Request for {} at offset {}", request.url, request.offset);
        self.ctx.stats.increment_request(request.offset);
        let client = self.client(&request.url).await;

        match client.process_request(&request, &mut write_half).await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                debug!("Player closed connection for {}: {}", request.url, e);
            }
            Err(e) => {
                self.ctx.stats.increment_failed();
                error!("Failed to serve {}: {}", request.url, e);
                self.ctx.notifier.error(&request.url, e);
            }
        }
        let _ = write_half.shutdown().await;
    }

    async fn client(&self, url: &str) -> Arc<CacheClient> {
        if let Some(client) = self.clients.read().await.get(url) {
            return client.clone();
        }
        let mut clients = self.clients.write().await;
        clients
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(CacheClient::new(url, self.ctx.clone())))
            .clone()
    }

    /// Check that the listener answers on its own loopback URL.
    ///
    /// Every attempt gets twice the timeout of the previous one.
    pub async fn ping(self: &Arc<Self>) -> bool {
        let mut timeout = self.ctx.ping_timeout;

        for attempt in 1..=self.ctx.max_attempts {
            let proxy = self.clone();
            let mut probe = tokio::spawn(async move { proxy.ping_once().await });

            match tokio::time::timeout(timeout, &mut probe).await {
                Ok(Ok(Ok(true))) => return true,
                Ok(Ok(Ok(false))) => warn!("Ping attempt {} got an unexpected answer", attempt),
                Ok(Ok(Err(e))) => warn!("Ping attempt {} failed: {}", attempt, e),
                Ok(Err(e)) => warn!("Ping attempt {} task failed: {}", attempt, e),
                Err(_) => {
                    probe.abort();
                    warn!("Ping attempt {} timed out after {:?}", attempt, timeout);
                }
            }
            timeout *= 2;
        }

        error!(
            "Proxy on port {} unreachable after {} attempts",
            self.port, self.ctx.max_attempts
        );
        false
    }

    async fn ping_once(&self) -> Result<bool> {
        let ping_url = self.ping_url();
        let mut source = self.ctx.source_factory.create(&ping_url, self.ctx.clone());
        source.open(0).await?;

        let mut body = Vec::new();
        let mut buffer = [0u8; 64];
        let result = loop {
            match source.read(&mut buffer).await {
                Ok(0) => break Ok(()),
                Ok(read) => {
                    body.extend_from_slice(&buffer[..read]);
                    if body.len() > PONG.len() {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        source.close().await;
        result?;

        Ok(body == PONG.as_bytes())
    }

    /// Tear down the client for one URL.
    pub async fn destroy(&self, url: &str) {
        let client = self.clients.write().await.remove(url);
        if let Some(client) = client {
            debug!("Destroying client for {}", url);
            client.shutdown().await;
        }
    }

    /// Stop accepting, tear down every client. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down cache proxy on port {}", self.port);

        self.ctx.cancel.cancel();
        for slot in [&self.accept_task, &self.stats_task] {
            if let Some(handle) = slot.lock().ok().and_then(|mut slot| slot.take()) {
                handle.abort();
            }
        }
        if let Ok(mut bypass) = self.bypass.lock() {
            bypass.take();
        }

        let clients: Vec<Arc<CacheClient>> =
            self.clients.write().await.drain().map(|(_, c)| c).collect();
        join_all(clients.iter().map(|client| client.shutdown())).await;

        info!("{}", self.ctx.stats.format_report());
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Log the statistics report periodically.
    fn start_stats_reporting(&self) {
        let stats = self.ctx.stats.clone();
        let cancel = self.ctx.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => info!("{}", stats.format_report()),
                }
            }
        });
        if let Ok(mut slot) = self.stats_task.lock() {
            *slot = Some(handle);
        }
    }
}
