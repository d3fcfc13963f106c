use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::utils::ProxyCacheError;

/// Progress and failure notifications for one cached URL.
pub trait CacheCallback: Send + Sync {
    /// `percent` is 0-100; `finished` is set once the cache file is complete.
    fn on_progress(&self, url: &str, percent: u8, finished: bool);

    fn on_error(&self, url: &str, error: &ProxyCacheError);
}

/// Event as delivered through a channel-backed callback.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Progress {
        url: String,
        percent: u8,
        finished: bool,
    },
    Error {
        url: String,
        message: String,
    },
}

/// What travels from the engine to the dispatcher task.
enum Dispatch {
    Progress {
        url: String,
        percent: u8,
        finished: bool,
    },
    Error {
        url: String,
        error: ProxyCacheError,
    },
}

impl Dispatch {
    fn url(&self) -> &str {
        match self {
            Self::Progress { url, .. } | Self::Error { url, .. } => url,
        }
    }
}

/// Forwards every event into a channel, for callers that prefer polling.
impl CacheCallback for mpsc::UnboundedSender<CacheEvent> {
    fn on_progress(&self, url: &str, percent: u8, finished: bool) {
        let _ = self.send(CacheEvent::Progress {
            url: url.to_string(),
            percent,
            finished,
        });
    }

    fn on_error(&self, url: &str, error: &ProxyCacheError) {
        let _ = self.send(CacheEvent::Error {
            url: url.to_string(),
            message: error.to_string(),
        });
    }
}

type CallbackMap = HashMap<String, Arc<dyn CacheCallback>>;

/// Delivery port between the engine and user callbacks.
///
/// Events go through a single dispatcher task, so callbacks never run on a
/// streaming task and events for one URL arrive in the order they were sent.
#[derive(Clone)]
pub struct Notifier {
    callbacks: Arc<RwLock<CallbackMap>>,
    sender: mpsc::UnboundedSender<Dispatch>,
}

impl Notifier {
    /// Create the notifier and spawn its dispatcher on the current runtime.
    pub fn start() -> Self {
        let callbacks: Arc<RwLock<CallbackMap>> = Arc::new(RwLock::new(HashMap::new()));
        let (sender, mut receiver) = mpsc::unbounded_channel::<Dispatch>();

        let registry = callbacks.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let callback = registry
                    .read()
                    .ok()
                    .and_then(|map| map.get(event.url()).cloned());
                let Some(callback) = callback else {
                    continue;
                };
                match &event {
                    Dispatch::Progress {
                        url,
                        percent,
                        finished,
                    } => callback.on_progress(url, *percent, *finished),
                    Dispatch::Error { url, error } => callback.on_error(url, error),
                }
            }
            debug!("Notifier dispatcher stopped");
        });

        Self { callbacks, sender }
    }

    pub fn register(&self, url: &str, callback: Arc<dyn CacheCallback>) {
        if let Ok(mut map) = self.callbacks.write() {
            map.insert(url.to_string(), callback);
        }
    }

    pub fn unregister(&self, url: &str) {
        if let Ok(mut map) = self.callbacks.write() {
            map.remove(url);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.callbacks.write() {
            map.clear();
        }
    }

    pub fn has_callback(&self, url: &str) -> bool {
        self.callbacks
            .read()
            .map(|map| map.contains_key(url))
            .unwrap_or(false)
    }

    pub fn progress(&self, url: &str, percent: u8, finished: bool) {
        if !self.has_callback(url) {
            return;
        }
        let event = Dispatch::Progress {
            url: url.to_string(),
            percent: percent.min(100),
            finished,
        };
        if self.sender.send(event).is_err() {
            warn!("Notifier dispatcher is gone, dropping progress for {}", url);
        }
    }

    pub fn error(&self, url: &str, error: ProxyCacheError) {
        if !self.has_callback(url) {
            return;
        }
        let event = Dispatch::Error {
            url: url.to_string(),
            error,
        };
        if self.sender.send(event).is_err() {
            warn!("Notifier dispatcher is gone, dropping error for {}", url);
        }
    }
}
