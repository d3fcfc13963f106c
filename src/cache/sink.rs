use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::callback::Notifier;
use super::context::CacheContext;
use super::storage::CacheStorage;
use super::usage::{DiskUsage, touch_all};
use crate::utils::{ProxyCacheError, Result};

/// Local, resumable storage for one URL's bytes.
///
/// A sink starts out downloading and becomes complete exactly once. Reads and
/// appends may interleave; appends are serialized by the sink itself.
#[async_trait]
pub trait CacheSink: Send + Sync {
    /// Bytes currently stored.
    fn available(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`, never past `available()`.
    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Append at the current end. Fails once the sink is complete.
    async fn append(&self, data: &[u8]) -> Result<()>;

    /// Append only if `offset` is the current end; returns `false` otherwise.
    async fn append_at(&self, offset: u64, data: &[u8]) -> Result<bool>;

    /// Promote to the complete state. No-op when already complete.
    async fn complete(&self) -> Result<()>;

    fn is_completed(&self) -> bool;

    /// Release file handles and refuse further writes. Safe to call repeatedly.
    async fn close(&self);
}

/// Creates a fresh sink per engine.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create(&self, url: &str, ctx: &CacheContext) -> Result<Arc<dyn CacheSink>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileSinkFactory;

#[async_trait]
impl SinkFactory for FileSinkFactory {
    async fn create(&self, url: &str, ctx: &CacheContext) -> Result<Arc<dyn CacheSink>> {
        let sink = FileSink::open(
            url,
            ctx.cache_file(url),
            ctx.download_file(url),
            SinkHooks {
                usages: ctx.usages.clone(),
                notifier: Some(ctx.notifier.clone()),
                storage: Some(ctx.storage.clone()),
                callback_interval: ctx.callback_interval,
            },
        )
        .await?;
        Ok(Arc::new(sink))
    }
}

/// Side effects a file sink triggers while it grows and completes.
#[derive(Clone, Default)]
pub struct SinkHooks {
    pub usages: Vec<Arc<dyn DiskUsage>>,
    pub notifier: Option<Notifier>,
    /// Used to look up the total length for progress percentages
    pub storage: Option<Arc<dyn CacheStorage>>,
    pub callback_interval: Duration,
}

struct Handles {
    path: PathBuf,
    reader: Option<File>,
    writer: Option<File>,
}

impl Handles {
    async fn reader(&mut self) -> Result<&mut File> {
        if self.reader.is_none() {
            self.reader = Some(File::open(&self.path).await?);
        }
        self.reader
            .as_mut()
            .ok_or_else(|| ProxyCacheError::Io(std::io::ErrorKind::NotFound.into()))
    }

    async fn writer(&mut self) -> Result<&mut File> {
        if self.writer.is_none() {
            self.writer = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?,
            );
        }
        self.writer
            .as_mut()
            .ok_or_else(|| ProxyCacheError::Io(std::io::ErrorKind::NotFound.into()))
    }

    async fn release(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.flush().await
        {
            warn!("Failed to flush {:?}: {}", self.path, e);
        }
        self.reader = None;
    }
}

#[derive(Default)]
struct Progress {
    percent: u8,
    last_sent: Option<Instant>,
}

/// Sink backed by a `<name>.download` file that is renamed to `<name>` on completion.
pub struct FileSink {
    url: String,
    complete_path: PathBuf,
    handles: Mutex<Handles>,
    length: AtomicU64,
    completed: AtomicBool,
    /// Set under the handle lock, so no write can follow a close
    closed: AtomicBool,
    hooks: SinkHooks,
    progress: StdMutex<Progress>,
}

impl FileSink {
    pub async fn open(
        url: &str,
        complete_path: PathBuf,
        download_path: PathBuf,
        hooks: SinkHooks,
    ) -> Result<Self> {
        if let Some(parent) = complete_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let completed = fs::try_exists(&complete_path).await.unwrap_or(false);
        let path = if completed {
            complete_path.clone()
        } else {
            download_path
        };

        // Touch the file so `available()` and readers work before the first append.
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let length = writer.metadata().await?.len();

        debug!(
            "Opened cache sink {:?} ({} bytes, completed: {})",
            path, length, completed
        );

        Ok(Self {
            url: url.to_string(),
            complete_path,
            handles: Mutex::new(Handles {
                path,
                reader: None,
                writer: Some(writer),
            }),
            length: AtomicU64::new(length),
            completed: AtomicBool::new(completed),
            closed: AtomicBool::new(false),
            hooks,
            progress: StdMutex::new(Progress::default()),
        })
    }

    pub fn complete_path(&self) -> &Path {
        &self.complete_path
    }

    fn closed_error(&self) -> ProxyCacheError {
        ProxyCacheError::Shutdown(self.url.clone())
    }

    async fn write_locked(&self, handles: &mut Handles, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        if self.completed.load(Ordering::SeqCst) {
            return Err(ProxyCacheError::SinkCompleted(
                self.complete_path.display().to_string(),
            ));
        }
        let writer = handles.writer().await?;
        writer.write_all(data).await?;
        writer.flush().await?;
        self.length.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn notify_progress(&self) {
        let Some(notifier) = &self.hooks.notifier else {
            return;
        };
        if !notifier.has_callback(&self.url) {
            return;
        }
        let total = match &self.hooks.storage {
            Some(storage) => storage
                .get(&self.url)
                .await
                .and_then(|info| info.known_length()),
            None => None,
        };
        let Some(total) = total else {
            return;
        };

        let percent = ((self.available() as f64 / total as f64) * 100.0).min(100.0) as u8;
        let send = match self.progress.lock() {
            Ok(mut progress) => {
                let due = progress
                    .last_sent
                    .is_none_or(|sent| sent.elapsed() >= self.hooks.callback_interval);
                if percent > progress.percent && percent < 100 && due {
                    progress.percent = percent;
                    progress.last_sent = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        };
        if send {
            notifier.progress(&self.url, percent, false);
        }
    }

    async fn promote(&self, handles: &mut Handles) -> Result<()> {
        let download_path = handles.path.clone();
        handles.release().await;

        if let Err(e) = fs::rename(&download_path, &self.complete_path).await {
            warn!(
                "Rename {:?} -> {:?} failed ({}), copying instead",
                download_path, self.complete_path, e
            );
            fs::copy(&download_path, &self.complete_path).await?;
            fs::remove_file(&download_path).await?;
        }

        handles.path = self.complete_path.clone();
        handles.writer().await?;
        handles.reader().await?;
        Ok(())
    }
}

#[async_trait]
impl CacheSink for FileSink {
    fn available(&self) -> u64 {
        self.length.load(Ordering::SeqCst)
    }

    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let available = self.available();
        if offset >= available || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((available - offset) as usize);

        let mut handles = self.handles.lock().await;
        let reader = handles.reader().await?;
        reader.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < want {
            let n = reader.read(&mut buf[filled..want]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn append(&self, data: &[u8]) -> Result<()> {
        {
            let mut handles = self.handles.lock().await;
            self.write_locked(&mut handles, data).await?;
        }
        self.notify_progress().await;
        Ok(())
    }

    async fn append_at(&self, offset: u64, data: &[u8]) -> Result<bool> {
        {
            let mut handles = self.handles.lock().await;
            if self.closed.load(Ordering::SeqCst) || self.available() != offset {
                return Ok(false);
            }
            self.write_locked(&mut handles, data).await?;
        }
        self.notify_progress().await;
        Ok(true)
    }

    async fn complete(&self) -> Result<()> {
        {
            let mut handles = self.handles.lock().await;
            if self.completed.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(self.closed_error());
            }
            self.promote(&mut handles).await?;
            self.completed.store(true, Ordering::SeqCst);
        }

        info!(
            "Cache file complete: {:?} ({} bytes)",
            self.complete_path,
            self.available()
        );
        touch_all(&self.hooks.usages, &self.complete_path).await;
        if let Some(notifier) = &self.hooks.notifier {
            notifier.progress(&self.url, 100, true);
        }
        Ok(())
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let mut handles = self.handles.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        handles.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::callback::CacheEvent;
    use crate::cache::metadata::SourceInfo;
    use crate::cache::storage::MemoryStorage;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const URL: &str = "http://example.com/video.mp4";

    async fn open_sink(dir: &Path, hooks: SinkHooks) -> FileSink {
        FileSink::open(
            URL,
            dir.join("video.mp4"),
            dir.join("video.mp4.download"),
            hooks,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_available_grows_with_appends() {
        let temp_dir = TempDir::new().unwrap();
        let sink = open_sink(temp_dir.path(), SinkHooks::default()).await;

        let mut expected = 0u64;
        let mut previous = sink.available();
        assert_eq!(previous, 0);

        for size in [1usize, 100, 4096, 7, 0, 32 * 1024] {
            sink.append(&vec![0xAB; size]).await.unwrap();
            expected += size as u64;
            assert!(sink.available() >= previous);
            assert_eq!(sink.available(), expected);
            previous = sink.available();
        }

        let on_disk = std::fs::metadata(temp_dir.path().join("video.mp4.download"))
            .unwrap()
            .len();
        assert_eq!(on_disk, expected);
    }

    #[tokio::test]
    async fn test_read_is_bounded_by_available() {
        let temp_dir = TempDir::new().unwrap();
        let sink = open_sink(temp_dir.path(), SinkHooks::default()).await;
        sink.append(b"0123456789").await.unwrap();

        let mut buf = [0u8; 32];
        let n = sink.read(&mut buf, 4).await.unwrap();
        assert_eq!(&buf[..n], b"456789");

        assert_eq!(sink.read(&mut buf, 10).await.unwrap(), 0);
        assert_eq!(sink.read(&mut buf, 99).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_at_checks_contiguity() {
        let temp_dir = TempDir::new().unwrap();
        let sink = open_sink(temp_dir.path(), SinkHooks::default()).await;

        assert!(sink.append_at(0, b"abc").await.unwrap());
        assert!(!sink.append_at(0, b"abc").await.unwrap());
        assert!(!sink.append_at(5, b"abc").await.unwrap());
        assert!(sink.append_at(3, b"def").await.unwrap());
        assert_eq!(sink.available(), 6);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let notifier = Notifier::start();
        let (tx, mut rx) = mpsc::unbounded_channel::<CacheEvent>();
        notifier.register(URL, Arc::new(tx));

        let sink = open_sink(
            temp_dir.path(),
            SinkHooks {
                notifier: Some(notifier.clone()),
                ..SinkHooks::default()
            },
        )
        .await;
        sink.append(b"hello").await.unwrap();
        assert!(!sink.is_completed());

        sink.complete().await.unwrap();
        sink.complete().await.unwrap();

        assert!(sink.is_completed());
        assert!(temp_dir.path().join("video.mp4").exists());
        assert!(!temp_dir.path().join("video.mp4.download").exists());
        assert_eq!(sink.available(), 5);

        let mut buf = [0u8; 5];
        sink.read(&mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Exactly one finished notification
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(CacheEvent::Progress {
                percent: 100,
                finished: true,
                ..
            })
        ));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_append_after_complete_fails() {
        let temp_dir = TempDir::new().unwrap();
        let sink = open_sink(temp_dir.path(), SinkHooks::default()).await;
        sink.append(b"done").await.unwrap();
        sink.complete().await.unwrap();

        let err = sink.append(b"more").await.unwrap_err();
        assert!(matches!(err, ProxyCacheError::SinkCompleted(_)));
        assert_eq!(sink.available(), 4);
    }

    #[tokio::test]
    async fn test_closed_sink_refuses_writes() {
        let temp_dir = TempDir::new().unwrap();
        let sink = open_sink(temp_dir.path(), SinkHooks::default()).await;
        sink.append(b"head").await.unwrap();
        sink.close().await;

        assert!(!sink.append_at(4, b"tail").await.unwrap());
        assert!(matches!(
            sink.append(b"tail").await.unwrap_err(),
            ProxyCacheError::Shutdown(_)
        ));
        assert!(matches!(
            sink.complete().await.unwrap_err(),
            ProxyCacheError::Shutdown(_)
        ));
        assert!(!sink.is_completed());
        assert!(!temp_dir.path().join("video.mp4").exists());

        let mut buf = [0u8; 8];
        let n = sink.read(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"head");
    }

    #[tokio::test]
    async fn test_reopen_resumes_partial_and_complete_files() {
        let temp_dir = TempDir::new().unwrap();
        {
            let sink = open_sink(temp_dir.path(), SinkHooks::default()).await;
            sink.append(b"partial").await.unwrap();
            sink.close().await;
            sink.close().await;
        }

        let sink = open_sink(temp_dir.path(), SinkHooks::default()).await;
        assert!(!sink.is_completed());
        assert_eq!(sink.available(), 7);
        sink.append(b" data").await.unwrap();
        sink.complete().await.unwrap();
        sink.close().await;

        let sink = open_sink(temp_dir.path(), SinkHooks::default()).await;
        assert!(sink.is_completed());
        assert_eq!(sink.available(), 12);
    }

    #[tokio::test]
    async fn test_progress_is_throttled_and_increasing() {
        let temp_dir = TempDir::new().unwrap();
        let notifier = Notifier::start();
        let (tx, mut rx) = mpsc::unbounded_channel::<CacheEvent>();
        notifier.register(URL, Arc::new(tx));
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put(URL, SourceInfo::new(URL, None, Some(100)))
            .await
            .unwrap();

        let sink = open_sink(
            temp_dir.path(),
            SinkHooks {
                notifier: Some(notifier.clone()),
                storage: Some(storage),
                callback_interval: Duration::from_secs(3600),
                ..SinkHooks::default()
            },
        )
        .await;

        sink.append(&[0u8; 10]).await.unwrap();
        sink.append(&[0u8; 10]).await.unwrap();
        sink.append(&[0u8; 80]).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(CacheEvent::Progress {
                percent: 10,
                finished: false,
                ..
            })
        ));
        // 20% is inside the interval and 100% is left to `complete()`
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }
}
