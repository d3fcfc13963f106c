use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::constants::DOWNLOAD_SUFFIX;

/// Disk reclamation policy applied whenever a cache file is accessed.
///
/// `accept` decides whether `file` survives a pass given the count and size
/// of the files already retained (newer ones). `touch` refreshes the file's
/// mtime and then walks the cache directory from newest to oldest, deleting
/// everything the policy rejects. Errors are logged and never returned.
pub trait DiskUsage: Send + Sync + Debug {
    fn accept(&self, file: &Path, file_size: u64, retained_count: u64, retained_size: u64) -> bool;

    fn touch(&self, file: &Path) {
        if let Err(e) = set_last_modified_now(file) {
            warn!("Failed to refresh mtime of {:?}: {}", file, e);
        }
        if let Err(e) = trim(self, file) {
            warn!("Failed to trim cache directory for {:?}: {}", file, e);
        }
    }
}

/// Keep at most `max` files.
#[derive(Debug, Clone, Copy)]
pub struct CountLimited {
    pub max: u64,
}

impl DiskUsage for CountLimited {
    fn accept(&self, _file: &Path, _file_size: u64, retained_count: u64, _retained_size: u64) -> bool {
        retained_count < self.max
    }
}

/// Keep the directory below `max` bytes.
#[derive(Debug, Clone, Copy)]
pub struct TotalSizeLimited {
    pub max: u64,
}

impl DiskUsage for TotalSizeLimited {
    fn accept(&self, _file: &Path, _file_size: u64, _retained_count: u64, retained_size: u64) -> bool {
        retained_size < self.max
    }
}

/// Drop any single file at or above `max` bytes.
#[derive(Debug, Clone, Copy)]
pub struct FileSizeLimited {
    pub max: u64,
}

impl DiskUsage for FileSizeLimited {
    fn accept(&self, _file: &Path, file_size: u64, _retained_count: u64, _retained_size: u64) -> bool {
        file_size < self.max
    }
}

/// Never evicts anything and leaves mtimes alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl DiskUsage for Unlimited {
    fn accept(&self, _file: &Path, _file_size: u64, _retained_count: u64, _retained_size: u64) -> bool {
        true
    }

    fn touch(&self, _file: &Path) {}
}

/// Apply every policy in order, off the async runtime.
pub async fn touch_all(usages: &[Arc<dyn DiskUsage>], file: &Path) {
    if usages.is_empty() {
        return;
    }
    let usages = usages.to_vec();
    let file = file.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        for usage in &usages {
            usage.touch(&file);
        }
    })
    .await;
    if let Err(e) = result {
        warn!("Disk usage task failed: {}", e);
    }
}

struct Entry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn trim<U: DiskUsage + ?Sized>(usage: &U, file: &Path) -> io::Result<()> {
    let Some(root) = file.parent() else {
        return Ok(());
    };

    let entries = list_newest_first(root)?;
    let mut retained_count = 0u64;
    let mut retained_size = 0u64;

    for entry in entries {
        let keep = usage.accept(&entry.path, entry.size, retained_count, retained_size)
            || is_downloading(&entry.path);
        if keep {
            retained_count += 1;
            retained_size += entry.size;
            continue;
        }

        match fs::remove_file(&entry.path) {
            Ok(()) => info!(
                "Evicted {:?} ({} bytes, {} files / {} bytes retained)",
                entry.path, entry.size, retained_count, retained_size
            ),
            Err(e) => warn!("Failed to evict {:?}: {}", entry.path, e),
        }
    }

    Ok(())
}

fn is_downloading(path: &Path) -> bool {
    path.to_string_lossy().ends_with(DOWNLOAD_SUFFIX)
}

fn list_newest_first(root: &Path) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(root)? {
        let dir_entry = dir_entry?;
        let metadata = match dir_entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) => {
                debug!("Skipping {:?}: {}", dir_entry.path(), e);
                continue;
            }
        };
        entries.push(Entry {
            path: dir_entry.path(),
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    entries.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(entries)
}

/// Set the file's mtime to now.
///
/// Some filesystems ignore explicit mtime updates; when the time did not move,
/// rewrite the last byte so the write itself bumps it.
pub(crate) fn set_last_modified_now(file: &Path) -> io::Result<()> {
    let now = SystemTime::now();
    let updated = File::options()
        .write(true)
        .open(file)
        .and_then(|handle| handle.set_modified(now));

    let stale = match fs::metadata(file)?.modified() {
        Ok(modified) => now
            .duration_since(modified)
            .is_ok_and(|age| age > Duration::from_secs(1)),
        Err(_) => true,
    };

    if updated.is_err() || stale {
        debug!("Falling back to rewriting last byte of {:?}", file);
        rewrite_last_byte(file)?;
    }
    Ok(())
}

fn rewrite_last_byte(file: &Path) -> io::Result<()> {
    let length = fs::metadata(file)?.len();
    if length == 0 {
        fs::remove_file(file)?;
        File::create(file)?;
        return Ok(());
    }

    let mut handle = OpenOptions::new().read(true).write(true).open(file)?;
    handle.seek(SeekFrom::Start(length - 1))?;
    let mut last = [0u8; 1];
    handle.read_exact(&mut last)?;
    handle.seek(SeekFrom::Start(length - 1))?;
    handle.write_all(&last)?;
    Ok(())
}
