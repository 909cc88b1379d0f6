use std::{
    future::Future,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

// Retry configuration constants
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_MS: u64 = 100;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Durable key/value cache rooted at a directory.
///
/// Keys are slash-separated relative paths (`golang.org/x/mod/@v/list`) and
/// are mirrored one-to-one as files under the root, so the directory tree is
/// the only index. Writers never expose partial content: every `put` lands in
/// a sibling temp file first and is renamed into place.
#[derive(Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: PathBuf) -> Self {
        FilesystemStorage { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache root {}", self.root.display()))
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Resolves a key after checking it stays inside the root.
    pub fn resolve_key(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.resolve(key))
    }

    /// Modification time of the entry, or `None` when it does not exist.
    pub async fn stat(&self, key: &str) -> Result<Option<SystemTime>> {
        let path = self.resolve_key(key)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {
                let modified = metadata
                    .modified()
                    .with_context(|| format!("reading mtime of {}", path.display()))?;
                Ok(Some(modified))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::from(e).context(format!("stat {}", path.display()))),
        }
    }

    pub async fn open_read(&self, key: &str) -> Result<Option<FileHandle>> {
        let path = self.resolve_key(key)?;

        let target: &Path = &path;
        let file = match with_retry("open_read", target, move || async move {
            File::open(target).await
        })
        .await
        {
            Ok(file) => file,
            Err((e, _)) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err((e, attempts)) => {
                return Err(anyhow::Error::from(e).context(format!(
                    "opening cache entry {} (after {} attempts)",
                    path.display(),
                    attempts
                )));
            }
        };

        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("reading metadata {}", path.display()))?;
        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(FileHandle {
            file,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            path,
        }))
    }

    /// Reads a whole entry; the handle is released before returning.
    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.open_read(key).await? {
            Some(mut handle) => Ok(Some(handle.read_all().await?)),
            None => Ok(None),
        }
    }

    /// Atomically replaces the entry at `key` with `bytes`.
    ///
    /// Concurrent readers observe either the previous file (or its absence)
    /// or the complete new content.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut temp = self.create_temp_writer(key).await?;
        if let Err(err) = temp.file_mut().write_all(bytes).await {
            let tmp_path = temp.tmp_path.clone();
            if let Err(rollback_err) = temp.rollback().await {
                tracing::debug!(error = %rollback_err, "rollback after failed write also failed");
            }
            return Err(anyhow::Error::from(err)
                .context(format!("writing temp file {}", tmp_path.display())));
        }
        temp.commit().await
    }

    pub async fn create_temp_writer(&self, key: &str) -> Result<TempFile> {
        let final_path = self.resolve_key(key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache dir {}", parent.display()))?;
        }

        let tmp_path = temp_path_for(&final_path);

        let target: &Path = &tmp_path;
        let file = with_retry("create_temp_writer", target, move || async move {
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(target)
                .await
        })
        .await
        .map_err(|(e, attempts)| {
            anyhow::Error::from(e).context(format!(
                "creating temp file {} (after {} attempts)",
                tmp_path.display(),
                attempts
            ))
        })?;

        Ok(TempFile {
            tmp_path,
            final_path,
            file,
        })
    }
}

pub struct FileHandle {
    pub file: File,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub path: PathBuf,
}

impl FileHandle {
    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size as usize);
        self.file
            .read_to_end(&mut buf)
            .await
            .with_context(|| format!("reading cache entry {}", self.path.display()))?;
        Ok(buf)
    }
}

pub struct TempFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
}

impl TempFile {
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub async fn commit(self) -> Result<()> {
        let Self {
            tmp_path,
            final_path,
            mut file,
        } = self;

        file.flush()
            .await
            .with_context(|| format!("flushing {}", tmp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", tmp_path.display()))?;
        drop(file);

        let (from, to): (&Path, &Path) = (&tmp_path, &final_path);
        match with_retry("commit", from, move || async move { fs::rename(from, to).await }).await
        {
            Ok(()) => Ok(()),
            Err((e, attempts)) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(anyhow::Error::from(e).context(format!(
                    "moving {} to {} (after {} attempts)",
                    tmp_path.display(),
                    final_path.display(),
                    attempts
                )))
            }
        }
    }

    pub async fn rollback(self) -> Result<()> {
        let Self { tmp_path, file, .. } = self;
        drop(file);
        match fs::remove_file(&tmp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("removing temp file {}", tmp_path.display()))),
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("empty cache key");
    }
    if key.contains('\\') || key.contains('\0') {
        bail!("cache key {key:?} contains a forbidden character");
    }
    if key.split('/').any(|segment| segment.is_empty()) {
        bail!("cache key {key:?} contains an empty segment");
    }
    let all_normal = Path::new(key)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !all_normal {
        bail!("cache key {key:?} escapes the cache root");
    }
    Ok(())
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_name = match final_path.file_name().and_then(|s| s.to_str()) {
        Some(name) => format!("{name}.tmp-{pid}-{timestamp}-{seq}"),
        None => format!("tmp-{pid}-{timestamp}-{seq}"),
    };
    final_path.with_file_name(tmp_name)
}

/// Runs `op` until it succeeds, fails with a non-transient error or runs
/// out of attempts. The error carries the number of attempts made.
async fn with_retry<T, F, Fut>(
    operation: &str,
    path: &Path,
    mut op: F,
) -> Result<T, (std::io::Error, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) && attempt < MAX_ATTEMPTS => {
                tracing::debug!(
                    "{} attempt {}/{} failed with {:?}, retrying in {}ms: {}",
                    operation,
                    attempt,
                    MAX_ATTEMPTS,
                    e.kind(),
                    BACKOFF_MS,
                    path.display()
                );
                tokio::time::sleep(Duration::from_millis(BACKOFF_MS)).await;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

/// Determines if an I/O error should be retried
fn should_retry(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
        || matches!(error.raw_os_error(), Some(16) | Some(11))
    // 16 = EBUSY (Device or resource busy)
    // 11 = EAGAIN (Resource temporarily unavailable)
}
