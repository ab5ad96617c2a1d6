//! File Cache Module
//!
//! Durable storage for byte payloads under string keys. Keys are hashed to
//! fixed-length filenames in a flat cache directory; every successful read
//! or write refreshes the key's TTL in the eviction queue, and the queue's
//! eviction callback deletes the backing file.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::HASH_HEX_LEN;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::queue::ExpiryQueue;

// == Capability Types ==
/// Sink for failures on background paths (eviction unlink, write-back),
/// where there is no caller to return to.
pub type ErrorSink = Arc<dyn Fn(&CacheError) + Send + Sync>;

type ByteGenerator = Arc<dyn Fn(&str) -> Result<Vec<u8>> + Send + Sync>;
type AsyncByteGenerator = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

// == Key Derivation ==
/// Maps a caller-supplied key to its fixed-length hexadecimal filename.
pub(crate) fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

// == Builder ==
/// Builds a [`FileCache`] from a [`CacheConfig`] plus optional capabilities.
pub struct FileCacheBuilder {
    config: CacheConfig,
    error_sink: Option<ErrorSink>,
    generator: Option<ByteGenerator>,
    generator_async: Option<AsyncByteGenerator>,
}

impl FileCacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            error_sink: None,
            generator: None,
            generator_async: None,
        }
    }

    /// Routes non-fatal asynchronous failures to `handler` instead of the
    /// default `error!` log line.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        self.error_sink = Some(Arc::new(handler));
        self
    }

    /// Consulted by [`FileCache::blocking_get`] when a key has no backing
    /// file. The produced bytes are returned as-is and not written back.
    pub fn miss_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.generator = Some(Arc::new(generator));
        self
    }

    /// Asynchronous counterpart of
    /// [`miss_generator`](Self::miss_generator), consulted by
    /// [`FileCache::get`].
    pub fn miss_generator_async<F>(mut self, generator: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync + 'static,
    {
        self.generator_async = Some(Arc::new(generator));
        self
    }

    /// Validates the configuration, registers the eviction callback, and
    /// unless `skip_initial_scan` is set performs the blocking directory
    /// bootstrap.
    ///
    /// Must be called within a tokio runtime; the eviction timer and the
    /// unlink tasks are spawned onto it.
    pub fn build(self) -> Result<FileCache> {
        self.config.validate_ttl()?;
        let base_path = self.config.resolved_base_path()?;
        let runtime = Handle::try_current().map_err(|_| {
            CacheError::Config("FileCache must be built inside a tokio runtime".to_string())
        })?;

        let error_sink: ErrorSink = self.error_sink.unwrap_or_else(|| {
            Arc::new(|e: &CacheError| error!(error = %e, "cache background failure"))
        });

        // Expired entries lose their backing file in the background. A file
        // that is already gone was removed out-of-band; that is benign.
        let queue = {
            let base = base_path.clone();
            let sink = error_sink.clone();
            let runtime = runtime.clone();
            ExpiryQueue::new(self.config.ttl, move |hash: &str| {
                let path = base.join(hash);
                let sink = sink.clone();
                runtime.spawn(async move {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {
                            debug!(path = %path.display(), "expired entry already removed");
                        }
                        Err(e) => sink(&CacheError::Io(e)),
                    }
                });
            })
        };

        let cache = FileCache {
            base_path,
            ttl: self.config.ttl,
            queue,
            overlay: Arc::new(Mutex::new(HashMap::new())),
            error_sink,
            generator: self.generator,
            generator_async: self.generator_async,
            runtime,
        };
        if !self.config.skip_initial_scan {
            cache.bootstrap_blocking()?;
        }
        Ok(cache)
    }
}

// == File Cache ==
/// Disk-backed byte cache with TTL eviction.
///
/// Cheap to clone; clones share the same directory, queue and overlay.
#[derive(Clone)]
pub struct FileCache {
    base_path: PathBuf,
    ttl: Duration,
    queue: ExpiryQueue,
    /// Values parked while their write is in flight, so a racing read
    /// observes the pending bytes instead of an incomplete or absent file
    overlay: Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>,
    error_sink: ErrorSink,
    generator: Option<ByteGenerator>,
    generator_async: Option<AsyncByteGenerator>,
    runtime: Handle,
}

impl FileCache {
    // == Constructors ==
    /// Builds a cache with default capabilities; see [`FileCacheBuilder`].
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> FileCacheBuilder {
        FileCacheBuilder::new(config)
    }

    // == Bootstrap ==
    /// Non-blocking directory bootstrap, for caches built with
    /// `skip_initial_scan`. Creates the cache directory if it is missing;
    /// otherwise reconstructs the eviction queue from file access times.
    pub async fn init(&self) -> Result<()> {
        let mut dir = match tokio::fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.base_path).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let Some(name) = valid_entry_name(&item.file_name()) else {
                continue;
            };
            let atime = match item.metadata().await {
                Ok(meta) => access_time(&meta),
                Err(e) => {
                    debug!(file = %name, error = %e, "metadata unavailable, assuming fresh");
                    SystemTime::now()
                }
            };
            found.push((name, atime));
        }
        self.seed_queue(found);
        Ok(())
    }

    fn bootstrap_blocking(&self) -> Result<()> {
        let dir = match std::fs::read_dir(&self.base_path) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&self.base_path)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for item in dir {
            let item = item?;
            let Some(name) = valid_entry_name(&item.file_name()) else {
                continue;
            };
            let atime = match item.metadata() {
                Ok(meta) => access_time(&meta),
                Err(e) => {
                    debug!(file = %name, error = %e, "metadata unavailable, assuming fresh");
                    SystemTime::now()
                }
            };
            found.push((name, atime));
        }
        self.seed_queue(found);
        Ok(())
    }

    /// Feeds scanned files into the queue oldest-access-first, each with
    /// `access time + ttl` as its deadline, so the reconstructed order
    /// matches what the access times imply: the most recently used entry
    /// expires last, and entries idle for nearly the full TTL go soon.
    fn seed_queue(&self, mut found: Vec<(String, SystemTime)>) {
        found.sort_by_key(|(_, atime)| *atime);
        let now_sys = SystemTime::now();
        let now = Instant::now();
        let count = found.len();
        for (name, atime) in found {
            let deadline = match (atime + self.ttl).duration_since(now_sys) {
                Ok(remaining) => now + remaining,
                // past due: the first armed timer evicts it right away
                Err(_) => now,
            };
            self.queue.append_at(&name, deadline);
        }
        info!(entries = count, path = %self.base_path.display(), "cache directory scanned");
    }

    // == Get ==
    /// Reads the bytes stored under `key`, refreshing its TTL.
    ///
    /// Returns `None` for an unknown key, unless an asynchronous miss
    /// generator is configured, in which case its output is returned (and
    /// not cached). I/O failures other than not-found propagate unchanged.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        if let Some(pending) = self.overlay.lock().get(&hash).cloned() {
            self.queue.append(&hash);
            return Ok(Some(pending.as_ref().clone()));
        }
        match tokio::fs::read(self.entry_path(&hash)).await {
            Ok(bytes) => {
                self.queue.append(&hash);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => match &self.generator_async {
                Some(generate) => generate(key.to_string()).await.map(Some),
                None => Ok(None),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking counterpart of [`get`](Self::get); consults the synchronous
    /// miss generator on not-found.
    pub fn blocking_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        if let Some(pending) = self.overlay.lock().get(&hash).cloned() {
            self.queue.append(&hash);
            return Ok(Some(pending.as_ref().clone()));
        }
        match std::fs::read(self.entry_path(&hash)) {
            Ok(bytes) => {
                self.queue.append(&hash);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => match &self.generator {
                Some(generate) => generate(key).map(Some),
                None => Ok(None),
            },
            Err(e) => Err(e.into()),
        }
    }

    // == Set ==
    /// Stores `value` under `key` with a fresh TTL.
    ///
    /// The value is parked in the in-memory overlay while the write is in
    /// flight and released once it settles, success or failure. A failed
    /// write leaves the queue entry in place; its eventual eviction unlink
    /// hits the benign not-found path.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let hash = hash_key(key);
        let value = Arc::new(value);
        self.overlay.lock().insert(hash.clone(), Arc::clone(&value));
        self.queue.append(&hash);
        let result = tokio::fs::write(self.entry_path(&hash), value.as_slice()).await;
        self.overlay.lock().remove(&hash);
        result.map_err(CacheError::from)
    }

    /// Blocking counterpart of [`set`](Self::set).
    pub fn blocking_set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let hash = hash_key(key);
        let value = Arc::new(value);
        self.overlay.lock().insert(hash.clone(), Arc::clone(&value));
        self.queue.append(&hash);
        let result = std::fs::write(self.entry_path(&hash), value.as_slice());
        self.overlay.lock().remove(&hash);
        result.map_err(CacheError::from)
    }

    // == Remove ==
    /// Drops `key` from the cache; the backing file is unlinked in the
    /// background. Returns whether the key was present.
    pub fn remove(&self, key: &str) -> bool {
        let hash = hash_key(key);
        self.overlay.lock().remove(&hash);
        self.queue.remove(&hash)
    }

    // == Clear ==
    /// Empties the cache, unlinking every backing file. Files already gone
    /// are benign; real failures go to the error sink, never to the caller.
    /// Returns the number of entries cleared.
    pub async fn clear(&self) -> usize {
        self.overlay.lock().clear();
        let keys = self.queue.clear();
        let count = keys.len();
        for hash in &keys {
            match tokio::fs::remove_file(self.entry_path(hash)).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(hash = %hash, "file already removed by eviction callback");
                }
                Err(e) => (self.error_sink)(&CacheError::Io(e)),
            }
        }
        count
    }

    // == Introspection ==
    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The eviction queue backing this cache, for diagnostics
    /// ([`entries`](ExpiryQueue::entries)) and for pausing eviction during
    /// bulk maintenance ([`stop`](ExpiryQueue::stop) /
    /// [`start`](ExpiryQueue::start)).
    pub fn queue(&self) -> &ExpiryQueue {
        &self.queue
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Tears down the eviction queue (cancelling its timer). Terminal.
    pub fn destroy(&self) {
        self.overlay.lock().clear();
        self.queue.destroy();
    }

    // == Internal ==
    fn entry_path(&self, hash: &str) -> PathBuf {
        self.base_path.join(hash)
    }

    pub(crate) fn report_error(&self, error: &CacheError) {
        (self.error_sink)(error);
    }

    pub(crate) fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("base_path", &self.base_path)
            .field("ttl", &self.ttl)
            .field("len", &self.queue.len())
            .finish()
    }
}

// == Helpers ==
fn valid_entry_name(name: &OsStr) -> Option<String> {
    match name.to_str() {
        Some(name) if name.len() == HASH_HEX_LEN => Some(name.to_string()),
        _ => {
            warn!(file = ?name, "skipping foreign file in cache directory");
            None
        }
    }
}

/// Last access time, falling back to mtime and then to "now" (full TTL) on
/// platforms that do not track it.
fn access_time(meta: &std::fs::Metadata) -> SystemTime {
    meta.accessed()
        .or_else(|_| meta.modified())
        .unwrap_or_else(|_| SystemTime::now())
}
