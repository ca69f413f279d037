//! Content-addressed asset cache
//!
//! Layout under the cache root:
//! ```text
//! download/<checksum>                         published assets
//! extract/<checksum>/<member-key>/<basename>  archive members
//! uncompress/<checksum>                       decompressed assets
//! tmp/                                        in-progress writes
//! ```
//! Files only reach their final name through a rename from `tmp/` after
//! the digest has been checked, so a reader never sees a partial or
//! corrupt entry under a verified name.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::descriptor::{AssetDescriptor, AssetState, Checksum};
use super::transport::{Transport, TransportError};
use crate::common::config::Config;
use crate::common::paths::ensure_dir;
use crate::common::{Error, Result};

pub(crate) const DOWNLOAD_DIR: &str = "download";
pub(crate) const EXTRACT_DIR: &str = "extract";
pub(crate) const UNCOMPRESS_DIR: &str = "uncompress";
pub(crate) const TMP_DIR: &str = "tmp";

/// How cache misses are served
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Extra attempts after a transient failure
    pub retries: u32,
    /// Delay before the first retry, doubled each time
    pub backoff: Duration,
    /// Deadline for one download attempt
    pub attempt_timeout: Duration,
    /// Whether a cache miss may use the network
    pub allow_download: bool,
    /// Re-hash files found on disk before trusting them
    pub verify_cached: bool,
    /// Draw a progress bar on an interactive stderr
    pub progress: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl FetchPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.cache.retries,
            backoff: Duration::from_millis(config.cache.backoff_ms),
            attempt_timeout: Duration::from_secs(config.timeouts.download_secs),
            allow_download: config.cache.allow_download,
            verify_cached: config.cache.verify_cached,
            progress: config.cache.progress,
        }
    }
}

/// Result of one fetch, shared with every caller that joined it
#[derive(Debug, Clone)]
enum Outcome {
    Ready(PathBuf),
    Failed(SharedFailure),
}

/// Cloneable copy of the errors a fetch can end with
#[derive(Debug, Clone)]
enum SharedFailure {
    Network {
        url: String,
        attempts: u32,
        message: String,
    },
    Mismatch {
        url: String,
        expected: String,
        actual: String,
    },
    Disabled {
        url: String,
        checksum: String,
    },
    Other(String),
}

impl From<&Error> for SharedFailure {
    fn from(err: &Error) -> Self {
        match err {
            Error::Network {
                url,
                attempts,
                message,
            } => Self::Network {
                url: url.clone(),
                attempts: *attempts,
                message: message.clone(),
            },
            Error::ChecksumMismatch {
                url,
                expected,
                actual,
            } => Self::Mismatch {
                url: url.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Error::DownloadDisabled { url, checksum } => Self::Disabled {
                url: url.clone(),
                checksum: checksum.clone(),
            },
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<SharedFailure> for Error {
    fn from(failure: SharedFailure) -> Self {
        match failure {
            SharedFailure::Network {
                url,
                attempts,
                message,
            } => Error::Network {
                url,
                attempts,
                message,
            },
            SharedFailure::Mismatch {
                url,
                expected,
                actual,
            } => Error::ChecksumMismatch {
                url,
                expected,
                actual,
            },
            SharedFailure::Disabled { url, checksum } => Error::DownloadDisabled { url, checksum },
            SharedFailure::Other(message) => Error::Cache(message),
        }
    }
}

/// Why a single download attempt ended
enum AttemptError {
    Transport(TransportError),
    Mismatch(String),
    Local(Error),
}

impl From<std::io::Error> for AttemptError {
    fn from(err: std::io::Error) -> Self {
        Self::Local(Error::Io(err))
    }
}

/// Content-addressed, single-flight asset cache
///
/// Cheap to share: wrap it in an `Arc` and hand it to every scenario.
pub struct AssetStore {
    root: PathBuf,
    transport: Arc<dyn Transport>,
    policy: FetchPolicy,
    states: Mutex<HashMap<Checksum, AssetState>>,
    in_flight: Mutex<HashMap<Checksum, watch::Receiver<Option<Outcome>>>>,
}

/// Removes the in-flight entry when the leading fetch finishes or is dropped
struct InFlightGuard<'a> {
    store: &'a AssetStore,
    checksum: Checksum,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(&self.store.in_flight).remove(&self.checksum);
        let mut states = lock(&self.store.states);
        // A cancelled leader never judged any bytes
        if states.get(&self.checksum) == Some(&AssetState::Fetching) {
            states.insert(self.checksum.clone(), AssetState::NotFetched);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Follower(watch::Receiver<Option<Outcome>>),
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>, transport: Arc<dyn Transport>, policy: FetchPolicy) -> Self {
        Self {
            root: root.into(),
            transport,
            policy,
            states: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Final location of an asset, whether or not it exists yet
    pub fn asset_path(&self, checksum: &Checksum) -> PathBuf {
        self.root.join(DOWNLOAD_DIR).join(checksum.as_str())
    }

    /// Current state of an asset in this store
    pub fn state(&self, descriptor: &AssetDescriptor) -> AssetState {
        lock(&self.states)
            .get(&descriptor.checksum)
            .copied()
            .unwrap_or(AssetState::NotFetched)
    }

    /// Published path for an asset, without fetching or verifying
    pub fn cached_path(&self, descriptor: &AssetDescriptor) -> Option<PathBuf> {
        let path = self.asset_path(&descriptor.checksum);
        path.is_file().then_some(path)
    }

    fn set_state(&self, checksum: &Checksum, state: AssetState) {
        lock(&self.states).insert(checksum.clone(), state);
    }

    /// Fetch an asset and return the path of its verified local copy
    ///
    /// Repeat calls for a verified asset return immediately. Concurrent
    /// calls for the same checksum share a single download and all see the
    /// same outcome.
    pub async fn fetch(&self, descriptor: &AssetDescriptor) -> Result<PathBuf> {
        loop {
            if self.state(descriptor) == AssetState::Verified {
                if let Some(path) = self.cached_path(descriptor) {
                    return Ok(path);
                }
                // Removed from under us; start over
                self.set_state(&descriptor.checksum, AssetState::NotFetched);
            }

            let role = {
                let mut in_flight = lock(&self.in_flight);
                match in_flight.get(&descriptor.checksum) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(descriptor.checksum.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let guard = InFlightGuard {
                        store: self,
                        checksum: descriptor.checksum.clone(),
                    };
                    let result = self.fetch_uncoalesced(descriptor).await;
                    let outcome = match &result {
                        Ok(path) => Outcome::Ready(path.clone()),
                        Err(err) => Outcome::Failed(SharedFailure::from(err)),
                    };
                    tx.send_replace(Some(outcome));
                    drop(guard);
                    return result;
                }
                Role::Follower(mut rx) => {
                    tracing::debug!(asset = descriptor.file_name(), "Joining in-flight fetch");
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(value) => (*value).clone(),
                        // Leader was cancelled before finishing
                        Err(_) => continue,
                    };
                    match outcome {
                        Some(Outcome::Ready(path)) => return Ok(path),
                        Some(Outcome::Failed(failure)) => return Err(failure.into()),
                        None => continue,
                    }
                }
            }
        }
    }

    /// Serve one fetch with no coordination; only the leader calls this
    async fn fetch_uncoalesced(&self, descriptor: &AssetDescriptor) -> Result<PathBuf> {
        let final_path = self.asset_path(&descriptor.checksum);

        if final_path.is_file() {
            if !self.policy.verify_cached || self.verify_on_disk(descriptor, &final_path).await? {
                tracing::debug!(asset = descriptor.file_name(), path = %final_path.display(), "Using cached asset");
                self.set_state(&descriptor.checksum, AssetState::Verified);
                return Ok(final_path);
            }
        }

        if !self.policy.allow_download {
            return Err(Error::DownloadDisabled {
                url: descriptor.url.clone(),
                checksum: descriptor.checksum.to_string(),
            });
        }

        ensure_dir(&self.root.join(DOWNLOAD_DIR))?;
        ensure_dir(&self.root.join(TMP_DIR))?;

        let mut attempt: u32 = 0;
        let mut backoff = self.policy.backoff;
        loop {
            attempt += 1;
            self.set_state(&descriptor.checksum, AssetState::Fetching);
            tracing::info!(url = %descriptor.url, attempt, "Downloading asset");

            let result = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.download_once(descriptor, &final_path),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Transport(TransportError::transient(format!(
                    "download timed out after {}s",
                    self.policy.attempt_timeout.as_secs()
                )))),
            };

            match result {
                Ok(path) => {
                    self.set_state(&descriptor.checksum, AssetState::Verified);
                    tracing::info!(asset = descriptor.file_name(), path = %path.display(), "Asset verified");
                    return Ok(path);
                }
                Err(AttemptError::Mismatch(actual)) => {
                    self.set_state(&descriptor.checksum, AssetState::Corrupt);
                    return Err(Error::ChecksumMismatch {
                        url: descriptor.url.clone(),
                        expected: descriptor.checksum.to_string(),
                        actual,
                    });
                }
                Err(AttemptError::Transport(err)) if err.transient && attempt <= self.policy.retries => {
                    tracing::warn!(
                        url = %descriptor.url,
                        attempt,
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Transient download failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(AttemptError::Transport(err)) => {
                    self.set_state(&descriptor.checksum, AssetState::NotFetched);
                    return Err(Error::Network {
                        url: descriptor.url.clone(),
                        attempts: attempt,
                        message: err.message,
                    });
                }
                Err(AttemptError::Local(err)) => {
                    self.set_state(&descriptor.checksum, AssetState::NotFetched);
                    return Err(err);
                }
            }
        }
    }

    /// Re-hash a file already on disk; deletes it if it does not match
    async fn verify_on_disk(&self, descriptor: &AssetDescriptor, path: &Path) -> Result<bool> {
        let checksum = descriptor.checksum.clone();
        let owned = path.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || checksum.digest_file(&owned))
            .await
            .map_err(|e| Error::Internal(format!("hash task failed: {}", e)))??;

        if actual == descriptor.checksum.as_str() {
            return Ok(true);
        }

        tracing::warn!(
            path = %path.display(),
            expected = %descriptor.checksum,
            actual = %actual,
            "Cached asset is corrupt, discarding"
        );
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(false)
    }

    /// One GET into a temp file; publish only if the digest matches
    async fn download_once(
        &self,
        descriptor: &AssetDescriptor,
        final_path: &Path,
    ) -> std::result::Result<PathBuf, AttemptError> {
        let download = self
            .transport
            .get(&descriptor.url)
            .await
            .map_err(AttemptError::Transport)?;

        let tmp = tempfile::Builder::new()
            .prefix(&descriptor.checksum.as_str()[..16])
            .suffix(".download")
            .tempfile_in(self.root.join(TMP_DIR))?;
        // The temp path deletes itself on drop, covering every early return
        let (file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let progress = self.progress_bar(download.content_length);
        let mut hasher = descriptor.checksum.algorithm().hasher();
        let mut received: u64 = 0;
        let mut body = download.body;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(AttemptError::Transport)?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(pb) = &progress {
                pb.set_position(received);
            }
        }
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        if let Some(expected) = download.content_length {
            if received != expected {
                return Err(AttemptError::Transport(TransportError::transient(format!(
                    "body truncated: received {} of {} bytes",
                    received, expected
                ))));
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = hasher.finalize_hex();
        if actual != descriptor.checksum.as_str() {
            return Err(AttemptError::Mismatch(actual));
        }

        tmp_path
            .persist(final_path)
            .map_err(|e| AttemptError::Local(Error::Io(e.error)))?;
        Ok(final_path.to_path_buf())
    }

    fn progress_bar(&self, total: Option<u64>) -> Option<ProgressBar> {
        let total = total.filter(|t| *t > 0)?;
        if !self.policy.progress || !std::io::stderr().is_terminal() {
            return None;
        }
        let pb = ProgressBar::new(total);
        if let Ok(style) =
            ProgressStyle::default_bar().template("  [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        Some(pb)
    }

    /// Delete every cache entry
    pub fn purge(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        lock(&self.states).clear();
        Ok(())
    }
}
