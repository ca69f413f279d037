//! Archive member extraction with a derived-entry cache
//!
//! Extracted members live next to the downloads, keyed by the parent
//! asset's checksum and the member name. Like downloads, they are written
//! into `tmp/` first and renamed into place when complete.

mod formats;

pub use formats::{normalize_member, Format};

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::assets::descriptor::{hash_file, AssetDescriptor, Checksum, DigestAlgorithm};
use crate::assets::store::{AssetStore, EXTRACT_DIR, TMP_DIR, UNCOMPRESS_DIR};
use crate::common::paths::ensure_dir;
use crate::common::{Error, Result};

/// A member pulled out of a verified asset
#[derive(Debug, Clone)]
pub struct ArchiveMemberHandle {
    pub asset: AssetDescriptor,
    pub member: String,
    pub path: PathBuf,
}

/// Per-request locks so concurrent callers for one derived entry do the
/// work once; later callers find the published entry
type Locks = Arc<Mutex<HashMap<(PathBuf, String), Arc<tokio::sync::Mutex<()>>>>>;

/// Extracts members from cached archives
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    root: PathBuf,
    locks: Locks,
}

impl ArchiveExtractor {
    /// Use `root` as the cache root; derived entries go under it
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::default(),
        }
    }

    /// Share the cache root of an asset store
    pub fn for_store(store: &AssetStore) -> Self {
        Self::new(store.root())
    }

    /// Extract `member` from the archive at `asset`, returning its local path
    ///
    /// A repeat call for the same asset and member is served from the cache.
    pub async fn extract(&self, asset: &Path, member: &str) -> Result<PathBuf> {
        let key = (asset.to_path_buf(), normalize_member(member).to_string());
        let lock = self.lock_for(&key)?;
        let result = {
            let _held = lock.lock().await;
            let (asset, member) = key.clone();
            let root = self.root.clone();
            tokio::task::spawn_blocking(move || extract_cached(&root, &asset, &member))
                .await
                .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))
        };
        self.release(&key, lock)?;
        result?
    }

    /// Fetch an asset through `store` and extract one member from it
    pub async fn extract_asset(
        &self,
        store: &AssetStore,
        asset: &AssetDescriptor,
        member: &str,
    ) -> Result<ArchiveMemberHandle> {
        let archive = store.fetch(asset).await?;
        let path = self.extract(&archive, member).await?;
        Ok(ArchiveMemberHandle {
            asset: asset.clone(),
            member: member.to_string(),
            path,
        })
    }

    /// Decompress a gzip or xz asset into a derived entry
    pub async fn uncompress(&self, asset: &Path) -> Result<PathBuf> {
        let key = (asset.to_path_buf(), String::new());
        let lock = self.lock_for(&key)?;
        let result = {
            let _held = lock.lock().await;
            let asset = key.0.clone();
            let root = self.root.clone();
            tokio::task::spawn_blocking(move || uncompress_cached(&root, &asset))
                .await
                .map_err(|e| Error::Internal(format!("decompression task failed: {}", e)))
        };
        self.release(&key, lock)?;
        result?
    }

    fn lock_for(&self, key: &(PathBuf, String)) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Internal("extraction lock poisoned".to_string()))?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }

    /// Drop the map entry once no other caller holds it
    fn release(&self, key: &(PathBuf, String), lock: Arc<tokio::sync::Mutex<()>>) -> Result<()> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Internal("extraction lock poisoned".to_string()))?;
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
        Ok(())
    }

    /// Where an extracted member would be published
    pub fn member_path(&self, parent: &str, member: &str) -> PathBuf {
        member_path(&self.root, parent, member)
    }
}

/// Cache key of the parent archive: its checksum if it lives in the
/// download area, otherwise the SHA-256 of its content
fn parent_key(asset: &Path) -> Result<String> {
    let from_name = asset
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| Checksum::parse(n).ok());
    match from_name {
        Some(checksum) => Ok(checksum.to_string()),
        None => Ok(hash_file(asset, DigestAlgorithm::Sha256)?),
    }
}

fn member_path(root: &Path, parent: &str, member: &str) -> PathBuf {
    let member = normalize_member(member);
    let key = hex::encode(Sha256::digest(member.as_bytes()));
    let base = Path::new(member)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "member".to_string());
    root.join(EXTRACT_DIR).join(parent).join(&key[..16]).join(base)
}

fn extract_cached(root: &Path, asset: &Path, member: &str) -> Result<PathBuf> {
    let parent = parent_key(asset)?;
    let dest = member_path(root, &parent, member);
    if dest.is_file() {
        tracing::debug!(member, path = %dest.display(), "Using cached member");
        return Ok(dest);
    }

    let tmp_dir = root.join(TMP_DIR);
    ensure_dir(&tmp_dir)?;
    let mut tmp = tempfile::Builder::new()
        .suffix(".extract")
        .tempfile_in(&tmp_dir)?;

    if !formats::extract_member(asset, member, tmp.as_file_mut())? {
        return Err(Error::member_not_found(asset, member));
    }

    publish(tmp, &dest)?;
    tracing::info!(member, path = %dest.display(), "Extracted archive member");
    Ok(dest)
}

fn uncompress_cached(root: &Path, asset: &Path) -> Result<PathBuf> {
    let parent = parent_key(asset)?;
    let dest = root.join(UNCOMPRESS_DIR).join(parent);
    if dest.is_file() {
        return Ok(dest);
    }

    let tmp_dir = root.join(TMP_DIR);
    ensure_dir(&tmp_dir)?;
    let mut tmp = tempfile::Builder::new()
        .suffix(".uncompress")
        .tempfile_in(&tmp_dir)?;

    let bytes = formats::uncompress(asset, tmp.as_file_mut())?;
    publish(tmp, &dest)?;
    tracing::info!(path = %dest.display(), bytes, "Uncompressed asset");
    Ok(dest)
}

/// Rename into place unless another writer published `dest` first
fn publish(tmp: tempfile::NamedTempFile, dest: &Path) -> Result<()> {
    tmp.as_file().sync_all()?;
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    match tmp.persist_noclobber(dest) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists && dest.is_file() => {
            tracing::debug!(path = %dest.display(), "Derived entry already published");
            Ok(())
        }
        Err(e) => Err(Error::Io(e.error)),
    }
}
