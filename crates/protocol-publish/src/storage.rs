//! Document storage backends
//!
//! Provides the [`StorageBackend`] trait, byte-oriented storage keyed by
//! protocol id and slot name, plus two implementations:
//!
//! - [`FsBackend`]: one directory per protocol id on the local filesystem
//! - [`MemoryBackend`]: in-process map, for tests and embedding
//!
//! ## Guarantees
//!
//! - `write` is atomic: readers see the old bytes or the new bytes, never a
//!   mix. The filesystem backend writes `<slot>.tmp`, syncs, renames, then
//!   syncs the parent directory so the rename itself is durable.
//! - `write_new` never overwrites; archives rely on it.
//! - `recover` deletes `*.tmp` leftovers of interrupted writes and leaves
//!   the last complete file in place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Suffix of in-flight writes
pub const TMP_SUFFIX: &str = ".tmp";

/// Fixed slot names
pub mod slots {
    use chrono::{DateTime, Utc};

    /// Canonical document
    pub const CURRENT: &str = "current.json";
    /// Active draft
    pub const DRAFT: &str = "draft.json";
    /// Hash-chained change log
    pub const AUDIT_LOG: &str = "audit.log";
    /// Archived canonical documents
    pub const HISTORY_DIR: &str = "history";
    /// Archived drafts
    pub const DRAFTS_DIR: &str = "drafts";
    /// Published version records
    pub const PUBLISHED_DIR: &str = "published";

    /// Timestamp component of archive slot names
    #[must_use]
    pub fn stamp(at: DateTime<Utc>) -> String {
        at.format("%Y%m%dT%H%M%S%6fZ").to_string()
    }

    /// Archive slot in `dir` for `at`; `attempt > 0` disambiguates collisions
    #[must_use]
    pub fn archive(dir: &str, at: DateTime<Utc>, attempt: u32) -> String {
        if attempt == 0 {
            format!("{dir}/{}.json", stamp(at))
        } else {
            format!("{dir}/{}-{attempt}.json", stamp(at))
        }
    }

    /// Published record slot for `version`
    #[must_use]
    pub fn published(version: u64) -> String {
        format!("{PUBLISHED_DIR}/v{version:06}.json")
    }
}

/// Byte storage keyed by protocol id and slot
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a slot; `None` when absent
    async fn read(&self, protocol_id: &str, slot: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace a slot atomically
    async fn write(&self, protocol_id: &str, slot: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Create a slot; fails with [`StorageError::AlreadyExists`] if present
    async fn write_new(
        &self,
        protocol_id: &str,
        slot: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError>;

    /// Append to a slot, creating it if absent
    async fn append(&self, protocol_id: &str, slot: &str, bytes: &[u8])
        -> Result<(), StorageError>;

    /// Delete a slot; returns whether it existed
    async fn remove(&self, protocol_id: &str, slot: &str) -> Result<bool, StorageError>;

    /// Rename a slot, replacing the target
    async fn rename(&self, protocol_id: &str, from: &str, to: &str) -> Result<(), StorageError>;

    /// Slots starting with `prefix`, sorted
    async fn list(&self, protocol_id: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Delete leftover temporary slots, returning their names
    async fn recover(&self, protocol_id: &str) -> Result<Vec<String>, StorageError>;
}

/// Write `bytes` to the first free archive slot in `dir`
///
/// # Errors
/// Returns the first error other than a name collision
pub async fn write_archive(
    backend: &dyn StorageBackend,
    protocol_id: &str,
    dir: &str,
    at: DateTime<Utc>,
    bytes: &[u8],
) -> Result<String, StorageError> {
    let mut attempt = 0;
    loop {
        let slot = slots::archive(dir, at, attempt);
        match backend.write_new(protocol_id, &slot, bytes).await {
            Ok(()) => return Ok(slot),
            Err(StorageError::AlreadyExists { .. }) => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Protocol id or slot name rejected
    #[error("invalid key '{key}': {reason}")]
    InvalidKey {
        /// Offending key
        key: String,
        /// Rule broken
        reason: &'static str,
    },

    /// `write_new` target exists
    #[error("{protocol_id}/{slot} already exists")]
    AlreadyExists {
        /// Protocol id
        protocol_id: String,
        /// Slot
        slot: String,
    },

    /// `rename` source missing
    #[error("{protocol_id}/{slot} not found")]
    NotFound {
        /// Protocol id
        protocol_id: String,
        /// Slot
        slot: String,
    },

    /// I/O failure
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Stored bytes do not decode
    #[error("corrupt {slot}: {reason}")]
    Corrupt {
        /// Slot
        slot: String,
        /// Decoder message
        reason: String,
    },

    /// Record failed to encode
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Fault injected into a [`MemoryBackend`]
    #[error("injected fault writing {protocol_id}/{slot}")]
    Injected {
        /// Protocol id
        protocol_id: String,
        /// Slot
        slot: String,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn valid_component(component: &str) -> Result<(), &'static str> {
    if component.is_empty() {
        return Err("empty component");
    }
    if component.starts_with('.') {
        return Err("leading dot");
    }
    if !component
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err("only [A-Za-z0-9_.-] allowed");
    }
    Ok(())
}

/// Check a protocol id: `[A-Za-z0-9_.-]+`, no leading dot
///
/// # Errors
/// Returns [`StorageError::InvalidKey`] naming the rule broken
pub fn validate_protocol_id(protocol_id: &str) -> Result<(), StorageError> {
    valid_component(protocol_id).map_err(|reason| StorageError::InvalidKey {
        key: protocol_id.to_string(),
        reason,
    })
}

fn validate_slot(slot: &str) -> Result<(), StorageError> {
    slot.split('/')
        .try_for_each(valid_component)
        .map_err(|reason| StorageError::InvalidKey {
            key: slot.to_string(),
            reason,
        })
}

fn validate_key(protocol_id: &str, slot: &str) -> Result<(), StorageError> {
    validate_protocol_id(protocol_id)?;
    validate_slot(slot)
}

/// Filesystem backend: `<root>/<protocol_id>/<slot>`
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Create backend rooted at `root`; directories are created on demand
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, protocol_id: &str) -> Result<PathBuf, StorageError> {
        validate_protocol_id(protocol_id)?;
        Ok(self.root.join(protocol_id))
    }

    fn path(&self, protocol_id: &str, slot: &str) -> Result<PathBuf, StorageError> {
        validate_key(protocol_id, slot)?;
        let mut path = self.root.join(protocol_id);
        path.extend(slot.split('/'));
        Ok(path)
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(parent))?;
        }
        Ok(())
    }

    async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let mut file = tokio::fs::File::create(path).await.map_err(io_error(path))?;
        file.write_all(bytes).await.map_err(io_error(path))?;
        file.sync_all().await.map_err(io_error(path))
    }

    /// Flush the directory entry of `path`
    #[cfg(unix)]
    async fn sync_parent(path: &Path) -> Result<(), StorageError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let dir = tokio::fs::File::open(parent)
            .await
            .map_err(io_error(parent))?;
        dir.sync_all().await.map_err(io_error(parent))
    }

    /// Directories cannot be opened for syncing here
    #[cfg(not(unix))]
    async fn sync_parent(_path: &Path) -> Result<(), StorageError> {
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn read(&self, protocol_id: &str, slot: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path(protocol_id, slot)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    async fn write(&self, protocol_id: &str, slot: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path(protocol_id, slot)?;
        Self::ensure_parent(&path).await?;
        let tmp = tmp_path(&path);
        Self::write_synced(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_error(&path))?;
        Self::sync_parent(&path).await?;
        debug!(protocol_id, slot, bytes = bytes.len(), "slot written");
        Ok(())
    }

    async fn write_new(
        &self,
        protocol_id: &str,
        slot: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.path(protocol_id, slot)?;
        Self::ensure_parent(&path).await?;
        let tmp = tmp_path(&path);
        Self::write_synced(&tmp, bytes).await?;
        // hard_link refuses to replace an existing file
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        tokio::fs::remove_file(&tmp)
            .await
            .map_err(io_error(&tmp))?;
        match linked {
            Ok(()) => Self::sync_parent(&path).await,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StorageError::AlreadyExists {
                protocol_id: protocol_id.to_string(),
                slot: slot.to_string(),
            }),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    async fn append(
        &self,
        protocol_id: &str,
        slot: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.path(protocol_id, slot)?;
        Self::ensure_parent(&path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_error(&path))?;
        file.write_all(bytes).await.map_err(io_error(&path))?;
        file.sync_data().await.map_err(io_error(&path))
    }

    async fn remove(&self, protocol_id: &str, slot: &str) -> Result<bool, StorageError> {
        let path = self.path(protocol_id, slot)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    async fn rename(&self, protocol_id: &str, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.path(protocol_id, from)?;
        let target = self.path(protocol_id, to)?;
        Self::ensure_parent(&target).await?;
        match tokio::fs::rename(&source, &target).await {
            Ok(()) => {
                Self::sync_parent(&target).await?;
                if source.parent() != target.parent() {
                    Self::sync_parent(&source).await?;
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                protocol_id: protocol_id.to_string(),
                slot: from.to_string(),
            }),
            Err(e) => Err(io_error(&target)(e)),
        }
    }

    async fn list(&self, protocol_id: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.dir(protocol_id)?;
        let mut found = Vec::new();
        let mut pending = vec![(dir, String::new())];
        while let Some((dir, relative)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir)(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let slot = if relative.is_empty() {
                    name
                } else {
                    format!("{relative}/{name}")
                };
                let file_type = entry.file_type().await.map_err(io_error(&dir))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), slot));
                } else if slot.starts_with(prefix) {
                    found.push(slot);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    async fn recover(&self, protocol_id: &str) -> Result<Vec<String>, StorageError> {
        let mut discarded = Vec::new();
        for slot in self.list(protocol_id, "").await? {
            if slot.ends_with(TMP_SUFFIX) {
                self.remove(protocol_id, &slot).await?;
                warn!(protocol_id, slot = %slot, "discarded incomplete write");
                discarded.push(slot);
            }
        }
        Ok(discarded)
    }
}

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    slots: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    faults: RwLock<Vec<String>>,
}

impl MemoryBackend {
    /// Create empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to a slot starting with `prefix` fail
    pub fn inject_fault(&self, prefix: impl Into<String>) {
        self.faults.write().push(prefix.into());
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        self.faults.write().clear();
    }

    fn check_fault(&self, protocol_id: &str, slot: &str) -> Result<(), StorageError> {
        if self.faults.read().iter().any(|p| slot.starts_with(p.as_str())) {
            return Err(StorageError::Injected {
                protocol_id: protocol_id.to_string(),
                slot: slot.to_string(),
            });
        }
        Ok(())
    }

    fn check_write(&self, protocol_id: &str, slot: &str) -> Result<(), StorageError> {
        validate_key(protocol_id, slot)?;
        self.check_fault(protocol_id, slot)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, protocol_id: &str, slot: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(protocol_id, slot)?;
        Ok(self
            .slots
            .read()
            .get(protocol_id)
            .and_then(|slots| slots.get(slot))
            .cloned())
    }

    async fn write(&self, protocol_id: &str, slot: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_write(protocol_id, slot)?;
        self.slots
            .write()
            .entry(protocol_id.to_string())
            .or_default()
            .insert(slot.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn write_new(
        &self,
        protocol_id: &str,
        slot: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.check_write(protocol_id, slot)?;
        let mut all = self.slots.write();
        let slots = all.entry(protocol_id.to_string()).or_default();
        if slots.contains_key(slot) {
            return Err(StorageError::AlreadyExists {
                protocol_id: protocol_id.to_string(),
                slot: slot.to_string(),
            });
        }
        slots.insert(slot.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn append(
        &self,
        protocol_id: &str,
        slot: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.check_write(protocol_id, slot)?;
        self.slots
            .write()
            .entry(protocol_id.to_string())
            .or_default()
            .entry(slot.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    async fn remove(&self, protocol_id: &str, slot: &str) -> Result<bool, StorageError> {
        self.check_write(protocol_id, slot)?;
        Ok(self
            .slots
            .write()
            .get_mut(protocol_id)
            .and_then(|slots| slots.remove(slot))
            .is_some())
    }

    async fn rename(&self, protocol_id: &str, from: &str, to: &str) -> Result<(), StorageError> {
        validate_key(protocol_id, from)?;
        self.check_write(protocol_id, to)?;
        let mut all = self.slots.write();
        let bytes = all
            .get_mut(protocol_id)
            .and_then(|slots| slots.remove(from))
            .ok_or_else(|| StorageError::NotFound {
                protocol_id: protocol_id.to_string(),
                slot: from.to_string(),
            })?;
        all.entry(protocol_id.to_string())
            .or_default()
            .insert(to.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, protocol_id: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        validate_protocol_id(protocol_id)?;
        Ok(self
            .slots
            .read()
            .get(protocol_id)
            .map(|slots| {
                slots
                    .keys()
                    .filter(|slot| slot.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn recover(&self, protocol_id: &str) -> Result<Vec<String>, StorageError> {
        validate_protocol_id(protocol_id)?;
        let mut all = self.slots.write();
        let Some(slots) = all.get_mut(protocol_id) else {
            return Ok(Vec::new());
        };
        let discarded: Vec<String> = slots
            .keys()
            .filter(|slot| slot.ends_with(TMP_SUFFIX))
            .cloned()
            .collect();
        for slot in &discarded {
            slots.remove(slot);
            warn!(protocol_id, slot = %slot, "discarded incomplete write");
        }
        Ok(discarded)
    }
}
