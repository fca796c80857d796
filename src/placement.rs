use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::store::RepositoryStore;
use crate::transfer::StagedTransfer;

/// Lazily created per-destination locks. Entries are never removed.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn lock_for(&self, key: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Moves validated scratch files into the managed repository.
#[derive(Debug, Default)]
pub struct AtomicPlacement {
    locks: PathLocks,
}

impl AtomicPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places the primary file and every checksum sibling next to `destination`.
    pub fn place_all(
        &self,
        staged: &StagedTransfer,
        destination: &Utf8PathBuf,
    ) -> Result<(), ProxyError> {
        for (scratch, dest) in staged.placements(destination) {
            self.place(&scratch, &dest)?;
        }
        Ok(())
    }

    pub fn place(&self, scratch: &Path, destination: &Utf8Path) -> Result<(), ProxyError> {
        self.place_with(scratch, destination, |from, to| fs::rename(from, to))
    }

    /// Like `place`, with the rename step supplied by the caller.
    fn place_with<R>(
        &self,
        scratch: &Path,
        destination: &Utf8Path,
        rename: R,
    ) -> Result<(), ProxyError>
    where
        R: FnOnce(&Path, &Path) -> io::Result<()>,
    {
        let parent = destination.parent().ok_or_else(|| ProxyError::Placement {
            path: destination.to_string(),
            message: "destination has no parent directory".to_string(),
        })?;
        fs::create_dir_all(parent.as_std_path()).map_err(|err| ProxyError::Placement {
            path: destination.to_string(),
            message: err.to_string(),
        })?;

        let lock = self.locks.lock_for(&canonical_key(destination));
        let _guard = lock.lock();
        if destination.as_std_path().exists() {
            fs::remove_file(destination.as_std_path()).map_err(|err| ProxyError::Placement {
                path: destination.to_string(),
                message: err.to_string(),
            })?;
        }

        match rename(scratch, destination.as_std_path()) {
            Ok(()) => {
                debug!(path = %destination, "placed by rename");
                Ok(())
            }
            Err(rename_err) => {
                debug!(path = %destination, error = %rename_err, "rename failed, copying");
                match RepositoryStore::copy_file_atomic(scratch, destination) {
                    Ok(()) => {
                        let _ = fs::remove_file(scratch);
                        Ok(())
                    }
                    Err(_) if destination.as_std_path().exists() => {
                        warn!(path = %destination, "destination appeared concurrently, keeping it");
                        let _ = fs::remove_file(scratch);
                        Ok(())
                    }
                    Err(copy_err) => Err(ProxyError::Placement {
                        path: destination.to_string(),
                        message: format!("rename failed: {rename_err}; copy failed: {copy_err}"),
                    }),
                }
            }
        }
    }
}

/// Canonical parent plus file name, so aliases of one destination share a lock.
fn canonical_key(destination: &Utf8Path) -> PathBuf {
    let path = destination.as_std_path();
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
