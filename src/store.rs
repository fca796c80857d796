use std::fs;
use std::path::Path;
use std::time::SystemTime;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::ManagedRepository;
use crate::error::ProxyError;

/// A file inside a managed repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub repository_id: String,
    pub logical_path: String,
    pub path: Utf8PathBuf,
}

impl Asset {
    pub fn exists(&self) -> bool {
        self.path.as_std_path().is_file()
    }

    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(self.path.as_std_path())
            .and_then(|meta| meta.modified())
            .ok()
    }
}

/// Filesystem storage for one managed repository, scoped to its root directory.
#[derive(Debug, Clone)]
pub struct RepositoryStore {
    repository_id: String,
    root: Utf8PathBuf,
}

impl RepositoryStore {
    pub fn new(repository_id: impl Into<String>, root: Utf8PathBuf) -> Self {
        Self {
            repository_id: repository_id.into(),
            root,
        }
    }

    pub fn for_repository(repository: &ManagedRepository) -> Self {
        Self::new(repository.id.clone(), repository.location.clone())
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    /// Resolves a logical path to an asset below the root, rejecting traversal.
    pub fn asset(&self, logical_path: &str) -> Result<Asset, ProxyError> {
        let normalized = normalize_logical_path(logical_path)?;
        Ok(Asset {
            repository_id: self.repository_id.clone(),
            path: self.root.join(&normalized),
            logical_path: normalized,
        })
    }

    pub fn delete(&self, asset: &Asset) -> Result<(), ProxyError> {
        if asset.path.as_std_path().exists() {
            fs::remove_file(asset.path.as_std_path())
                .map_err(|err| ProxyError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn copy_file_atomic(source: &Path, dest: &Utf8Path) -> Result<(), ProxyError> {
        let parent = dest
            .parent()
            .ok_or_else(|| ProxyError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ProxyError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix(".aproxy-copy")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ProxyError::Filesystem(err.to_string()))?;
        fs::copy(source, temp.path()).map_err(|err| ProxyError::Filesystem(err.to_string()))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| ProxyError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

pub fn normalize_logical_path(logical_path: &str) -> Result<String, ProxyError> {
    let unified = logical_path.replace('\\', "/");
    let mut segments = Vec::new();
    for component in Utf8Path::new(&unified).components() {
        match component {
            Utf8Component::Normal(segment) => segments.push(segment),
            Utf8Component::RootDir | Utf8Component::CurDir => {}
            Utf8Component::ParentDir | Utf8Component::Prefix(_) => {
                return Err(ProxyError::InvalidPath(logical_path.to_string()));
            }
        }
    }
    if segments.is_empty() {
        return Err(ProxyError::InvalidPath(logical_path.to_string()));
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn asset_serializes_its_path() {
        let store = RepositoryStore::new("internal", Utf8PathBuf::from("/srv/internal"));
        let asset = store.asset("org/foo/foo.jar").unwrap();
        let json = serde_json::to_value(&asset).unwrap();
        assert_eq!(json["path"], "/srv/internal/org/foo/foo.jar");
        assert_eq!(json["logical_path"], "org/foo/foo.jar");
    }

    #[test]
    fn asset_paths_stay_under_root() {
        let store = RepositoryStore::new("internal", Utf8PathBuf::from("/srv/internal"));
        let asset = store.asset("/org/foo//1.0/./foo-1.0.jar").unwrap();
        assert_eq!(asset.logical_path, "org/foo/1.0/foo-1.0.jar");
        assert_eq!(asset.path, Utf8PathBuf::from("/srv/internal/org/foo/1.0/foo-1.0.jar"));
    }

    #[test]
    fn traversal_is_rejected() {
        let store = RepositoryStore::new("internal", Utf8PathBuf::from("/srv/internal"));
        assert_matches!(store.asset("org/../../etc/passwd"), Err(ProxyError::InvalidPath(_)));
        assert_matches!(store.asset("/"), Err(ProxyError::InvalidPath(_)));
    }

    #[test]
    fn copy_file_atomic_replaces_destination() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source.bin");
        std::fs::write(&source, b"fresh").unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("nested/dest.bin")).unwrap();
        std::fs::create_dir_all(dest.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(dest.as_std_path(), b"stale").unwrap();

        RepositoryStore::copy_file_atomic(&source, &dest).unwrap();

        assert_eq!(std::fs::read(dest.as_std_path()).unwrap(), b"fresh");
    }
}
