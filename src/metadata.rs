use std::time::SystemTime;

use tracing::debug;

use crate::error::ProxyError;
use crate::store::{Asset, RepositoryStore};

/// A repository-specific metadata copy fetched from one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSource {
    pub target_id: String,
    pub asset: Asset,
}

/// Combines per-target metadata copies into the repository's own file.
pub trait MetadataMerger: Send + Sync {
    fn merge(
        &self,
        store: &RepositoryStore,
        logical_path: &str,
        sources: &[MetadataSource],
    ) -> Result<(), ProxyError>;
}

/// `maven-metadata.xml` fetched from `central` is kept as `maven-metadata-central.xml`.
pub fn repository_specific_name(target_id: &str, logical_path: &str) -> String {
    let (dir, file) = match logical_path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, logical_path),
    };
    let renamed = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{target_id}.{ext}"),
        _ => format!("{file}-{target_id}"),
    };
    match dir {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}

/// Replaces the merged file with the most recently modified source.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestWinsMerger;

impl MetadataMerger for LatestWinsMerger {
    fn merge(
        &self,
        store: &RepositoryStore,
        logical_path: &str,
        sources: &[MetadataSource],
    ) -> Result<(), ProxyError> {
        let newest = sources
            .iter()
            .filter(|source| source.asset.exists())
            .max_by_key(|source| source.asset.modified().unwrap_or(SystemTime::UNIX_EPOCH));
        let Some(newest) = newest else {
            debug!(path = logical_path, "no metadata sources to merge");
            return Ok(());
        };

        let merged = store.asset(logical_path)?;
        RepositoryStore::copy_file_atomic(newest.asset.path.as_std_path(), &merged.path)
            .map_err(|err| ProxyError::MetadataMerge(err.to_string()))?;
        debug!(path = logical_path, remote = %newest.target_id, "metadata merged");
        Ok(())
    }
}
