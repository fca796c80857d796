use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camino::Utf8PathBuf;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::domain::{FetchRequest, is_checksum_path};
use crate::error::ProxyError;
use crate::failure_cache::UrlFailureCache;
use crate::policy::PolicySet;
use crate::registry::ProxyConnector;
use crate::store::Asset;
use crate::transport::{TransportClient, TransportSession};

/// Scratch copies of a transferred resource and its checksum siblings.
#[derive(Debug)]
pub struct StagedFiles {
    pub primary: PathBuf,
    pub checksums: Vec<StagedChecksum>,
    /// Checksum extensions configured for the target the files came from.
    pub checksum_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChecksum {
    pub extension: String,
    pub path: PathBuf,
}

impl StagedFiles {
    /// Removes the primary and every checksum sibling from scratch space.
    pub fn discard(&mut self) {
        let _ = fs::remove_file(&self.primary);
        for checksum in self.checksums.drain(..) {
            let _ = fs::remove_file(&checksum.path);
        }
    }
}

/// A validated transfer awaiting placement. Dropping it removes the scratch directory.
#[derive(Debug)]
pub struct StagedTransfer {
    pub files: StagedFiles,
    _scratch: TempDir,
}

impl StagedTransfer {
    /// Pairs every staged file with its destination next to `destination`.
    pub fn placements(&self, destination: &Utf8PathBuf) -> Vec<(PathBuf, Utf8PathBuf)> {
        let mut placements = vec![(self.files.primary.clone(), destination.clone())];
        for checksum in &self.files.checksums {
            placements.push((
                checksum.path.clone(),
                Utf8PathBuf::from(format!("{destination}.{}", checksum.extension)),
            ));
        }
        placements
    }
}

#[derive(Debug)]
pub enum Attempt {
    /// The connector filters or a policy excluded this target and there is no local copy.
    Skipped,
    /// A policy rejected the transfer; the existing local copy stands.
    LocalFallback,
    Staged(StagedTransfer),
}

/// Disconnects the session on every exit path.
struct SessionGuard(Box<dyn TransportSession>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

pub struct TransferEngine {
    transport: Arc<dyn TransportClient>,
    policies: Arc<PolicySet>,
    failures: Arc<UrlFailureCache>,
    scratch_root: Utf8PathBuf,
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn TransportClient>,
        policies: Arc<PolicySet>,
        failures: Arc<UrlFailureCache>,
        scratch_root: Utf8PathBuf,
    ) -> Self {
        Self {
            transport,
            policies,
            failures,
            scratch_root,
        }
    }

    pub fn scratch_root(&self) -> &Utf8PathBuf {
        &self.scratch_root
    }

    pub fn attempt(
        &self,
        connector: &ProxyConnector,
        request: &FetchRequest,
        remote_path: &str,
        destination: &Asset,
    ) -> Result<Attempt, ProxyError> {
        let target = &connector.target;
        let url = target.url_for(remote_path);
        let local = destination.exists().then(|| destination.path.as_std_path());

        if !connector.filter.allows(remote_path) {
            debug!(remote = %target.id, path = remote_path, "path excluded by connector filters");
            return Ok(Attempt::Skipped);
        }

        let checked = self.policies.apply_pre_download(&connector.policies, request, local);
        if let Err(violation) = checked {
            info!(remote = %target.id, %violation, "pre-download policy rejected transfer");
            return Ok(fallback(local.is_some()));
        }

        fs::create_dir_all(self.scratch_root.as_std_path())
            .map_err(|err| ProxyError::Filesystem(err.to_string()))?;
        let scratch = tempfile::Builder::new()
            .prefix(".aproxy-")
            .tempdir_in(self.scratch_root.as_std_path())
            .map_err(|err| ProxyError::Filesystem(err.to_string()))?;
        let primary = scratch.path().join(file_name(remote_path));

        let mut files = {
            let session = self
                .transport
                .connect(
                    target,
                    target.credentials.as_ref(),
                    connector.network_proxy.as_deref(),
                )
                .inspect_err(|err| self.record_transport_failure(&url, err))?;
            let mut session = SessionGuard(session);

            let transfer = match destination.modified().filter(|_| local.is_some()) {
                Some(since) => session.0.fetch_if_newer(remote_path, &primary, since),
                None => session.0.fetch(remote_path, &primary),
            };
            transfer.inspect_err(|err| self.record_transport_failure(&url, err))?;
            debug!(remote = %target.id, %url, "transferred");

            let mut files = StagedFiles {
                primary: primary.clone(),
                checksums: Vec::new(),
                checksum_extensions: target.checksum_extensions.clone(),
            };
            if !is_checksum_path(remote_path) {
                for extension in &target.checksum_extensions {
                    self.fetch_checksum(
                        &mut session,
                        connector,
                        remote_path,
                        &primary,
                        extension,
                        &mut files,
                    );
                }
            }
            files
        };

        let validated = self
            .policies
            .apply_post_download(&connector.policies, request, &mut files);
        if let Err(violation) = validated {
            info!(remote = %target.id, %violation, "post-download policy rejected transfer");
            files.discard();
            return Ok(fallback(local.is_some()));
        }

        Ok(Attempt::Staged(StagedTransfer {
            files,
            _scratch: scratch,
        }))
    }

    fn fetch_checksum(
        &self,
        session: &mut SessionGuard,
        connector: &ProxyConnector,
        remote_path: &str,
        primary: &Path,
        extension: &str,
        files: &mut StagedFiles,
    ) {
        let checksum_path = format!("{remote_path}.{extension}");
        let url = connector.target.url_for(&checksum_path);
        if self.failures.has_failed_recently(&url) {
            debug!(%url, "skipping checksum with a recent failure");
            return;
        }
        let mut scratch = primary.as_os_str().to_owned();
        scratch.push(".");
        scratch.push(extension);
        let scratch = PathBuf::from(scratch);

        match session.0.fetch(&checksum_path, &scratch) {
            Ok(()) => files.checksums.push(StagedChecksum {
                extension: extension.to_string(),
                path: scratch,
            }),
            Err(err) => {
                debug!(%url, error = %err, "checksum transfer failed");
                let _ = fs::remove_file(&scratch);
                self.failures.cache_failure(&url);
            }
        }
    }

    fn record_transport_failure(&self, url: &str, err: &ProxyError) {
        if matches!(err, ProxyError::Transfer { .. }) {
            self.failures.cache_failure(url);
        }
    }
}

fn fallback(local_exists: bool) -> Attempt {
    if local_exists {
        Attempt::LocalFallback
    } else {
        Attempt::Skipped
    }
}

fn file_name(remote_path: &str) -> String {
    remote_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("resource")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_uses_last_segment() {
        assert_eq!(file_name("org/foo/1.0/foo-1.0.jar"), "foo-1.0.jar");
        assert_eq!(file_name("org/foo/"), "foo");
        assert_eq!(file_name(""), "resource");
    }

    #[test]
    fn placements_follow_destination() {
        let scratch = tempfile::tempdir().unwrap();
        let staged = StagedTransfer {
            files: StagedFiles {
                primary: scratch.path().join("foo.jar"),
                checksums: vec![StagedChecksum {
                    extension: "sha256".to_string(),
                    path: scratch.path().join("foo.jar.sha256"),
                }],
                checksum_extensions: vec!["sha256".to_string()],
            },
            _scratch: scratch,
        };
        let destination = Utf8PathBuf::from("/srv/internal/org/foo.jar");
        let placements = staged.placements(&destination);
        assert_eq!(placements.len(), 2);
        assert_eq!(placements[1].1, Utf8PathBuf::from("/srv/internal/org/foo.jar.sha256"));
    }
}
