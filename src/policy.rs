use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, info, warn};

use crate::domain::{
    ChecksumAlgorithm, FetchRequest, RequestKind, is_checksum_path, is_snapshot_version,
    version_from_path,
};
use crate::error::{ProxyError, TargetFailures};
use crate::transfer::{StagedChecksum, StagedFiles};

pub const RELEASES: &str = "releases";
pub const SNAPSHOTS: &str = "snapshots";
pub const CHECKSUM: &str = "checksum";
pub const PROPAGATE_ERRORS: &str = "propagate-errors";
pub const PROPAGATE_ERRORS_ON_UPDATE: &str = "propagate-errors-on-update";

pub const ALWAYS: &str = "always";
pub const NEVER: &str = "never";
pub const ONCE: &str = "once";
pub const HOURLY: &str = "hourly";
pub const DAILY: &str = "daily";

pub const FAIL: &str = "fail";
pub const FIX: &str = "fix";
pub const IGNORE: &str = "ignore";

pub const STOP: &str = "stop";
pub const QUEUE: &str = "queue";
pub const NOT_PRESENT: &str = "not-present";

const UPDATE_OPTIONS: &[&str] = &[ALWAYS, NEVER, ONCE, HOURLY, DAILY];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDescriptor {
    pub id: &'static str,
    pub options: &'static [&'static str],
    pub default_option: &'static str,
}

impl PolicyDescriptor {
    pub fn is_legal(&self, option: &str) -> bool {
        self.options.contains(&option)
    }
}

/// Gate evaluated before any transfer from a target is attempted.
pub trait PreDownloadPolicy: Send + Sync {
    fn descriptor(&self) -> &PolicyDescriptor;

    fn apply(
        &self,
        option: &str,
        request: &FetchRequest,
        local: Option<&Path>,
    ) -> Result<(), ProxyError>;
}

/// Validation of freshly transferred scratch files.
pub trait PostDownloadPolicy: Send + Sync {
    fn descriptor(&self) -> &PolicyDescriptor;

    fn apply(
        &self,
        option: &str,
        request: &FetchRequest,
        fetched: &mut StagedFiles,
    ) -> Result<(), ProxyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    Abort,
}

/// Decides whether a transfer failure ends the fetch or falls through to the
/// next connector. Policies may record or cancel the target's entry in
/// `failures`.
pub trait DownloadErrorPolicy: Send + Sync {
    fn descriptor(&self) -> &PolicyDescriptor;

    fn apply(
        &self,
        option: &str,
        request: &FetchRequest,
        target_id: &str,
        local: Option<&Path>,
        error: &ProxyError,
        failures: &mut TargetFailures,
    ) -> ErrorAction;
}

pub enum Policy {
    PreDownload(Box<dyn PreDownloadPolicy>),
    PostDownload(Box<dyn PostDownloadPolicy>),
    DownloadError(Box<dyn DownloadErrorPolicy>),
}

#[derive(Default)]
pub struct PolicySet {
    pre_download: Vec<Box<dyn PreDownloadPolicy>>,
    post_download: Vec<Box<dyn PostDownloadPolicy>>,
    download_error: Vec<Box<dyn DownloadErrorPolicy>>,
}

impl PolicySet {
    pub fn new(policies: impl IntoIterator<Item = Policy>) -> Self {
        let mut set = Self::default();
        for policy in policies {
            match policy {
                Policy::PreDownload(policy) => set.pre_download.push(policy),
                Policy::PostDownload(policy) => set.post_download.push(policy),
                Policy::DownloadError(policy) => set.download_error.push(policy),
            }
        }
        set
    }

    pub fn standard() -> Self {
        Self::new([
            Policy::PreDownload(Box::new(UpdatePolicy::releases())),
            Policy::PreDownload(Box::new(UpdatePolicy::snapshots())),
            Policy::PostDownload(Box::new(ChecksumPolicy::new())),
            Policy::DownloadError(Box::new(PropagateErrorsPolicy::new())),
            Policy::DownloadError(Box::new(PropagateErrorsOnUpdatePolicy::new())),
        ])
    }

    pub fn apply_pre_download(
        &self,
        settings: &BTreeMap<String, String>,
        request: &FetchRequest,
        local: Option<&Path>,
    ) -> Result<(), ProxyError> {
        for policy in &self.pre_download {
            let option = resolve_option(policy.descriptor(), settings);
            debug!(policy = policy.descriptor().id, option, "applying pre-download policy");
            policy.apply(option, request, local)?;
        }
        Ok(())
    }

    pub fn apply_post_download(
        &self,
        settings: &BTreeMap<String, String>,
        request: &FetchRequest,
        fetched: &mut StagedFiles,
    ) -> Result<(), ProxyError> {
        for policy in &self.post_download {
            let option = resolve_option(policy.descriptor(), settings);
            debug!(policy = policy.descriptor().id, option, "applying post-download policy");
            policy.apply(option, request, fetched)?;
        }
        Ok(())
    }

    pub fn apply_download_error(
        &self,
        settings: &BTreeMap<String, String>,
        request: &FetchRequest,
        target_id: &str,
        local: Option<&Path>,
        error: &ProxyError,
        failures: &mut TargetFailures,
    ) -> ErrorAction {
        for policy in &self.download_error {
            let option = resolve_option(policy.descriptor(), settings);
            debug!(policy = policy.descriptor().id, option, "applying download-error policy");
            let action = policy.apply(option, request, target_id, local, error, failures);
            if action == ErrorAction::Abort {
                return action;
            }
        }
        ErrorAction::Continue
    }
}

/// The connector's option for the policy when legal, otherwise the policy default.
pub fn resolve_option<'a>(
    descriptor: &'a PolicyDescriptor,
    settings: &'a BTreeMap<String, String>,
) -> &'a str {
    match settings.get(descriptor.id) {
        Some(option) if descriptor.is_legal(option) => option.as_str(),
        Some(option) => {
            let err = ProxyError::Configuration(format!(
                "unknown option {option:?} for policy {}, expected one of {:?}",
                descriptor.id, descriptor.options
            ));
            warn!(error = %err, fallback = descriptor.default_option, "using policy default");
            descriptor.default_option
        }
        None => descriptor.default_option,
    }
}

/// Update frequency gate for release or snapshot artifacts.
pub struct UpdatePolicy {
    descriptor: PolicyDescriptor,
    snapshots: bool,
}

impl UpdatePolicy {
    pub fn releases() -> Self {
        Self {
            descriptor: PolicyDescriptor {
                id: RELEASES,
                options: UPDATE_OPTIONS,
                default_option: ALWAYS,
            },
            snapshots: false,
        }
    }

    pub fn snapshots() -> Self {
        Self {
            descriptor: PolicyDescriptor {
                id: SNAPSHOTS,
                options: UPDATE_OPTIONS,
                default_option: ALWAYS,
            },
            snapshots: true,
        }
    }
}

impl PreDownloadPolicy for UpdatePolicy {
    fn descriptor(&self) -> &PolicyDescriptor {
        &self.descriptor
    }

    fn apply(
        &self,
        option: &str,
        request: &FetchRequest,
        local: Option<&Path>,
    ) -> Result<(), ProxyError> {
        if option == ALWAYS || request.kind != RequestKind::Artifact {
            return Ok(());
        }
        let is_snapshot = request
            .version
            .clone()
            .or_else(|| version_from_path(&request.logical_path))
            .map(|version| is_snapshot_version(&version))
            .unwrap_or(false);
        if is_snapshot != self.snapshots || is_checksum_path(&request.logical_path) {
            return Ok(());
        }

        let id = self.descriptor.id;
        let path = request.logical_path.as_str();
        if option == NEVER {
            return Err(ProxyError::violation(id, path, "updates are disabled"));
        }
        let Some(local) = local else {
            return Ok(());
        };
        let interval = match option {
            ONCE => {
                return Err(ProxyError::violation(id, path, "local copy already exists"));
            }
            HOURLY => Duration::from_secs(60 * 60),
            DAILY => Duration::from_secs(24 * 60 * 60),
            _ => return Ok(()),
        };
        let age = fs::metadata(local)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());
        match age {
            Some(age) if age < interval => Err(ProxyError::violation(
                id,
                path,
                format!("local copy is {}s old, updated {option}", age.as_secs()),
            )),
            _ => Ok(()),
        }
    }
}

/// Verifies (or regenerates) checksum siblings of a transferred file.
pub struct ChecksumPolicy {
    descriptor: PolicyDescriptor,
}

impl ChecksumPolicy {
    pub fn new() -> Self {
        Self {
            descriptor: PolicyDescriptor {
                id: CHECKSUM,
                options: &[FAIL, FIX, IGNORE],
                default_option: FIX,
            },
        }
    }
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl PostDownloadPolicy for ChecksumPolicy {
    fn descriptor(&self) -> &PolicyDescriptor {
        &self.descriptor
    }

    fn apply(
        &self,
        option: &str,
        request: &FetchRequest,
        fetched: &mut StagedFiles,
    ) -> Result<(), ProxyError> {
        if option == IGNORE || is_checksum_path(&request.logical_path) {
            return Ok(());
        }
        let path = request.logical_path.as_str();

        if option == FAIL {
            let mut verified = 0usize;
            for checksum in &fetched.checksums {
                let Some(algorithm) = ChecksumAlgorithm::from_extension(&checksum.extension)
                else {
                    continue;
                };
                if !checksum_matches(&fetched.primary, algorithm, &checksum.path)? {
                    fetched.discard();
                    return Err(ProxyError::violation(
                        CHECKSUM,
                        path,
                        format!("{} checksum does not match content", algorithm.extension()),
                    ));
                }
                verified += 1;
            }
            if verified == 0 {
                fetched.discard();
                return Err(ProxyError::violation(
                    CHECKSUM,
                    path,
                    "no verifiable checksum was transferred",
                ));
            }
            return Ok(());
        }

        for extension in fetched.checksum_extensions.clone() {
            let Some(algorithm) = ChecksumAlgorithm::from_extension(&extension) else {
                continue;
            };
            let existing = fetched
                .checksums
                .iter()
                .position(|checksum| checksum.extension.eq_ignore_ascii_case(&extension));
            if let Some(index) = existing {
                if checksum_matches(&fetched.primary, algorithm, &fetched.checksums[index].path)? {
                    continue;
                }
                info!(path, extension = extension.as_str(), "replacing mismatched checksum");
                fetched.checksums.remove(index);
            }
            let sibling = write_checksum(&fetched.primary, algorithm, &extension)?;
            fetched.checksums.push(StagedChecksum {
                extension,
                path: sibling,
            });
        }
        Ok(())
    }
}

pub fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, ProxyError> {
    let file = fs::File::open(path).map_err(|err| ProxyError::Filesystem(err.to_string()))?;
    match algorithm {
        ChecksumAlgorithm::Md5 => hex_digest::<Md5>(file),
        ChecksumAlgorithm::Sha1 => hex_digest::<Sha1>(file),
        ChecksumAlgorithm::Sha256 => hex_digest::<Sha256>(file),
        ChecksumAlgorithm::Sha512 => hex_digest::<Sha512>(file),
    }
}

fn hex_digest<D: Digest + io::Write>(mut reader: impl io::Read) -> Result<String, ProxyError> {
    let mut hasher = D::new();
    io::copy(&mut reader, &mut hasher).map_err(|err| ProxyError::Filesystem(err.to_string()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Extracts the hex digest from `<hex>`, `<hex>  <file>` or BSD `ALG (file) = <hex>` forms.
pub fn parse_checksum(content: &str) -> Option<String> {
    let content = content.trim();
    let token = match content.rsplit_once(" = ") {
        Some((_, digest)) => digest.trim(),
        None => content.split_whitespace().next()?,
    };
    (!token.is_empty() && token.chars().all(|ch| ch.is_ascii_hexdigit()))
        .then(|| token.to_ascii_lowercase())
}

fn checksum_matches(
    primary: &Path,
    algorithm: ChecksumAlgorithm,
    checksum_path: &Path,
) -> Result<bool, ProxyError> {
    let bytes = fs::read(checksum_path).map_err(|err| ProxyError::Filesystem(err.to_string()))?;
    let Some(expected) = parse_checksum(&String::from_utf8_lossy(&bytes)) else {
        return Ok(false);
    };
    Ok(digest_file(primary, algorithm)? == expected)
}

fn write_checksum(
    primary: &Path,
    algorithm: ChecksumAlgorithm,
    extension: &str,
) -> Result<PathBuf, ProxyError> {
    let digest = digest_file(primary, algorithm)?;
    let mut sibling = primary.as_os_str().to_owned();
    sibling.push(".");
    sibling.push(extension);
    let sibling = PathBuf::from(sibling);
    fs::write(&sibling, format!("{digest}\n"))
        .map_err(|err| ProxyError::Filesystem(err.to_string()))?;
    Ok(sibling)
}

pub struct PropagateErrorsPolicy {
    descriptor: PolicyDescriptor,
}

impl PropagateErrorsPolicy {
    pub fn new() -> Self {
        Self {
            descriptor: PolicyDescriptor {
                id: PROPAGATE_ERRORS,
                options: &[STOP, QUEUE, IGNORE],
                default_option: QUEUE,
            },
        }
    }
}

impl Default for PropagateErrorsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadErrorPolicy for PropagateErrorsPolicy {
    fn descriptor(&self) -> &PolicyDescriptor {
        &self.descriptor
    }

    fn apply(
        &self,
        option: &str,
        request: &FetchRequest,
        target_id: &str,
        _local: Option<&Path>,
        error: &ProxyError,
        failures: &mut TargetFailures,
    ) -> ErrorAction {
        match option {
            STOP => ErrorAction::Abort,
            IGNORE => {
                debug!(
                    remote = target_id,
                    path = %request.logical_path,
                    %error,
                    "ignoring transfer error"
                );
                failures.remove(target_id);
                ErrorAction::Continue
            }
            _ => {
                failures.insert(target_id.to_string(), error.clone());
                ErrorAction::Continue
            }
        }
    }
}

pub struct PropagateErrorsOnUpdatePolicy {
    descriptor: PolicyDescriptor,
}

impl PropagateErrorsOnUpdatePolicy {
    pub fn new() -> Self {
        Self {
            descriptor: PolicyDescriptor {
                id: PROPAGATE_ERRORS_ON_UPDATE,
                options: &[ALWAYS, NOT_PRESENT],
                default_option: ALWAYS,
            },
        }
    }
}

impl Default for PropagateErrorsOnUpdatePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadErrorPolicy for PropagateErrorsOnUpdatePolicy {
    fn descriptor(&self) -> &PolicyDescriptor {
        &self.descriptor
    }

    fn apply(
        &self,
        option: &str,
        request: &FetchRequest,
        target_id: &str,
        local: Option<&Path>,
        _error: &ProxyError,
        failures: &mut TargetFailures,
    ) -> ErrorAction {
        if option == NOT_PRESENT && local.is_some() {
            debug!(
                remote = target_id,
                path = %request.logical_path,
                "local copy present, not propagating error"
            );
            failures.remove(target_id);
        }
        ErrorAction::Continue
    }
}
