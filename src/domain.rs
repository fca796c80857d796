use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

pub const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Artifact,
    Resource,
    Metadata,
}

/// Maven-style coordinates: `group:artifact[:extension[:classifier]]:version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub classifier: Option<String>,
    pub extension: String,
}

impl ArtifactRef {
    pub fn is_snapshot(&self) -> bool {
        is_snapshot_version(&self.version)
    }

    pub fn to_path(&self) -> String {
        let file_name = match &self.classifier {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.artifact_id, self.version, classifier, self.extension
            ),
            None => format!("{}-{}.{}", self.artifact_id, self.version, self.extension),
        };
        format!(
            "{}/{}/{}/{}",
            self.group_id.replace('.', "/"),
            self.artifact_id,
            self.version,
            file_name
        )
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.extension)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{classifier}")?;
        }
        write!(f, ":{}", self.version)
    }
}

impl FromStr for ArtifactRef {
    type Err = ProxyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.trim().split(':').collect::<Vec<_>>();
        if parts.iter().any(|part| part.trim().is_empty()) {
            return Err(ProxyError::InvalidCoordinates(value.to_string()));
        }
        let (group_id, artifact_id, extension, classifier, version) = match parts.as_slice() {
            [g, a, v] => (*g, *a, "jar", None, *v),
            [g, a, e, v] => (*g, *a, *e, None, *v),
            [g, a, e, c, v] => (*g, *a, *e, Some(*c), *v),
            _ => return Err(ProxyError::InvalidCoordinates(value.to_string())),
        };
        let segment_ok = |s: &str| !s.contains('/') && !s.contains('\\') && s != "..";
        if ![group_id, artifact_id, extension, version]
            .into_iter()
            .chain(classifier)
            .all(segment_ok)
        {
            return Err(ProxyError::InvalidCoordinates(value.to_string()));
        }
        Ok(Self {
            group_id: group_id.to_string(),
            artifact_id: artifact_id.to_string(),
            version: version.to_string(),
            classifier: classifier.map(str::to_string),
            extension: extension.to_string(),
        })
    }
}

pub fn is_snapshot_version(version: &str) -> bool {
    version.ends_with(SNAPSHOT_SUFFIX) || is_timestamped_snapshot(version)
}

// 1.0-20240102.101112-3
fn is_timestamped_snapshot(version: &str) -> bool {
    let mut parts = version.rsplitn(3, '-');
    let (Some(build), Some(stamp), Some(_base)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Some((date, time)) = stamp.split_once('.') else {
        return false;
    };
    !build.is_empty()
        && build.chars().all(|ch| ch.is_ascii_digit())
        && date.len() == 8
        && time.len() == 6
        && date.chars().chain(time.chars()).all(|ch| ch.is_ascii_digit())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "md5" => Some(ChecksumAlgorithm::Md5),
            "sha1" => Some(ChecksumAlgorithm::Sha1),
            "sha256" => Some(ChecksumAlgorithm::Sha256),
            "sha512" => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Extensions recognised as checksum siblings, whether or not they can be verified.
pub const CHECKSUM_EXTENSIONS: &[&str] = &["sha1", "md5", "sha256", "sha512", "asc"];

pub fn is_checksum_path(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| CHECKSUM_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Best-effort version hint for a logical path, taken from the directory that holds the file.
pub fn version_from_path(path: &str) -> Option<String> {
    let segments = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if segments.len() < 3 {
        return None;
    }
    let version = segments[segments.len() - 2];
    let artifact_id = segments[segments.len() - 3];
    let file_name = segments[segments.len() - 1];
    file_name
        .starts_with(&format!("{artifact_id}-"))
        .then(|| version.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedRepository {
    pub id: String,
    pub location: camino::Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub id: String,
    pub url: String,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
    pub checksum_extensions: Vec<String>,
}

impl RemoteRepository {
    pub fn url_for(&self, remote_path: &str) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            remote_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProxy {
    pub id: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub use_ntlm: bool,
}

impl NetworkProxy {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub managed_repo_id: String,
    pub logical_path: String,
    pub kind: RequestKind,
    pub version: Option<String>,
}

impl FetchRequest {
    pub fn artifact(managed_repo_id: &str, artifact: &ArtifactRef) -> Self {
        Self {
            managed_repo_id: managed_repo_id.to_string(),
            logical_path: artifact.to_path(),
            kind: RequestKind::Artifact,
            version: Some(artifact.version.clone()),
        }
    }

    pub fn resource(managed_repo_id: &str, path: &str) -> Self {
        Self {
            managed_repo_id: managed_repo_id.to_string(),
            logical_path: path.to_string(),
            kind: RequestKind::Resource,
            version: None,
        }
    }

    pub fn metadata(managed_repo_id: &str, path: &str) -> Self {
        Self {
            managed_repo_id: managed_repo_id.to_string(),
            logical_path: path.to_string(),
            kind: RequestKind::Metadata,
            version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_artifact_ref_short_form() {
        let artifact: ArtifactRef = "org.foo:foo:1.0".parse().unwrap();
        assert_eq!(artifact.extension, "jar");
        assert_eq!(artifact.to_path(), "org/foo/foo/1.0/foo-1.0.jar");
    }

    #[test]
    fn parse_artifact_ref_with_classifier() {
        let artifact: ArtifactRef = "org.foo:foo:jar:sources:1.0".parse().unwrap();
        assert_eq!(artifact.to_path(), "org/foo/foo/1.0/foo-1.0-sources.jar");
        assert_eq!(artifact.to_string(), "org.foo:foo:jar:sources:1.0");
    }

    #[test]
    fn parse_artifact_ref_invalid() {
        assert_matches!(
            "org.foo:foo".parse::<ArtifactRef>(),
            Err(ProxyError::InvalidCoordinates(_))
        );
        assert_matches!(
            "org.foo:foo::1.0".parse::<ArtifactRef>(),
            Err(ProxyError::InvalidCoordinates(_))
        );
        assert_matches!(
            "org.foo:..:1.0".parse::<ArtifactRef>(),
            Err(ProxyError::InvalidCoordinates(_))
        );
    }

    #[test]
    fn snapshot_detection() {
        assert!(is_snapshot_version("1.0-SNAPSHOT"));
        assert!(is_snapshot_version("1.0-20240102.101112-3"));
        assert!(!is_snapshot_version("1.0"));
        assert!(!is_snapshot_version("1.0-beta-2"));
    }

    #[test]
    fn checksum_paths() {
        assert!(is_checksum_path("org/foo/1.0/foo-1.0.jar.sha1"));
        assert!(is_checksum_path("org/foo/1.0/foo-1.0.jar.SHA256"));
        assert!(!is_checksum_path("org/foo/1.0/foo-1.0.jar"));
    }

    #[test]
    fn checksum_algorithms_from_extensions() {
        assert_eq!(ChecksumAlgorithm::from_extension("SHA1"), Some(ChecksumAlgorithm::Sha1));
        assert_eq!(ChecksumAlgorithm::from_extension("md5"), Some(ChecksumAlgorithm::Md5));
        assert_eq!(ChecksumAlgorithm::from_extension("asc"), None);
        assert_eq!(ChecksumAlgorithm::Sha512.extension(), "sha512");
    }

    #[test]
    fn version_hint_from_layout() {
        assert_eq!(
            version_from_path("org/foo/foo/1.0/foo-1.0.jar").as_deref(),
            Some("1.0")
        );
        assert_eq!(version_from_path("org/foo/maven-metadata.xml"), None);
    }

    #[test]
    fn remote_url_joins_cleanly() {
        let remote = RemoteRepository {
            id: "central".to_string(),
            url: "https://repo.example/maven2/".to_string(),
            credentials: None,
            timeout: Duration::from_secs(60),
            checksum_extensions: Vec::new(),
        };
        assert_eq!(
            remote.url_for("/org/foo/foo-1.0.jar"),
            "https://repo.example/maven2/org/foo/foo-1.0.jar"
        );
    }
}
