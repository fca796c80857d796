use std::collections::BTreeMap;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Per-target failures collected while walking connectors, keyed by target repository id.
pub type TargetFailures = BTreeMap<String, ProxyError>;

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ProxyError {
    #[error("resource not found in remote repository: {0}")]
    NotFound(String),

    #[error("local copy is up to date: {0}")]
    NotModified(String),

    #[error("policy {policy} rejected {path}: {reason}")]
    PolicyViolation {
        policy: String,
        path: String,
        reason: String,
    },

    #[error("transfer of {url} failed: {message}")]
    Transfer { url: String, message: String },

    #[error("invalid proxy configuration: {0}")]
    Configuration(String),

    #[error("failed to place {path}: {message}")]
    Placement { path: String, message: String },

    #[error("failed to fetch {path} from {} remote repositories: {}", failures.len(), summarize(failures))]
    AggregateDownload {
        path: String,
        failures: TargetFailures,
    },

    #[error("unknown managed repository: {0}")]
    UnknownRepository(String),

    #[error("invalid repository path: {0}")]
    InvalidPath(String),

    #[error("invalid artifact coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("missing config file proxy.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("task queue rejected scan request: {0}")]
    Queue(String),

    #[error("metadata merge failed: {0}")]
    MetadataMerge(String),
}

impl ProxyError {
    pub fn transfer(url: impl Into<String>, message: impl ToString) -> Self {
        ProxyError::Transfer {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn violation(policy: &str, path: &str, reason: impl Into<String>) -> Self {
        ProxyError::PolicyViolation {
            policy: policy.to_string(),
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

fn summarize(failures: &TargetFailures) -> String {
    failures
        .iter()
        .map(|(target, err)| format!("[{target}] {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
