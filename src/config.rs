use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{Credentials, ManagedRepository, NetworkProxy, RemoteRepository};
use crate::error::ProxyError;
use crate::failure_cache::DEFAULT_FAILURE_TTL;

pub const DEFAULT_CONFIG_FILE: &str = "proxy.json";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub scratch_dir: Option<String>,
    #[serde(default)]
    pub failure_cache_ttl_secs: Option<u64>,
    #[serde(default)]
    pub managed_repositories: Vec<ManagedRepositoryEntry>,
    #[serde(default)]
    pub remote_repositories: Vec<RemoteRepositoryEntry>,
    #[serde(default)]
    pub network_proxies: Vec<NetworkProxyEntry>,
    #[serde(default)]
    pub proxy_connectors: Vec<ConnectorEntry>,
    #[serde(default)]
    pub connector_rules: Vec<ConnectorRuleEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagedRepositoryEntry {
    pub id: String,
    pub location: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteRepositoryEntry {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub checksum_extensions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkProxyEntry {
    pub id: String,
    #[serde(default = "default_proxy_protocol")]
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_ntlm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectorEntry {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub proxy_id: Option<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub policies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectorRuleEntry {
    pub rule_type: RuleType,
    pub pattern: String,
    #[serde(default)]
    pub connectors: Vec<ConnectorRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConnectorRef {
    Shorthand(String),
    Detailed(ConnectorRefObject),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectorRefObject {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorRule {
    pub rule_type: RuleType,
    pub pattern: String,
    pub connectors: Vec<ConnectorRefObject>,
}

impl ConnectorRule {
    pub fn applies_to(&self, source: &str, target: &str) -> bool {
        self.connectors
            .iter()
            .any(|link| link.source == source && link.target == target)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub scratch_dir: Utf8PathBuf,
    pub failure_cache_ttl: Duration,
    pub managed_repositories: Vec<ManagedRepository>,
    pub remote_repositories: Vec<RemoteRepository>,
    pub network_proxies: Vec<NetworkProxy>,
    pub connectors: Vec<ConnectorEntry>,
    pub rules: Vec<ConnectorRule>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ProxyError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(ProxyError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ProxyError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ProxyError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ProxyError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let scratch_dir = match config.scratch_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_scratch_dir()?,
        };

        let failure_cache_ttl = config
            .failure_cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FAILURE_TTL);

        let managed_repositories = config
            .managed_repositories
            .into_iter()
            .map(|entry| ManagedRepository {
                id: entry.id,
                location: Utf8PathBuf::from(entry.location),
            })
            .collect();

        let remote_repositories = config
            .remote_repositories
            .into_iter()
            .map(|entry| RemoteRepository {
                credentials: credentials(entry.username, entry.password),
                timeout: Duration::from_secs(entry.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
                checksum_extensions: entry
                    .checksum_extensions
                    .unwrap_or_else(default_checksum_extensions),
                id: entry.id,
                url: entry.url,
            })
            .collect();

        let network_proxies = config
            .network_proxies
            .into_iter()
            .map(|entry| NetworkProxy {
                credentials: credentials(entry.username, entry.password),
                id: entry.id,
                protocol: entry.protocol,
                host: entry.host,
                port: entry.port,
                use_ntlm: entry.use_ntlm,
            })
            .collect();

        let rules = config
            .connector_rules
            .into_iter()
            .map(|entry| {
                let connectors = entry
                    .connectors
                    .into_iter()
                    .map(|link| match link {
                        ConnectorRef::Shorthand(value) => parse_connector_ref(&value),
                        ConnectorRef::Detailed(obj) => Ok(obj),
                    })
                    .collect::<Result<Vec<_>, ProxyError>>()?;
                Ok(ConnectorRule {
                    rule_type: entry.rule_type,
                    pattern: entry.pattern,
                    connectors,
                })
            })
            .collect::<Result<Vec<_>, ProxyError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            scratch_dir,
            failure_cache_ttl,
            managed_repositories,
            remote_repositories,
            network_proxies,
            connectors: config.proxy_connectors,
            rules,
        })
    }
}

pub fn default_checksum_extensions() -> Vec<String> {
    vec!["sha256".to_string(), "sha512".to_string()]
}

fn default_proxy_protocol() -> String {
    "http".to_string()
}

fn default_scratch_dir() -> Result<Utf8PathBuf, ProxyError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.cache_dir().join("artifact-proxy").join("scratch"))
                .ok()
        })
        .ok_or_else(|| ProxyError::Filesystem("unable to resolve scratch directory".to_string()))
}

fn credentials(username: Option<String>, password: Option<String>) -> Option<Credentials> {
    username
        .filter(|name| !name.trim().is_empty())
        .map(|username| Credentials {
            username,
            password: password.unwrap_or_default(),
        })
}

fn parse_connector_ref(value: &str) -> Result<ConnectorRefObject, ProxyError> {
    let (source, target) = value
        .split_once("->")
        .map(|(source, target)| (source.trim(), target.trim()))
        .filter(|(source, target)| !source.is_empty() && !target.is_empty())
        .ok_or_else(|| {
            ProxyError::ConfigParse(format!("invalid connector reference: {value}"))
        })?;
    Ok(ConnectorRefObject {
        source: source.to_string(),
        target: target.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "scratch_dir": "/tmp/scratch",
                "managed_repositories": [{"id": "internal", "location": "/srv/internal"}],
                "remote_repositories": [{"id": "central", "url": "https://repo.example/maven2"}],
                "proxy_connectors": [{"source": "internal", "target": "central"}]
            }"#,
        )
        .unwrap();

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.failure_cache_ttl, DEFAULT_FAILURE_TTL);
        assert_eq!(resolved.remote_repositories[0].timeout, Duration::from_secs(60));
        assert_eq!(
            resolved.remote_repositories[0].checksum_extensions,
            default_checksum_extensions()
        );
        assert!(resolved.remote_repositories[0].credentials.is_none());
        assert_eq!(resolved.connectors[0].order, 0);
        assert!(!resolved.connectors[0].disabled);
    }

    #[test]
    fn connector_refs_accept_shorthand_and_objects() {
        let config: Config = serde_json::from_str(
            r#"{
                "scratch_dir": "/tmp/scratch",
                "connector_rules": [{
                    "rule_type": "blacklist",
                    "pattern": "com/acme/**",
                    "connectors": ["internal->central", {"source": "internal", "target": "mirror"}]
                }]
            }"#,
        )
        .unwrap();

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        let rule = &resolved.rules[0];
        assert_eq!(rule.rule_type, RuleType::Blacklist);
        assert!(rule.applies_to("internal", "central"));
        assert!(rule.applies_to("internal", "mirror"));
        assert!(!rule.applies_to("other", "central"));
    }

    #[test]
    fn malformed_connector_ref_is_rejected() {
        let config: Config = serde_json::from_str(
            r#"{
                "scratch_dir": "/tmp/scratch",
                "connector_rules": [{"rule_type": "whitelist", "pattern": "**", "connectors": ["internal"]}]
            }"#,
        )
        .unwrap();

        assert!(matches!(
            ConfigLoader::resolve_config(config),
            Err(ProxyError::ConfigParse(_))
        ));
    }
}
