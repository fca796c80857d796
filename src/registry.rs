use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ConnectorEntry, ConnectorRule, ResolvedConfig, RuleType};
use crate::domain::{ManagedRepository, NetworkProxy, RemoteRepository};
use crate::filter::PathFilter;

/// A resolved link from a managed repository to one remote target.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConnector {
    pub source_repo_id: String,
    pub target: RemoteRepository,
    pub order: i32,
    pub enabled: bool,
    /// Raw patterns after rule merging, kept for introspection.
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub filter: PathFilter,
    pub network_proxy: Option<Arc<NetworkProxy>>,
    pub policies: BTreeMap<String, String>,
}

impl ProxyConnector {
    pub fn target_repo_id(&self) -> &str {
        &self.target.id
    }

    pub fn summary(&self) -> ConnectorSummary {
        ConnectorSummary {
            source: self.source_repo_id.clone(),
            target: self.target.id.clone(),
            url: self.target.url.clone(),
            order: self.order,
            enabled: self.enabled,
            network_proxy: self.network_proxy.as_ref().map(|proxy| proxy.id.clone()),
            whitelist: self.whitelist.clone(),
            blacklist: self.blacklist.clone(),
            policies: self.policies.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorSummary {
    pub source: String,
    pub target: String,
    pub url: String,
    pub order: i32,
    pub enabled: bool,
    pub network_proxy: Option<String>,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub policies: BTreeMap<String, String>,
}

/// One immutable generation of the connector table.
#[derive(Debug, Default)]
pub struct ConnectorSnapshot {
    managed: HashMap<String, ManagedRepository>,
    connectors: HashMap<String, Arc<[ProxyConnector]>>,
}

impl ConnectorSnapshot {
    pub fn build(config: &ResolvedConfig) -> Self {
        let managed: HashMap<String, ManagedRepository> = config
            .managed_repositories
            .iter()
            .map(|repo| (repo.id.clone(), repo.clone()))
            .collect();
        let remotes: HashMap<&str, &RemoteRepository> = config
            .remote_repositories
            .iter()
            .map(|repo| (repo.id.as_str(), repo))
            .collect();
        let proxies: HashMap<&str, Arc<NetworkProxy>> = config
            .network_proxies
            .iter()
            .map(|proxy| (proxy.id.as_str(), Arc::new(proxy.clone())))
            .collect();

        let mut grouped: BTreeMap<String, Vec<ProxyConnector>> = BTreeMap::new();
        for entry in &config.connectors {
            if !managed.contains_key(&entry.source) {
                warn!(
                    source = %entry.source,
                    remote = %entry.target,
                    "dropping connector with unknown managed repository"
                );
                continue;
            }
            let Some(target) = remotes.get(entry.target.as_str()) else {
                warn!(
                    source = %entry.source,
                    remote = %entry.target,
                    "dropping connector with unknown remote repository"
                );
                continue;
            };
            let connector = build_connector(entry, target, &proxies, &config.rules);
            grouped
                .entry(entry.source.clone())
                .or_default()
                .push(connector);
        }

        let connectors = grouped
            .into_iter()
            .map(|(source, mut list)| {
                // stable: equal orders keep configuration sequence
                list.sort_by_key(|connector| connector.order);
                (source, Arc::from(list))
            })
            .collect();

        Self {
            managed,
            connectors,
        }
    }

    pub fn managed(&self, repository_id: &str) -> Option<&ManagedRepository> {
        self.managed.get(repository_id)
    }

    pub fn connectors(&self, repository_id: &str) -> Arc<[ProxyConnector]> {
        self.connectors
            .get(repository_id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn has_connectors(&self, repository_id: &str) -> bool {
        self.connectors
            .get(repository_id)
            .is_some_and(|list| !list.is_empty())
    }
}

fn build_connector(
    entry: &ConnectorEntry,
    target: &RemoteRepository,
    proxies: &HashMap<&str, Arc<NetworkProxy>>,
    rules: &[ConnectorRule],
) -> ProxyConnector {
    let mut whitelist = entry.whitelist.clone();
    let mut blacklist = entry.blacklist.clone();
    for rule in rules
        .iter()
        .filter(|rule| rule.applies_to(&entry.source, &entry.target))
    {
        match rule.rule_type {
            RuleType::Whitelist => whitelist.push(rule.pattern.clone()),
            RuleType::Blacklist => blacklist.push(rule.pattern.clone()),
        }
    }

    let (filter, errors) = PathFilter::compile(&whitelist, &blacklist);
    for err in errors {
        warn!(source = %entry.source, remote = %entry.target, %err, "ignoring path pattern");
    }

    let network_proxy = entry.proxy_id.as_deref().and_then(|id| {
        let proxy = proxies.get(id).cloned();
        if proxy.is_none() {
            warn!(
                source = %entry.source,
                remote = %entry.target,
                proxy = id,
                "unknown network proxy, connecting directly"
            );
        }
        proxy
    });

    ProxyConnector {
        source_repo_id: entry.source.clone(),
        target: target.clone(),
        order: entry.order,
        enabled: !entry.disabled,
        whitelist,
        blacklist,
        filter,
        network_proxy,
        policies: entry.policies.clone(),
    }
}

/// Holds the current snapshot; `rebuild` swaps it in one step.
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    snapshot: RwLock<Arc<ConnectorSnapshot>>,
}

impl ConnectorRegistry {
    pub fn new(config: &ResolvedConfig) -> Self {
        let registry = Self::default();
        registry.rebuild(config);
        registry
    }

    pub fn rebuild(&self, config: &ResolvedConfig) {
        let snapshot = Arc::new(ConnectorSnapshot::build(config));
        let total: usize = snapshot.connectors.values().map(|list| list.len()).sum();
        *self.snapshot.write() = snapshot;
        info!(connectors = total, "connector registry rebuilt");
    }

    pub fn snapshot(&self) -> Arc<ConnectorSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn get(&self, repository_id: &str) -> Arc<[ProxyConnector]> {
        let connectors = self.snapshot().connectors(repository_id);
        debug!(repository = repository_id, count = connectors.len(), "resolved connectors");
        connectors
    }

    pub fn has_connectors(&self, repository_id: &str) -> bool {
        self.snapshot().has_connectors(repository_id)
    }
}
