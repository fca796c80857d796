use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{ArtifactRef, FetchRequest, RequestKind};
use crate::error::{ProxyError, TargetFailures};
use crate::failure_cache::UrlFailureCache;
use crate::metadata::{
    LatestWinsMerger, MetadataMerger, MetadataSource, repository_specific_name,
};
use crate::notify::{PostFetchNotifier, TaskQueue};
use crate::placement::AtomicPlacement;
use crate::policy::{ErrorAction, PolicySet};
use crate::registry::{ConnectorRegistry, ConnectorSnapshot, ProxyConnector};
use crate::store::{Asset, RepositoryStore};
use crate::transfer::{Attempt, TransferEngine};
use crate::transport::TransportClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResult {
    pub asset: Option<Asset>,
    /// Set when remote content was placed (for metadata: when any target
    /// produced newer content or no local copy existed).
    pub updated: bool,
}

enum Outcome {
    Placed,
    LocalFallback,
    Exhausted,
}

/// Per-target bookkeeping for one walk over the connectors.
struct ErrorChain<'a> {
    policies: &'a PolicySet,
    request: &'a FetchRequest,
    failures: TargetFailures,
}

impl<'a> ErrorChain<'a> {
    fn new(policies: &'a PolicySet, request: &'a FetchRequest) -> Self {
        Self {
            policies,
            request,
            failures: TargetFailures::new(),
        }
    }

    fn record(
        &mut self,
        connector: &ProxyConnector,
        destination: &Asset,
        error: ProxyError,
    ) -> Result<(), ProxyError> {
        let target_id = connector.target_repo_id();
        warn!(
            repository = %self.request.managed_repo_id,
            remote = target_id,
            path = %self.request.logical_path,
            %error,
            "transfer failed"
        );
        let local = destination.exists().then(|| destination.path.as_std_path());
        let action = self.policies.apply_download_error(
            &connector.policies,
            self.request,
            target_id,
            local,
            &error,
            &mut self.failures,
        );
        match action {
            ErrorAction::Continue => Ok(()),
            ErrorAction::Abort => {
                self.failures.insert(target_id.to_string(), error);
                Err(self.into_error())
            }
        }
    }

    fn into_error(&mut self) -> ProxyError {
        ProxyError::AggregateDownload {
            path: self.request.logical_path.clone(),
            failures: std::mem::take(&mut self.failures),
        }
    }

    fn finish(mut self) -> Result<(), ProxyError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }
}

/// Walks a managed repository's connectors to satisfy fetch requests.
pub struct FetchCoordinator {
    registry: ConnectorRegistry,
    failures: Arc<UrlFailureCache>,
    transport: Arc<dyn TransportClient>,
    policies: Arc<PolicySet>,
    engine: TransferEngine,
    placement: AtomicPlacement,
    notifier: PostFetchNotifier,
    merger: Box<dyn MetadataMerger>,
}

impl FetchCoordinator {
    pub fn new(config: &ResolvedConfig, transport: Arc<dyn TransportClient>) -> Self {
        let failures = Arc::new(UrlFailureCache::new(config.failure_cache_ttl));
        let policies = Arc::new(PolicySet::standard());
        let engine = TransferEngine::new(
            Arc::clone(&transport),
            Arc::clone(&policies),
            Arc::clone(&failures),
            config.scratch_dir.clone(),
        );
        Self {
            registry: ConnectorRegistry::new(config),
            failures,
            transport,
            policies,
            engine,
            placement: AtomicPlacement::new(),
            notifier: PostFetchNotifier::default(),
            merger: Box::new(LatestWinsMerger),
        }
    }

    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = Arc::new(policies);
        self.engine = TransferEngine::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.policies),
            Arc::clone(&self.failures),
            self.engine.scratch_root().clone(),
        );
        self
    }

    pub fn with_task_queue(mut self, queue: Box<dyn TaskQueue>) -> Self {
        self.notifier = PostFetchNotifier::new(queue);
        self
    }

    pub fn with_merger(mut self, merger: Box<dyn MetadataMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Swaps in a registry built from `config` and forgets cached failures.
    pub fn reload(&self, config: &ResolvedConfig) {
        self.registry.rebuild(config);
        self.failures.clear();
    }

    pub fn connectors(&self, repository_id: &str) -> Arc<[ProxyConnector]> {
        self.registry.get(repository_id)
    }

    pub fn has_connectors(&self, repository_id: &str) -> bool {
        self.registry.has_connectors(repository_id)
    }

    pub fn failure_cache(&self) -> &UrlFailureCache {
        &self.failures
    }

    pub fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, ProxyError> {
        match request.kind {
            RequestKind::Artifact => {
                let (asset, updated) = self.fetch_artifact_request(request)?;
                Ok(FetchResult {
                    asset: Some(asset),
                    updated,
                })
            }
            RequestKind::Resource => self.fetch_resource_request(request),
            RequestKind::Metadata => self.fetch_metadata_request(request),
        }
    }

    /// Returns the local asset, refreshed from the first target that serves it.
    pub fn fetch_artifact(
        &self,
        repository_id: &str,
        artifact: &ArtifactRef,
    ) -> Result<Asset, ProxyError> {
        let request = FetchRequest::artifact(repository_id, artifact);
        self.fetch_artifact_request(&request)
            .map(|(asset, _)| asset)
            .map_err(|err| match err {
                ProxyError::NotFound(_) => ProxyError::NotFound(artifact.to_string()),
                other => other,
            })
    }

    pub fn fetch_resource(
        &self,
        repository_id: &str,
        path: &str,
    ) -> Result<Option<Asset>, ProxyError> {
        let request = FetchRequest::resource(repository_id, path);
        Ok(self.fetch_resource_request(&request)?.asset)
    }

    pub fn fetch_metadata(
        &self,
        repository_id: &str,
        path: &str,
    ) -> Result<FetchResult, ProxyError> {
        let request = FetchRequest::metadata(repository_id, path);
        self.fetch_metadata_request(&request)
    }

    fn fetch_artifact_request(&self, request: &FetchRequest) -> Result<(Asset, bool), ProxyError> {
        let snapshot = self.registry.snapshot();
        let store = store_for(&snapshot, &request.managed_repo_id)?;
        let destination = store.asset(&request.logical_path)?;

        match self.walk(&snapshot, request, &destination)? {
            Outcome::Placed => {
                self.notifier
                    .notify(store.repository_id(), &destination.logical_path);
                Ok((destination, true))
            }
            Outcome::LocalFallback => Ok((destination, false)),
            Outcome::Exhausted if destination.exists() => Ok((destination, false)),
            Outcome::Exhausted => Err(ProxyError::NotFound(destination.logical_path)),
        }
    }

    fn fetch_resource_request(&self, request: &FetchRequest) -> Result<FetchResult, ProxyError> {
        let snapshot = self.registry.snapshot();
        let store = store_for(&snapshot, &request.managed_repo_id)?;
        let destination = store.asset(&request.logical_path)?;
        if destination.exists() {
            debug!(path = %destination.logical_path, "resource present locally");
            return Ok(FetchResult {
                asset: Some(destination),
                updated: false,
            });
        }

        match self.walk(&snapshot, request, &destination)? {
            Outcome::Placed => {
                self.notifier
                    .notify(store.repository_id(), &destination.logical_path);
                Ok(FetchResult {
                    asset: Some(destination),
                    updated: true,
                })
            }
            Outcome::LocalFallback | Outcome::Exhausted => Ok(FetchResult {
                asset: destination.exists().then_some(destination),
                updated: false,
            }),
        }
    }

    /// Tries enabled connectors in order until one places the resource.
    fn walk(
        &self,
        snapshot: &ConnectorSnapshot,
        request: &FetchRequest,
        destination: &Asset,
    ) -> Result<Outcome, ProxyError> {
        let connectors = snapshot.connectors(&request.managed_repo_id);
        let mut errors = ErrorChain::new(&self.policies, request);

        for connector in connectors.iter() {
            let target_id = connector.target_repo_id();
            if !connector.enabled {
                debug!(remote = target_id, "connector disabled");
                continue;
            }

            match self
                .engine
                .attempt(connector, request, &destination.logical_path, destination)
            {
                Ok(Attempt::Staged(staged)) => {
                    self.placement.place_all(&staged, &destination.path)?;
                    info!(
                        repository = %request.managed_repo_id,
                        remote = target_id,
                        path = %destination.logical_path,
                        "fetched from remote"
                    );
                    return Ok(Outcome::Placed);
                }
                Ok(Attempt::LocalFallback) => return Ok(Outcome::LocalFallback),
                Ok(Attempt::Skipped) => {}
                Err(ProxyError::NotFound(url)) => {
                    debug!(remote = target_id, %url, "not found on remote");
                }
                Err(ProxyError::NotModified(url)) => {
                    debug!(remote = target_id, %url, "local copy is current");
                }
                Err(err @ ProxyError::Transfer { .. }) => {
                    errors.record(connector, destination, err)?;
                }
                Err(err) => return Err(err),
            }
        }

        errors.finish()?;
        Ok(Outcome::Exhausted)
    }

    fn fetch_metadata_request(&self, request: &FetchRequest) -> Result<FetchResult, ProxyError> {
        let snapshot = self.registry.snapshot();
        let store = store_for(&snapshot, &request.managed_repo_id)?;
        let merged = store.asset(&request.logical_path)?;
        let existed = merged.exists();

        let connectors = snapshot.connectors(&request.managed_repo_id);
        let mut errors = ErrorChain::new(&self.policies, request);
        let mut sources = Vec::new();
        let mut newer = false;
        let mut answered = false;

        for connector in connectors.iter().filter(|connector| connector.enabled) {
            let target_id = connector.target_repo_id();
            let specific =
                store.asset(&repository_specific_name(target_id, &merged.logical_path))?;

            match self
                .engine
                .attempt(connector, request, &merged.logical_path, &specific)
            {
                Ok(Attempt::Staged(staged)) => {
                    self.placement.place_all(&staged, &specific.path)?;
                    debug!(remote = target_id, path = %specific.logical_path, "metadata refreshed");
                    newer = true;
                    answered = true;
                }
                Ok(Attempt::LocalFallback) => answered = true,
                Ok(Attempt::Skipped) => {}
                Err(ProxyError::NotFound(_)) => {
                    if let Err(err) = store.delete(&specific) {
                        let path = &specific.logical_path;
                        warn!(%path, %err, "failed to remove stale metadata");
                    }
                    answered = true;
                }
                Err(ProxyError::NotModified(_)) => answered = true,
                Err(err @ ProxyError::Transfer { .. }) => {
                    errors.record(connector, &specific, err)?;
                }
                Err(err) => return Err(err),
            }

            if specific.exists() {
                sources.push(MetadataSource {
                    target_id: target_id.to_string(),
                    asset: specific,
                });
            }
        }

        if !answered {
            errors.finish()?;
        }

        let updated = newer || !existed;
        if updated {
            if let Err(err) = self.merger.merge(&store, &merged.logical_path, &sources) {
                warn!(path = %merged.logical_path, %err, "metadata merge failed");
            }
        }

        let asset = merged.exists().then_some(merged);
        if updated {
            if let Some(asset) = &asset {
                self.notifier.notify(store.repository_id(), &asset.logical_path);
            }
        }
        Ok(FetchResult { asset, updated })
    }
}

fn store_for(
    snapshot: &ConnectorSnapshot,
    repository_id: &str,
) -> Result<RepositoryStore, ProxyError> {
    snapshot
        .managed(repository_id)
        .map(RepositoryStore::for_repository)
        .ok_or_else(|| ProxyError::UnknownRepository(repository_id.to_string()))
}
