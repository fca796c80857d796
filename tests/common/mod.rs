#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use camino::Utf8PathBuf;

use artifact_proxy::config::{ConnectorEntry, ResolvedConfig};
use artifact_proxy::domain::{Credentials, ManagedRepository, NetworkProxy, RemoteRepository};
use artifact_proxy::error::ProxyError;
use artifact_proxy::transport::{TransportClient, TransportSession};

pub const MANAGED: &str = "internal";

/// An in-memory remote repository.
#[derive(Default)]
pub struct MockRemote {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub last_modified: Mutex<Option<SystemTime>>,
    pub failing: Mutex<bool>,
    pub requests: Mutex<Vec<String>>,
    pub connects: Mutex<usize>,
    pub disconnects: Mutex<usize>,
    /// Username and proxy URL passed to each `connect`.
    pub connections: Mutex<Vec<(Option<String>, Option<String>)>>,
}

impl MockRemote {
    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        self
    }

    pub fn failing() -> Self {
        let remote = Self::default();
        *remote.failing.lock().unwrap() = true;
        remote
    }

    pub fn set_last_modified(&self, time: SystemTime) {
        *self.last_modified.lock().unwrap() = Some(time);
    }

    pub fn requests_for(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.as_str() == path)
            .count()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_connection(&self) -> Option<(Option<String>, Option<String>)> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[derive(Default)]
pub struct MockTransport {
    remotes: HashMap<String, Arc<MockRemote>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self, id: &str, remote: MockRemote) -> Self {
        self.remotes.insert(id.to_string(), Arc::new(remote));
        self
    }

    pub fn remote(&self, id: &str) -> Arc<MockRemote> {
        Arc::clone(&self.remotes[id])
    }
}

impl TransportClient for MockTransport {
    fn connect(
        &self,
        target: &RemoteRepository,
        credentials: Option<&Credentials>,
        proxy: Option<&NetworkProxy>,
    ) -> Result<Box<dyn TransportSession>, ProxyError> {
        let remote = self
            .remotes
            .get(&target.id)
            .cloned()
            .ok_or_else(|| ProxyError::transfer(&target.url, "unknown host"))?;
        *remote.connects.lock().unwrap() += 1;
        remote.connections.lock().unwrap().push((
            credentials.map(|creds| creds.username.clone()),
            proxy.map(NetworkProxy::url),
        ));
        Ok(Box::new(MockSession {
            url: target.url.clone(),
            remote,
        }))
    }
}

struct MockSession {
    url: String,
    remote: Arc<MockRemote>,
}

impl MockSession {
    fn serve(&self, remote_path: &str, destination: &Path) -> Result<(), ProxyError> {
        self.remote
            .requests
            .lock()
            .unwrap()
            .push(remote_path.to_string());
        let url = format!("{}/{remote_path}", self.url);
        if *self.remote.failing.lock().unwrap() {
            return Err(ProxyError::transfer(url, "connection reset"));
        }
        let content = self.remote.files.lock().unwrap().get(remote_path).cloned();
        match content {
            Some(content) => {
                std::fs::write(destination, content).unwrap();
                Ok(())
            }
            None => Err(ProxyError::NotFound(url)),
        }
    }
}

impl TransportSession for MockSession {
    fn fetch(&mut self, remote_path: &str, destination: &Path) -> Result<(), ProxyError> {
        self.serve(remote_path, destination)
    }

    fn fetch_if_newer(
        &mut self,
        remote_path: &str,
        destination: &Path,
        since: SystemTime,
    ) -> Result<(), ProxyError> {
        let last_modified = *self.remote.last_modified.lock().unwrap();
        if let Some(modified) = last_modified {
            if modified <= since && self.remote.files.lock().unwrap().contains_key(remote_path) {
                self.remote
                    .requests
                    .lock()
                    .unwrap()
                    .push(remote_path.to_string());
                return Err(ProxyError::NotModified(remote_path.to_string()));
            }
        }
        self.serve(remote_path, destination)
    }

    fn disconnect(&mut self) {
        *self.remote.disconnects.lock().unwrap() += 1;
    }
}

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub config: ResolvedConfig,
}

impl Harness {
    pub fn new(targets: &[&str]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let config = ResolvedConfig {
            schema_version: 1,
            scratch_dir: root.join("scratch"),
            failure_cache_ttl: Duration::from_secs(1800),
            managed_repositories: vec![ManagedRepository {
                id: MANAGED.to_string(),
                location: root.join("managed"),
            }],
            remote_repositories: targets.iter().map(|id| remote(id)).collect(),
            network_proxies: Vec::new(),
            connectors: Vec::new(),
            rules: Vec::new(),
        };
        Self { temp, config }
    }

    pub fn connect(mut self, target: &str, order: i32) -> Self {
        self.config.connectors.push(connector(target, order));
        self
    }

    pub fn connect_with(mut self, entry: ConnectorEntry) -> Self {
        self.config.connectors.push(entry);
        self
    }

    pub fn checksums(mut self, target: &str, extensions: &[&str]) -> Self {
        for repo in &mut self.config.remote_repositories {
            if repo.id == target {
                repo.checksum_extensions = extensions.iter().map(|ext| ext.to_string()).collect();
            }
        }
        self
    }

    pub fn credentials(mut self, target: &str, username: &str, password: &str) -> Self {
        for repo in &mut self.config.remote_repositories {
            if repo.id == target {
                repo.credentials = Some(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                });
            }
        }
        self
    }

    pub fn network_proxy(mut self, id: &str, host: &str, port: u16) -> Self {
        self.config.network_proxies.push(NetworkProxy {
            id: id.to_string(),
            protocol: "http".to_string(),
            host: host.to_string(),
            port,
            credentials: None,
            use_ntlm: false,
        });
        self
    }

    pub fn managed_path(&self, logical_path: &str) -> Utf8PathBuf {
        self.config.managed_repositories[0].location.join(logical_path)
    }

    pub fn write_local(&self, logical_path: &str, content: &[u8]) {
        let path = self.managed_path(logical_path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn read_local(&self, logical_path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.managed_path(logical_path)).ok()
    }

    /// Entries left in the scratch root.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.config.scratch_dir.as_std_path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn remote(id: &str) -> RemoteRepository {
    RemoteRepository {
        id: id.to_string(),
        url: format!("https://{id}.example/maven2"),
        credentials: None,
        timeout: Duration::from_secs(5),
        checksum_extensions: Vec::new(),
    }
}

pub fn connector(target: &str, order: i32) -> ConnectorEntry {
    ConnectorEntry {
        source: MANAGED.to_string(),
        target: target.to_string(),
        order,
        disabled: false,
        proxy_id: None,
        whitelist: Vec::new(),
        blacklist: Vec::new(),
        policies: BTreeMap::new(),
    }
}
