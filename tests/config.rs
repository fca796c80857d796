use std::sync::Arc;

use assert_matches::assert_matches;

use artifact_proxy::config::ConfigLoader;
use artifact_proxy::coordinator::FetchCoordinator;
use artifact_proxy::error::ProxyError;
use artifact_proxy::transport::HttpTransport;

#[test]
fn config_file_builds_ordered_connectors() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("proxy.json");
    std::fs::write(
        &path,
        r#"{
            "scratch_dir": "/tmp/aproxy-scratch",
            "failure_cache_ttl_secs": 600,
            "managed_repositories": [{"id": "internal", "location": "/srv/repo/internal"}],
            "remote_repositories": [
                {"id": "central", "url": "https://repo1.maven.org/maven2"},
                {"id": "mirror", "url": "https://mirror.example/maven2", "username": "ci", "password": "secret"}
            ],
            "network_proxies": [{"id": "corp", "host": "proxy.local", "port": 3128}],
            "proxy_connectors": [
                {"source": "internal", "target": "mirror", "order": 2, "proxy_id": "corp"},
                {"source": "internal", "target": "central", "order": 1, "blacklist": ["**/*.sha1"],
                 "policies": {"releases": "once", "checksum": "fail"}}
            ],
            "connector_rules": [
                {"rule_type": "whitelist", "pattern": "org/**", "connectors": ["internal->mirror"]}
            ]
        }"#,
    )
    .unwrap();

    let config = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(config.failure_cache_ttl.as_secs(), 600);
    assert_eq!(
        config.remote_repositories[1]
            .credentials
            .as_ref()
            .map(|creds| creds.username.as_str()),
        Some("ci")
    );

    let coordinator = FetchCoordinator::new(&config, Arc::new(HttpTransport::new()));
    let connectors = coordinator.connectors("internal");
    assert_eq!(connectors[0].target_repo_id(), "central");
    assert_eq!(connectors[0].policies["checksum"], "fail");
    assert!(!connectors[0].filter.allows("org/foo/1.0/foo-1.0.jar.sha1"));
    assert_eq!(connectors[1].target_repo_id(), "mirror");
    assert_eq!(connectors[1].whitelist, vec!["org/**"]);
    assert_eq!(
        connectors[1]
            .network_proxy
            .as_ref()
            .map(|proxy| proxy.url()),
        Some("http://proxy.local:3128".to_string())
    );
}

#[test]
fn unreadable_config_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(ProxyError::ConfigRead(_))
    );
}

#[test]
fn malformed_config_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("proxy.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(ProxyError::ConfigParse(_))
    );
}
