//! Config loading and defaults integration tests

use std::path::PathBuf;
use std::time::Duration;

use mirror_node::config::Config;
use mirror_node::NodeError;

#[test]
fn test_defaults() {
    let config = Config::from_toml("").unwrap();

    assert_eq!(config.coordinator.base_url, "https://openbmclapi.bangbang93.com");
    assert_eq!(config.storage.data_dir, PathBuf::from("./cache"));
    assert_eq!(config.download.max_parallel, 32);
    assert_eq!(config.download.max_attempts, 10);
    assert_eq!(config.download.idle_timeout_secs, 60);
    assert_eq!(config.cache.idle_ttl_secs, 1440);
    assert_eq!(config.cache.max_bytes, 512 * 1024 * 1024);
    assert_eq!(config.cache.sweep_interval_secs, 5);
    assert_eq!(config.session.heartbeat_interval(), Duration::from_secs(5));
    assert_eq!(config.session.ack_timeout(), Duration::from_secs(30));
    assert_eq!(config.session.reconnect_delay(), Duration::from_secs(5));
    assert_eq!(config.api.http_port, 8800);
    assert!(!config.session.byoc);
}

#[test]
fn test_config_with_all_sections() {
    let toml_str = r#"
[cluster]
id = "cluster-1"
secret = "s3cret"
auth_retries = 5

[coordinator]
base_url = "http://127.0.0.1:9000"
request_timeout_secs = 10

[storage]
data_dir = "/var/lib/mirror"

[download]
max_parallel = 8
max_attempts = 0

[cache]
max_bytes = 1048576

[session]
public_host = "mirror.example.com"
public_port = 443
byoc = true

[api]
http_port = 9090
"#;

    let config = Config::from_toml(toml_str).unwrap();
    config.validate().unwrap();

    assert_eq!(config.cluster.id, "cluster-1");
    assert_eq!(config.cluster.auth_retries, 5);
    assert_eq!(config.cluster.auth_retry_delay_secs, 5);
    assert_eq!(config.coordinator.request_timeout_secs, 10);
    assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/mirror"));
    assert_eq!(config.download.max_parallel, 8);
    assert_eq!(config.download.max_attempts, 0);
    assert_eq!(config.cache.max_bytes, 1_048_576);
    assert!(config.session.byoc);
    assert_eq!(config.announced_port(), 443);
}

#[test]
fn test_announced_port_falls_back_to_http_port() {
    let config = Config::from_toml("[api]\nhttp_port = 4000\n").unwrap();
    assert_eq!(config.announced_port(), 4000);
}

#[test]
fn test_validate_requires_identity() {
    let config = Config::default();
    assert!(matches!(config.validate(), Err(NodeError::Config(_))));

    let mut config = Config::default();
    config.cluster.id = "c".into();
    config.cluster.secret = "s".into();
    config.validate().unwrap();

    config.download.max_parallel = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_toml_is_config_error() {
    assert!(matches!(
        Config::from_toml("[download]\nmax_parallel = \"many\""),
        Err(NodeError::Config(_))
    ));
}
