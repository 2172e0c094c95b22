use super::*;
use std::collections::HashMap;
use std::fs;
use tempfile::TempDir;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn test_defaults() {
    let config = EngineConfig::default();
    assert_eq!(config.remote, "origin");
    assert_eq!(config.branch, "main");
    assert_eq!(config.lock_ttl, Duration::from_secs(4 * 3600));
    assert_eq!(config.git_timeout, Duration::from_secs(300));
    assert_eq!(config.dvc_timeout, Duration::from_secs(1800));
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.base_delay, Duration::from_millis(750));
    assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    assert!(!config.admin_mode);
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_yaml_keeps_defaults() {
    let yaml = r#"
workspace_root: /srv/datasets/clone
locks_root: /mnt/share/locks
lock_ttl: 2h
retry:
  max_attempts: 5
  base_delay: 1s
"#;
    let config = EngineConfig::from_yaml(yaml, Path::new("config.yaml")).unwrap();

    assert_eq!(config.workspace_root, PathBuf::from("/srv/datasets/clone"));
    assert_eq!(config.locks_root, PathBuf::from("/mnt/share/locks"));
    assert_eq!(config.lock_ttl, Duration::from_secs(7200));
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay, Duration::from_secs(1));
    assert_eq!(config.retry.max_delay, Duration::from_secs(8));
    assert_eq!(config.dvc_executable, "dvc");
}

#[test]
fn test_malformed_yaml_is_parse_error() {
    let err = EngineConfig::from_yaml("lock_ttl: [not a duration", Path::new("bad.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[test]
fn test_env_overrides() {
    let mut config = EngineConfig::default();
    config
        .apply_overrides(env(&[
            ("DATAGEST_LOCKS_ROOT", "/mnt/locks"),
            ("DATAGEST_LOCK_TTL", "90m"),
            ("DATAGEST_RETRY_MAX_ATTEMPTS", "4"),
            ("DATAGEST_DVC_REMOTE", "nas"),
            ("DATAGEST_ADMIN_MODE", "true"),
        ]))
        .unwrap();

    assert_eq!(config.locks_root, PathBuf::from("/mnt/locks"));
    assert_eq!(config.lock_ttl, Duration::from_secs(90 * 60));
    assert_eq!(config.retry.max_attempts, 4);
    assert_eq!(config.dvc_remote.as_deref(), Some("nas"));
    assert!(config.admin_mode);
}

#[test]
fn test_bad_env_override_names_variable() {
    let mut config = EngineConfig::default();
    let err = config
        .apply_overrides(env(&[("DATAGEST_GIT_TIMEOUT", "soon")]))
        .unwrap_err();
    assert!(err.to_string().contains("DATAGEST_GIT_TIMEOUT"));
}

#[test]
fn test_validation_rejects_zero_values() {
    let mut config = EngineConfig::default();
    config.lock_ttl = Duration::ZERO;
    assert!(config.validate().unwrap_err().to_string().contains("lock_ttl"));

    let mut config = EngineConfig::default();
    config.retry.max_attempts = 0;
    assert!(config.validate().is_err());

    let mut config = EngineConfig::default();
    config.dvc_timeout = Duration::ZERO;
    assert!(config.validate().is_err());
}

#[test]
fn test_engine_settings_carry_config() {
    let mut config = EngineConfig::default();
    config.branch = "release".to_string();
    config.lock_ttl = Duration::from_secs(60);

    let settings = config.engine_settings();
    assert_eq!(settings.branch, "release");
    assert_eq!(settings.lock_ttl, Duration::from_secs(60));
    assert_eq!(settings.retry, config.retry);
}

#[tokio::test]
async fn test_loader_reads_explicit_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    fs::write(&path, "branch: develop\ngit_timeout: 45s\n").unwrap();

    let config = ConfigLoader::new(Some(path)).without_env().load().await.unwrap();
    assert_eq!(config.branch, "develop");
    assert_eq!(config.git_timeout, Duration::from_secs(45));
}

#[tokio::test]
async fn test_loader_missing_explicit_file_is_error() {
    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::new(Some(dir.path().join("absent.yaml")))
        .without_env()
        .load()
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[tokio::test]
async fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.yaml");
    let mut config = EngineConfig::default();
    config.remote = "upstream".to_string();
    config.lock_ttl = Duration::from_secs(3 * 3600);

    ConfigLoader::save(&config, &path).await.unwrap();
    let loaded = ConfigLoader::new(Some(path)).without_env().load().await.unwrap();
    assert_eq!(loaded, config);
}

#[tokio::test]
async fn test_loader_rejects_invalid_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    fs::write(&path, "retry:\n  max_attempts: 0\n").unwrap();

    let err = ConfigLoader::new(Some(path)).without_env().load().await.unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}
