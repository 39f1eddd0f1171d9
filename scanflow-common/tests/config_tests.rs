//! Configuration loading and root folder resolution
//!
//! Tests that touch SCANFLOW_* environment variables are marked #[serial]
//! so they do not race each other.

use scanflow_common::config::{
    default_root_folder, resolve_root_folder, EmbeddingConfig, PipelineConfig, CONFIG_ENV_VAR,
    ROOT_FOLDER_ENV_VAR,
};
use scanflow_common::Error;
use serial_test::serial;
use std::path::{Path, PathBuf};

#[test]
#[serial]
fn test_root_folder_cli_wins() {
    std::env::set_var(ROOT_FOLDER_ENV_VAR, "/from/env");
    let root = resolve_root_folder(
        Some(Path::new("/from/cli")),
        ROOT_FOLDER_ENV_VAR,
        Some(Path::new("/from/toml")),
    );
    assert_eq!(root, PathBuf::from("/from/cli"));
    std::env::remove_var(ROOT_FOLDER_ENV_VAR);
}

#[test]
#[serial]
fn test_root_folder_env_before_toml() {
    std::env::set_var(ROOT_FOLDER_ENV_VAR, "/from/env");
    let root = resolve_root_folder(None, ROOT_FOLDER_ENV_VAR, Some(Path::new("/from/toml")));
    assert_eq!(root, PathBuf::from("/from/env"));

    // Blank values do not count
    std::env::set_var(ROOT_FOLDER_ENV_VAR, "  ");
    let root = resolve_root_folder(None, ROOT_FOLDER_ENV_VAR, Some(Path::new("/from/toml")));
    assert_eq!(root, PathBuf::from("/from/toml"));
    std::env::remove_var(ROOT_FOLDER_ENV_VAR);
}

#[test]
#[serial]
fn test_root_folder_os_default_last() {
    std::env::remove_var(ROOT_FOLDER_ENV_VAR);
    let root = resolve_root_folder(None, ROOT_FOLDER_ENV_VAR, None);
    assert_eq!(root, default_root_folder());
    assert!(root.ends_with("scanflow"));
}

#[test]
#[serial]
fn test_load_from_env_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scanflow.toml");
    std::fs::write(
        &path,
        "[broker]\nqueue_prefix = \"staging_\"\n\n[training]\nretrain_batch_size = 5\n",
    )
    .unwrap();

    std::env::set_var(CONFIG_ENV_VAR, &path);
    let config = PipelineConfig::load(None).unwrap();
    std::env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.broker.queue_prefix, "staging_");
    assert_eq!(config.training.retrain_batch_size, 5);
    // Untouched sections keep their defaults
    assert_eq!(config.pipeline.consume.len(), 4);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let result = PipelineConfig::load(Some(Path::new("/no/such/scanflow.toml")));
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
#[serial]
fn test_invalid_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[broker.reconnect]\nbase_delay_ms = 0\n").unwrap();

    let result = PipelineConfig::load(Some(&path));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_api_key_from_named_env_var() {
    let config = EmbeddingConfig {
        api_key_env: Some("SCANFLOW_TEST_EMBED_KEY".to_string()),
        ..EmbeddingConfig::default()
    };

    std::env::remove_var("SCANFLOW_TEST_EMBED_KEY");
    assert_eq!(config.api_key(), None);

    std::env::set_var("SCANFLOW_TEST_EMBED_KEY", "sk-test");
    assert_eq!(config.api_key().as_deref(), Some("sk-test"));

    let explicit = EmbeddingConfig {
        api_key: Some("sk-explicit".to_string()),
        ..config
    };
    assert_eq!(explicit.api_key().as_deref(), Some("sk-explicit"));
    std::env::remove_var("SCANFLOW_TEST_EMBED_KEY");
}
