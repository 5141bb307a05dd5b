use std::path::PathBuf;

use pipeline_core::config::{BackendKind, ConfigManager, QueueProviderKind};

fn shipped_config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
}

#[test]
fn test_shipped_base_config_validates() {
    let manager =
        ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), "development")
            .unwrap();
    let config = manager.config();
    assert_eq!(config.backend_kind().unwrap(), BackendKind::Local);
    assert_eq!(config.worker.lanes, vec!["normal", "backfill"]);
    assert!(config.retry.jitter);
}

#[test]
fn test_shipped_test_overlay() {
    let manager =
        ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), "test").unwrap();
    let config = manager.config();
    assert_eq!(config.database.url, "sqlite::memory:");
    assert_eq!(config.queue_provider_kind().unwrap(), QueueProviderKind::InMemory);
    assert_eq!(config.retry.max_delay_ms, 10);
    assert_eq!(config.logging.level.as_deref(), Some("debug"));
    // Unset keys fall through to the base file.
    assert_eq!(config.retry.max_retries, 3);
}

#[test]
fn test_shipped_production_overlay_uses_queue_backend() {
    let manager =
        ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), "production")
            .unwrap();
    let config = manager.config();
    assert_eq!(config.backend_kind().unwrap(), BackendKind::Queue);
    assert_eq!(config.worker.concurrency_per_lane, 4);
    assert!(config.logging.json);
}
