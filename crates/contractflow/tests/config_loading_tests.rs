//! Loading configuration files from disk and starting a service from them.

use std::time::Duration;

use tempfile::TempDir;

use contractflow::config::{load_config, Environment};
use contractflow::{ConfigError, ContractflowError, IngestService, NewDocument};

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("contractflow.json");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_load_full_config_file() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    let path = write_config(
        &dir,
        &format!(
            r#"{{
                "version": "1.0",
                "data_directory": "{}",
                "environment": "development",
                "workers": {{"count": 3, "poll_interval_ms": 50, "lease_timeout_secs": 120}},
                "queue": {{"default_priority": 20, "default_max_retries": 5}},
                "pipeline": {{"rule_extraction_enabled": false}},
                "resilience": {{"failure_threshold": 4, "cooldown_secs": 15}},
                "mirror": {{"grace_period_secs": 3}},
                "logging": {{"level": "debug", "json": true}}
            }}"#,
            data.display()
        ),
    );

    let config = load_config(&path).unwrap();
    assert_eq!(config.environment, Environment::Development);
    assert_eq!(config.workers.count, 3);
    assert_eq!(config.workers.lease_timeout(), Duration::from_secs(120));
    assert_eq!(config.queue.default_priority, 20);
    assert_eq!(config.queue.default_max_retries, 5);
    assert!(!config.pipeline.rule_extraction_enabled);
    assert_eq!(config.resilience.failure_threshold, 4);
    assert_eq!(config.mirror.grace_period(), Duration::from_secs(3));
    assert!(config.logging.json);
    assert_eq!(config.database_path(), data.join("contractflow.db"));
}

#[test]
fn test_unknown_section_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"{"version": "1.0", "data_directory": "/tmp/cf", "ai": {"enabled": true}}"#,
    );
    assert!(matches!(
        load_config(&path),
        Err(ConfigError::SchemaValidation { .. })
    ));
}

#[test]
fn test_malformed_json_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "{ not json");
    assert!(matches!(load_config(&path), Err(ConfigError::ParseJson(_))));
}

#[test]
fn test_service_opens_from_config_file() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    let path = write_config(
        &dir,
        &format!(
            r#"{{"version": "1.0", "data_directory": "{}", "workers": {{"count": 1, "poll_interval_ms": 5}}}}"#,
            data.display()
        ),
    );

    let config = load_config(&path).unwrap();
    let mut service = IngestService::open(config).unwrap();
    assert!(data.join("contractflow.db").exists());

    service.start_workers().unwrap();
    let body = b"Renewal is automatic each year.";
    let doc = service
        .initiate_upload(NewDocument::new("renewal.txt", body.len() as u64, 1))
        .unwrap();
    service
        .upload_chunk(&doc.id, 0, body, &contractflow::upload::content_hash(body))
        .unwrap();

    let mut finished = false;
    for _ in 0..500 {
        let status = service.upload_status(&doc.id).unwrap();
        if status.processing_status.is_terminal() {
            finished = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    service.stop_workers();
    assert!(finished, "document did not finish processing");

    assert!(matches!(
        service.job_status("missing"),
        Err(ContractflowError::JobNotFound(_))
    ));
}
