use edge_agent::cli::config::write_new_config;
use edge_agent::config::types::{Compression, Retention, StoreConfig};
use edge_agent::config::{generate::generate_starter_config, load_config, ConfigError};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_generated_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    std::env::set_var("EDGE_AGENT_BUCKET", "fleet-raw-can");
    write_new_config(&config_path, &generate_starter_config()).unwrap();
    let config = load_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.resolved_vehicle_id(), "vehicle-001");
    assert_eq!(config.can.interface, "can0");
    assert_eq!(config.can.read_timeout, Duration::from_millis(100));
    assert_eq!(config.simulation.cycle.len(), 4);
    assert_eq!(config.batch.window, Duration::from_secs(60));
    assert_eq!(config.batch.compression, Compression::Zstd);
    assert_eq!(config.buffer.retention, Retention::Archive);
    assert_eq!(config.upload.workers, 2);
    assert_eq!(config.upload.max_attempts, 5);
    assert!(config.logging.dir.is_none());
    match config.upload.store {
        Some(StoreConfig::S3(s3)) => {
            assert_eq!(s3.bucket, "fleet-raw-can");
            assert_eq!(s3.region.as_deref(), Some("us-east-1"));
        }
        other => panic!("expected s3 store, got {:?}", other),
    }
}

#[test]
fn test_missing_file_names_the_path() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("absent.yml");

    let err = load_config(&config_path).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
    assert!(err.to_string().contains("absent.yml"));
}

#[test]
fn test_invalid_values_are_all_reported() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    let config_yaml = r#"
data_dir: /tmp/edge
batch:
  window: 0s
  max_frames: 0
buffer:
  max_files: 0
upload:
  enabled: true
  workers: 0
"#;
    fs::write(&config_path, config_yaml).unwrap();

    let err = load_config(&config_path).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("batch.window must be positive"), "{}", message);
    assert!(message.contains("batch.max_frames must be positive"), "{}", message);
    assert!(message.contains("upload.workers"), "{}", message);
    assert!(message.contains("buffer.max_files must be positive"), "{}", message);
    assert!(message.contains("upload.store is required"), "{}", message);
}

#[test]
fn test_unknown_compression_is_a_parse_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(
        &config_path,
        "batch:\n  compression: lz4\nupload:\n  enabled: false\n",
    )
    .unwrap();

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("config.yml"), "{}", err);
}

#[test]
fn test_local_store_path_is_tilde_expanded() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(
        &config_path,
        "upload:\n  store:\n    type: local\n    path: ~/can-outbox\n",
    )
    .unwrap();

    let config = load_config(&config_path).unwrap();
    match config.upload.store {
        Some(StoreConfig::Local(local)) => {
            assert!(!local.path.starts_with("~"));
            assert!(local.path.ends_with("can-outbox"));
        }
        other => panic!("expected local store, got {:?}", other),
    }
}
