use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, ENV_VAR_PATTERN};
use crate::source::frame::MAX_ARBITRATION_ID;
use regex::Regex;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let config = parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })?;

    Ok(config)
}

/// Parse and validate a config from YAML text.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut unexpanded_vars: Vec<String> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables (e.g., export VEHICLE_ID=truck-042)\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

/// Expands tilde (~) in all PathBuf fields in the config.
fn expand_paths(config: &mut Config) {
    config.data_dir = expand_tilde(&config.data_dir);

    if let Some(StoreConfig::Local(local)) = config.upload.store.as_mut() {
        local.path = expand_tilde(&local.path);
    }

    if let Some(dir) = config.logging.dir.as_mut() {
        *dir = expand_tilde(dir);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.data_dir.as_os_str().is_empty() {
        errors.push("data_dir cannot be empty".to_string());
    }
    if let Some(id) = &config.vehicle_id {
        if id.contains('/') || id.contains('=') {
            errors.push(format!(
                "vehicle_id '{}' must not contain '/' or '=' (it becomes a partition directory)",
                id
            ));
        }
    }

    validate_can(&config.can, &mut errors);
    validate_simulation(&config.simulation, &mut errors);
    validate_batch(&config.batch, &mut errors);
    validate_buffer(&config.buffer, &mut errors);
    validate_upload(&config.upload, &mut errors);

    if config.health.interval.is_zero() {
        errors.push("health.interval must be positive".to_string());
    }
    if config.health.fps_window < std::time::Duration::from_secs(1) {
        errors.push("health.fps_window must be at least 1s".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_can(can: &CanConfig, errors: &mut Vec<String>) {
    if can.interface.trim().is_empty() {
        errors.push("can.interface cannot be empty".to_string());
    }
    if can.bitrate == 0 {
        errors.push("can.bitrate must be positive".to_string());
    }
    if can.read_timeout.is_zero() {
        errors.push("can.read_timeout must be positive".to_string());
    }
    if can.reconnect.initial.is_zero() || can.reconnect.initial > can.reconnect.max {
        errors.push(format!(
            "can.reconnect: initial ({:?}) must be positive and not exceed max ({:?})",
            can.reconnect.initial, can.reconnect.max
        ));
    }

    for (i, filter) in can.filters.iter().enumerate() {
        if !filter.is_valid() {
            let limit = if filter.extended {
                MAX_ARBITRATION_ID
            } else {
                0x7FF
            };
            errors.push(format!(
                "can.filters[{}]: id 0x{:X} / mask 0x{:X} exceed 0x{:X}",
                i, filter.id, filter.mask, limit
            ));
        }
    }
}

fn validate_simulation(sim: &SimulationConfig, errors: &mut Vec<String>) {
    if sim.frame_rate_hz == 0 {
        errors.push("simulation.frame_rate_hz must be positive".to_string());
    }
    if !sim.cycle.is_empty() && sim.cycle.iter().all(|span| span.duration.is_zero()) {
        errors.push("simulation.cycle must have a non-zero total duration".to_string());
    }
}

fn validate_batch(batch: &BatchConfig, errors: &mut Vec<String>) {
    if batch.window.is_zero() {
        errors.push("batch.window must be positive".to_string());
    }
    if batch.max_frames == 0 {
        errors.push("batch.max_frames must be positive".to_string());
    }
    if batch.compression == Compression::Zstd && !(1..=22).contains(&batch.zstd_level) {
        errors.push(format!(
            "batch.zstd_level must be between 1 and 22, got {}",
            batch.zstd_level
        ));
    }
}

fn validate_buffer(buffer: &BufferConfig, errors: &mut Vec<String>) {
    if buffer.max_disk_mb == 0 {
        errors.push("buffer.max_disk_mb must be positive".to_string());
    }
    if buffer.max_files == Some(0) {
        errors.push("buffer.max_files must be positive when set".to_string());
    }
    if buffer.archive_max_mb.is_some() && buffer.retention == Retention::Delete {
        errors.push("buffer.archive_max_mb has no effect with retention 'delete'".to_string());
    }
}

fn validate_upload(upload: &UploadConfig, errors: &mut Vec<String>) {
    if upload.backoff.initial.is_zero() || upload.backoff.initial > upload.backoff.max {
        errors.push(format!(
            "upload.backoff: initial ({:?}) must be positive and not exceed max ({:?})",
            upload.backoff.initial, upload.backoff.max
        ));
    }
    if upload.prefix.starts_with('/') || upload.prefix.ends_with('/') {
        errors.push(format!(
            "upload.prefix '{}' must not start or end with '/'",
            upload.prefix
        ));
    }

    if !upload.enabled {
        return;
    }

    if upload.workers == 0 {
        errors.push("upload.workers must be at least 1 when uploads are enabled".to_string());
    }
    if upload.max_attempts == 0 {
        errors.push("upload.max_attempts must be at least 1".to_string());
    }
    if upload.request_timeout.is_zero() {
        errors.push("upload.request_timeout must be positive".to_string());
    }
    if upload.poll_interval.is_zero() {
        errors.push("upload.poll_interval must be positive".to_string());
    }

    match &upload.store {
        None => errors.push(
            "upload.store is required when uploads are enabled (type: s3 or type: local)"
                .to_string(),
        ),
        Some(StoreConfig::S3(s3)) if s3.bucket.trim().is_empty() => {
            errors.push("upload.store.bucket cannot be empty".to_string());
        }
        Some(StoreConfig::Local(local)) if local.path.as_os_str().is_empty() => {
            errors.push("upload.store.path cannot be empty".to_string());
        }
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MINIMAL: &str = r#"
vehicle_id: truck-042
data_dir: /tmp/edge
upload:
  store:
    type: local
    path: /tmp/outbox
"#;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.resolved_vehicle_id(), "truck-042");
        assert_eq!(config.can.interface, "can0");
        assert_eq!(config.can.reconnect.initial, Duration::from_secs(1));
        assert_eq!(config.can.reconnect.max, Duration::from_secs(30));
        assert_eq!(config.batch.window, Duration::from_secs(60));
        assert_eq!(config.batch.max_frames, 100_000);
        assert_eq!(config.upload.max_attempts, 5);
        assert_eq!(config.upload.backoff.initial, Duration::from_secs(2));
        assert_eq!(config.buffer.quota_bytes(), 5000 * 1024 * 1024);
        assert_eq!(config.simulation.cycle.len(), 4);
    }

    #[test]
    fn test_human_durations() {
        let yaml = format!(
            "{}batch:\n  window: 500ms\nhealth:\n  interval: 5m\n",
            MINIMAL
        );
        let config = parse_config(&yaml).unwrap();
        assert_eq!(config.batch.window, Duration::from_millis(500));
        assert_eq!(config.health.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
batch:
  window: 0s
  max_frames: 0
upload:
  workers: 0
  backoff:
    initial: 10s
    max: 1s
can:
  filters:
    - id: 0x800
      mask: 0x7FF
"#;
        match parse_config(yaml) {
            Err(ConfigError::ValidationList(errors)) => {
                let joined = errors.join("\n");
                assert!(joined.contains("batch.window"));
                assert!(joined.contains("batch.max_frames"));
                assert!(joined.contains("upload.workers"));
                assert!(joined.contains("upload.backoff"));
                assert!(joined.contains("upload.store is required"));
                assert!(joined.contains("can.filters[0]"));
            }
            other => panic!("expected validation list, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_uploads_disabled_needs_no_store() {
        let yaml = "upload:\n  enabled: false\n";
        let config = parse_config(yaml).unwrap();
        assert!(!config.upload.enabled);
        assert!(config.upload.store.is_none());
    }

    #[test]
    fn test_vehicle_id_with_separator_rejected() {
        let yaml = format!("{}\nvehicle_id: a/b\n", MINIMAL.replace("vehicle_id: truck-042", ""));
        assert!(matches!(
            parse_config(&yaml),
            Err(ConfigError::ValidationList(_))
        ));
    }

    #[test]
    fn test_unexpanded_env_var_is_error() {
        let yaml = "vehicle_id: $env{EDGE_AGENT_TEST_SURELY_UNSET}\nupload:\n  enabled: false\n";
        match parse_config(yaml) {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("EDGE_AGENT_TEST_SURELY_UNSET"));
            }
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_s3_store_section() {
        let yaml = r#"
upload:
  prefix: fleet/raw
  store:
    type: s3
    bucket: can-data
    region: eu-west-1
    endpoint_url: http://minio:9000
"#;
        let config = parse_config(yaml).unwrap();
        match config.upload.store {
            Some(StoreConfig::S3(s3)) => {
                assert_eq!(s3.bucket, "can-data");
                assert_eq!(s3.region.as_deref(), Some("eu-west-1"));
                assert_eq!(s3.endpoint_url.as_deref(), Some("http://minio:9000"));
            }
            other => panic!("expected s3 store, got {:?}", other),
        }
    }
}
