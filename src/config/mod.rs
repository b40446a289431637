// drivemirror/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const MIB: u64 = 1024 * 1024;
/// S3 rejects non-final parts below 5 MiB.
const MIN_PART_SIZE: u64 = 5 * MIB;
const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
const DEFAULT_TOKEN_ENV: &str = "DRIVE_ACCESS_TOKEN";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Upper bound on a whole request, body included; sized for large downloads.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub server_side_encryption: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonStateConfig {
    pub dynamodb_table: Option<String>,
    pub local_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonSharedDrive {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSourceConfig {
    pub api_base: Option<String>,
    pub access_token_env: Option<String>,
    pub include_user_files: Option<bool>,
    pub shared_drives: Option<Vec<JsonSharedDrive>>,
    pub page_size: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonEngineConfig {
    pub max_workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub rate_limit_delay_ms: Option<u64>,
    pub large_object_threshold: Option<u64>,
    pub part_size: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub rate_limit_backoff_multiplier: Option<u32>,
    pub state_ttl_days: Option<i64>,
    pub attribute_value_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub log_level: Option<String>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub state: Option<JsonStateConfig>,
    pub source: Option<JsonSourceConfig>,
    pub engine: Option<JsonEngineConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub bucket_name: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub static_credentials: Option<(String, String)>,
    pub folder_prefix: Option<String>,
    pub server_side_encryption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBackend {
    DynamoDb { table: String },
    LocalFile { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDrive {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub api_base: Url,
    pub access_token_env: String,
    pub include_user_files: bool,
    pub shared_drives: Vec<SharedDrive>,
    pub page_size: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub batch_size: usize,
    pub rate_limit_delay: Duration,
    pub large_object_threshold: u64,
    pub part_size: u64,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub rate_limit_backoff_multiplier: u32,
    pub state_ttl: chrono::Duration,
    pub attribute_value_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_workers: 5,
            batch_size: 50,
            rate_limit_delay: Duration::from_millis(100),
            large_object_threshold: 100 * MIB,
            part_size: 10 * MIB,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1000),
            rate_limit_backoff_multiplier: 4,
            state_ttl: chrono::Duration::days(30),
            attribute_value_limit: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub spaces_config: SpacesConfig,
    pub state: StateBackend,
    pub source: SourceConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let mut raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        apply_env_overrides(&mut raw_json_config, |name| env::var(name).ok());
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        Ok(AppConfig {
            log_level: raw.log_level.clone().unwrap_or_else(|| "info".to_string()),
            spaces_config: load_spaces_config(raw.s3_storage.as_ref())?,
            state: load_state_backend(raw.state.as_ref())?,
            source: load_source_config(raw.source.as_ref())?,
            engine: load_engine_config(raw.engine.as_ref())?,
        })
    }
}

/// Environment variables win over config.json for the settings most often
/// changed per deployment.
fn apply_env_overrides<F>(raw: &mut RawJsonConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(bucket) = lookup("S3_BUCKET") {
        raw.s3_storage.get_or_insert_with(Default::default).bucket_name = Some(bucket);
    }
    if let Some(table) = lookup("STATE_TABLE") {
        let state = raw.state.get_or_insert_with(Default::default);
        state.dynamodb_table = Some(table);
        state.local_file = None;
    }
    let engine = raw.engine.get_or_insert_with(Default::default);
    if let Some(v) = lookup("MAX_WORKERS").and_then(|v| v.trim().parse().ok()) {
        engine.max_workers = Some(v);
    }
    if let Some(v) = lookup("RATE_LIMIT_DELAY_MS").and_then(|v| v.trim().parse().ok()) {
        engine.rate_limit_delay_ms = Some(v);
    }
    if let Some(v) = lookup("BATCH_SIZE").and_then(|v| v.trim().parse().ok()) {
        engine.batch_size = Some(v);
    }
}

fn load_spaces_config(raw: Option<&JsonS3StorageConfig>) -> Result<SpacesConfig> {
    let raw = raw.context("s3_storage must be defined in config.json")?;
    let bucket_name = raw
        .bucket_name
        .clone()
        .filter(|s| !s.trim().is_empty())
        .context("s3_storage.bucket_name must be set in config.json (or S3_BUCKET)")?;

    let static_credentials = match (
        raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
    ) {
        (Some(key_id), Some(secret)) => Some((key_id.clone(), secret.clone())),
        (None, None) => None,
        _ => {
            return Err(anyhow::anyhow!(
                "s3_storage.access_key_id and s3_storage.secret_access_key must be set together"
            ));
        }
    };

    if let Some(endpoint) = raw.endpoint_url.as_ref().filter(|s| !s.is_empty()) {
        Url::parse(endpoint)
            .with_context(|| format!("s3_storage.endpoint_url is not a valid URL: {}", endpoint))?;
    }

    Ok(SpacesConfig {
        bucket_name,
        region: raw.region.clone().filter(|s| !s.is_empty()),
        endpoint_url: raw.endpoint_url.clone().filter(|s| !s.is_empty()),
        static_credentials,
        folder_prefix: raw
            .folder_prefix
            .as_ref()
            .map(|p| p.trim_matches('/').to_string())
            .filter(|s| !s.is_empty()),
        server_side_encryption: raw.server_side_encryption.clone().filter(|s| !s.is_empty()),
    })
}

fn load_state_backend(raw: Option<&JsonStateConfig>) -> Result<StateBackend> {
    let raw = raw.context("state must be defined in config.json (dynamodb_table or local_file)")?;
    match (
        raw.dynamodb_table.as_ref().filter(|s| !s.is_empty()),
        raw.local_file.as_ref().filter(|p| !p.as_os_str().is_empty()),
    ) {
        (Some(table), None) => Ok(StateBackend::DynamoDb { table: table.clone() }),
        (None, Some(path)) => Ok(StateBackend::LocalFile { path: path.clone() }),
        (Some(_), Some(_)) => Err(anyhow::anyhow!(
            "state.dynamodb_table and state.local_file are mutually exclusive"
        )),
        (None, None) => Err(anyhow::anyhow!(
            "state requires either dynamodb_table or local_file"
        )),
    }
}

fn load_source_config(raw: Option<&JsonSourceConfig>) -> Result<SourceConfig> {
    let default = JsonSourceConfig::default();
    let raw = raw.unwrap_or(&default);

    let api_base_str = raw.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
    let api_base = Url::parse(api_base_str)
        .with_context(|| format!("source.api_base is not a valid URL: {}", api_base_str))?;

    let shared_drives: Vec<SharedDrive> = raw
        .shared_drives
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|d| SharedDrive { id: d.id, name: d.name })
        .collect();
    if let Some(bad) = shared_drives.iter().find(|d| d.id.is_empty() || d.name.is_empty()) {
        return Err(anyhow::anyhow!(
            "shared drive entries need both id and name (got id={:?}, name={:?})",
            bad.id,
            bad.name
        ));
    }

    let include_user_files = raw.include_user_files.unwrap_or(true);
    if !include_user_files && shared_drives.is_empty() {
        return Err(anyhow::anyhow!(
            "source.include_user_files is false and no shared_drives are configured; nothing to back up"
        ));
    }

    let page_size = raw.page_size.unwrap_or(100);
    if page_size == 0 || page_size > 1000 {
        return Err(anyhow::anyhow!("source.page_size must be between 1 and 1000"));
    }

    let connect_timeout_secs = raw.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    let request_timeout_secs = raw.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if connect_timeout_secs == 0 || request_timeout_secs == 0 {
        return Err(anyhow::anyhow!(
            "source.connect_timeout_secs and source.request_timeout_secs must be positive"
        ));
    }

    Ok(SourceConfig {
        api_base,
        access_token_env: raw
            .access_token_env
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_ENV.to_string()),
        include_user_files,
        shared_drives,
        page_size,
        connect_timeout: Duration::from_secs(connect_timeout_secs),
        request_timeout: Duration::from_secs(request_timeout_secs),
    })
}

fn load_engine_config(raw: Option<&JsonEngineConfig>) -> Result<EngineConfig> {
    let d = EngineConfig::default();
    let Some(raw) = raw else {
        return Ok(d);
    };

    let engine = EngineConfig {
        max_workers: raw.max_workers.unwrap_or(d.max_workers),
        batch_size: raw.batch_size.unwrap_or(d.batch_size),
        rate_limit_delay: raw
            .rate_limit_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(d.rate_limit_delay),
        large_object_threshold: raw.large_object_threshold.unwrap_or(d.large_object_threshold),
        part_size: raw.part_size.unwrap_or(d.part_size),
        max_attempts: raw.max_attempts.unwrap_or(d.max_attempts),
        retry_base_delay: raw
            .retry_base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(d.retry_base_delay),
        rate_limit_backoff_multiplier: raw
            .rate_limit_backoff_multiplier
            .unwrap_or(d.rate_limit_backoff_multiplier),
        state_ttl: raw
            .state_ttl_days
            .map(chrono::Duration::days)
            .unwrap_or(d.state_ttl),
        attribute_value_limit: raw.attribute_value_limit.unwrap_or(d.attribute_value_limit),
    };

    if engine.max_workers == 0 {
        return Err(anyhow::anyhow!("engine.max_workers must be at least 1"));
    }
    if engine.batch_size == 0 {
        return Err(anyhow::anyhow!("engine.batch_size must be at least 1"));
    }
    if engine.max_attempts == 0 {
        return Err(anyhow::anyhow!("engine.max_attempts must be at least 1"));
    }
    if engine.part_size < MIN_PART_SIZE {
        return Err(anyhow::anyhow!(
            "engine.part_size must be at least {} bytes",
            MIN_PART_SIZE
        ));
    }
    if engine.large_object_threshold < engine.part_size {
        return Err(anyhow::anyhow!(
            "engine.large_object_threshold must not be smaller than engine.part_size"
        ));
    }
    if engine.state_ttl <= chrono::Duration::zero() {
        return Err(anyhow::anyhow!("engine.state_ttl_days must be positive"));
    }
    if engine.attribute_value_limit == 0 {
        return Err(anyhow::anyhow!("engine.attribute_value_limit must be positive"));
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn raw_from(value: serde_json::Value) -> anyhow::Result<RawJsonConfig> {
        Ok(serde_json::from_value(value)?)
    }

    fn minimal() -> serde_json::Value {
        json!({
            "s3_storage": { "bucket_name": "drive-backups" },
            "state": { "dynamodb_table": "drive-backup-state" }
        })
    }

    #[test]
    fn test_minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw_from(minimal())?)?;

        assert_eq!(config.spaces_config.bucket_name, "drive-backups");
        assert!(config.spaces_config.static_credentials.is_none());
        assert_eq!(config.state, StateBackend::DynamoDb { table: "drive-backup-state".into() });
        assert_eq!(config.source.api_base.as_str(), "https://www.googleapis.com/");
        assert_eq!(config.source.access_token_env, "DRIVE_ACCESS_TOKEN");
        assert!(config.source.include_user_files);
        assert_eq!(config.source.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.source.request_timeout, Duration::from_secs(600));
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.engine.part_size, 10 * 1024 * 1024);
        assert_eq!(config.engine.state_ttl, chrono::Duration::days(30));
        assert_eq!(config.log_level, "info");
        Ok(())
    }

    #[test]
    fn test_full_config() -> anyhow::Result<()> {
        let raw = raw_from(json!({
            "log_level": "debug",
            "s3_storage": {
                "bucket_name": "b",
                "region": "eu-west-1",
                "endpoint_url": "https://s3.example.com",
                "access_key_id": "AKIA",
                "secret_access_key": "secret",
                "folder_prefix": "/gdrive-backup/",
                "server_side_encryption": "aws:kms"
            },
            "state": { "local_file": "/tmp/state.json" },
            "source": {
                "shared_drives": [{ "id": "0AB", "name": "Finance" }],
                "page_size": 500,
                "connect_timeout_secs": 5,
                "request_timeout_secs": 120
            },
            "engine": {
                "max_workers": 8,
                "batch_size": 10,
                "rate_limit_delay_ms": 0,
                "part_size": 8388608,
                "large_object_threshold": 67108864
            }
        }))?;
        let config = AppConfig::from_raw(raw)?;

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.spaces_config.folder_prefix.as_deref(), Some("gdrive-backup"));
        assert_eq!(
            config.spaces_config.static_credentials,
            Some(("AKIA".to_string(), "secret".to_string()))
        );
        assert_eq!(config.state, StateBackend::LocalFile { path: PathBuf::from("/tmp/state.json") });
        assert_eq!(
            config.source.shared_drives,
            vec![SharedDrive { id: "0AB".into(), name: "Finance".into() }]
        );
        assert_eq!(config.source.page_size, 500);
        assert_eq!(config.source.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.source.request_timeout, Duration::from_secs(120));
        assert_eq!(config.engine.max_workers, 8);
        assert_eq!(config.engine.rate_limit_delay, Duration::ZERO);
        assert_eq!(config.engine.part_size, 8 * 1024 * 1024);
        Ok(())
    }

    #[test]
    fn test_missing_bucket_is_rejected() -> anyhow::Result<()> {
        let raw = raw_from(json!({
            "s3_storage": { "bucket_name": "" },
            "state": { "dynamodb_table": "t" }
        }))?;
        assert!(AppConfig::from_raw(raw).is_err());
        Ok(())
    }

    #[test]
    fn test_state_backend_must_be_exclusive() -> anyhow::Result<()> {
        let raw = raw_from(json!({
            "s3_storage": { "bucket_name": "b" },
            "state": { "dynamodb_table": "t", "local_file": "/tmp/s.json" }
        }))?;
        assert!(AppConfig::from_raw(raw).is_err());

        let raw = raw_from(json!({
            "s3_storage": { "bucket_name": "b" },
            "state": {}
        }))?;
        assert!(AppConfig::from_raw(raw).is_err());
        Ok(())
    }

    #[test]
    fn test_partial_static_credentials_are_rejected() -> anyhow::Result<()> {
        let raw = raw_from(json!({
            "s3_storage": { "bucket_name": "b", "access_key_id": "AKIA" },
            "state": { "dynamodb_table": "t" }
        }))?;
        let err = AppConfig::from_raw(raw).err().map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("must be set together")));

        let raw = raw_from(json!({
            "s3_storage": { "bucket_name": "b", "access_key_id": "", "secret_access_key": "secret" },
            "state": { "dynamodb_table": "t" }
        }))?;
        assert!(AppConfig::from_raw(raw).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_timeout_is_rejected() -> anyhow::Result<()> {
        let mut value = minimal();
        value["source"] = json!({ "request_timeout_secs": 0 });
        assert!(AppConfig::from_raw(raw_from(value)?).is_err());
        Ok(())
    }

    #[test]
    fn test_part_size_below_minimum_is_rejected() -> anyhow::Result<()> {
        let mut value = minimal();
        value["engine"] = json!({ "part_size": 1024 });
        assert!(AppConfig::from_raw(raw_from(value)?).is_err());
        Ok(())
    }

    #[test]
    fn test_threshold_below_part_size_is_rejected() -> anyhow::Result<()> {
        let mut value = minimal();
        value["engine"] = json!({ "part_size": 10485760, "large_object_threshold": 5242880 });
        assert!(AppConfig::from_raw(raw_from(value)?).is_err());
        Ok(())
    }

    #[test]
    fn test_nothing_to_back_up_is_rejected() -> anyhow::Result<()> {
        let mut value = minimal();
        value["source"] = json!({ "include_user_files": false });
        assert!(AppConfig::from_raw(raw_from(value)?).is_err());
        Ok(())
    }

    #[test]
    fn test_env_overrides() -> anyhow::Result<()> {
        let mut raw = raw_from(json!({
            "s3_storage": { "bucket_name": "from-json" },
            "state": { "local_file": "/tmp/state.json" }
        }))?;
        let vars: HashMap<&str, &str> = [
            ("S3_BUCKET", "from-env"),
            ("STATE_TABLE", "state-from-env"),
            ("MAX_WORKERS", " 12 "),
            ("RATE_LIMIT_DELAY_MS", "250"),
            ("BATCH_SIZE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        apply_env_overrides(&mut raw, |name| vars.get(name).map(|v| v.to_string()));
        let config = AppConfig::from_raw(raw)?;

        assert_eq!(config.spaces_config.bucket_name, "from-env");
        assert_eq!(config.state, StateBackend::DynamoDb { table: "state-from-env".into() });
        assert_eq!(config.engine.max_workers, 12);
        assert_eq!(config.engine.rate_limit_delay, Duration::from_millis(250));
        assert_eq!(config.engine.batch_size, 50);
        Ok(())
    }
}
