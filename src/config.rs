use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub s3: S3Config,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Downgrade transient remote errors to soft statuses (reads 404,
    /// writes 200) so the build proceeds cache-bypassed.
    #[serde(default)]
    pub allow_offline: bool,
    /// When false, responses that look like GCC depfiles are suppressed.
    #[serde(default)]
    pub allow_gcc_depfiles: bool,
    /// Per-upload size cap in bytes. `0` means no cap.
    #[serde(default = "default_max_entry_size_bytes")]
    pub max_entry_size_bytes: u64,
    #[serde(default)]
    pub memory_cache: MemoryCacheConfig,
    pub async_upload: AsyncUploadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_entry_size_bytes() -> u64 {
    50 * 1000 * 1000
}

// ---------------------------------------------------------------------------
// Proxy listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Bind address. The proxy performs no client authentication, so this
    /// should stay on loopback unless the network is trusted.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shut the process down after this many minutes without a request.
    /// `0` disables the idle watchdog.
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
    /// Per-request time budget in seconds; an expired budget answers 404.
    #[serde(default = "default_socket_timeout_seconds")]
    pub socket_timeout_seconds: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_idle_minutes() -> u64 {
    90
}

fn default_socket_timeout_seconds() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// S3 target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// Prepended to every object key before it reaches the bucket.
    #[serde(default)]
    pub prefix: String,
    /// Optional region override; when unset the ambient AWS environment
    /// (env vars, profile, instance metadata) decides.
    #[serde(default)]
    pub region: Option<String>,
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive remote errors before remote access is paused.
    #[serde(default = "default_errors_before_pausing")]
    pub errors_before_pausing: u32,
    /// How long a pause lasts before remote access resumes.
    #[serde(default = "default_pause_minutes")]
    pub pause_minutes: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            errors_before_pausing: default_errors_before_pausing(),
            pause_minutes: default_pause_minutes(),
        }
    }
}

fn default_errors_before_pausing() -> u32 {
    3
}

fn default_pause_minutes() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// In-memory cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryCacheConfig {
    /// Ceiling for total resident cache bytes.
    #[serde(default = "default_cache_max_total_bytes")]
    pub max_total_bytes: u64,
    /// Entries larger than this are never admitted.
    #[serde(default = "default_cache_max_entry_bytes")]
    pub max_entry_bytes: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: default_cache_max_total_bytes(),
            max_entry_bytes: default_cache_max_entry_bytes(),
        }
    }
}

fn default_cache_max_total_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_cache_max_entry_bytes() -> u64 {
    1024 * 1024
}

// ---------------------------------------------------------------------------
// Async upload / spool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AsyncUploadConfig {
    /// When true, `PUT` answers 200 as soon as the body is staged and the
    /// upload runs in the background.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Directory holding spooled `PUT` bodies between staging and upload.
    /// Purged on startup and shutdown.
    pub cache_dir: String,
    /// Ceiling on the sum of in-flight upload sizes, in megabytes.
    #[serde(default = "default_max_pending_upload_mb")]
    pub max_pending_upload_mb: u64,
}

fn bool_true() -> bool {
    true
}

fn default_max_pending_upload_mb() -> u64 {
    256
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log destination path; stderr when unset.
    #[serde(default)]
    pub file: Option<String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.s3.bucket.is_empty(), "s3.bucket must not be empty");
    anyhow::ensure!(config.proxy.port != 0, "proxy.port must be nonzero");
    anyhow::ensure!(
        config.proxy.socket_timeout_seconds > 0,
        "proxy.socket_timeout_seconds must be nonzero"
    );
    anyhow::ensure!(
        config.breaker.errors_before_pausing > 0,
        "breaker.errors_before_pausing must be nonzero"
    );
    anyhow::ensure!(
        !config.async_upload.cache_dir.is_empty(),
        "async_upload.cache_dir must not be empty"
    );
    anyhow::ensure!(
        config.async_upload.max_pending_upload_mb > 0,
        "async_upload.max_pending_upload_mb must be nonzero"
    );
    anyhow::ensure!(
        config.memory_cache.max_entry_bytes <= config.memory_cache.max_total_bytes,
        "memory_cache.max_entry_bytes must not exceed max_total_bytes"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        validate_config(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse(
            r#"
proxy: {}
s3:
  bucket: my-build-cache
async_upload:
  cache_dir: /tmp/buildcache-spool
"#,
        )
        .unwrap();

        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.proxy.port, 7777);
        assert_eq!(config.proxy.idle_minutes, 90);
        assert_eq!(config.breaker.errors_before_pausing, 3);
        assert!(config.async_upload.enabled);
        assert!(!config.allow_offline);
        assert!(!config.allow_gcc_depfiles);
        assert_eq!(config.s3.prefix, "");
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn empty_bucket_is_rejected() {
        let err = parse(
            r#"
proxy: {}
s3:
  bucket: ""
async_upload:
  cache_dir: /tmp/buildcache-spool
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn entry_cap_must_fit_total() {
        let err = parse(
            r#"
proxy: {}
s3:
  bucket: b
memory_cache:
  max_total_bytes: 1024
  max_entry_bytes: 2048
async_upload:
  cache_dir: /tmp/buildcache-spool
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_entry_bytes"));
    }
}
