use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(alias = "redis")]
    pub keydb: KeyDbConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `redis://127.0.0.1:6379`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    /// Logical database selected after connecting.
    #[serde(default)]
    pub database: u8,
    /// Number of pooled connections.  Blocking commands (`BLPOP`,
    /// `XREADGROUP ... BLOCK`) do not use the pool: each wait opens its own
    /// connection with the same settings and closes it afterwards.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Timeout (milliseconds) for establishing each connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl KeyDbConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

// ---------------------------------------------------------------------------
// Lock defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// TTL (seconds) applied to the lock key on acquisition.
    #[serde(default = "default_lock_expires")]
    pub expires_secs: u64,
    /// How long (seconds) `acquire` waits for a release signal.  Zero means
    /// non-blocking.
    #[serde(default)]
    pub blocking_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expires_secs: default_lock_expires(),
            blocking_secs: 0,
        }
    }
}

impl LockConfig {
    pub fn expires(&self) -> Duration {
        Duration::from_secs(self.expires_secs)
    }

    pub fn blocking(&self) -> Duration {
        Duration::from_secs(self.blocking_secs)
    }
}

fn default_lock_expires() -> u64 {
    3
}

// ---------------------------------------------------------------------------
// Queue defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of entries returned by a single read.
    #[serde(default = "default_queue_count")]
    pub count: u64,
    /// How long (milliseconds) a read for new entries may block.  Omit to
    /// return immediately.
    #[serde(default)]
    pub block_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            count: default_queue_count(),
            block_ms: None,
        }
    }
}

impl QueueConfig {
    pub fn block(&self) -> Option<Duration> {
        self.block_ms.map(Duration::from_millis)
    }
}

fn default_queue_count() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.keydb.endpoint.trim().is_empty(),
        "keydb.endpoint must not be empty"
    );
    anyhow::ensure!(config.keydb.pool_size > 0, "keydb.pool_size must be at least 1");
    anyhow::ensure!(
        config.lock.expires_secs > 0,
        "lock.expires_secs must be at least 1"
    );
    anyhow::ensure!(config.queue.count > 0, "queue.count must be at least 1");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("keydb:\n  endpoint: redis://127.0.0.1:6379\n").unwrap();
        assert!(!config.keydb.tls);
        assert_eq!(config.keydb.auth_token_env, "KEYDB_AUTH_TOKEN");
        assert_eq!(config.keydb.database, 0);
        assert_eq!(config.keydb.pool_size, 4);
        assert_eq!(config.lock.expires(), Duration::from_secs(3));
        assert_eq!(config.lock.blocking(), Duration::ZERO);
        assert_eq!(config.queue.count, 10);
        assert_eq!(config.queue.block(), None);
    }

    #[test]
    fn redis_alias_and_overrides() {
        let yaml = r#"
redis:
  endpoint: rediss://cache.internal:6380
  tls: true
  database: 2
  pool_size: 8
lock:
  expires_secs: 30
  blocking_secs: 5
queue:
  count: 50
  block_ms: 2000
"#;
        let config = parse_config(yaml).unwrap();
        assert!(config.keydb.tls);
        assert_eq!(config.keydb.database, 2);
        assert_eq!(config.keydb.pool_size, 8);
        assert_eq!(config.lock.blocking(), Duration::from_secs(5));
        assert_eq!(config.queue.block(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let yaml = "keydb:\n  endpoint: redis://localhost\n  pool_size: 0\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("pool_size"));
    }

    #[test]
    fn zero_lock_expiry_is_rejected() {
        let yaml = "keydb:\n  endpoint: redis://localhost\nlock:\n  expires_secs: 0\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rediskit.yaml");
        std::fs::write(&path, "keydb:\n  endpoint: redis://localhost:7000\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.keydb.endpoint, "redis://localhost:7000");
    }

    #[test]
    fn load_config_missing_file_names_path() {
        let err = load_config("/nonexistent/rediskit.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/rediskit.yaml"));
    }
}
