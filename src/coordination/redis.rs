//! KeyDB / Redis backed store.
//!
//! Builds a [`fred::clients::Pool`] configured for the KeyDB instance
//! described in [`crate::config::KeyDbConfig`], optionally enabling TLS
//! via `rustls` and reading the auth token from an environment variable,
//! and wraps it in [`RedisStore`], which implements the lock and stream
//! capabilities on top of it using fred's typed command interfaces.

use std::time::Duration;

use anyhow::{Context, Result};
use fred::clients::{Client, Pool};
use fred::interfaces::{ClientLike, KeysInterface, ListInterface, LuaInterface, StreamsInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration, SetOptions, Value};
use tracing::{debug, info, trace};

use super::reply;
use super::store::{ttl_millis, LockStore, PendingSummary, Script, StreamEntry, StreamStore};
use crate::config::KeyDbConfig;

// ---------------------------------------------------------------------------
// Pool setup
// ---------------------------------------------------------------------------

/// Create a KeyDB connection pool from the application configuration.
///
/// The pool is initialised (connected + PING verified) before being returned.
/// If `config.tls` is `true`, the connection uses `rustls` via fred's built-in
/// TLS support.  The auth token is read from the environment variable whose
/// name is given in `config.auth_token_env`.
pub async fn create_pool(config: &KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    // The endpoint may optionally include a `rediss://` or `redis://` scheme
    // prefix which we strip.
    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = FredConfig {
        server: ServerConfig::new_centralized(host, port),
        ..FredConfig::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(ref token) = auth_token {
        fred_config.password = Some(token.clone());
    }

    if config.database != 0 {
        fred_config.database = Some(config.database);
    }

    let mut builder = Builder::from_config(fred_config);
    builder.with_connection_config(|conn| {
        conn.connection_timeout = config.connect_timeout();
    });
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build KeyDB connection pool")?;

    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    info!(
        host = host,
        port = port,
        tls = config.tls,
        database = config.database,
        pool_size = config.pool_size,
        "KeyDB pool created and verified"
    );

    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a database suffix in a URI).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

/// Server-side blocking timeouts of zero mean "wait forever", so anything
/// shorter than a millisecond is rounded up.
fn blocking_millis(timeout: Duration) -> u64 {
    (timeout.as_millis() as u64).max(1)
}

fn field_pairs(fields: &[(String, String)]) -> Vec<(&str, &str)> {
    fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

fn id_list(ids: &[String]) -> Vec<&str> {
    ids.iter().map(String::as_str).collect()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to a KeyDB pool implementing [`LockStore`] and [`StreamStore`].
///
/// Cloning is cheap and shares the underlying connections.  The pool lives
/// until [`RedisStore::close`] is called.
///
/// Blocking commands (`BLPOP`, `XREADGROUP ... BLOCK`) never run on the
/// pool: a connection parked on one would hold back every command queued
/// behind it, including the release that is supposed to wake the waiter.
/// Each wait gets its own short-lived connection instead.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Build, connect and verify a pool for `config`.
    pub async fn connect(config: &KeyDbConfig) -> Result<Self> {
        Ok(Self::from_pool(create_pool(config).await?))
    }

    /// Wrap an already initialised pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Close every connection in the pool.
    pub async fn close(&self) -> Result<()> {
        self.pool.quit().await.context("KeyDB QUIT failed")?;
        info!("KeyDB pool closed");
        Ok(())
    }

    /// A client with the pool's configuration that shares no connection
    /// with it.  Not connected yet.
    fn detached_client(&self) -> Client {
        self.pool.next().clone_new()
    }

    /// Connect a detached client for one blocking command.
    async fn blocking_client(&self) -> Result<Client> {
        let client = self.detached_client();
        client.init().await.context("failed to connect blocking client")?;
        Ok(client)
    }

    async fn dismiss(client: Client) {
        if let Err(e) = client.quit().await {
            debug!(error = %e, "closing blocking client failed");
        }
    }
}

#[async_trait::async_trait]
impl LockStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = ttl_millis(ttl)?;
        let result: Option<String> = self
            .pool
            .set(
                key,
                value,
                Some(Expiration::PX(ttl_ms as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await
            .context("SET NX failed")?;
        // SET … NX returns "OK" when the key was set, nil otherwise.
        Ok(result.is_some())
    }

    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let secs = blocking_millis(timeout) as f64 / 1000.0;
        let client = self.blocking_client().await?;
        let reply: Result<Value> = client.blpop(key, secs).await.context("BLPOP failed");
        Self::dismiss(client).await;
        // BLPOP replies `[key, element]`, or nil on timeout.
        let popped = match reply? {
            Value::Array(items) => items.into_iter().nth(1).and_then(|v| v.as_string()),
            _ => None,
        };
        trace!(%key, popped = popped.is_some(), "BLPOP");
        Ok(popped)
    }

    async fn run_script(&self, script: &Script, keys: &[String], args: &[String]) -> Result<i64> {
        let result: i64 = self
            .pool
            .eval(script.lua, keys.to_vec(), args.to_vec())
            .await
            .with_context(|| format!("{} script failed", script.name))?;
        Ok(result)
    }
}

#[async_trait::async_trait]
impl StreamStore for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: bool = self.pool.exists(key).await.context("EXISTS failed")?;
        Ok(exists)
    }

    async fn append_entry(&self, key: &str, fields: &[(String, String)]) -> Result<String> {
        let id: String = self
            .pool
            .xadd(key, false, None, "*", field_pairs(fields))
            .await
            .context("XADD failed")?;
        trace!(%key, %id, "XADD");
        Ok(id)
    }

    async fn append_entries(&self, key: &str, entries: &[Vec<(String, String)>]) -> Result<Vec<String>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let pipeline = self.pool.next().pipeline();
        for fields in entries {
            let _: () = pipeline
                .xadd(key, false, None, "*", field_pairs(fields))
                .await
                .context("failed to queue XADD")?;
        }
        let ids: Vec<String> = pipeline.all().await.context("XADD pipeline failed")?;
        trace!(%key, count = ids.len(), "XADD pipeline");
        Ok(ids)
    }

    async fn delete_entries(&self, key: &str, ids: &[String]) -> Result<u64> {
        let removed: u64 = self
            .pool
            .xdel(key, id_list(ids))
            .await
            .context("XDEL failed")?;
        Ok(removed)
    }

    async fn create_group(&self, key: &str, group: &str, start_id: &str) -> Result<bool> {
        match self
            .pool
            .xgroup_create::<Value, _, _, _>(key, group, start_id, false)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.details().contains("BUSYGROUP") => {
                debug!(%key, %group, "consumer group already exists");
                Ok(false)
            }
            Err(e) => Err(e).context("XGROUP CREATE failed"),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        key: &str,
        offset: &str,
        count: u64,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        let count = (count > 0).then_some(count);
        // Raw reply: entries deleted while pending come back with nil fields.
        let reply: Value = match block {
            None => self
                .pool
                .xreadgroup(group, consumer, count, None, false, key, offset)
                .await
                .context("XREADGROUP failed")?,
            Some(block) => {
                let client = self.blocking_client().await?;
                let reply = client
                    .xreadgroup(group, consumer, count, Some(blocking_millis(block)), false, key, offset)
                    .await
                    .context("XREADGROUP BLOCK failed");
                Self::dismiss(client).await;
                reply?
            }
        };
        reply::parse_read_group(reply, key)
    }

    async fn pending_summary(&self, key: &str, group: &str) -> Result<Option<PendingSummary>> {
        match self
            .pool
            .xpending::<PendingSummary, _, _, _>(key, group, ())
            .await
        {
            Ok(summary) => Ok(Some(summary)),
            // Missing log and missing group both answer NOGROUP.
            Err(e) if e.details().contains("NOGROUP") => Ok(None),
            Err(e) => Err(e).context("XPENDING failed"),
        }
    }

    async fn ack_entries(&self, key: &str, group: &str, ids: &[String]) -> Result<u64> {
        let acked: u64 = self
            .pool
            .xack(key, group, id_list(ids))
            .await
            .context("XACK failed")?;
        Ok(acked)
    }

    async fn range(&self, key: &str, start: &str, end: &str, limit: Option<u64>) -> Result<Vec<StreamEntry>> {
        let reply: Value = self
            .pool
            .xrange(key, start, end, limit)
            .await
            .context("XRANGE failed")?;
        reply::parse_entries(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("keydb.local:6380").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("keydb.local").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6379);
    }

    #[test]
    fn test_parse_host_port_strips_database_path() {
        let (host, port) = parse_host_port("127.0.0.1:6379/2").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 6379);
    }

    #[test]
    fn test_parse_host_port_rejects_bad_port() {
        assert!(parse_host_port("keydb.local:notaport").is_err());
    }

    #[test]
    fn entry_fields_keep_their_order() {
        let fields = vec![
            ("message".to_string(), "a".to_string()),
            ("attempt".to_string(), "2".to_string()),
        ];
        assert_eq!(field_pairs(&fields), vec![("message", "a"), ("attempt", "2")]);
        assert_eq!(id_list(&["1-0".to_string(), "2-0".to_string()]), vec!["1-0", "2-0"]);
    }

    #[tokio::test]
    async fn blocking_client_shares_no_connection_with_pool() {
        // Building a pool does not connect, so no server is needed here.
        let pool = Builder::default_centralized().build_pool(4).unwrap();
        let store = RedisStore::from_pool(pool);

        let detached = store.detached_client();
        assert!(store.pool().clients().iter().all(|c| c.id() != detached.id()));
        assert_ne!(store.detached_client().id(), detached.id());
    }

    #[test]
    fn blocking_timeouts_never_round_to_forever() {
        assert_eq!(blocking_millis(Duration::ZERO), 1);
        assert_eq!(blocking_millis(Duration::from_micros(300)), 1);
        assert_eq!(blocking_millis(Duration::from_millis(2_500)), 2_500);
    }
}
