//! Blocking distributed mutex.
//!
//! One logical lock is backed by two keys: `<key>-lock` holds the owner
//! token of the current holder (set with `NX` and a TTL), and
//! `<key>-signal` is a short-lived list that a releasing owner pushes a
//! single wake token onto.  Waiters block on a pop from the signal list
//! instead of polling, and retry the conditional set when woken.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use super::node::owner_token;
use super::store::{LockStore, Script};
use crate::metrics::{Metrics, MetricsRegistry};

/// TTL of the signal list, so an unconsumed wake token cannot linger.
pub const SIGNAL_TTL: Duration = Duration::from_millis(1000);

/// Check-and-delete release.  Only the current owner may clear its lock;
/// the wake token is pushed in the same atomic step.
pub const RELEASE_SCRIPT: Script = Script {
    name: "release_lock",
    lua: r#"
        if redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
        redis.call('DEL', KEYS[2])
        redis.call('RPUSH', KEYS[2], 1)
        redis.call('PEXPIRE', KEYS[2], ARGV[2])
        redis.call('DEL', KEYS[1])
        return 1
    "#,
};

/// Owner-checked TTL extension.
pub const EXTEND_SCRIPT: Script = Script {
    name: "extend_lock",
    lua: r#"
        if redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
        return 1
    "#,
};

pub fn lock_key(key: &str) -> String {
    format!("{key}-lock")
}

pub fn signal_key(key: &str) -> String {
    format!("{key}-signal")
}

/// A lock handle bound to one owner token.
///
/// Each instance generates its own token, so two instances never share
/// ownership even when they run in the same process.
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    token: String,
    metrics: Option<MetricsRegistry>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            token: owner_token(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The value written to the lock key while this instance holds it.
    pub fn token(&self) -> &str {
        &self.token
    }

    fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref().map(|m| m.metrics.as_ref())
    }

    /// Try to take the lock for `key`, holding it for at most `expires`.
    ///
    /// With a zero `blocking` window this is a single attempt.  Otherwise
    /// the caller waits on the release signal for up to `blocking` in total,
    /// retrying after every wake; once the window has elapsed exactly one
    /// more attempt is made and its outcome returned.
    ///
    /// `Ok(false)` means the lock is held elsewhere.  Store errors are
    /// returned as `Err` and never imply the lock was taken.
    pub async fn acquire(&self, key: &str, expires: Duration, blocking: Duration) -> Result<bool> {
        let started = Instant::now();
        let lock_key = lock_key(key);
        let signal_key = signal_key(key);

        let mut timed_out = false;
        let acquired = loop {
            let acquired = self
                .store
                .set_if_absent(&lock_key, &self.token, expires)
                .await?;
            if acquired || timed_out || blocking.is_zero() {
                break acquired;
            }

            let remaining = blocking.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                timed_out = true;
                continue;
            }
            if let Some(m) = self.metrics() {
                m.lock_waits.inc();
            }
            timed_out = self.store.blocking_pop(&signal_key, remaining).await?.is_none();
        };

        let elapsed = started.elapsed();
        if let Some(m) = self.metrics() {
            m.lock_acquire_duration_seconds.observe(elapsed.as_secs_f64());
            if acquired {
                m.lock_acquisitions.inc();
            } else if !blocking.is_zero() {
                m.lock_timeouts.inc();
            }
        }

        if !acquired && !blocking.is_zero() {
            warn!(%key, ?blocking, "acquire: timed out waiting for lock release");
        }
        debug!(%key, acquired, waited_ms = elapsed.as_millis() as u64, "acquire");
        Ok(acquired)
    }

    /// Release the lock for `key` if this instance holds it.
    ///
    /// Returns `false` without touching the store state when the lock is
    /// absent or owned by someone else (for example after our TTL lapsed
    /// and another holder took over).
    pub async fn release(&self, key: &str) -> Result<bool> {
        let keys = vec![lock_key(key), signal_key(key)];
        let args = vec![self.token.clone(), SIGNAL_TTL.as_millis().to_string()];
        let released = self.store.run_script(&RELEASE_SCRIPT, &keys, &args).await? == 1;

        if let Some(m) = self.metrics() {
            if released {
                m.lock_releases.inc();
            } else {
                m.lock_release_rejections.inc();
            }
        }
        if released {
            debug!(%key, "lock released");
        } else {
            debug!(%key, "lock release ignored: key missing or owned by another holder");
        }
        Ok(released)
    }

    /// Reset the TTL of a lock this instance holds to `ttl`.  Returns `false`
    /// if the lock is no longer ours.
    pub async fn extend(&self, key: &str, ttl: Duration) -> Result<bool> {
        let keys = vec![lock_key(key)];
        let args = vec![self.token.clone(), ttl.as_millis().to_string()];
        let extended = self.store.run_script(&EXTEND_SCRIPT, &keys, &args).await? == 1;
        debug!(%key, ?ttl, extended, "extend");
        Ok(extended)
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// Returns `Ok(None)` without running `f` if the lock could not be
    /// acquired.  The lock is released whether or not `f` succeeds.
    pub async fn run_locked<F, Fut, T>(
        &self,
        key: &str,
        expires: Duration,
        blocking: Duration,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.acquire(key, expires, blocking).await? {
            return Ok(None);
        }

        let result = f().await;

        if let Err(e) = self.release(key).await {
            warn!(%key, error = %e, "release after critical section failed");
            if result.is_ok() {
                return Err(e);
            }
        }
        result.map(Some)
    }
}
