use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use rediskit::config::{self, LockConfig, QueueConfig};
use rediskit::coordination::{
    DistributedLock, LockStore, MemoryStore, Offset, RedisStore, StreamQueue, StreamStore,
};
use rediskit::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "rediskit", about = "Distributed locks and stream queues on KeyDB")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "REDISKIT_CONFIG", default_value = "/etc/rediskit/config.yaml")]
    config: String,

    /// Use an in-process store instead of connecting to KeyDB.
    #[arg(long)]
    memory: bool,

    /// Print the Prometheus text exposition to stderr before exiting.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a lock, hold it for a while, then release it.
    Lock {
        key: String,
        /// Lock TTL in seconds (defaults to `lock.expires_secs`).
        #[arg(long)]
        expires: Option<u64>,
        /// Seconds to wait for the lock (defaults to `lock.blocking_secs`).
        #[arg(long)]
        blocking: Option<u64>,
        /// Milliseconds to hold the lock before releasing it.
        #[arg(long, default_value_t = 0)]
        hold_ms: u64,
    },
    /// Append messages to a topic.
    Produce {
        topic: String,
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Read messages for a consumer.
    Consume {
        #[command(flatten)]
        target: Consumer,
        /// Maximum number of messages (defaults to `queue.count`).
        #[arg(long)]
        count: Option<u64>,
        /// Block this many milliseconds for new messages (defaults to
        /// `queue.block_ms`).
        #[arg(long)]
        block_ms: Option<u64>,
        /// Read pending messages after this ID instead of new ones.
        #[arg(long)]
        after: Option<String>,
    },
    /// Re-read the consumer's delivered but unacknowledged messages.
    Pending {
        #[command(flatten)]
        target: Consumer,
        #[arg(long)]
        count: Option<u64>,
    },
    /// Acknowledge messages for a group.
    Ack {
        #[command(flatten)]
        target: Consumer,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Remove messages from a topic.
    Delete {
        topic: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Look up a single message by ID.
    Get { topic: String, id: String },
}

#[derive(Args, Debug)]
struct Consumer {
    topic: String,
    group: String,
    /// Consumer name within the group.
    #[arg(long, default_value = "rediskit")]
    consumer: String,
}

// ---------------------------------------------------------------------------
// Store selection
// ---------------------------------------------------------------------------

struct Stores {
    locks: Arc<dyn LockStore>,
    streams: Arc<dyn StreamStore>,
    redis: Option<RedisStore>,
}

impl Stores {
    fn memory() -> Self {
        let store = MemoryStore::new();
        Self {
            locks: Arc::new(store.clone()),
            streams: Arc::new(store),
            redis: None,
        }
    }

    fn redis(store: RedisStore) -> Self {
        Self {
            locks: Arc::new(store.clone()),
            streams: Arc::new(store.clone()),
            redis: Some(store),
        }
    }

    async fn close(self) -> Result<()> {
        if let Some(redis) = self.redis {
            redis.close().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(
    command: Command,
    stores: &Stores,
    lock_config: &LockConfig,
    queue_config: &QueueConfig,
    metrics: &MetricsRegistry,
) -> Result<serde_json::Value> {
    let open = |target: Consumer| {
        let streams = Arc::clone(&stores.streams);
        let metrics = metrics.clone();
        async move {
            let queue = StreamQueue::open(streams, target.topic, target.group, target.consumer)
                .await?
                .with_metrics(metrics);
            anyhow::Ok(queue)
        }
    };
    let producer = |topic: String| {
        StreamQueue::producer(Arc::clone(&stores.streams), topic).with_metrics(metrics.clone())
    };

    let output = match command {
        Command::Lock {
            key,
            expires,
            blocking,
            hold_ms,
        } => {
            let lock = DistributedLock::new(Arc::clone(&stores.locks)).with_metrics(metrics.clone());
            let expires = expires.map_or(lock_config.expires(), Duration::from_secs);
            let blocking = blocking.map_or(lock_config.blocking(), Duration::from_secs);
            let held = lock
                .run_locked(&key, expires, blocking, move || async move {
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    Ok(())
                })
                .await?;
            json!({
                "key": key,
                "token": lock.token(),
                "acquired": held.is_some(),
            })
        }
        Command::Produce { topic, payloads } => {
            let ids = producer(topic).produce_batch(&payloads).await?;
            json!({ "ids": ids })
        }
        Command::Consume {
            target,
            count,
            block_ms,
            after,
        } => {
            let queue = open(target).await?;
            let count = count.unwrap_or(queue_config.count);
            let block = block_ms.map(Duration::from_millis).or(queue_config.block());
            let offset = after.map_or(Offset::Unread, Offset::After);
            json!(queue.consume(count, block, offset).await?)
        }
        Command::Pending { target, count } => {
            let queue = open(target).await?;
            json!(queue.get_pending(count.unwrap_or(queue_config.count)).await?)
        }
        Command::Ack { target, ids } => {
            let queue = open(target).await?;
            json!({ "acked": queue.ack(&ids).await? })
        }
        Command::Delete { topic, ids } => {
            json!({ "deleted": producer(topic).delete(&ids).await? })
        }
        Command::Get { topic, id } => json!(producer(topic).get_message(&id).await?),
    };
    Ok(output)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    // ---- Config + store ----
    let (stores, lock_config, queue_config) = if cli.memory {
        tracing::info!("using in-process store");
        (Stores::memory(), LockConfig::default(), QueueConfig::default())
    } else {
        let config = config::load_config(&cli.config)?;
        tracing::info!(config_path = %cli.config, endpoint = %config.keydb.endpoint, "connecting");
        let store = RedisStore::connect(&config.keydb).await?;
        (Stores::redis(store), config.lock, config.queue)
    };

    let metrics = MetricsRegistry::new();

    let result = run(cli.command, &stores, &lock_config, &queue_config, &metrics).await;
    stores.close().await?;
    let output = result?;

    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("failed to encode output")?
    );

    if cli.metrics {
        eprint!("{}", metrics.encode()?);
    }
    Ok(())
}
