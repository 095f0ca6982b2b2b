//! Coordination primitives backed by KeyDB (Redis-compatible).
//!
//! Provides a blocking distributed lock with owner-checked release and a
//! durable consumer-group message queue over a stream.  Both talk to the
//! server only through the capability traits in [`store`], implemented by
//! [`redis::RedisStore`] for a live server and [`memory::MemoryStore`] for
//! tests and local runs.

pub mod locks;
pub mod memory;
pub mod node;
pub mod queue;
pub mod redis;
pub mod reply;
pub mod store;

pub use locks::DistributedLock;
pub use memory::MemoryStore;
pub use queue::{Message, Offset, StreamQueue};
pub use redis::RedisStore;
pub use store::{LockStore, StreamStore};
