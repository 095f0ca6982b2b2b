pub mod config;
pub mod coordination;
pub mod metrics;

pub use coordination::{DistributedLock, Message, Offset, StreamQueue};
