//! Block-based persisted message queue.
//!
//! Records live in bounded blocks; blocks are saved to pluggable storage
//! tiers, evicted from memory when idle and reloaded on demand. Every
//! blocking call takes a [`Context`] that bounds how long it may wait.

pub mod block;
pub mod clock;
pub mod config;
pub mod context;
mod dedup;
pub mod error;
pub mod id;
pub mod message;
pub mod meta;
pub mod partial_lock;
pub mod queue;
pub mod signal;
pub mod subscriber;

pub use block::{Backend, Block, BlockInfo};
pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use config::{Durability, QueueConfig};
pub use context::Context;
pub use error::{Error, Result};
pub use id::IdGenerator;
pub use message::{Message, MessageWithMeta, NewMessage};
pub use partial_lock::{PartialLock, ReadGuard, WriteGuard};
pub use queue::{Queue, QueueBuilder};
pub use signal::{SaveSignal, VersionTracker};
pub use subscriber::SubscriberTable;
