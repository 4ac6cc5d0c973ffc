//! Block-based persisted message queue with tiered storage.
//!
//! Writers append records that receive strictly increasing ids; readers
//! fetch everything after an offset. Records are grouped into bounded
//! blocks that are saved, evicted, moved between storage tiers and deleted
//! independently.

pub mod core;
pub mod lifecycle;
pub mod storage;

pub use crate::core::{
    Context, Durability, Error, Message, MessageWithMeta, NewMessage, Queue, QueueConfig, Result,
};
