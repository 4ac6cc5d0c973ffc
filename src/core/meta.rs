//! Persisted layout.
//!
//! ```text
//! {default tier}/
//!   queue.meta                 ← block index, limits, versions (JSON)
//!   subscribers.meta           ← subscriber table (JSON)
//! {block.current_tier}/
//!   00000000000001234567.blk   ← one object per block
//! ```
//!
//! Maintenance tools rely on these names.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

pub const METADATA_NAME: &str = "queue.meta";
pub const SUBSCRIBERS_NAME: &str = "subscribers.meta";
pub const META_VERSION: u32 = 1;

pub fn block_object_name(id: u64) -> String {
    format!("{:020}.blk", id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMeta {
    pub version: u32,
    pub count_limit: usize,
    pub byte_limit: usize,
    pub age_limit_ms: Option<u64>,
    pub dirty_version: u64,
    pub persisted_version: u64,
    pub blocks: Vec<BlockMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: u64,
    pub created_at: u64,
    pub current_tier: String,
    pub pending_tier: String,
    #[serde(default)]
    pub tiers_to_reclaim: Vec<String>,
    #[serde(default)]
    pub pending_delete: bool,
    pub length: usize,
    pub byte_len: usize,
    pub last_id: u64,
    /// Highest record id written to `current_tier`.
    pub persisted_version: u64,
}

impl QueueMeta {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let meta: QueueMeta = serde_json::from_slice(bytes)?;
        if meta.version != META_VERSION {
            return Err(Error::UnsupportedVersion(meta.version));
        }
        if meta.blocks.windows(2).any(|pair| pair[0].id >= pair[1].id) {
            return Err(Error::Corrupt("queue metadata blocks out of order"));
        }
        Ok(meta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberEntry {
    pub last_id: u64,
    pub first_seen: u64,
    pub last_seen: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberMeta {
    pub version: u32,
    pub entries: BTreeMap<String, SubscriberEntry>,
    pub replica_members: BTreeSet<String>,
}

impl SubscriberMeta {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let meta: SubscriberMeta = serde_json::from_slice(bytes)?;
        if meta.version != META_VERSION {
            return Err(Error::UnsupportedVersion(meta.version));
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_names_sort_by_id() {
        let a = block_object_name(9);
        let b = block_object_name(10);
        assert!(a < b);
        assert_eq!(b, "00000000000000000010.blk");
    }

    #[test]
    fn test_unordered_blocks_are_rejected() {
        let block = |id| BlockMeta {
            id,
            created_at: 0,
            current_tier: "hot".into(),
            pending_tier: "hot".into(),
            tiers_to_reclaim: Vec::new(),
            pending_delete: false,
            length: 1,
            byte_len: 1,
            last_id: id,
            persisted_version: id,
        };
        let meta = QueueMeta {
            version: META_VERSION,
            count_limit: 0,
            byte_limit: 0,
            age_limit_ms: None,
            dirty_version: 1,
            persisted_version: 1,
            blocks: vec![block(5), block(3)],
        };
        let bytes = meta.to_bytes().expect("encode");
        assert!(matches!(QueueMeta::from_bytes(&bytes), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_subscriber_meta_rejects_unknown_version() {
        let meta = SubscriberMeta {
            version: 99,
            ..SubscriberMeta::default()
        };
        let bytes = meta.to_bytes().expect("encode");
        assert!(matches!(SubscriberMeta::from_bytes(&bytes), Err(Error::UnsupportedVersion(99))));
    }
}
