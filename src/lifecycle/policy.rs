//! Maintenance policy evaluation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::BlockInfo;

/// When a saved block's records may be dropped from memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type")]
pub enum UnloadPolicy {
    /// Keep everything resident.
    #[default]
    Never,

    /// Evict every closed block.
    Always,

    /// Evict closed blocks not read or written for `secs`.
    IdleAfter { secs: u64 },
}

/// Age-based tier placement. The rule with the largest `after_secs` the
/// block's age has reached wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TierPolicy {
    pub rules: Vec<TierRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    pub after_secs: u64,
    pub tier: String,
}

/// When closed blocks may be dropped for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type")]
pub enum DeletePolicy {
    #[default]
    Never,

    /// Delete blocks older than `secs`.
    AgeAfter { secs: u64 },

    /// Delete blocks every record of which has been read by at least
    /// `min_replicas` replica members.
    ReplicaWatermark { min_replicas: usize },
}

/// Evaluate if a block should be evicted from memory.
pub fn should_unload(policy: &UnloadPolicy, info: &BlockInfo, now_ns: u64) -> bool {
    if info.is_open || info.evicted || !info.saved {
        return false;
    }
    match policy {
        UnloadPolicy::Never => false,
        UnloadPolicy::Always => true,
        UnloadPolicy::IdleAfter { secs } => info.idle(now_ns) >= Duration::from_secs(*secs),
    }
}

/// Tier the block should live in, or `None` to leave it where it is.
pub fn target_tier(policy: &TierPolicy, info: &BlockInfo, now_ns: u64) -> Option<String> {
    if info.is_open {
        return None;
    }
    let age = info.age(now_ns);
    policy
        .rules
        .iter()
        .filter(|rule| age >= Duration::from_secs(rule.after_secs))
        .max_by_key(|rule| rule.after_secs)
        .map(|rule| rule.tier.clone())
        .filter(|tier| *tier != info.pending_tier)
}

/// Evaluate if a block should be flagged for deletion. `replicas` is the
/// number of replica members that have read through `info.last_id`.
pub fn should_delete(policy: &DeletePolicy, info: &BlockInfo, now_ns: u64, replicas: usize) -> bool {
    if info.is_open {
        return false;
    }
    match policy {
        DeletePolicy::Never => false,
        DeletePolicy::AgeAfter { secs } => info.age(now_ns) >= Duration::from_secs(*secs),
        DeletePolicy::ReplicaWatermark { min_replicas } => {
            *min_replicas > 0 && replicas >= *min_replicas
        }
    }
}
