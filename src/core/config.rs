//! Queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::DEFAULT_TIER;

/// Configuration for a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Records per block before it closes. 0 disables the limit.
    /// Default: 10 000
    pub count_limit: usize,

    /// Payload bytes per block before it closes. 0 disables the limit.
    /// Default: 16 MB
    pub byte_limit: usize,

    /// Block age before it closes.
    /// Default: none
    #[serde(with = "opt_duration_ms")]
    pub age_limit: Option<Duration>,

    /// Tier new blocks, queue metadata and subscribers are written to.
    /// Default: "hot"
    pub default_tier: String,

    /// Instance value mixed into generated ids.
    /// Default: 0
    pub instance_id: u16,

    /// Upper bound tools use when building a call context.
    /// Default: 30 seconds
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            count_limit: 10_000,
            byte_limit: 16 * 1024 * 1024,
            age_limit: None,
            default_tier: DEFAULT_TIER.to_string(),
            instance_id: 0,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn with_count_limit(mut self, count_limit: usize) -> Self {
        self.count_limit = count_limit;
        self
    }

    pub fn with_byte_limit(mut self, byte_limit: usize) -> Self {
        self.byte_limit = byte_limit;
        self
    }

    pub fn with_age_limit(mut self, age_limit: Duration) -> Self {
        self.age_limit = Some(age_limit);
        self
    }

    pub fn with_instance_id(mut self, instance_id: u16) -> Self {
        self.instance_id = instance_id;
        self
    }
}

/// Per-call durability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Durability {
    /// Memory only; nothing is marked dirty.
    NoSave,
    /// Persist queue metadata and every pending block before returning.
    SaveImmediate,
    /// Mark dirty and return; the next `save_all` persists it.
    SaveMark,
    /// Mark dirty and block until a `save_all` covers this write.
    SaveWait,
}

impl Durability {
    pub fn marks_dirty(self) -> bool {
        !matches!(self, Durability::NoSave)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
