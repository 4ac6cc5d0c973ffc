//! Storage collaborators for the queue.
//!
//! The queue only needs five individually atomic operations from a backing
//! store; [`Storage`] names them. [`Tiers`] maps tier names to stores so a
//! block can live in one tier and move to another.
//!
//! `MemoryStorage` and `FsStorage` are reference adapters for tests, tools
//! and single-node use.

mod compress;
mod fs;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{Context, Error, Result};

pub use compress::{Compressor, NoCompression};
#[cfg(feature = "zstd")]
pub use compress::ZstdCompressor;
pub use fs::FsStorage;
pub use memory::MemoryStorage;

pub const DEFAULT_TIER: &str = "hot";

/// A named-object store.
pub trait Storage: Send + Sync + fmt::Debug {
    fn exists(&self, ctx: &Context, name: &str) -> Result<bool>;

    /// Fails with `Error::NotFound` when `name` is absent.
    fn get(&self, ctx: &Context, name: &str) -> Result<Vec<u8>>;

    /// Replaces `name` atomically.
    fn save(&self, ctx: &Context, name: &str, data: &[u8]) -> Result<()>;

    /// Removing an absent object succeeds.
    fn delete(&self, ctx: &Context, name: &str) -> Result<()>;

    fn rename(&self, ctx: &Context, old_name: &str, new_name: &str) -> Result<()>;
}

/// Named storage tiers with a default.
#[derive(Debug, Clone)]
pub struct Tiers {
    default: String,
    tiers: BTreeMap<String, Arc<dyn Storage>>,
}

impl Tiers {
    pub fn new(default: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        let default = default.into();
        let mut tiers = BTreeMap::new();
        tiers.insert(default.clone(), storage);
        Self { default, tiers }
    }

    /// A single in-memory tier named [`DEFAULT_TIER`].
    pub fn memory() -> Self {
        Self::new(DEFAULT_TIER, Arc::new(MemoryStorage::new()))
    }

    pub fn with_tier(mut self, name: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        self.tiers.insert(name.into(), storage);
        self
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn default_storage(&self) -> Result<&Arc<dyn Storage>> {
        self.get(&self.default)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Storage>> {
        self.tiers
            .get(name)
            .ok_or_else(|| Error::UnknownTier(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tiers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tiers.keys().map(String::as_str)
    }
}
