//! Subscriber read offsets and replica membership.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::core::meta::{SubscriberEntry, SubscriberMeta, META_VERSION, SUBSCRIBERS_NAME};
use crate::core::{Context, PartialLock, Result, VersionTracker};
use crate::storage::Storage;

#[derive(Debug, Default)]
struct SubscriberState {
    entries: BTreeMap<String, SubscriberEntry>,
    replica_members: BTreeSet<String>,
}

/// Last-acknowledged offsets per named consumer, plus the set of
/// subscribers counted toward the replica watermark.
#[derive(Debug, Default)]
pub struct SubscriberTable {
    state: PartialLock<SubscriberState>,
    versions: VersionTracker,
    save_lock: Mutex<()>,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_meta(meta: SubscriberMeta) -> Self {
        Self {
            state: PartialLock::new(SubscriberState {
                entries: meta.entries,
                replica_members: meta.replica_members,
            }),
            versions: VersionTracker::new(0),
            save_lock: Mutex::new(()),
        }
    }

    /// Loads the table from `storage`, or starts empty when it was never saved.
    pub fn load(ctx: &Context, storage: &dyn Storage) -> Result<Self> {
        if !storage.exists(ctx, SUBSCRIBERS_NAME)? {
            return Ok(Self::new());
        }
        let bytes = storage.get(ctx, SUBSCRIBERS_NAME)?;
        Ok(Self::from_meta(SubscriberMeta::from_bytes(&bytes)?))
    }

    pub(crate) fn versions(&self) -> &VersionTracker {
        &self.versions
    }

    fn save_lock(&self) -> MutexGuard<'_, ()> {
        self.save_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Advances `name` to `id`; `id == 0` removes the entry. Offsets never
    /// move backwards. Returns the table version the change needs persisted,
    /// or `None` when nothing was marked dirty.
    pub fn set_last_read(
        &self,
        ctx: &Context,
        name: &str,
        id: u64,
        now: u64,
        mark_dirty: bool,
    ) -> Result<Option<u64>> {
        let mut state = self.state.write(ctx)?;
        if id == 0 {
            state.entries.remove(name);
        } else {
            let entry = state
                .entries
                .entry(name.to_string())
                .or_insert(SubscriberEntry {
                    last_id: 0,
                    first_seen: now,
                    last_seen: now,
                });
            if id > entry.last_id {
                entry.last_id = id;
            }
            entry.last_seen = now;
        }
        Ok(mark_dirty.then(|| self.versions.bump()))
    }

    pub fn get_last_read(&self, ctx: &Context, name: &str) -> Result<Option<SubscriberEntry>> {
        Ok(self.state.read(ctx)?.entries.get(name).copied())
    }

    /// Returns the new table version when membership changed.
    pub fn add_replica_member(&self, ctx: &Context, name: &str) -> Result<Option<u64>> {
        let mut state = self.state.write(ctx)?;
        let changed = state.replica_members.insert(name.to_string());
        Ok(changed.then(|| self.versions.bump()))
    }

    pub fn remove_replica_member(&self, ctx: &Context, name: &str) -> Result<Option<u64>> {
        let mut state = self.state.write(ctx)?;
        let changed = state.replica_members.remove(name);
        Ok(changed.then(|| self.versions.bump()))
    }

    /// Number of replica members whose offset has reached `id`.
    pub fn replica_count(&self, ctx: &Context, id: u64) -> Result<usize> {
        let state = self.state.read(ctx)?;
        Ok(state
            .replica_members
            .iter()
            .filter_map(|name| state.entries.get(name))
            .filter(|entry| entry.last_id >= id)
            .count())
    }

    pub fn names(&self, ctx: &Context) -> Result<Vec<String>> {
        Ok(self.state.read(ctx)?.entries.keys().cloned().collect())
    }

    /// Persists pending changes. Returns `false` when nothing was pending.
    pub fn save(&self, ctx: &Context, storage: &dyn Storage) -> Result<bool> {
        let _io = self.save_lock();
        if self.versions.pending().is_none() {
            return Ok(false);
        }
        let (meta, version) = {
            let state = self.state.read(ctx)?;
            let meta = SubscriberMeta {
                version: META_VERSION,
                entries: state.entries.clone(),
                replica_members: state.replica_members.clone(),
            };
            (meta, self.versions.dirty())
        };
        let bytes = meta.to_bytes()?;
        storage.save(ctx, SUBSCRIBERS_NAME, &bytes)?;
        self.versions.mark_persisted(version);
        log::debug!("saved subscriber table (version {version})");
        Ok(true)
    }
}
