//! Blocks: bounded runs of records and the unit of persistence, eviction
//! and tier placement.
//!
//! Each block carries two locks. The data lock (`PartialLock<BlockData>`)
//! guards records and placement; the file-save mutex serializes physical I/O
//! (save, load-for-move, move, clear, delete) so a slow store never holds the
//! data lock beyond the snapshot.
//!
//! Blocks never point back at their queue. The queue hands its storage
//! collaborators in as a [`Backend`] on every lifecycle call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::message::{decode_block, encode_block};
use crate::core::meta::{block_object_name, BlockMeta};
use crate::core::{
    Context, Error, IdGenerator, Message, MessageWithMeta, NewMessage, PartialLock, QueueConfig,
    ReadGuard, Result, VersionTracker,
};
use crate::storage::{Compressor, Storage, Tiers};

/// Storage collaborators a block needs for its lifecycle.
#[derive(Debug, Clone)]
pub struct Backend {
    pub tiers: Tiers,
    pub compressor: Arc<dyn Compressor>,
}

impl Backend {
    pub fn new(tiers: Tiers, compressor: Arc<dyn Compressor>) -> Self {
        Self { tiers, compressor }
    }

    pub fn storage(&self, tier: &str) -> Result<&Arc<dyn Storage>> {
        self.tiers.get(tier)
    }

    fn write_block(
        &self,
        ctx: &Context,
        tier: &str,
        block_id: u64,
        records: &[Arc<Message>],
    ) -> Result<usize> {
        let encoded = encode_block(block_id, records)?;
        let packed = self.compressor.compress(&encoded)?;
        let name = block_object_name(block_id);
        self.storage(tier)?
            .save(ctx, &name, &packed)
            .map_err(|err| in_tier("save", tier, &name, err))?;
        Ok(packed.len())
    }

    /// Reads a block object; `None` when the tier has no object for it.
    fn read_block(&self, ctx: &Context, tier: &str, block_id: u64) -> Result<Option<Vec<Arc<Message>>>> {
        let storage = self.storage(tier)?;
        let name = block_object_name(block_id);
        if !storage
            .exists(ctx, &name)
            .map_err(|err| in_tier("exists", tier, &name, err))?
        {
            return Ok(None);
        }
        let packed = storage
            .get(ctx, &name)
            .map_err(|err| in_tier("get", tier, &name, err))?;
        let encoded = self.compressor.decompress(&packed)?;
        decode_block(block_id, &encoded).map(Some)
    }

    fn delete_block(&self, ctx: &Context, tier: &str, block_id: u64) -> Result<()> {
        let name = block_object_name(block_id);
        self.storage(tier)?
            .delete(ctx, &name)
            .map_err(|err| in_tier("delete", tier, &name, err))
    }
}

/// Names the tier and block object a storage failure happened on. Timeouts
/// and failures the store already attributed pass through unchanged.
fn in_tier(op: &'static str, tier: &str, name: &str, err: Error) -> Error {
    match err {
        err @ Error::Storage { .. } => err,
        err if err.is_timeout() => err,
        err => Error::storage(op, format!("{tier}/{name}"), err),
    }
}

#[derive(Debug)]
pub(crate) struct BlockData {
    records: Vec<Arc<Message>>,
    length: usize,
    byte_len: usize,
    last_id: u64,
    evicted: bool,
    current_tier: String,
    pending_tier: String,
    tiers_to_reclaim: Vec<String>,
    pending_delete: bool,
}

impl BlockData {
    fn push(&mut self, message: Message) {
        self.length += 1;
        self.byte_len += message.payload.len();
        self.last_id = message.id;
        self.records.push(Arc::new(message));
    }
}

/// Outcome of [`Block::try_append`].
#[derive(Debug)]
pub(crate) enum Append {
    Done(u64),
    /// The block is at a limit; the message is handed back untouched.
    Full(NewMessage),
}

/// Point-in-time view of a block used by maintenance policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: u64,
    pub created_at: u64,
    pub last_accessed: u64,
    pub length: usize,
    pub byte_len: usize,
    pub last_id: u64,
    pub evicted: bool,
    pub saved: bool,
    pub current_tier: String,
    pub pending_tier: String,
    pub pending_delete: bool,
    /// The queue's tail block, still accepting appends.
    pub is_open: bool,
}

impl BlockInfo {
    pub fn age(&self, now_ns: u64) -> Duration {
        Duration::from_nanos(now_ns.saturating_sub(self.created_at))
    }

    pub fn idle(&self, now_ns: u64) -> Duration {
        Duration::from_nanos(now_ns.saturating_sub(self.last_accessed))
    }
}

#[derive(Debug)]
pub struct Block {
    id: u64,
    created_at: u64,
    data: PartialLock<BlockData>,
    versions: VersionTracker,
    last_accessed: AtomicU64,
    save_lock: Mutex<()>,
}

impl Block {
    /// Creates a block whose id is the id of `first`, the record it opens with.
    pub(crate) fn open_with(
        ids: &IdGenerator,
        first: NewMessage,
        now: u64,
        tier: &str,
        mark_dirty: bool,
    ) -> (Arc<Block>, u64) {
        let id = ids.next();
        let mut data = BlockData {
            records: Vec::new(),
            length: 0,
            byte_len: 0,
            last_id: 0,
            evicted: false,
            current_tier: tier.to_string(),
            pending_tier: tier.to_string(),
            tiers_to_reclaim: Vec::new(),
            pending_delete: false,
        };
        data.push(first.into_message(id, now));
        let versions = VersionTracker::new(0);
        if mark_dirty {
            versions.mark_dirty(id);
        }
        log::debug!("opened block {id} in tier {tier}");
        let block = Block {
            id,
            created_at: now,
            data: PartialLock::new(data),
            versions,
            last_accessed: AtomicU64::new(now),
            save_lock: Mutex::new(()),
        };
        (Arc::new(block), id)
    }

    /// Rebuilds an evicted block from its metadata entry.
    pub(crate) fn from_meta(meta: &BlockMeta, now: u64) -> Arc<Block> {
        let data = BlockData {
            records: Vec::new(),
            length: meta.length,
            byte_len: meta.byte_len,
            last_id: meta.last_id,
            evicted: true,
            current_tier: meta.current_tier.clone(),
            pending_tier: meta.pending_tier.clone(),
            tiers_to_reclaim: meta.tiers_to_reclaim.clone(),
            pending_delete: meta.pending_delete,
        };
        Arc::new(Block {
            id: meta.id,
            created_at: meta.created_at,
            data: PartialLock::new(data),
            versions: VersionTracker::new(meta.persisted_version),
            last_accessed: AtomicU64::new(now),
            save_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn dirty_version(&self) -> u64 {
        self.versions.dirty()
    }

    pub fn persisted_version(&self) -> u64 {
        self.versions.persisted()
    }

    pub(crate) fn versions(&self) -> &VersionTracker {
        &self.versions
    }

    fn save_lock(&self) -> MutexGuard<'_, ()> {
        self.save_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self, now: u64) {
        self.last_accessed.fetch_max(now, Ordering::AcqRel);
    }

    fn is_full(&self, data: &BlockData, config: &QueueConfig, now: u64) -> bool {
        if config.count_limit > 0 && data.records.len() >= config.count_limit {
            return true;
        }
        if config.byte_limit > 0 && data.byte_len >= config.byte_limit {
            return true;
        }
        match config.age_limit {
            Some(age_limit) => Duration::from_nanos(now.saturating_sub(self.created_at)) >= age_limit,
            None => false,
        }
    }

    /// Whether the block still takes appends under `config`'s limits.
    pub fn can_append(&self, ctx: &Context, config: &QueueConfig, now: u64) -> Result<bool> {
        let data = self.data.read(ctx)?;
        Ok(!data.evicted && !self.is_full(&data, config, now))
    }

    /// Appends one record if the block is under `config`'s limits, checked
    /// under the same exclusive hold that places the record. The id is drawn
    /// from `ids` while the lock is held, keeping records in id order.
    pub(crate) fn try_append(
        &self,
        ctx: &Context,
        ids: &IdGenerator,
        config: &QueueConfig,
        message: NewMessage,
        now: u64,
        mark_dirty: bool,
    ) -> Result<Append> {
        let mut data = self.data.write(ctx)?;
        if data.evicted {
            return Err(Error::BlockEvicted(self.id));
        }
        if self.is_full(&data, config, now) {
            return Ok(Append::Full(message));
        }
        let id = ids.next();
        data.push(message.into_message(id, now));
        if mark_dirty {
            self.versions.mark_dirty(id);
        }
        self.touch(now);
        Ok(Append::Done(id))
    }

    /// Shared hold on the block's records, reloading them first if the block
    /// is evicted. The reload and the returned hold are one acquisition, so a
    /// concurrent unload cannot empty the records in between.
    fn loaded(&self, ctx: &Context, backend: &Backend) -> Result<ReadGuard<'_, BlockData>> {
        let data = self.data.read(ctx)?;
        if !data.evicted {
            return Ok(data);
        }
        drop(data);
        let mut data = self.data.write(ctx)?;
        self.fill(ctx, backend, &mut data)?;
        Ok(data.reduce())
    }

    /// Reads the block object from its current tier and repopulates records.
    ///
    /// A missing object loads as an empty block: its records were never
    /// made durable.
    pub fn load(&self, ctx: &Context, backend: &Backend) -> Result<()> {
        let mut data = self.data.write(ctx)?;
        self.fill(ctx, backend, &mut data)
    }

    fn fill(&self, ctx: &Context, backend: &Backend, data: &mut BlockData) -> Result<()> {
        if !data.evicted {
            return Ok(());
        }
        let records = match backend.read_block(ctx, &data.current_tier, self.id)? {
            Some(records) => records,
            None => {
                log::warn!(
                    "block {} has no object in tier {}; loading empty",
                    self.id,
                    data.current_tier
                );
                Vec::new()
            }
        };
        let last_id = records.last().map(|m| m.id).unwrap_or(0);
        data.length = records.len();
        data.byte_len = records.iter().map(|m| m.payload.len()).sum();
        data.last_id = last_id;
        data.records = records;
        data.evicted = false;
        self.versions.reset(last_id);
        log::debug!("loaded block {} ({} records)", self.id, data.length);
        Ok(())
    }

    /// Writes pending changes to the current tier. Returns `false` when
    /// there was nothing to write.
    pub fn save(&self, ctx: &Context, backend: &Backend) -> Result<bool> {
        let _io = self.save_lock();
        if self.versions.pending().is_none() {
            return Ok(false);
        }
        let (records, version, tier) = {
            let data = self.data.read(ctx)?;
            if data.evicted {
                return Ok(false);
            }
            (data.records.clone(), self.versions.dirty(), data.current_tier.clone())
        };
        let written = backend.write_block(ctx, &tier, self.id, &records)?;
        self.versions.mark_persisted(version);
        log::debug!(
            "saved block {} to {} ({} records, {} bytes, version {})",
            self.id,
            tier,
            records.len(),
            written,
            version
        );
        Ok(true)
    }

    /// Drops records from memory. Refused with `Error::NotSaved` while the
    /// block has changes no save has covered.
    pub fn unload(&self, ctx: &Context) -> Result<()> {
        let mut data = self.data.write(ctx)?;
        if data.evicted {
            return Ok(());
        }
        if !self.versions.is_clean() {
            return Err(Error::NotSaved(self.id));
        }
        data.records = Vec::new();
        data.evicted = true;
        log::debug!("unloaded block {}", self.id);
        Ok(())
    }

    /// Reads records with `id > from_id` into `out` until it holds `limit`.
    pub(crate) fn collect_after(
        &self,
        ctx: &Context,
        backend: &Backend,
        from_id: u64,
        limit: usize,
        now: u64,
        out: &mut Vec<MessageWithMeta>,
    ) -> Result<()> {
        {
            let data = self.data.read(ctx)?;
            if data.pending_delete || data.last_id <= from_id {
                return Ok(());
            }
        }
        let data = self.loaded(ctx, backend)?;
        self.touch(now);
        let persisted = self.versions.persisted();
        let start = data.records.partition_point(|m| m.id <= from_id);
        let room = limit.saturating_sub(out.len());
        out.extend(data.records[start..].iter().take(room).map(|m| MessageWithMeta {
            message: Arc::clone(m),
            is_saved: m.id <= persisted,
        }));
        Ok(())
    }

    /// Finds a record by `(source, external_id)`.
    pub(crate) fn find_external(
        &self,
        ctx: &Context,
        backend: &Backend,
        source: &str,
        external_id: u64,
    ) -> Result<Option<u64>> {
        if self.data.read(ctx)?.pending_delete {
            return Ok(None);
        }
        let data = self.loaded(ctx, backend)?;
        Ok(data
            .records
            .iter()
            .rev()
            .find(|m| m.external_id == external_id && m.source == source)
            .map(|m| m.id))
    }

    /// Sets the tier this block should move to. Returns whether it changed.
    pub fn set_pending_tier(&self, ctx: &Context, tier: &str) -> Result<bool> {
        let mut data = self.data.write(ctx)?;
        if data.pending_tier == tier {
            return Ok(false);
        }
        data.pending_tier = tier.to_string();
        Ok(true)
    }

    /// Copies the block into its pending tier and flips placement. The old
    /// tier is queued for [`Block::clear_old_tiers`]. Returns whether a move
    /// happened.
    pub fn move_to_pending_tier(&self, ctx: &Context, backend: &Backend) -> Result<bool> {
        let _io = self.save_lock();
        let target = {
            let data = self.data.read(ctx)?;
            if data.pending_tier == data.current_tier {
                return Ok(false);
            }
            data.pending_tier.clone()
        };
        backend.storage(&target)?;

        let (records, version) = {
            let data = self.loaded(ctx, backend)?;
            (data.records.clone(), self.versions.dirty())
        };
        backend.write_block(ctx, &target, self.id, &records)?;

        let mut data = self.data.write(ctx)?;
        if data.pending_tier != target {
            // Re-marked while copying; the copy stays queued for cleanup.
            if !data.tiers_to_reclaim.contains(&target) {
                data.tiers_to_reclaim.push(target);
            }
            return Ok(false);
        }
        let old = std::mem::replace(&mut data.current_tier, target.clone());
        if !data.tiers_to_reclaim.contains(&old) {
            data.tiers_to_reclaim.push(old.clone());
        }
        drop(data);
        self.versions.mark_persisted(version);
        log::info!("moved block {} from {} to {}", self.id, old, target);
        Ok(true)
    }

    /// Deletes copies left in previous tiers. Idempotent. Returns the number
    /// of tiers cleared.
    pub fn clear_old_tiers(&self, ctx: &Context, backend: &Backend) -> Result<usize> {
        let _io = self.save_lock();
        let (current, reclaim) = {
            let data = self.data.read(ctx)?;
            if data.tiers_to_reclaim.is_empty() {
                return Ok(0);
            }
            (data.current_tier.clone(), data.tiers_to_reclaim.clone())
        };
        let mut cleared = Vec::new();
        for tier in &reclaim {
            if *tier != current {
                backend.delete_block(ctx, tier, self.id)?;
            }
            cleared.push(tier.clone());
        }
        let mut data = self.data.write(ctx)?;
        data.tiers_to_reclaim.retain(|tier| !cleared.contains(tier));
        Ok(cleared.iter().filter(|tier| **tier != current).count())
    }

    /// Flags the block for deletion. Returns whether the flag changed.
    pub fn mark_delete(&self, ctx: &Context) -> Result<bool> {
        let mut data = self.data.write(ctx)?;
        if data.pending_delete {
            return Ok(false);
        }
        data.pending_delete = true;
        Ok(true)
    }

    /// Removes the block's objects from the current tier and every tier
    /// queued for cleanup. Only valid after [`Block::mark_delete`].
    pub fn delete(&self, ctx: &Context, backend: &Backend) -> Result<()> {
        let _io = self.save_lock();
        let tiers = {
            let data = self.data.read(ctx)?;
            if !data.pending_delete {
                return Err(Error::NotPendingDelete(self.id));
            }
            let mut tiers = vec![data.current_tier.clone()];
            for tier in &data.tiers_to_reclaim {
                if !tiers.contains(tier) {
                    tiers.push(tier.clone());
                }
            }
            tiers
        };
        for tier in &tiers {
            backend.delete_block(ctx, tier, self.id)?;
        }
        let mut data = self.data.write(ctx)?;
        data.records = Vec::new();
        data.evicted = true;
        data.tiers_to_reclaim.clear();
        log::info!("deleted block {} from {:?}", self.id, tiers);
        Ok(())
    }

    pub fn info(&self, ctx: &Context, is_open: bool) -> Result<BlockInfo> {
        let data = self.data.read(ctx)?;
        Ok(BlockInfo {
            id: self.id,
            created_at: self.created_at,
            last_accessed: self.last_accessed.load(Ordering::Acquire),
            length: data.length,
            byte_len: data.byte_len,
            last_id: data.last_id,
            evicted: data.evicted,
            saved: self.versions.is_clean(),
            current_tier: data.current_tier.clone(),
            pending_tier: data.pending_tier.clone(),
            pending_delete: data.pending_delete,
            is_open,
        })
    }

    pub(crate) fn meta(&self, ctx: &Context) -> Result<BlockMeta> {
        let data = self.data.read(ctx)?;
        Ok(BlockMeta {
            id: self.id,
            created_at: self.created_at,
            current_tier: data.current_tier.clone(),
            pending_tier: data.pending_tier.clone(),
            tiers_to_reclaim: data.tiers_to_reclaim.clone(),
            pending_delete: data.pending_delete,
            length: data.length,
            byte_len: data.byte_len,
            last_id: data.last_id,
            persisted_version: self.versions.persisted(),
        })
    }
}
