//! The queue: ordered blocks, id generation, durability and maintenance
//! entry points.
//!
//! # Locking
//!
//! The block list sits behind a [`PartialLock`]. Appends hold it shared and
//! only promote to exclusive when the tail block is absent or full; each
//! block's own lock guards its records. Locks are always taken queue first,
//! then block. Maintenance passes snapshot the block list and release the
//! queue lock before doing I/O or calling policy callbacks.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use blockq::core::{Context, Durability, NewMessage, Queue, QueueConfig};
//! use blockq::storage::Tiers;
//!
//! let ctx = Context::with_timeout(Duration::from_secs(5));
//! let queue = Queue::builder(QueueConfig::default(), Tiers::memory()).open(&ctx)?;
//! let id = queue.add(&ctx, NewMessage::new(b"hello".to_vec()), Durability::SaveImmediate)?;
//! let read = queue.get(&ctx, 0, 10)?;
//! assert_eq!(read[0].id(), id);
//! # Ok::<(), blockq::core::Error>(())
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::block::{Append, Backend, Block, BlockInfo};
use crate::core::dedup::DedupCache;
use crate::core::meta::{QueueMeta, METADATA_NAME, META_VERSION};
use crate::core::{
    Clock, Context, Durability, Error, IdGenerator, MessageWithMeta, NewMessage, PartialLock,
    QueueConfig, Result, SaveSignal, SubscriberTable, SystemClock, VersionTracker, WriteGuard,
};
use crate::storage::{Compressor, NoCompression, Storage, Tiers};

/// Collects the collaborators a queue is built from.
#[derive(Debug)]
pub struct QueueBuilder {
    config: QueueConfig,
    tiers: Tiers,
    compressor: Arc<dyn Compressor>,
    clock: Arc<dyn Clock>,
}

impl QueueBuilder {
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// An empty queue; storage is not read.
    pub fn create(self) -> Result<Queue> {
        self.tiers.get(&self.config.default_tier)?;
        let ids = IdGenerator::new(self.config.instance_id, self.clock.as_ref());
        Ok(Queue {
            ids,
            blocks: PartialLock::new(Vec::new()),
            versions: VersionTracker::new(0),
            pending: Mutex::new(BTreeMap::new()),
            subscribers: SubscriberTable::new(),
            dedup: DedupCache::default(),
            save_lock: Mutex::new(()),
            backend: Backend::new(self.tiers, self.compressor),
            clock: self.clock,
            config: self.config,
        })
    }

    /// Loads queue metadata and subscribers from the default tier, or starts
    /// empty when nothing was saved yet. Blocks come back evicted.
    pub fn open(self, ctx: &Context) -> Result<Queue> {
        let storage = Arc::clone(self.tiers.get(&self.config.default_tier)?);
        let queue = self.create()?;
        let subscribers = SubscriberTable::load(ctx, storage.as_ref())?;
        if !storage.exists(ctx, METADATA_NAME)? {
            return Ok(Queue { subscribers, ..queue });
        }

        let meta = QueueMeta::from_bytes(&storage.get(ctx, METADATA_NAME)?)?;
        if meta.count_limit != queue.config.count_limit || meta.byte_limit != queue.config.byte_limit {
            log::info!(
                "queue limits changed: count {} -> {}, bytes {} -> {}",
                meta.count_limit,
                queue.config.count_limit,
                meta.byte_limit,
                queue.config.byte_limit
            );
        }
        let now = queue.clock.now();
        let blocks: Vec<Arc<Block>> = meta.blocks.iter().map(|b| Block::from_meta(b, now)).collect();
        if let Some(last) = meta.blocks.iter().map(|b| b.last_id.max(b.id)).max() {
            queue.ids.observe(last);
        }
        log::info!("opened queue with {} blocks", blocks.len());
        Ok(Queue {
            blocks: PartialLock::new(blocks),
            versions: VersionTracker::new(meta.persisted_version),
            subscribers,
            ..queue
        })
    }
}

#[derive(Debug)]
pub struct Queue {
    config: QueueConfig,
    backend: Backend,
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
    blocks: PartialLock<Vec<Arc<Block>>>,
    versions: VersionTracker,
    pending: Mutex<BTreeMap<u64, Arc<Block>>>,
    subscribers: SubscriberTable,
    pub(crate) dedup: DedupCache,
    save_lock: Mutex<()>,
}

impl Queue {
    pub fn builder(config: QueueConfig, tiers: Tiers) -> QueueBuilder {
        QueueBuilder {
            config,
            tiers,
            compressor: Arc::new(NoCompression),
            clock: Arc::new(SystemClock),
        }
    }

    /// An empty queue with no compression and the system clock.
    pub fn new(config: QueueConfig, tiers: Tiers) -> Result<Self> {
        Self::builder(config, tiers).create()
    }

    /// Reopens whatever `tiers` holds, with no compression and the system
    /// clock. Use [`Queue::builder`] to supply either.
    pub fn open(ctx: &Context, config: QueueConfig, tiers: Tiers) -> Result<Self> {
        Self::builder(config, tiers).open(ctx)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn tiers(&self) -> &Tiers {
        &self.backend.tiers
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn dirty_version(&self) -> u64 {
        self.versions.dirty()
    }

    pub fn persisted_version(&self) -> u64 {
        self.versions.persisted()
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    fn default_storage(&self) -> Result<&Arc<dyn Storage>> {
        self.backend.tiers.get(&self.config.default_tier)
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<Block>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save_lock(&self) -> MutexGuard<'_, ()> {
        self.save_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the block list; the queue lock is released on return.
    pub(crate) fn block_list(&self, ctx: &Context) -> Result<Vec<Arc<Block>>> {
        Ok(self.blocks.read(ctx)?.clone())
    }

    pub fn block_count(&self, ctx: &Context) -> Result<usize> {
        Ok(self.blocks.read(ctx)?.len())
    }

    pub(crate) fn check_timestamp(&self, message: &NewMessage, now: u64) -> Result<()> {
        if message.external_timestamp > now {
            return Err(Error::FutureTimestamp {
                external_ns: message.external_timestamp,
                now_ns: now,
            });
        }
        Ok(())
    }

    /// Appends one record and returns its id.
    pub fn add(&self, ctx: &Context, message: NewMessage, durability: Durability) -> Result<u64> {
        let now = self.clock.now();
        self.check_timestamp(&message, now)?;
        let (block, id) = self.append(ctx, message, now, durability)?;
        self.apply_durability(ctx, &[(block, id)], durability)?;
        Ok(id)
    }

    /// Appends a batch. Timestamps are validated for the whole batch before
    /// anything is written; durability is applied once for the batch.
    pub fn add_list(
        &self,
        ctx: &Context,
        messages: Vec<NewMessage>,
        durability: Durability,
    ) -> Result<Vec<u64>> {
        let now = self.clock.now();
        for message in &messages {
            self.check_timestamp(message, now)?;
        }
        let mut written = Vec::with_capacity(messages.len());
        for message in messages {
            written.push(self.append(ctx, message, now, durability)?);
        }
        self.apply_durability(ctx, &written, durability)?;
        Ok(written.into_iter().map(|(_, id)| id).collect())
    }

    /// The in-memory half of an append: place the record and mark it dirty.
    pub(crate) fn append(
        &self,
        ctx: &Context,
        message: NewMessage,
        now: u64,
        durability: Durability,
    ) -> Result<(Arc<Block>, u64)> {
        let mark = durability.marks_dirty();
        let blocks = self.blocks.read(ctx)?;
        let message = match blocks.last() {
            Some(tail) => match self.try_tail(ctx, tail, message, now, mark)? {
                Append::Done(id) => {
                    let tail = Arc::clone(tail);
                    self.mark_appended(&tail, id, mark);
                    return Ok((tail, id));
                }
                Append::Full(message) => message,
            },
            None => message,
        };

        let mut exclusive = match blocks.try_promote(ctx) {
            Ok(exclusive) => exclusive,
            Err((shared, Error::PromoteContended)) => {
                drop(shared);
                self.blocks.write(ctx)?
            }
            Err((_, err)) => return Err(err),
        };
        let (block, id) = self.append_exclusive(ctx, &mut exclusive, message, now, mark)?;
        let shared = exclusive.reduce();
        self.mark_appended(&block, id, mark);
        drop(shared);
        Ok((block, id))
    }

    /// Appends to `tail` unless it is full. An evicted tail counts as full;
    /// one evicted between the check and the append fails with
    /// `Error::BlockEvicted`.
    fn try_tail(
        &self,
        ctx: &Context,
        tail: &Block,
        message: NewMessage,
        now: u64,
        mark: bool,
    ) -> Result<Append> {
        if !tail.can_append(ctx, &self.config, now)? {
            return Ok(Append::Full(message));
        }
        tail.try_append(ctx, &self.ids, &self.config, message, now, mark)
    }

    /// Appends with the block list held exclusively, opening a new tail
    /// block when the current one is absent or full.
    fn append_exclusive(
        &self,
        ctx: &Context,
        blocks: &mut WriteGuard<'_, Vec<Arc<Block>>>,
        message: NewMessage,
        now: u64,
        mark: bool,
    ) -> Result<(Arc<Block>, u64)> {
        // Another writer may have opened a block while we waited.
        let message = match blocks.last() {
            Some(tail) => match self.try_tail(ctx, tail, message, now, mark)? {
                Append::Done(id) => return Ok((Arc::clone(tail), id)),
                Append::Full(message) => message,
            },
            None => message,
        };
        let (block, id) = Block::open_with(&self.ids, message, now, &self.config.default_tier, mark);
        blocks.push(Arc::clone(&block));
        log::debug!("queue now has {} blocks", blocks.len());
        Ok((block, id))
    }

    fn mark_appended(&self, block: &Arc<Block>, id: u64, mark: bool) {
        if mark {
            self.versions.mark_dirty(id);
            self.pending().insert(block.id(), Arc::clone(block));
        }
    }

    pub(crate) fn apply_durability(
        &self,
        ctx: &Context,
        written: &[(Arc<Block>, u64)],
        durability: Durability,
    ) -> Result<()> {
        match durability {
            Durability::NoSave | Durability::SaveMark => Ok(()),
            Durability::SaveImmediate => self.save_all(ctx).map(|_| ()),
            Durability::SaveWait => {
                let mut needed: BTreeMap<u64, (Arc<Block>, u64)> = BTreeMap::new();
                let mut queue_version = 0;
                for (block, id) in written {
                    queue_version = queue_version.max(*id);
                    let slot = needed
                        .entry(block.id())
                        .or_insert_with(|| (Arc::clone(block), *id));
                    slot.1 = slot.1.max(*id);
                }
                let mut signals: Vec<SaveSignal> = needed
                    .values()
                    .map(|(block, id)| block.versions().wait_for(*id))
                    .collect();
                signals.push(self.versions.wait_for(queue_version));
                for signal in signals {
                    signal.wait(ctx)?;
                }
                Ok(())
            }
        }
    }

    /// Reads up to `limit` records with `id > from_id`, in id order.
    pub fn get(&self, ctx: &Context, from_id: u64, limit: usize) -> Result<Vec<MessageWithMeta>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidates = {
            let blocks = self.blocks.read(ctx)?;
            // Block ids are first-record ids, so the first candidate is the
            // last block starting at or before `from_id`.
            let start = blocks.partition_point(|b| b.id() <= from_id).saturating_sub(1);
            blocks[start..].to_vec()
        };
        let now = self.clock.now();
        let mut out = Vec::with_capacity(limit.min(1024));
        for block in candidates {
            if out.len() >= limit {
                break;
            }
            block.collect_after(ctx, &self.backend, from_id, limit, now, &mut out)?;
        }
        Ok(out)
    }

    /// Persists every pending block, then queue metadata, then the
    /// subscriber table. Returns the number of blocks written.
    ///
    /// One pass satisfies every save-wait caller whose write it covers.
    pub fn save_all(&self, ctx: &Context) -> Result<usize> {
        let _io = self.save_lock();
        let pending: Vec<Arc<Block>> = std::mem::take(&mut *self.pending()).into_values().collect();
        let mut saved = 0;
        for (index, block) in pending.iter().enumerate() {
            match block.save(ctx, &self.backend) {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(err) => {
                    let mut requeue = self.pending();
                    for block in &pending[index..] {
                        requeue.insert(block.id(), Arc::clone(block));
                    }
                    return Err(err);
                }
            }
        }
        self.save_meta_locked(ctx)?;
        self.subscribers.save(ctx, self.default_storage()?.as_ref())?;
        Ok(saved)
    }

    /// Writes queue metadata if it changed since the last write.
    pub fn save_meta(&self, ctx: &Context) -> Result<bool> {
        let _io = self.save_lock();
        self.save_meta_locked(ctx)
    }

    fn save_meta_locked(&self, ctx: &Context) -> Result<bool> {
        let Some(version) = self.versions.pending() else {
            return Ok(false);
        };
        let blocks = self.block_list(ctx)?;
        let mut entries = Vec::with_capacity(blocks.len());
        for block in &blocks {
            entries.push(block.meta(ctx)?);
        }
        let meta = QueueMeta {
            version: META_VERSION,
            count_limit: self.config.count_limit,
            byte_limit: self.config.byte_limit,
            age_limit_ms: self.config.age_limit.map(|d| d.as_millis() as u64),
            dirty_version: version,
            persisted_version: version,
            blocks: entries,
        };
        self.default_storage()?
            .save(ctx, METADATA_NAME, &meta.to_bytes()?)?;
        self.versions.mark_persisted(version);
        log::debug!("saved queue metadata ({} blocks, version {version})", blocks.len());
        Ok(true)
    }

    /// Views of every block, oldest first.
    pub fn block_infos(&self, ctx: &Context) -> Result<Vec<BlockInfo>> {
        let blocks = self.block_list(ctx)?;
        let last = blocks.len().saturating_sub(1);
        blocks
            .iter()
            .enumerate()
            .map(|(index, block)| block.info(ctx, index == last))
            .collect()
    }

    /// Evicts blocks the policy selects. Blocks with unsaved changes are
    /// skipped. Returns the ids unloaded.
    pub fn unload_blocks(
        &self,
        ctx: &Context,
        policy: impl Fn(&BlockInfo) -> bool,
    ) -> Result<Vec<u64>> {
        let blocks = self.block_list(ctx)?;
        let last = blocks.len().saturating_sub(1);
        let mut unloaded = Vec::new();
        for (index, block) in blocks.iter().enumerate() {
            let info = block.info(ctx, index == last)?;
            if info.evicted || !policy(&info) {
                continue;
            }
            match block.unload(ctx) {
                Ok(()) => unloaded.push(block.id()),
                Err(Error::NotSaved(id)) => log::debug!("skipping unload of unsaved block {id}"),
                Err(err) => return Err(err),
            }
        }
        Ok(unloaded)
    }

    /// Assigns pending tiers from the policy. Returns how many changed.
    pub fn set_marks(
        &self,
        ctx: &Context,
        policy: impl Fn(&BlockInfo) -> Option<String>,
    ) -> Result<usize> {
        let blocks = self.block_list(ctx)?;
        let last = blocks.len().saturating_sub(1);
        let mut changed = 0;
        for (index, block) in blocks.iter().enumerate() {
            let info = block.info(ctx, index == last)?;
            if info.pending_delete {
                continue;
            }
            let Some(tier) = policy(&info) else {
                continue;
            };
            self.backend.tiers.get(&tier)?;
            if block.set_pending_tier(ctx, &tier)? {
                changed += 1;
            }
        }
        if changed > 0 {
            self.versions.bump();
        }
        Ok(changed)
    }

    /// Moves blocks whose pending tier differs from their current one,
    /// persists the new placement, then clears the old copies. Returns the
    /// number of blocks moved.
    pub fn update_marks(&self, ctx: &Context) -> Result<usize> {
        let blocks = self.block_list(ctx)?;
        let mut moved = 0;
        for block in &blocks {
            if block.move_to_pending_tier(ctx, &self.backend)? {
                moved += 1;
            }
        }
        if moved > 0 {
            self.versions.bump();
            self.save_meta(ctx)?;
        }
        let mut cleared = 0;
        for block in &blocks {
            cleared += block.clear_old_tiers(ctx, &self.backend)?;
        }
        if cleared > 0 {
            self.versions.bump();
            self.save_meta(ctx)?;
        }
        Ok(moved)
    }

    /// Flags blocks for deletion, oldest first, stopping at the first block
    /// the policy rejects. The open tail block is never flagged. Returns how
    /// many blocks were newly flagged.
    pub fn set_delete(&self, ctx: &Context, policy: impl Fn(&BlockInfo) -> bool) -> Result<usize> {
        let blocks = self.block_list(ctx)?;
        let Some((_, closed)) = blocks.split_last() else {
            return Ok(0);
        };
        let mut flagged = 0;
        for block in closed {
            let info = block.info(ctx, false)?;
            if info.pending_delete {
                continue;
            }
            if !policy(&info) {
                break;
            }
            if block.mark_delete(ctx)? {
                flagged += 1;
            }
        }
        if flagged > 0 {
            self.versions.bump();
        }
        Ok(flagged)
    }

    /// Deletes the contiguous oldest prefix of flagged blocks from storage
    /// and from the block list. Returns the ids removed.
    pub fn delete_blocks(&self, ctx: &Context) -> Result<Vec<u64>> {
        let blocks = self.block_list(ctx)?;
        let Some((_, closed)) = blocks.split_last() else {
            return Ok(Vec::new());
        };
        let mut doomed = Vec::new();
        for block in closed {
            if !block.info(ctx, false)?.pending_delete {
                break;
            }
            doomed.push(Arc::clone(block));
        }
        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        let mut deleted = BTreeSet::new();
        let mut failure = None;
        for block in &doomed {
            match block.delete(ctx, &self.backend) {
                Ok(()) => {
                    deleted.insert(block.id());
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if !deleted.is_empty() {
            let mut list = self.blocks.write(ctx)?;
            list.retain(|block| !deleted.contains(&block.id()));
            drop(list);
            self.pending().retain(|id, _| !deleted.contains(id));
            self.versions.bump();
            self.save_meta(ctx)?;
            log::info!("deleted {} blocks", deleted.len());
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(deleted.into_iter().collect()),
        }
    }

    pub fn subscriber_set_last_read(
        &self,
        ctx: &Context,
        name: &str,
        id: u64,
        durability: Durability,
    ) -> Result<()> {
        let version = self.subscribers.set_last_read(
            ctx,
            name,
            id,
            self.clock.now(),
            durability.marks_dirty(),
        )?;
        let Some(version) = version else {
            return Ok(());
        };
        match durability {
            Durability::NoSave | Durability::SaveMark => Ok(()),
            Durability::SaveImmediate => self.save_subscribers(ctx).map(|_| ()),
            Durability::SaveWait => self.subscribers.versions().wait_for(version).wait(ctx),
        }
    }

    pub fn subscriber_get_last_read(&self, ctx: &Context, name: &str) -> Result<Option<u64>> {
        Ok(self
            .subscribers
            .get_last_read(ctx, name)?
            .map(|entry| entry.last_id))
    }

    pub fn subscriber_add_replica_member(&self, ctx: &Context, name: &str) -> Result<()> {
        if self.subscribers.add_replica_member(ctx, name)?.is_some() {
            self.save_subscribers(ctx)?;
        }
        Ok(())
    }

    pub fn subscriber_remove_replica_member(&self, ctx: &Context, name: &str) -> Result<()> {
        if self.subscribers.remove_replica_member(ctx, name)?.is_some() {
            self.save_subscribers(ctx)?;
        }
        Ok(())
    }

    /// Replica members whose last read has reached `id`.
    pub fn subscriber_get_replica_count(&self, ctx: &Context, id: u64) -> Result<usize> {
        self.subscribers.replica_count(ctx, id)
    }

    pub fn subscriber_names(&self, ctx: &Context) -> Result<Vec<String>> {
        self.subscribers.names(ctx)
    }

    fn save_subscribers(&self, ctx: &Context) -> Result<bool> {
        self.subscribers.save(ctx, self.default_storage()?.as_ref())
    }
}
