//! Idempotent appends keyed by `(source, external_id)`.
//!
//! Each source keeps the highest external id it has appended. An id above
//! that maximum is new and appends without a scan; anything else scans
//! blocks newest first for an existing record. A source with no cached
//! maximum (first use, or after reopening) always scans.
//!
//! A caller-supplied external timestamp bounds the scan: blocks created
//! before it cannot hold the record. Without one every live block is
//! searched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::block::Block;
use crate::core::{Context, Durability, Error, NewMessage, PartialLock, Queue, Result};

#[derive(Debug, Default)]
pub(crate) struct DedupCache {
    sources: Mutex<HashMap<String, Arc<PartialLock<Option<u64>>>>>,
}

impl DedupCache {
    /// The per-source slot. Holding its write guard serializes unique
    /// appends for that source.
    fn slot(&self, source: &str) -> Arc<PartialLock<Option<u64>>> {
        let mut sources = self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            sources
                .entry(source.to_string())
                .or_insert_with(|| Arc::new(PartialLock::new(None))),
        )
    }
}

impl Queue {
    /// Appends unless a record with the same `(source, external_id)` exists,
    /// in which case the existing id is returned and nothing is written.
    ///
    /// A duplicate returns at once regardless of `durability`.
    pub fn add_unique(&self, ctx: &Context, message: NewMessage, durability: Durability) -> Result<u64> {
        let now = self.now();
        let (id, written) = self.add_unique_one(ctx, message, now, durability)?;
        if let Some(block) = written {
            self.apply_durability(ctx, &[(block, id)], durability)?;
        }
        Ok(id)
    }

    /// Unique append of a batch. Returns one id per message, existing or new.
    pub fn add_unique_list(
        &self,
        ctx: &Context,
        messages: Vec<NewMessage>,
        durability: Durability,
    ) -> Result<Vec<u64>> {
        let now = self.now();
        for message in &messages {
            if message.external_id == 0 {
                return Err(Error::ZeroExternalId);
            }
            self.check_timestamp(message, now)?;
        }
        let mut ids = Vec::with_capacity(messages.len());
        let mut written = Vec::new();
        for message in messages {
            let (id, block) = self.add_unique_one(ctx, message, now, durability)?;
            if let Some(block) = block {
                written.push((block, id));
            }
            ids.push(id);
        }
        self.apply_durability(ctx, &written, durability)?;
        Ok(ids)
    }

    fn add_unique_one(
        &self,
        ctx: &Context,
        message: NewMessage,
        now: u64,
        durability: Durability,
    ) -> Result<(u64, Option<Arc<Block>>)> {
        if message.external_id == 0 {
            return Err(Error::ZeroExternalId);
        }
        self.check_timestamp(&message, now)?;
        let external_id = message.external_id;
        let timestamp = match message.external_timestamp {
            0 => None,
            ts => Some(ts),
        };

        let slot = self.dedup.slot(&message.source);
        let mut max_seen = slot.write(ctx)?;
        let needs_scan = match *max_seen {
            Some(max) => external_id <= max,
            None => true,
        };
        if needs_scan {
            if let Some(existing) = self.find_external(ctx, &message.source, external_id, timestamp)? {
                log::debug!(
                    "duplicate {}/{} resolved to {}",
                    message.source,
                    external_id,
                    existing
                );
                return Ok((existing, None));
            }
        }

        let (block, id) = self.append(ctx, message, now, durability)?;
        *max_seen = Some(max_seen.map_or(external_id, |max| max.max(external_id)));
        Ok((id, Some(block)))
    }

    /// Scans newest first. With a `timestamp`, a block created at or before
    /// it is the last one checked: older blocks cannot hold a record stamped
    /// after it.
    fn find_external(
        &self,
        ctx: &Context,
        source: &str,
        external_id: u64,
        timestamp: Option<u64>,
    ) -> Result<Option<u64>> {
        let blocks = self.block_list(ctx)?;
        for block in blocks.iter().rev() {
            if let Some(id) = block.find_external(ctx, self.backend(), source, external_id)? {
                return Ok(Some(id));
            }
            if timestamp.is_some_and(|ts| block.created_at() <= ts) {
                break;
            }
        }
        Ok(None)
    }
}
