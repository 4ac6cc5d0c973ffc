//! Lifecycle manager: one maintenance pass over a queue.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::{Context, Queue, Result};
use crate::lifecycle::{
    should_delete, should_unload, target_tier, DeletePolicy, LifecycleStats, TierPolicy,
    UnloadPolicy,
};

/// Configuration for lifecycle management.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub unload: UnloadPolicy,
    pub tier: TierPolicy,
    pub delete: DeletePolicy,
}

/// Applies a [`LifecycleConfig`] to a queue. Scheduling is left to the
/// caller.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Run lifecycle management once: save, unload, re-tier, delete.
    ///
    /// A failing pass is recorded in the stats and the run moves on. Only a
    /// failure to list blocks aborts the run.
    pub fn run_once(&self, ctx: &Context, queue: &Queue) -> Result<LifecycleStats> {
        let start = Instant::now();
        let mut stats = LifecycleStats::new();
        stats.scanned_count = queue.block_infos(ctx)?.len();

        match queue.save_all(ctx) {
            Ok(saved) => stats.saved_count = saved,
            Err(e) => stats.record_error("save", e),
        }

        let now = queue.now();
        match queue.unload_blocks(ctx, |info| should_unload(&self.config.unload, info, now)) {
            Ok(ids) => stats.unloaded_count = ids.len(),
            Err(e) => stats.record_error("unload", e),
        }

        match queue.set_marks(ctx, |info| target_tier(&self.config.tier, info, now)) {
            Ok(marked) => stats.marked_count = marked,
            Err(e) => stats.record_error("mark", e),
        }
        match queue.update_marks(ctx) {
            Ok(moved) => stats.moved_count = moved,
            Err(e) => stats.record_error("move", e),
        }

        let flagged = queue.set_delete(ctx, |info| {
            let replicas = match self.config.delete {
                DeletePolicy::ReplicaWatermark { .. } => {
                    match queue.subscriber_get_replica_count(ctx, info.last_id) {
                        Ok(count) => count,
                        Err(e) => {
                            log::warn!("replica count for block {} unavailable: {e}", info.id);
                            0
                        }
                    }
                }
                _ => 0,
            };
            should_delete(&self.config.delete, info, now, replicas)
        });
        match flagged {
            Ok(flagged) => stats.flagged_count = flagged,
            Err(e) => stats.record_error("flag", e),
        }
        match queue.delete_blocks(ctx) {
            Ok(ids) => stats.deleted_count = ids.len(),
            Err(e) => stats.record_error("delete", e),
        }

        stats.duration = start.elapsed();
        log::info!("lifecycle run: {}", stats.summary());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Durability, ManualClock, NewMessage, QueueConfig};
    use crate::lifecycle::TierRule;
    use crate::storage::{MemoryStorage, Tiers};
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx() -> Context {
        Context::with_timeout(Duration::from_secs(5))
    }

    struct Fixture {
        queue: Queue,
        clock: Arc<ManualClock>,
        hot: Arc<MemoryStorage>,
        cold: Arc<MemoryStorage>,
    }

    fn fixture() -> Fixture {
        let hot = Arc::new(MemoryStorage::new());
        let cold = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000_000_000_000));
        let tiers = Tiers::new("hot", hot.clone()).with_tier("cold", cold.clone());
        let queue = Queue::builder(QueueConfig::default().with_count_limit(2), tiers)
            .clock(clock.clone())
            .create()
            .expect("create");
        Fixture { queue, clock, hot, cold }
    }

    fn fill(queue: &Queue, count: u8) -> Vec<u64> {
        (0..count)
            .map(|i| {
                queue
                    .add(&ctx(), NewMessage::new(vec![i]), Durability::SaveMark)
                    .expect("add")
            })
            .collect()
    }

    #[test]
    fn test_default_config_only_saves() {
        let f = fixture();
        fill(&f.queue, 5);
        let stats = LifecycleManager::new(LifecycleConfig::default())
            .run_once(&ctx(), &f.queue)
            .expect("run");
        assert_eq!(stats.scanned_count, 3);
        assert_eq!(stats.saved_count, 3);
        assert_eq!(stats.unloaded_count, 0);
        assert_eq!(stats.deleted_count, 0);
        assert!(!stats.has_errors());
    }

    #[test]
    fn test_unload_and_move_closed_blocks() {
        let f = fixture();
        fill(&f.queue, 5);
        f.clock.advance(Duration::from_secs(120));
        let config = LifecycleConfig {
            unload: UnloadPolicy::Always,
            tier: TierPolicy {
                rules: vec![TierRule { after_secs: 60, tier: "cold".into() }],
            },
            delete: DeletePolicy::Never,
        };
        let stats = LifecycleManager::new(config).run_once(&ctx(), &f.queue).expect("run");
        assert_eq!(stats.unloaded_count, 2);
        assert_eq!(stats.marked_count, 2);
        assert_eq!(stats.moved_count, 2);
        assert!(!stats.has_errors(), "{:?}", stats.errors);
        assert_eq!(f.cold.len(), 2);
        // Open block plus queue metadata stay hot.
        assert_eq!(f.hot.len(), 2);
        assert_eq!(f.queue.get(&ctx(), 0, 10).expect("get").len(), 5);
    }

    #[test]
    fn test_replica_watermark_deletes_read_prefix() {
        let f = fixture();
        let ids = fill(&f.queue, 5);
        f.queue.subscriber_add_replica_member(&ctx(), "replica").expect("member");
        f.queue
            .subscriber_set_last_read(&ctx(), "replica", ids[1], Durability::SaveMark)
            .expect("ack");
        let config = LifecycleConfig {
            delete: DeletePolicy::ReplicaWatermark { min_replicas: 1 },
            ..LifecycleConfig::default()
        };
        let stats = LifecycleManager::new(config).run_once(&ctx(), &f.queue).expect("run");
        assert_eq!(stats.flagged_count, 1);
        assert_eq!(stats.deleted_count, 1);
        let remaining = f.queue.get(&ctx(), 0, 10).expect("get");
        assert_eq!(remaining.first().map(|m| m.id()), Some(ids[2]));
    }

    #[test]
    fn test_config_from_json() {
        let config: LifecycleConfig = serde_json::from_str(
            r#"{"unload":{"type":"IdleAfter","secs":300},"tier":{"rules":[{"after_secs":60,"tier":"cold"}]}}"#,
        )
        .expect("parse");
        assert_eq!(config.unload, UnloadPolicy::IdleAfter { secs: 300 });
        assert_eq!(config.delete, DeletePolicy::Never);
        assert_eq!(config.tier.rules.len(), 1);
    }
}
