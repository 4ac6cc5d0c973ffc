//! Block lifecycle management.
//!
//! Policies decide which blocks to evict from memory, which tier each block
//! belongs in, and which old blocks may be deleted. [`LifecycleManager`]
//! applies them to a queue through its maintenance entry points.
//!
//! # Example
//!
//! ```rust,ignore
//! use blockq::lifecycle::{LifecycleConfig, LifecycleManager, UnloadPolicy};
//!
//! let config = LifecycleConfig {
//!     unload: UnloadPolicy::IdleAfter { secs: 300 },
//!     ..Default::default()
//! };
//!
//! let stats = LifecycleManager::new(config).run_once(&ctx, &queue)?;
//! println!("{}", stats.summary());
//! ```

mod manager;
mod policy;
mod stats;

pub use manager::{LifecycleConfig, LifecycleManager};
pub use policy::{
    should_delete, should_unload, target_tier, DeletePolicy, TierPolicy, TierRule, UnloadPolicy,
};
pub use stats::LifecycleStats;
