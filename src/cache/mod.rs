//! Published-content tree cache.
//!
//! One immutable [`TreeSnapshot`](crate::domain::snapshot::TreeSnapshot) of
//! everything published, shared by reference with every reader:
//!
//! - **CacheState**: owns the current snapshot and the mutation entry points
//! - **SourceLoader**: rebuilds the tree from the content source
//! - **DiskStore**: mirrors the tree to a snapshot file for fast cold start
//! - **PersistenceScheduler**: coalesces changes into one write per unit of work
//! - **LifecycleHooks**: synchronous callbacks that can veto in-flight operations
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! snapshot_path = "data/published.json"
//! disk_cache_enabled = true
//! persist_changes = true
//! check_disk_changes = true
//! # ... see config.rs for all options
//! ```

pub(crate) mod config;
mod disk;
mod error;
mod hooks;
mod loader;
pub(crate) mod lock;
mod middleware;
mod persist;
mod state;

pub use config::CacheConfig;
pub use disk::{DiskRead, DiskStore};
pub use error::CacheError;
pub use hooks::{Hook, HookOutcome, HookPoint, LifecycleHooks};
pub use loader::{FetchedNode, LoadReport, LoadedTree, SourceLoader};
pub use middleware::persist_after_request;
pub use persist::{DiskWatermark, PersistenceScheduler};
pub use state::{CacheState, PublishOutcome, RefreshOutcome, UnpublishOutcome};
