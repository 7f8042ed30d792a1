//! Keel watch: semantic change events over the object bucket.
//!
//! Raw KV writes become `Put`, `Delete` (marked for deletion, still readable) or `Purge`
//! (gone). Handlers return an [`Outcome`](keel_core::Outcome) that decides acknowledgement.

#![forbid(unsafe_code)]

mod cache;
mod watcher;

pub use cache::{spawn_cache, CacheHandle, CacheSnapshot, Coalescer, SnapshotBuilder};
pub use watcher::{classify, settle, EventHandler, FnHandler, Watcher, WatcherConfig};
