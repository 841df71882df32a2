//! Tile residency: the pyramid cache and its reuse store.
//!
//! # Architecture
//!
//! ```text
//!                    update(viewport)
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │                TilePyramidCache                 │
//! │  active tiles ──remove──► BoundedTileStore      │
//! │       ▲                        │                │
//! │       └──────── restore ───────┘                │
//! └───────┬──────────────────────────────▲──────────┘
//!         │ spawn (TaskGuard)            │ CacheMessage
//!         ▼                              │
//! ┌─────────────────┐   ┌────────────────┴────────┐
//! │ TileSource load │──►│ mpsc channel            │
//! │ timers          │──►│ (applied between frames)│
//! └─────────────────┘   └─────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TilePyramidCache`]: retain set, substitution, eviction and reloads
//! - [`BoundedTileStore`]: capacity-bounded FIFO-per-key store of evicted tiles
//! - [`TaskGuard`]: spawned load or timer that is aborted when dropped
//! - [`SourceEvent`]: notifications broadcast to subscribers
//!
//! # Example
//!
//! ```
//! use tile_pyramid::cache::TilePyramidCache;
//! use tile_pyramid::config::CacheOptions;
//! use tile_pyramid::source::{SyntheticSource, SyntheticSourceConfig, Viewport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let source = SyntheticSource::new(SyntheticSourceConfig::default());
//! let mut cache = TilePyramidCache::new(source, CacheOptions::default());
//!
//! cache.update(&Viewport::new(0.0, 0.0, 2.0, 512, 512));
//! cache.settle().await;
//! assert!(cache.loaded());
//! assert!(!cache.renderable_ids(false).is_empty());
//! # }
//! ```

mod events;
mod pyramid;
mod raster;
mod store;
mod task;

pub use events::{SourceEvent, EVENT_CHANNEL_CAPACITY};
pub use pyramid::TilePyramidCache;
pub use store::{BoundedTileStore, EvictFn};
pub use task::{CacheMessage, TaskGuard};
