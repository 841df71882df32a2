//! # Tile Pyramid
//!
//! A residency cache for map tile pyramids.
//!
//! A map view needs a handful of tiles at full resolution, but tiles take time
//! to arrive. This library decides which tiles to keep in memory for a moving
//! viewport: it requests the ideal tiles, draws loaded ancestors or
//! descendants in their place while they load, parks tiles that scroll out of
//! view in a bounded store for cheap reuse, and refreshes tiles as their data
//! expires.
//!
//! ## Features
//!
//! - **Substitution**: missing tiles fall back to loaded ancestors or descendants
//! - **Reuse store**: evicted tiles are kept in a viewport-sized FIFO store
//! - **Expiry**: `Cache-Control`/`Expires` driven reloads with exponential backoff
//! - **Fades**: raster cross-fades and symbol fade holds delay eviction
//! - **World copies**: tiles are renumbered, not refetched, across the antimeridian
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`tile`] - Tile identity, keys and the per-tile lifecycle
//! - [`cache`] - The pyramid cache, reuse store and background tasks
//! - [`source`] - Data-source trait, viewport coverage and a synthetic source
//! - [`config`] - Cache options and CLI types
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust,no_run
//! use tile_pyramid::{CacheOptions, SyntheticSource, SyntheticSourceConfig, TilePyramidCache, Viewport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = SyntheticSource::new(SyntheticSourceConfig::default());
//!     let mut cache = TilePyramidCache::new(source, CacheOptions::default());
//!
//!     // Once per frame
//!     cache.update(&Viewport::new(13.4, 52.5, 10.0, 1024, 768));
//!     cache.process_events();
//!
//!     for id in cache.renderable_ids(false) {
//!         println!("draw {id}");
//!     }
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod source;
pub mod tile;

// Re-export commonly used types
pub use cache::{BoundedTileStore, SourceEvent, TaskGuard, TilePyramidCache};
pub use config::{CacheOptions, Cli, Command, CoverConfig, SimulateConfig};
pub use error::{LoadError, TileIdError};
pub use source::{
    covering_zoom_level, Coverage, CoverageParams, FlatCoverage, LoadRequest, SourceKind,
    SourceOptions, SyntheticSource, SyntheticSourceConfig, TileSource, Viewport,
};
pub use tile::{
    CanonicalTileId, ExpiryData, OverscaledTileId, Tile, TileClaim, TileData, TileKey, TileState,
    UnwrappedTileId,
};
