//! Tile identity and per-tile lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            TilePyramidCache             │
//! └────────────────────┬────────────────────┘
//!                      │ owns
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │                  Tile                   │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ state machine│  │ expiry / fade   │  │
//! │  │ (lifecycle)  │  │ bookkeeping     │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │ addressed by
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │   OverscaledTileId ─► TileKey (u128)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`CanonicalTileId`], [`UnwrappedTileId`], [`OverscaledTileId`]: value types
//!   with quadtree containment math
//! - [`TileKey`]: packed map key for every tile map in the crate
//! - [`Tile`]: load state, expiry backoff, fade windows and dependency keys
//!
//! # Example
//!
//! ```
//! use tile_pyramid::tile::OverscaledTileId;
//!
//! let id = OverscaledTileId::new(5, 0, 5, 17, 9).unwrap();
//! let parent = id.scaled_to(4).unwrap();
//! assert!(id.is_child_of(&parent));
//! assert_eq!(parent.children(14).len(), 4);
//! ```

mod id;
mod lifecycle;

pub use id::{
    CanonicalTileId, OverscaledTileId, TileKey, UnwrappedTileId, MAX_TILE_ZOOM, MIN_TILE_ZOOM,
};
pub use lifecycle::{
    parse_cache_control, CacheControl, Clock, ExpiryData, FadingDirection, FadingRole, Tile,
    TileClaim, TileData, TileState, CLOCK_SKEW_RETRY_TIMEOUT, MAX_TIMER_DELAY,
};
