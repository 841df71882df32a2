//! Data-source abstraction and viewport coverage.
//!
//! The cache never fetches bytes itself. It asks a [`TileSource`] for tile
//! data and a [`Coverage`] for the ideal tiles of a viewport, so that the
//! retain and eviction logic can be exercised against any backend.
//!
//! # Components
//!
//! - [`TileSource`]: async loader plus abort/unload hooks and static properties
//! - [`SourceOptions`]: zoom range, tile size and covering behaviour of a source
//! - [`FlatCoverage`]: ideal tiles for an untilted web-mercator viewport
//! - [`SyntheticSource`]: in-process source with simulated latency and gaps
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use tile_pyramid::error::LoadError;
//! use tile_pyramid::source::{LoadRequest, SourceOptions, TileSource};
//! use tile_pyramid::tile::TileData;
//!
//! struct Blank {
//!     options: SourceOptions,
//! }
//!
//! #[async_trait]
//! impl TileSource for Blank {
//!     fn options(&self) -> &SourceOptions {
//!         &self.options
//!     }
//!
//!     async fn load_tile(&self, _request: &LoadRequest) -> Result<TileData, LoadError> {
//!         Ok(TileData::default())
//!     }
//! }
//! ```

mod coverage;
mod synthetic;

pub use coverage::{covering_zoom_level, Coverage, CoverageParams, FlatCoverage, Viewport};
pub use synthetic::{SyntheticSource, SyntheticSourceConfig};

pub use crate::tile::TileData;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::tile::{OverscaledTileId, TileState, MAX_TILE_ZOOM};

// =============================================================================
// Source Options
// =============================================================================

/// Kind of data a source serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Vector,
    Raster,
    RasterDem,
    Geojson,
}

impl SourceKind {
    /// Raster-like sources cross-fade and never hold tiles for symbol fades.
    pub fn is_raster(&self) -> bool {
        matches!(self, SourceKind::Raster | SourceKind::RasterDem)
    }
}

/// Static properties of a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOptions {
    pub kind: SourceKind,
    pub minzoom: u8,
    pub maxzoom: u8,
    /// Tile edge length in pixels
    pub tile_size: u32,
    /// Round rather than floor the zoom when covering a viewport
    pub round_zoom: bool,
    /// Request overscaled tiles at their render zoom instead of the data zoom
    pub reparse_overscaled: bool,
}

impl SourceOptions {
    pub fn vector() -> Self {
        Self {
            kind: SourceKind::Vector,
            minzoom: 0,
            maxzoom: 14,
            tile_size: 512,
            round_zoom: false,
            reparse_overscaled: true,
        }
    }

    pub fn raster() -> Self {
        Self {
            kind: SourceKind::Raster,
            minzoom: 0,
            maxzoom: 22,
            tile_size: 512,
            round_zoom: true,
            reparse_overscaled: false,
        }
    }

    /// Check the zoom range and tile size.
    pub fn validate(&self) -> Result<(), String> {
        if self.minzoom > self.maxzoom {
            return Err(format!(
                "minzoom ({}) must not exceed maxzoom ({})",
                self.minzoom, self.maxzoom
            ));
        }
        if self.maxzoom > MAX_TILE_ZOOM {
            return Err(format!(
                "maxzoom ({}) must be at most {}",
                self.maxzoom, MAX_TILE_ZOOM
            ));
        }
        if self.tile_size < 64 || !self.tile_size.is_power_of_two() {
            return Err(format!(
                "tile_size ({}) must be a power of two of at least 64",
                self.tile_size
            ));
        }
        Ok(())
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self::vector()
    }
}

// =============================================================================
// TileSource Trait
// =============================================================================

/// A single load issued by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub id: OverscaledTileId,
    /// Instance id of the tile being loaded
    pub uid: u64,
    /// State of the tile when the request was issued
    pub previous_state: TileState,
}

impl LoadRequest {
    /// Whether this request refreshes data the tile already has.
    pub fn is_reload(&self) -> bool {
        matches!(
            self.previous_state,
            TileState::Loaded | TileState::Reloading | TileState::Expired
        )
    }
}

/// Backend that produces tile data.
///
/// Loads run on spawned tasks, so implementations must be shareable across
/// threads. A load for a tile that was removed in the meantime is aborted and
/// its result discarded.
#[async_trait]
pub trait TileSource: Send + Sync + 'static {
    fn options(&self) -> &SourceOptions;

    /// Fetch the data for one tile.
    async fn load_tile(&self, request: &LoadRequest) -> Result<TileData, LoadError>;

    /// Called when a pending load is abandoned.
    fn abort_tile(&self, _id: &OverscaledTileId, _uid: u64) {}

    /// Called when a tile's payload is released for good.
    fn unload_tile(&self, _id: &OverscaledTileId, _uid: u64) {}

    /// Whether the source can serve `id` at all. Ideal tiles failing this are
    /// skipped.
    fn has_tile(&self, _id: &OverscaledTileId) -> bool {
        true
    }
}
