//! Configuration for the tile pyramid cache and its command-line simulator.
//!
//! Two layers live here:
//! - [`CacheOptions`]: tunables of a [`TilePyramidCache`](crate::cache::TilePyramidCache),
//!   passed explicitly at construction
//! - [`Cli`]: the `tile-pyramid` binary's arguments, parsed with clap from the
//!   command line or from environment variables
//!
//! # Environment Variables
//!
//! Every simulator option can also be set with the `TILE_PYRAMID_` prefix:
//!
//! - `TILE_PYRAMID_SOURCE_KIND` - vector, raster, raster-dem or geojson (default: vector)
//! - `TILE_PYRAMID_MINZOOM` / `TILE_PYRAMID_MAXZOOM` - source zoom range (default: 0 / 14)
//! - `TILE_PYRAMID_TILE_SIZE` - tile size in pixels (default: 512)
//! - `TILE_PYRAMID_LATENCY_MS` - simulated load latency (default: 20)
//! - `TILE_PYRAMID_RASTER_FADE_MS` - raster cross-fade duration (default: 0, off)
//! - `TILE_PYRAMID_FADE_MS` - symbol fade hold duration (default: 300)
//! - `TILE_PYRAMID_MAX_TILE_CACHE_SIZE` - hard cap on the reuse store
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tile_pyramid::config::CacheOptions;
//!
//! let options = CacheOptions {
//!     raster_fade_duration: Duration::from_millis(300),
//!     ..Default::default()
//! };
//! assert!(options.validate().is_ok());
//! ```

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::source::{SourceKind, SourceOptions, Viewport};
use crate::tile::MAX_TILE_ZOOM;

// =============================================================================
// Default Values
// =============================================================================

/// Levels above the covering zoom searched for a substitute ancestor.
pub const DEFAULT_MAX_OVERZOOMING: u8 = 10;

/// Levels below an ideal tile searched for substitute descendants.
pub const DEFAULT_MAX_UNDERZOOMING: u8 = 3;

/// Zoom levels' worth of viewport tiles kept in the reuse store.
pub const DEFAULT_MAX_TILE_CACHE_ZOOM_LEVELS: usize = 5;

/// Hold time for tiles whose symbols are fading out.
pub const DEFAULT_FADE_DURATION: Duration = Duration::from_millis(300);

/// Ancestor levels considered as raster cross-fade partners.
pub const DEFAULT_MAX_FADING_ANCESTOR_LEVELS: u8 = 5;

/// Default viewport size of the simulator.
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1024;
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 768;

// =============================================================================
// Cache Options
// =============================================================================

/// Tunables of a tile pyramid cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOptions {
    /// Levels above the covering zoom to search for a loaded ancestor.
    pub max_overzooming: u8,

    /// Levels below an ideal tile to search for loaded descendants.
    pub max_underzooming: u8,

    /// Hard cap on the reuse store; `None` sizes it from the viewport only.
    pub max_tile_cache_size: Option<usize>,

    /// Multiplier applied to the viewport tile count when sizing the store.
    pub max_tile_cache_zoom_levels: usize,

    /// How long removed tiles with symbols stay resident for their fade-out.
    pub fade_duration: Duration,

    /// Raster cross-fade duration; zero disables fading.
    pub raster_fade_duration: Duration,

    /// Ancestor levels searched for a cross-fade partner.
    pub max_fading_ancestor_levels: u8,

    /// Stop climbing past unrequested ancestors while their children load.
    pub cancel_pending_tile_requests_while_zooming: bool,

    /// Also keep parents and a low-zoom ancestor of each ideal tile.
    pub used_for_terrain: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_overzooming: DEFAULT_MAX_OVERZOOMING,
            max_underzooming: DEFAULT_MAX_UNDERZOOMING,
            max_tile_cache_size: None,
            max_tile_cache_zoom_levels: DEFAULT_MAX_TILE_CACHE_ZOOM_LEVELS,
            fade_duration: DEFAULT_FADE_DURATION,
            raster_fade_duration: Duration::ZERO,
            max_fading_ancestor_levels: DEFAULT_MAX_FADING_ANCESTOR_LEVELS,
            cancel_pending_tile_requests_while_zooming: true,
            used_for_terrain: false,
        }
    }
}

impl CacheOptions {
    /// Validate the options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tile_cache_zoom_levels == 0 {
            return Err("max_tile_cache_zoom_levels must be greater than 0".to_string());
        }
        if self.max_underzooming == 0 {
            return Err("max_underzooming must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tile pyramid cache simulator.
///
/// Drives the cache with a synthetic tile source to observe retention,
/// substitution and eviction, or prints the ideal covering of a viewport.
#[derive(Parser, Debug, Clone)]
#[command(name = "tile-pyramid")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Move a viewport across a synthetic source and report cache behaviour.
    Simulate(SimulateConfig),

    /// Print the ideal tiles covering one viewport.
    Cover(CoverConfig),
}

/// Source properties shared by both subcommands.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Kind of source to simulate.
    #[arg(long = "source-kind", value_enum, default_value_t = SourceKind::Vector, env = "TILE_PYRAMID_SOURCE_KIND")]
    pub kind: SourceKind,

    /// Minimum zoom served by the source.
    #[arg(long, default_value_t = 0, env = "TILE_PYRAMID_MINZOOM")]
    pub minzoom: u8,

    /// Maximum zoom served by the source.
    #[arg(long, default_value_t = 14, env = "TILE_PYRAMID_MAXZOOM")]
    pub maxzoom: u8,

    /// Tile size in pixels.
    #[arg(long, default_value_t = 512, env = "TILE_PYRAMID_TILE_SIZE")]
    pub tile_size: u32,
}

impl SourceArgs {
    /// Source options for these arguments, with the kind's covering defaults.
    pub fn source_options(&self) -> SourceOptions {
        let base = if self.kind.is_raster() {
            SourceOptions::raster()
        } else {
            SourceOptions::vector()
        };
        SourceOptions {
            kind: self.kind,
            minzoom: self.minzoom,
            maxzoom: self.maxzoom,
            tile_size: self.tile_size,
            ..base
        }
    }
}

/// Viewport arguments.
#[derive(Args, Debug, Clone)]
pub struct ViewportArgs {
    /// Center longitude in degrees.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub lng: f64,

    /// Center latitude in degrees.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub lat: f64,

    /// Map zoom.
    #[arg(long, default_value_t = 3.0)]
    pub zoom: f64,

    /// Viewport width in pixels.
    #[arg(long, default_value_t = DEFAULT_VIEWPORT_WIDTH)]
    pub width: u32,

    /// Viewport height in pixels.
    #[arg(long, default_value_t = DEFAULT_VIEWPORT_HEIGHT)]
    pub height: u32,
}

impl ViewportArgs {
    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.lng, self.lat, self.zoom, self.width, self.height)
    }

    fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("viewport width and height must be greater than 0".to_string());
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err("lat must be between -90 and 90".to_string());
        }
        if !(0.0..=f64::from(MAX_TILE_ZOOM)).contains(&self.zoom) {
            return Err(format!("zoom must be between 0 and {MAX_TILE_ZOOM}"));
        }
        Ok(())
    }
}

/// Configuration for the `simulate` command.
#[derive(Args, Debug, Clone)]
pub struct SimulateConfig {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub viewport: ViewportArgs,

    // =========================================================================
    // Camera Motion
    // =========================================================================
    /// Number of frames to simulate.
    #[arg(long, default_value_t = 120)]
    pub frames: usize,

    /// Time between frames in milliseconds.
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// Longitude pan per frame in degrees.
    #[arg(long, default_value_t = 1.5, allow_negative_numbers = true)]
    pub pan_per_frame: f64,

    /// Zoom change per frame.
    #[arg(long, default_value_t = 0.02, allow_negative_numbers = true)]
    pub zoom_per_frame: f64,

    // =========================================================================
    // Synthetic Source
    // =========================================================================
    /// Simulated load latency in milliseconds.
    #[arg(long, default_value_t = 20, env = "TILE_PYRAMID_LATENCY_MS")]
    pub latency_ms: u64,

    /// Report tiles deeper than this zoom as missing.
    #[arg(long, env = "TILE_PYRAMID_MISSING_ABOVE_ZOOM")]
    pub missing_above_zoom: Option<u8>,

    /// Fail every n-th request.
    #[arg(long, env = "TILE_PYRAMID_ERROR_EVERY")]
    pub error_every: Option<u64>,

    /// Cache-Control max-age attached to responses, in seconds.
    #[arg(long, env = "TILE_PYRAMID_MAX_AGE")]
    pub max_age: Option<u64>,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Raster cross-fade duration in milliseconds (0 disables fading).
    #[arg(long, default_value_t = 0, env = "TILE_PYRAMID_RASTER_FADE_MS")]
    pub raster_fade_ms: u64,

    /// Symbol fade hold duration in milliseconds.
    #[arg(long, default_value_t = 300, env = "TILE_PYRAMID_FADE_MS")]
    pub fade_ms: u64,

    /// Hard cap on the number of tiles kept for reuse.
    #[arg(long, env = "TILE_PYRAMID_MAX_TILE_CACHE_SIZE")]
    pub max_tile_cache_size: Option<usize>,

    /// Keep terrain ancestors of every ideal tile.
    #[arg(long, default_value_t = false)]
    pub terrain: bool,

    // =========================================================================
    // Output
    // =========================================================================
    /// Print a JSON summary on stdout.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl SimulateConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.source.source_options().validate()?;
        self.viewport.validate()?;
        self.cache_options().validate()?;

        if self.frames == 0 {
            return Err("frames must be greater than 0".to_string());
        }
        if self.max_tile_cache_size == Some(0) {
            return Err("max_tile_cache_size must be greater than 0".to_string());
        }
        if self.error_every == Some(0) {
            return Err("error_every must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            max_tile_cache_size: self.max_tile_cache_size,
            fade_duration: Duration::from_millis(self.fade_ms),
            raster_fade_duration: Duration::from_millis(self.raster_fade_ms),
            used_for_terrain: self.terrain,
            ..Default::default()
        }
    }
}

/// Configuration for the `cover` command.
#[derive(Args, Debug, Clone)]
pub struct CoverConfig {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub viewport: ViewportArgs,

    /// Print the tiles as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CoverConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.source.source_options().validate()?;
        self.viewport.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
