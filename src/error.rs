use thiserror::Error;

/// Errors raised when constructing or transforming tile identifiers.
///
/// These are programming errors: a caller asked for a coordinate that cannot
/// exist in the pyramid. They are reported at construction time and never
/// absorbed into tile state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TileIdError {
    /// Coordinate outside `0 <= x, y < 2^z` or zoom outside the supported range
    #[error("x={x}, y={y}, z={z} outside of bounds: 0<=x<2^z, 0<=y<2^z, 0<=z<=25")]
    OutOfBounds { z: u8, x: u32, y: u32 },

    /// Overscaled zoom below the canonical zoom of the data it renders
    #[error("overscaled_z should be >= z; overscaled_z = {overscaled_z}; z = {z}")]
    OverscaleBelowCanonical { overscaled_z: u8, z: u8 },

    /// Scaling target deeper than the id's overscaled zoom
    #[error("target_z > overscaled_z; target_z = {target_z}; overscaled_z = {overscaled_z}")]
    InvalidArgument { target_z: u8, overscaled_z: u8 },
}

/// Errors reported by a data source when a tile load fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The source has no data for the tile (HTTP 404 and friends).
    ///
    /// Non-fatal: the cache substitutes ancestors or descendants instead.
    #[error("Tile not found: {0}")]
    NotFound(String),

    /// Any other failure (network, decoding, server error)
    #[error("Tile load failed: {0}")]
    Other(String),
}

impl LoadError {
    /// Whether this error only signals an absent resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LoadError::NotFound(_))
    }
}
