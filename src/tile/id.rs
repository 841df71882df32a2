//! Tile identifiers and quadtree containment math.
//!
//! Three layers of identity are used throughout the cache:
//!
//! - [`CanonicalTileId`]: pure `z/x/y` address of a tile's data
//! - [`UnwrappedTileId`]: canonical id plus the world copy (`wrap`) it is drawn in
//! - [`OverscaledTileId`]: unwrapped id plus the zoom it is rendered at, which may
//!   be deeper than the data zoom when the source has no finer data
//!
//! Every identifier maps to a [`TileKey`], a packed integer that is equal for two
//! ids exactly when all of `(wrap, overscaled_z, z, x, y)` are equal.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::error::TileIdError;

/// Shallowest zoom level a canonical tile may have.
pub const MIN_TILE_ZOOM: u8 = 0;

/// Deepest zoom level a canonical tile may have.
pub const MAX_TILE_ZOOM: u8 = 25;

// =============================================================================
// Tile Key
// =============================================================================

/// Packed identity of a tile, used as the key of every tile map.
///
/// Layout (most significant first): zig-zag encoded wrap (32 bits),
/// overscaled zoom (8), canonical zoom (8), y (32), x (32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TileKey(u128);

impl TileKey {
    /// Pack a tile address into a key.
    pub fn new(wrap: i32, overscaled_z: u8, z: u8, x: u32, y: u32) -> Self {
        // Negative world copies take the odd slots so the encoding stays dense.
        let wrap = i64::from(wrap) * 2;
        let wrap = if wrap < 0 { -wrap - 1 } else { wrap } as u128;

        Self(
            (wrap << 80)
                | (u128::from(overscaled_z) << 72)
                | (u128::from(z) << 64)
                | (u128::from(y) << 32)
                | u128::from(x),
        )
    }

    /// The raw packed value.
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

// =============================================================================
// Canonical Tile ID
// =============================================================================

/// A tile address without world-wrap or overscale information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CanonicalTileId {
    z: u8,
    x: u32,
    y: u32,
}

impl CanonicalTileId {
    /// Create a canonical id, validating `0 <= x, y < 2^z` and the zoom range.
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self, TileIdError> {
        if !is_in_bounds(z, x, y) {
            return Err(TileIdError::OutOfBounds { z, x, y });
        }
        Ok(Self { z, x, y })
    }

    /// Zoom level.
    pub fn z(&self) -> u8 {
        self.z
    }

    /// Column.
    pub fn x(&self) -> u32 {
        self.x
    }

    /// Row.
    pub fn y(&self) -> u32 {
        self.y
    }

    /// Key of this tile in world copy 0 at its own zoom.
    pub fn key(&self) -> TileKey {
        TileKey::new(0, self.z, self.z, self.x, self.y)
    }

    /// Whether `self` lies strictly inside `parent` in the quadtree.
    pub fn is_child_of(&self, parent: &CanonicalTileId) -> bool {
        if self.z <= parent.z {
            return false;
        }
        let dz = u32::from(self.z - parent.z);
        parent.x == self.x >> dz && parent.y == self.y >> dz
    }

    fn ancestor(&self, z: u8) -> Self {
        let dz = u32::from(self.z - z);
        Self {
            z,
            x: self.x >> dz,
            y: self.y >> dz,
        }
    }
}

impl fmt::Display for CanonicalTileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

fn is_in_bounds(z: u8, x: u32, y: u32) -> bool {
    if !(MIN_TILE_ZOOM..=MAX_TILE_ZOOM).contains(&z) {
        return false;
    }
    let dim = 1u64 << z;
    u64::from(x) < dim && u64::from(y) < dim
}

// =============================================================================
// Unwrapped Tile ID
// =============================================================================

/// A canonical tile placed in a specific horizontal copy of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct UnwrappedTileId {
    pub wrap: i32,
    pub canonical: CanonicalTileId,
}

impl UnwrappedTileId {
    pub fn new(wrap: i32, canonical: CanonicalTileId) -> Self {
        Self { wrap, canonical }
    }

    pub fn key(&self) -> TileKey {
        let c = &self.canonical;
        TileKey::new(self.wrap, c.z, c.z, c.x, c.y)
    }
}

// =============================================================================
// Overscaled Tile ID
// =============================================================================

/// A tile rendered at `overscaled_z` using the data addressed by `canonical`.
///
/// When `overscaled_z > canonical.z` the tile is overscaled: coarse data is
/// stretched over a deeper zoom because the source has nothing finer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OverscaledTileId {
    overscaled_z: u8,
    wrap: i32,
    canonical: CanonicalTileId,
}

impl OverscaledTileId {
    /// Create an id, failing when the coordinate is out of bounds or when
    /// `overscaled_z < z`.
    pub fn new(overscaled_z: u8, wrap: i32, z: u8, x: u32, y: u32) -> Result<Self, TileIdError> {
        if overscaled_z < z {
            return Err(TileIdError::OverscaleBelowCanonical { overscaled_z, z });
        }
        Ok(Self {
            overscaled_z,
            wrap,
            canonical: CanonicalTileId::new(z, x, y)?,
        })
    }

    /// Create an id that renders `canonical` at its own zoom.
    pub fn from_canonical(wrap: i32, canonical: CanonicalTileId) -> Self {
        Self {
            overscaled_z: canonical.z,
            wrap,
            canonical,
        }
    }

    /// Assemble an id whose invariants are already guaranteed by the caller.
    fn from_parts(overscaled_z: u8, wrap: i32, canonical: CanonicalTileId) -> Self {
        debug_assert!(overscaled_z >= canonical.z);
        Self {
            overscaled_z,
            wrap,
            canonical,
        }
    }

    pub fn overscaled_z(&self) -> u8 {
        self.overscaled_z
    }

    pub fn wrap(&self) -> i32 {
        self.wrap
    }

    pub fn canonical(&self) -> &CanonicalTileId {
        &self.canonical
    }

    pub fn key(&self) -> TileKey {
        let c = &self.canonical;
        TileKey::new(self.wrap, self.overscaled_z, c.z, c.x, c.y)
    }

    /// The representation of this tile at `target_z`.
    ///
    /// Above the canonical zoom the data address is unchanged (still
    /// overscaled); at or below it the canonical coordinates are shifted to the
    /// ancestor at `target_z`.
    pub fn scaled_to(&self, target_z: u8) -> Result<Self, TileIdError> {
        if target_z > self.overscaled_z {
            return Err(TileIdError::InvalidArgument {
                target_z,
                overscaled_z: self.overscaled_z,
            });
        }
        Ok(self.scaled_to_unchecked(target_z))
    }

    /// `scaled_to` for callers that already know `target_z <= overscaled_z`.
    pub(crate) fn scaled_to_unchecked(&self, target_z: u8) -> Self {
        debug_assert!(target_z <= self.overscaled_z);
        if target_z > self.canonical.z {
            Self::from_parts(target_z, self.wrap, self.canonical)
        } else {
            Self::from_parts(target_z, self.wrap, self.canonical.ancestor(target_z))
        }
    }

    /// Same as `scaled_to(target_z).key()` (or `.wrapped().key()` when
    /// `with_wrap` is false) without building the intermediate id.
    pub fn calculate_scaled_key(&self, target_z: u8, with_wrap: bool) -> Result<TileKey, TileIdError> {
        let scaled = self.scaled_to(target_z)?;
        let wrap = if with_wrap { self.wrap } else { 0 };
        let c = &scaled.canonical;
        Ok(TileKey::new(wrap, target_z, c.z, c.x, c.y))
    }

    pub fn is_overscaled(&self) -> bool {
        self.overscaled_z > self.canonical.z
    }

    /// Whether `self` is a strict descendant of `parent` in the same world copy.
    pub fn is_child_of(&self, parent: &OverscaledTileId) -> bool {
        if parent.wrap != self.wrap {
            return false;
        }
        if self.overscaled_z <= parent.overscaled_z {
            return false;
        }
        // The root contains everything; the shift below degenerates there.
        if parent.overscaled_z == 0 {
            return true;
        }
        if self.canonical.z < parent.canonical.z {
            return false;
        }
        let dz = u32::from(self.canonical.z - parent.canonical.z);
        parent.canonical.x == self.canonical.x >> dz && parent.canonical.y == self.canonical.y >> dz
    }

    /// Direct children one zoom deeper.
    ///
    /// At or beyond `source_max_zoom` the source has no finer data, so the
    /// single child is this tile overscaled one more level.
    pub fn children(&self, source_max_zoom: u8) -> Vec<OverscaledTileId> {
        if self.overscaled_z >= source_max_zoom || self.canonical.z >= MAX_TILE_ZOOM {
            return vec![Self::from_parts(
                self.overscaled_z.saturating_add(1),
                self.wrap,
                self.canonical,
            )];
        }

        let z = self.canonical.z + 1;
        let x = self.canonical.x * 2;
        let y = self.canonical.y * 2;
        [(x, y), (x + 1, y), (x, y + 1), (x + 1, y + 1)]
            .into_iter()
            .map(|(x, y)| Self::from_parts(z, self.wrap, CanonicalTileId { z, x, y }))
            .collect()
    }

    /// Stable draw order: `(wrap, overscaled_z, x, y)`.
    pub fn is_less_than(&self, rhs: &OverscaledTileId) -> bool {
        self.cmp(rhs) == Ordering::Less
    }

    /// This tile in world copy 0.
    pub fn wrapped(&self) -> Self {
        self.unwrap_to(0)
    }

    /// This tile moved to world copy `wrap`.
    pub fn unwrap_to(&self, wrap: i32) -> Self {
        Self::from_parts(self.overscaled_z, wrap, self.canonical)
    }

    /// `2^(overscaled_z - z)`, saturating at `u32::MAX`.
    pub fn overscale_factor(&self) -> u32 {
        let dz = u32::from(self.overscaled_z - self.canonical.z);
        1u32.checked_shl(dz).unwrap_or(u32::MAX)
    }

    pub fn to_unwrapped(&self) -> UnwrappedTileId {
        UnwrappedTileId::new(self.wrap, self.canonical)
    }
}

impl Ord for OverscaledTileId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wrap
            .cmp(&other.wrap)
            .then(self.overscaled_z.cmp(&other.overscaled_z))
            .then(self.canonical.x.cmp(&other.canonical.x))
            .then(self.canonical.y.cmp(&other.canonical.y))
            // keeps Ord consistent with Eq for ids that differ only in data zoom
            .then(self.canonical.z.cmp(&other.canonical.z))
    }
}

impl PartialOrd for OverscaledTileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OverscaledTileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.overscaled_z, self.canonical.x, self.canonical.y
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
