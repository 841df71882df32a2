//! Ideal tile coverage for a viewport.
//!
//! Projection and camera math live outside the cache; it only needs the set
//! of tiles that would show the viewport at full resolution. [`FlatCoverage`]
//! computes that set for a north-up, untilted web-mercator view, which is
//! what the simulator and the tests drive the cache with. Renderers with
//! pitch, globe or terrain plug in their own [`Coverage`].

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use super::SourceOptions;
use crate::tile::OverscaledTileId;

/// Pixel size of zoom level 0 in the reference tile grid.
pub const WORLD_TILE_SIZE: f64 = 512.0;

/// Camera state needed to cover a viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Longitude of the viewport center, unbounded (crossing ±180 moves into
    /// another world copy)
    pub center_lng: f64,
    pub center_lat: f64,
    pub zoom: f64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Viewport {
    pub fn new(center_lng: f64, center_lat: f64, zoom: f64, width: u32, height: u32) -> Self {
        Self {
            center_lng,
            center_lat,
            zoom,
            width,
            height,
        }
    }
}

/// Source properties that shape the covering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageParams {
    pub tile_size: u32,
    pub minzoom: u8,
    pub maxzoom: u8,
    pub round_zoom: bool,
    pub reparse_overscaled: bool,
}

impl From<&SourceOptions> for CoverageParams {
    fn from(options: &SourceOptions) -> Self {
        Self {
            tile_size: options.tile_size,
            minzoom: options.minzoom,
            maxzoom: options.maxzoom,
            round_zoom: options.round_zoom,
            reparse_overscaled: options.reparse_overscaled,
        }
    }
}

/// Tile zoom level that covers a viewport at `zoom`.
///
/// Sources with smaller tiles need a deeper level for the same pixel density.
pub fn covering_zoom_level(zoom: f64, params: &CoverageParams) -> u8 {
    let tile_size = f64::from(params.tile_size.max(1));
    let z = zoom + (WORLD_TILE_SIZE / tile_size).log2();
    let z = if params.round_zoom { z.round() } else { z.floor() };
    z.clamp(0.0, f64::from(u8::MAX)) as u8
}

/// Produces the ideal tile set for a viewport.
pub trait Coverage: Send + Sync {
    fn ideal_tiles(&self, viewport: &Viewport, params: &CoverageParams) -> Vec<OverscaledTileId>;
}

impl<F> Coverage for F
where
    F: Fn(&Viewport, &CoverageParams) -> Vec<OverscaledTileId> + Send + Sync,
{
    fn ideal_tiles(&self, viewport: &Viewport, params: &CoverageParams) -> Vec<OverscaledTileId> {
        self(viewport, params)
    }
}

/// Covering for an untilted web-mercator viewport.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatCoverage;

impl Coverage for FlatCoverage {
    fn ideal_tiles(&self, viewport: &Viewport, params: &CoverageParams) -> Vec<OverscaledTileId> {
        let z = covering_zoom_level(viewport.zoom, params);
        if z < params.minzoom {
            return Vec::new();
        }
        let z_tile = z.min(params.maxzoom);
        let overscaled_z = if params.reparse_overscaled { z } else { z_tile };

        let world = WORLD_TILE_SIZE * 2f64.powf(viewport.zoom);
        let (cx, cy) = project(viewport.center_lng, viewport.center_lat);
        let (cx, cy) = (cx * world, cy * world);

        let tiles = 1i64 << z_tile;
        let span = world / tiles as f64;
        let half_w = f64::from(viewport.width) / 2.0;
        let half_h = f64::from(viewport.height) / 2.0;

        let x0 = ((cx - half_w) / span).floor() as i64;
        let x1 = ((cx + half_w) / span).ceil() as i64 - 1;
        let y0 = ((cy - half_h) / span).floor().max(0.0) as i64;
        let y1 = (((cy + half_h) / span).ceil() as i64 - 1).min(tiles - 1);

        let mut ids = Vec::new();
        for x in x0..=x1.max(x0) {
            let wrap = x.div_euclid(tiles) as i32;
            let tx = x.rem_euclid(tiles) as u32;
            for y in y0..=y1 {
                if let Ok(id) = OverscaledTileId::new(overscaled_z, wrap, z_tile, tx, y as u32) {
                    let dx = (x as f64 + 0.5) * span - cx;
                    let dy = (y as f64 + 0.5) * span - cy;
                    ids.push((dx * dx + dy * dy, id));
                }
            }
        }

        // load from the center outwards
        ids.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

/// Web-mercator position in world units (`[0, 1]` for world copy 0).
fn project(lng: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-85.051_128_779_806_6, 85.051_128_779_806_6);
    let x = (lng + 180.0) / 360.0;
    let y = (180.0 - (180.0 / PI) * (PI / 4.0 + lat * PI / 360.0).tan().ln()) / 360.0;
    (x, y)
}
