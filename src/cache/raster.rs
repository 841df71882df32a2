//! Raster cross-fade designation and covered-tile detection.
//!
//! Raster tiles cannot blend one tile against many, so fades are many-to-one:
//! a set of deeper "base" tiles fades against a single shallower "parent".
//!
//! ```text
//!   zooming in                          zooming out
//!
//!   ancestor   ■  Parent, departing     ideal     ■  Parent, incoming
//!          ┌──┬┴─┬──┐                           ┌──┬┴─┬──┐
//!   ideal  ■  ■  ■  ■  Base, incoming   children ■  ■  ■  ■  Base, departing
//! ```
//!
//! Loading ideal tiles on the edge of the ideal set, with nothing to fade
//! against, fade in on their own once their data arrives.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::tile::{FadingDirection, FadingRole, OverscaledTileId, Tile, TileKey};

/// Parameters of one fading pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FadeParams {
    pub duration: Duration,
    pub max_fading_ancestor_levels: u8,
    pub minzoom: u8,
    pub maxzoom: u8,
}

type Retain = HashMap<TileKey, OverscaledTileId>;

fn loaded<'a>(tiles: &'a HashMap<TileKey, Tile>, id: &OverscaledTileId) -> Option<&'a Tile> {
    tiles.get(&id.key()).filter(|t| t.has_data())
}

/// Assign fade roles to ideal tiles and retain their fade partners.
pub(crate) fn update_fading_tiles(
    tiles: &mut HashMap<TileKey, Tile>,
    ideal: &[OverscaledTileId],
    retain: &mut Retain,
    params: &FadeParams,
    now: Instant,
) {
    let edges = edge_tiles(ideal);

    for ideal_id in ideal {
        let key = ideal_id.key();
        match tiles.get_mut(&key) {
            // a tile that was fading out is wanted again
            Some(tile) if tile.fading_direction() == Some(FadingDirection::Departing) => {
                tile.reset_fade()
            }
            Some(_) => {}
            None => continue,
        }

        if fade_with_ancestor(tiles, ideal_id, retain, params, now)
            || fade_with_descendants(tiles, ideal_id, retain, params, now)
            || fade_edge(tiles, ideal_id, &edges, params, now)
        {
            continue;
        }

        if let Some(tile) = tiles.get_mut(&key) {
            tile.reset_fade();
        }
    }
}

/// The ideal tile fades in over its nearest loaded ancestor.
fn fade_with_ancestor(
    tiles: &mut HashMap<TileKey, Tile>,
    ideal_id: &OverscaledTileId,
    retain: &mut Retain,
    params: &FadeParams,
    now: Instant,
) -> bool {
    let key = ideal_id.key();
    let Some(ideal) = loaded(tiles, ideal_id) else {
        return false;
    };

    if ideal.fading_role() == Some(FadingRole::Base)
        && ideal.fading_direction() == Some(FadingDirection::Incoming)
    {
        if let Some(parent) = ideal.fading_parent_id().copied() {
            // the parent is only needed until the fade completes
            if ideal.is_fading(now) {
                retain.insert(parent.key(), parent);
            }
            return true;
        }
    }

    let min_z = ideal_id
        .overscaled_z()
        .saturating_sub(params.max_fading_ancestor_levels)
        .max(params.minzoom);

    for z in (min_z..ideal_id.overscaled_z()).rev() {
        let ancestor_id = ideal_id.scaled_to_unchecked(z);
        let ancestor_key = ancestor_id.key();
        let Some(ancestor) = loaded(tiles, &ancestor_id) else {
            continue;
        };
        let parent_id = *ancestor.id();
        let end = now + params.duration;

        if let Some(ideal) = tiles.get_mut(&key) {
            ideal.set_cross_fade(
                FadingRole::Base,
                FadingDirection::Incoming,
                Some(parent_id),
                now,
                end,
            );
        }
        if let Some(ancestor) = tiles.get_mut(&ancestor_key) {
            ancestor.set_cross_fade(FadingRole::Parent, FadingDirection::Departing, None, now, end);
        }
        retain.insert(ancestor_key, ancestor_id);
        return true;
    }

    false
}

/// Loaded children, or failing that grandchildren, fade out under the ideal tile.
fn fade_with_descendants(
    tiles: &mut HashMap<TileKey, Tile>,
    ideal_id: &OverscaledTileId,
    retain: &mut Retain,
    params: &FadeParams,
    now: Instant,
) -> bool {
    if loaded(tiles, ideal_id).is_none() {
        return false;
    }

    let children = ideal_id.children(params.maxzoom);
    if fade_children(tiles, ideal_id, &children, retain, params, now) {
        return true;
    }

    let mut found = false;
    for child in &children {
        let grandchildren = child.children(params.maxzoom);
        if fade_children(tiles, ideal_id, &grandchildren, retain, params, now) {
            found = true;
        }
    }
    found
}

fn fade_children(
    tiles: &mut HashMap<TileKey, Tile>,
    ideal_id: &OverscaledTileId,
    child_ids: &[OverscaledTileId],
    retain: &mut Retain,
    params: &FadeParams,
    now: Instant,
) -> bool {
    if child_ids
        .first()
        .map_or(true, |c| c.overscaled_z() >= params.maxzoom)
    {
        return false;
    }

    let end = now + params.duration;
    let mut found = false;

    for child_id in child_ids {
        let child_key = child_id.key();
        let Some(child) = tiles.get_mut(&child_key).filter(|t| t.has_data()) else {
            continue;
        };

        let already_departing = child.fading_role() == Some(FadingRole::Base)
            && child.fading_direction() == Some(FadingDirection::Departing)
            && child.fading_parent_id().is_some();
        if already_departing && !child.is_fading(now) {
            continue;
        }
        if !already_departing {
            child.set_cross_fade(
                FadingRole::Base,
                FadingDirection::Departing,
                Some(*ideal_id),
                now,
                end,
            );
            if let Some(ideal) = tiles.get_mut(&ideal_id.key()) {
                ideal.set_cross_fade(FadingRole::Parent, FadingDirection::Incoming, None, now, end);
            }
        }

        retain.insert(child_key, *child_id);
        found = true;
    }

    found
}

/// Edge tiles still loading fade in on their own.
fn fade_edge(
    tiles: &mut HashMap<TileKey, Tile>,
    ideal_id: &OverscaledTileId,
    edges: &HashSet<TileKey>,
    params: &FadeParams,
    now: Instant,
) -> bool {
    let key = ideal_id.key();
    let Some(tile) = tiles.get_mut(&key) else {
        return false;
    };

    if tile.self_fading() {
        return true;
    }
    if tile.has_data() {
        return false;
    }
    if edges.contains(&key) {
        tile.set_self_fade(now, now + params.duration);
        return true;
    }
    false
}

/// Ideal tiles with at least one side not bordered by another ideal tile.
pub(crate) fn edge_tiles(ideal: &[OverscaledTileId]) -> HashSet<TileKey> {
    let keys: HashSet<TileKey> = ideal.iter().map(|id| id.key()).collect();

    ideal
        .iter()
        .filter(|id| {
            neighbours(id)
                .iter()
                .any(|n| !keys.contains(&n.key()))
        })
        .map(|id| id.key())
        .collect()
}

/// Existing same-zoom neighbours, stepping into the adjacent world copy at
/// the antimeridian.
fn neighbours(id: &OverscaledTileId) -> Vec<OverscaledTileId> {
    let c = id.canonical();
    let dim = 1i64 << c.z();
    let (x, y) = (i64::from(c.x()), i64::from(c.y()));

    [(-1, 0), (1, 0), (0, -1), (0, 1)]
        .into_iter()
        .filter_map(|(dx, dy)| {
            let ny = y + dy;
            if ny < 0 || ny >= dim {
                return None;
            }
            let nx = x + dx;
            let wrap = id.wrap() + nx.div_euclid(dim) as i32;
            OverscaledTileId::new(
                id.overscaled_z(),
                wrap,
                c.z(),
                nx.rem_euclid(dim) as u32,
                ny as u32,
            )
            .ok()
        })
        .collect()
}

/// Retained tiles that a settled ideal tile hides completely.
///
/// A substitute below an ideal tile is covered once that ideal tile has its
/// data and finished fading in; a substitute above ideal tiles is covered once
/// every ideal tile beneath it has.
pub(crate) fn covered_tiles(
    tiles: &HashMap<TileKey, Tile>,
    ideal: &[OverscaledTileId],
    retain: &Retain,
    now: Instant,
) -> HashSet<TileKey> {
    let ideal_keys: HashSet<TileKey> = ideal.iter().map(|id| id.key()).collect();
    let settled = |id: &OverscaledTileId| {
        tiles
            .get(&id.key())
            .is_some_and(|t| t.has_data() && t.fade_opacity(now) >= 1.0)
    };

    let mut covered = HashSet::new();
    for (key, id) in retain {
        if ideal_keys.contains(key) || !tiles.contains_key(key) {
            continue;
        }

        if let Some(over) = ideal.iter().find(|i| id.is_child_of(i)) {
            if settled(over) {
                covered.insert(*key);
            }
            continue;
        }

        let mut beneath = ideal.iter().filter(|i| i.is_child_of(id)).peekable();
        if beneath.peek().is_some() && beneath.all(settled) {
            covered.insert(*key);
        }
    }
    covered
}
