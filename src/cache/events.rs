use serde::Serialize;

use crate::tile::OverscaledTileId;

/// Default capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications published by a [`TilePyramidCache`](super::TilePyramidCache).
///
/// Lagging subscribers lose the oldest events; the cache never blocks on them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEvent {
    /// A new tile was created and its first load issued.
    TileLoading(OverscaledTileId),
    /// A tile received data.
    TileData(OverscaledTileId),
    /// A tile left the active set.
    TileRemoved(OverscaledTileId),
    /// A tile was removed before its load completed.
    TileAborted(OverscaledTileId),
    /// A load failed for a reason other than a missing tile.
    TileError { id: OverscaledTileId, message: String },
    /// Every active tile has settled after a load completion.
    Idle,
}
