//! The tile pyramid cache.
//!
//! [`TilePyramidCache`] keeps the tiles a viewport needs resident. Every
//! update it takes the ideal covering of the viewport, decides which tiles to
//! retain (the ideal tiles plus loaded substitutes for those still missing
//! data), and moves everything else either into the [`BoundedTileStore`] for
//! reuse or out of memory.
//!
//! # Update Cycle
//!
//! ```text
//!   ideal tiles
//!        │
//!        ▼
//!   wrap renumbering ─► store sizing ─► retain set
//!                                          │
//!                   ┌──────────────────────┤
//!                   ▼                      ▼
//!         raster: fading + covered    vector: fade hold
//!                   │                      │
//!                   └──────────┬───────────┘
//!                              ▼
//!                 remove unretained (store or unload)
//!                              │
//!                              ▼
//!                 loaded parent / sibling indexes
//! ```
//!
//! # Loads And Timers
//!
//! Loads and timers run as Tokio tasks and report back over a channel. Their
//! results are applied only by [`TilePyramidCache::process_events`],
//! [`TilePyramidCache::settle`] and at the start of every update, so a
//! completion never lands in the middle of a reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::events::{SourceEvent, EVENT_CHANNEL_CAPACITY};
use super::raster::{self, FadeParams};
use super::store::BoundedTileStore;
use super::task::{CacheMessage, TaskGuard};
use crate::config::CacheOptions;
use crate::error::LoadError;
use crate::source::{
    covering_zoom_level, Coverage, CoverageParams, FlatCoverage, LoadRequest, TileSource, Viewport,
};
use crate::tile::{
    CanonicalTileId, Clock, OverscaledTileId, Tile, TileClaim, TileData, TileKey, TileState,
    UnwrappedTileId,
};

/// Tiles kept this cycle, by key.
type Retain = HashMap<TileKey, OverscaledTileId>;

/// Lowest zoom an ideal tile pulls in as a terrain ancestor.
const TERRAIN_ANCESTOR_ZOOM: u8 = 5;

/// The inputs of the most recent update, replayed on resume and after a
/// missing tile is reported.
#[derive(Debug, Clone)]
enum Frame {
    Viewport(Viewport),
    Ideal(Vec<OverscaledTileId>, Viewport),
}

/// Retains, loads and evicts the tiles of one source for a moving viewport.
pub struct TilePyramidCache<S: TileSource> {
    source: Arc<S>,
    options: CacheOptions,
    coverage: Box<dyn Coverage>,
    clock: Clock,

    /// Active tiles, owned exclusively; consumers hold [`TileClaim`]s
    tiles: HashMap<TileKey, Tile>,
    /// Inactive tiles with data, keyed by their world-copy-0 key
    store: BoundedTileStore<Tile>,
    covered: HashSet<TileKey>,
    loaded_parents: HashMap<TileKey, Option<OverscaledTileId>>,
    loaded_siblings: HashMap<TileKey, Option<OverscaledTileId>>,

    /// In-flight loads by tile uid
    loads: HashMap<u64, TaskGuard>,
    reload_timers: HashMap<TileKey, TaskGuard>,
    fade_timers: HashMap<TileKey, TaskGuard>,
    store_timer: Option<(Instant, TaskGuard)>,
    tx: mpsc::UnboundedSender<CacheMessage>,
    rx: mpsc::UnboundedReceiver<CacheMessage>,
    events: broadcast::Sender<SourceEvent>,

    next_uid: u64,
    prev_lng: Option<f64>,
    last_frame: Option<Frame>,
    paused: bool,
    reload_on_resume: bool,
    deferred_reloads: Vec<TileKey>,
    updated: bool,
    needs_update: bool,
}

impl<S: TileSource> TilePyramidCache<S> {
    /// Create a cache over `source` that covers viewports with [`FlatCoverage`].
    pub fn new(source: S, options: CacheOptions) -> Self {
        Self::with_coverage(source, options, FlatCoverage)
    }

    /// Create a cache with a custom covering strategy.
    pub fn with_coverage<C>(source: S, options: CacheOptions, coverage: C) -> Self
    where
        C: Coverage + 'static,
    {
        let source = Arc::new(source);

        let evict_source = Arc::clone(&source);
        let store = BoundedTileStore::new(
            0,
            Box::new(move |mut tile: Tile| {
                evict_source.unload_tile(tile.id(), tile.uid());
                tile.unload();
            }),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            source,
            options,
            coverage: Box::new(coverage),
            clock: Clock::new(),
            tiles: HashMap::new(),
            store,
            covered: HashSet::new(),
            loaded_parents: HashMap::new(),
            loaded_siblings: HashMap::new(),
            loads: HashMap::new(),
            reload_timers: HashMap::new(),
            fade_timers: HashMap::new(),
            store_timer: None,
            tx,
            rx,
            events,
            next_uid: 1,
            prev_lng: None,
            last_frame: None,
            paused: false,
            reload_on_resume: false,
            deferred_reloads: Vec::new(),
            updated: false,
            needs_update: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Receive notifications about tile loads and removals.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    /// Number of active tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Number of tiles parked in the reuse store.
    pub fn store_len(&self) -> usize {
        self.store.len()
    }

    /// Current capacity of the reuse store.
    pub fn store_capacity(&self) -> usize {
        self.store.max_size()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn get_tile(&self, id: &OverscaledTileId) -> Option<&Tile> {
        self.tiles.get(&id.key())
    }

    /// Whether `id` is active but hidden under better tiles.
    pub fn is_covered(&self, id: &OverscaledTileId) -> bool {
        self.covered.contains(&id.key())
    }

    /// Active tile ids in draw order.
    pub fn ids(&self) -> Vec<OverscaledTileId> {
        let mut ids: Vec<_> = self.tiles.values().map(|t| *t.id()).collect();
        ids.sort();
        ids
    }

    /// Ids of active tiles that should be drawn, in draw order.
    ///
    /// Symbol layers also draw tiles held for their fade-out.
    pub fn renderable_ids(&self, symbol_layer: bool) -> Vec<OverscaledTileId> {
        let now = Instant::now();
        let mut ids: Vec<_> = self
            .tiles
            .iter()
            .filter(|(key, _)| self.is_renderable(**key, symbol_layer, now))
            .map(|(_, t)| *t.id())
            .collect();
        ids.sort();
        ids
    }

    /// Positions of the drawable tiles, for placing them on screen.
    pub fn visible_coordinates(&self) -> Vec<UnwrappedTileId> {
        self.renderable_ids(false)
            .iter()
            .map(OverscaledTileId::to_unwrapped)
            .collect()
    }

    fn is_renderable(&self, key: TileKey, symbol_layer: bool, now: Instant) -> bool {
        let Some(tile) = self.tiles.get(&key) else {
            return false;
        };
        tile.has_data()
            && (symbol_layer || !tile.holding_for_fade())
            && !self.covered.contains(&key)
            && (tile.fade_end_time().is_none() || tile.fade_opacity(now) > 0.0)
    }

    /// Whether every active tile has settled since the first update.
    pub fn loaded(&self) -> bool {
        self.updated && self.all_settled()
    }

    fn all_settled(&self) -> bool {
        self.tiles
            .values()
            .all(|t| matches!(t.state(), TileState::Loaded | TileState::Errored))
    }

    /// Whether a raster fade is still running on any active tile.
    pub fn has_transition(&self) -> bool {
        if !self.source.options().kind.is_raster() {
            return false;
        }
        let now = Instant::now();
        self.tiles.values().any(|t| t.is_fading(now))
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Keep an active tile resident for as long as the returned claim lives.
    ///
    /// A claimed tile stays active even when no update retains it. Once every
    /// claim is dropped the next update may evict it as usual. Returns `None`
    /// when `id` is not active.
    pub fn claim_tile(&self, id: &OverscaledTileId) -> Option<TileClaim> {
        self.tiles.get(&id.key()).map(Tile::claim)
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Reconcile the active set with the ideal covering of `viewport`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since loads and timers are
    /// spawned tasks.
    pub fn update(&mut self, viewport: &Viewport) {
        self.drain_messages();
        self.last_frame = Some(Frame::Viewport(*viewport));
        if self.paused {
            return;
        }
        self.needs_update = false;

        let params = CoverageParams::from(self.source.options());
        let ideal = self.coverage.ideal_tiles(viewport, &params);
        self.reconcile(ideal, viewport);
    }

    /// Reconcile the active set with a caller-computed ideal covering.
    ///
    /// `viewport` still drives world-wrap detection and store sizing. An ideal
    /// tile that is not active adopts an active copy of the same location in
    /// another world when that copy is neither ideal nor claimed, so callers
    /// numbering wraps differently from [`FlatCoverage`] still reuse tiles.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since loads and timers are
    /// spawned tasks.
    pub fn update_with_ideal(&mut self, ideal: &[OverscaledTileId], viewport: &Viewport) {
        self.drain_messages();
        self.last_frame = Some(Frame::Ideal(ideal.to_vec(), *viewport));
        if self.paused {
            return;
        }
        self.needs_update = false;
        self.reconcile(ideal.to_vec(), viewport);
    }

    fn replay_last_frame(&mut self) {
        match self.last_frame.clone() {
            Some(Frame::Viewport(viewport)) => self.update(&viewport),
            Some(Frame::Ideal(ideal, viewport)) => self.update_with_ideal(&ideal, &viewport),
            None => self.needs_update = false,
        }
    }

    fn reconcile(&mut self, ideal: Vec<OverscaledTileId>, viewport: &Viewport) {
        let mut ideal: Vec<_> = ideal
            .into_iter()
            .filter(|id| self.source.has_tile(id))
            .collect();

        self.handle_wrap_jump(viewport.center_lng);
        self.update_cache_size(viewport);

        if self.options.used_for_terrain {
            let extra = self.terrain_ancestors(&ideal);
            let mut seen: HashSet<TileKey> = ideal.iter().map(|id| id.key()).collect();
            ideal.extend(extra.into_iter().filter(|id| seen.insert(id.key())));
        }

        self.updated = true;

        let source = self.source.options();
        let (kind, minzoom, maxzoom) = (source.kind, source.minzoom, source.maxzoom);
        let zoom = covering_zoom_level(viewport.zoom, &CoverageParams::from(source));

        let mut retain = self.update_retained_tiles(&ideal, zoom);

        let now = Instant::now();
        let fade = self.options.raster_fade_duration;
        if kind.is_raster() && !fade.is_zero() && !self.options.used_for_terrain {
            let params = FadeParams {
                duration: fade,
                max_fading_ancestor_levels: self.options.max_fading_ancestor_levels,
                minzoom,
                maxzoom,
            };
            raster::update_fading_tiles(&mut self.tiles, &ideal, &mut retain, &params, now);
        }

        if kind.is_raster() {
            self.covered = raster::covered_tiles(&self.tiles, &ideal, &retain, now);
            let doomed: Vec<TileKey> = self
                .tiles
                .keys()
                .filter(|key| !retain.contains_key(key))
                .copied()
                .collect();
            for key in doomed {
                self.remove_tile(key);
            }
        } else {
            self.covered.clear();
            self.release_unretained_with_fade(&retain);
        }

        self.rebuild_loaded_caches();

        debug!(
            zoom,
            ideal = ideal.len(),
            retained = retain.len(),
            active = self.tiles.len(),
            stored = self.store.len(),
            "Pyramid updated"
        );
    }

    /// Renumber world copies when the center moves by whole worlds.
    ///
    /// `lng` is the center longitude as the camera reports it, normalized or
    /// not. Coverage numbers wraps from that same value, so the shift is the
    /// displacement rounded to whole worlds: a camera renormalizing 181° to
    /// -179° shifts by one, while one reporting 181° shifts by none.
    fn handle_wrap_jump(&mut self, lng: f64) {
        let Some(prev) = self.prev_lng.replace(lng) else {
            return;
        };
        let delta = wrap_delta(prev, lng);
        if delta == 0 {
            return;
        }

        let tiles = std::mem::take(&mut self.tiles);
        self.tiles = tiles
            .into_values()
            .map(|mut tile| {
                let id = tile.id().unwrap_to(tile.id().wrap().saturating_add(delta));
                tile.set_id(id);
                (id.key(), tile)
            })
            .collect();
        self.covered.clear();

        // timers were keyed by the old ids
        self.reload_timers.clear();
        self.fade_timers.clear();
        let keys: Vec<TileKey> = self.tiles.keys().copied().collect();
        for key in keys {
            self.set_reload_timer(key);
            self.arm_fade_timer(key);
        }

        debug!(delta, tiles = self.tiles.len(), "Tiles renumbered across world copies");
    }

    /// Move an active copy of `id` from another world onto `id`.
    ///
    /// Only a copy that is neither ideal nor claimed moves.
    fn adopt_world_copy(&mut self, id: OverscaledTileId, ideal_keys: &HashSet<TileKey>) {
        let key = id.key();
        if self.tiles.contains_key(&key) {
            return;
        }
        let location = id.wrapped().key();
        let Some(old_key) = self
            .tiles
            .iter()
            .find(|(k, t)| {
                t.id().wrapped().key() == location && !ideal_keys.contains(*k) && !t.is_claimed()
            })
            .map(|(k, _)| *k)
        else {
            return;
        };
        let Some(mut tile) = self.tiles.remove(&old_key) else {
            return;
        };

        let from = *tile.id();
        if tile.holding_for_fade() {
            tile.clear_fade_hold();
        }
        tile.set_id(id);
        self.tiles.insert(key, tile);

        self.reload_timers.remove(&old_key);
        self.fade_timers.remove(&old_key);
        self.covered.remove(&old_key);
        self.set_reload_timer(key);

        debug!(from = %from, to = %id, "Tile moved to another world copy");
    }

    /// Size the store from the number of tiles a viewport shows.
    fn update_cache_size(&mut self, viewport: &Viewport) {
        let tile_size = f64::from(self.source.options().tile_size.max(1));
        let across = (f64::from(viewport.width) / tile_size).ceil() as usize + 1;
        let down = (f64::from(viewport.height) / tile_size).ceil() as usize + 1;

        let view_size = across
            .saturating_mul(down)
            .saturating_mul(self.options.max_tile_cache_zoom_levels);
        let max_size = self
            .options
            .max_tile_cache_size
            .map_or(view_size, |cap| cap.min(view_size));

        if max_size != self.store.max_size() {
            trace!(max_size, "Tile store resized");
        }
        self.store.set_max_size(max_size);
        self.schedule_store_timer();
    }

    fn terrain_ancestors(&self, ideal: &[OverscaledTileId]) -> Vec<OverscaledTileId> {
        let minzoom = self.source.options().minzoom;
        let mut ancestors = Vec::new();
        for id in ideal {
            let z = id.canonical().z();
            if z > minzoom {
                ancestors.push(id.scaled_to_unchecked(z - 1));
                ancestors.push(id.scaled_to_unchecked(z.min(TERRAIN_ANCESTOR_ZOOM).max(minzoom)));
            }
        }
        ancestors
    }

    // =========================================================================
    // Retain Set
    // =========================================================================

    /// Add every ideal tile and pick loaded substitutes for those lacking data.
    fn update_retained_tiles(&mut self, ideal: &[OverscaledTileId], zoom: u8) -> Retain {
        let (minzoom, maxzoom) = {
            let source = self.source.options();
            (source.minzoom, source.maxzoom)
        };
        let min_covering_zoom = zoom
            .saturating_sub(self.options.max_overzooming)
            .max(minzoom);

        let mut retain = Retain::new();
        let mut missing = Vec::new();
        let mut missing_keys = HashSet::new();

        let ideal_keys: HashSet<TileKey> = ideal.iter().map(OverscaledTileId::key).collect();
        for id in ideal {
            self.adopt_world_copy(*id, &ideal_keys);
            self.add_tile(*id);
            retain.insert(id.key(), *id);
            let has_data = self.tiles.get(&id.key()).is_some_and(Tile::has_data);
            if !has_data && missing_keys.insert(id.key()) {
                missing.push(*id);
            }
        }

        self.retain_loaded_children(&mut missing, &mut retain);

        let mut checked = HashSet::new();
        for id in missing {
            if zoom >= maxzoom {
                // the only possible child is this tile overscaled one level
                if let Some(child) = id.children(maxzoom).first().copied() {
                    if self.tiles.get(&child.key()).is_some_and(Tile::has_data) {
                        retain.insert(child.key(), child);
                        continue;
                    }
                }
            } else if id
                .children(maxzoom)
                .iter()
                .all(|child| retain.contains_key(&child.key()))
            {
                continue;
            }

            let mut parent_was_requested = self.tiles.get(&id.key()).is_some_and(Tile::was_requested);

            for z in (min_covering_zoom..id.overscaled_z()).rev() {
                let parent = id.scaled_to_unchecked(z);
                let parent_key = parent.key();
                if !checked.insert(parent_key) {
                    break;
                }

                if !self.tiles.contains_key(&parent_key)
                    && (parent_was_requested || self.store.has(parent.wrapped().key()))
                {
                    self.add_tile(parent);
                }

                let Some(tile) = self.tiles.get(&parent_key) else {
                    continue;
                };
                let has_data = tile.has_data();
                if has_data
                    || !self.options.cancel_pending_tile_requests_while_zooming
                    || parent_was_requested
                {
                    retain.insert(parent_key, parent);
                }
                parent_was_requested = tile.was_requested();
                if has_data {
                    break;
                }
            }
        }

        retain
    }

    /// Retain loaded descendants of missing tiles.
    ///
    /// Only the shallowest generation found is kept so one location is not
    /// drawn at mixed resolutions. Tiles whose descendants fully cover them
    /// are dropped from `missing`.
    fn retain_loaded_children(&self, missing: &mut Vec<OverscaledTileId>, retain: &mut Retain) {
        let max_underzooming = self.options.max_underzooming;

        missing.retain(|target| {
            let max_z = target.overscaled_z().saturating_add(max_underzooming);
            let candidates: Vec<OverscaledTileId> = self
                .tiles
                .values()
                .filter(|t| t.has_data())
                .map(|t| *t.id())
                .filter(|id| id.is_child_of(target) && id.overscaled_z() <= max_z)
                .collect();

            let Some(shallowest) = candidates.iter().map(|id| id.overscaled_z()).min() else {
                return true;
            };
            let generation: Vec<_> = candidates
                .into_iter()
                .filter(|id| id.overscaled_z() == shallowest)
                .collect();
            for id in &generation {
                retain.insert(id.key(), *id);
            }

            !descendants_complete(target, &generation)
        });
    }

    // =========================================================================
    // Tile Lifecycle
    // =========================================================================

    /// Make `id` active, restoring it from the store or issuing a fresh load.
    fn add_tile(&mut self, id: OverscaledTileId) {
        let key = id.key();
        if self.tiles.contains_key(&key) {
            return;
        }

        let (tile, restored) = match self.store.get_and_remove(id.wrapped().key()) {
            Some(mut tile) => {
                tile.reset_fade();
                tile.set_id(id);
                self.schedule_store_timer();
                debug!(tile = %id, uid = tile.uid(), "Tile restored from store");
                (tile, true)
            }
            None => {
                let uid = self.next_uid;
                self.next_uid += 1;
                self.spawn_load(id, uid, TileState::Loading);
                self.emit(SourceEvent::TileLoading(id));
                debug!(tile = %id, uid, "Tile added");
                (Tile::new(id, uid), false)
            }
        };

        self.tiles.insert(key, tile);
        if restored {
            self.set_reload_timer(key);
        }
    }

    /// Take `key` out of the active set unless a consumer still claims it.
    fn remove_tile(&mut self, key: TileKey) {
        if let Some(tile) = self.tiles.get(&key).filter(|t| t.is_claimed()) {
            trace!(tile = %tile.id(), claims = tile.claim_count(), "Claimed tile kept active");
            return;
        }
        self.evict_tile(key);
    }

    /// Take `key` out of the active set regardless of claims.
    ///
    /// Tiles with data go to the store; the rest are aborted and unloaded.
    fn evict_tile(&mut self, key: TileKey) {
        let Some(mut tile) = self.tiles.remove(&key) else {
            return;
        };

        self.reload_timers.remove(&key);
        self.fade_timers.remove(&key);
        self.covered.remove(&key);

        let id = *tile.id();
        let uid = tile.uid();
        if self.loads.remove(&uid).is_some() {
            self.source.abort_tile(&id, uid);
            self.emit(SourceEvent::TileAborted(id));
        }

        if tile.has_data() && tile.state() != TileState::Reloading {
            let expiry = tile.expiry_timeout(self.clock.now_ms());
            self.store.add(id.wrapped().key(), tile, expiry);
            self.schedule_store_timer();
            debug!(tile = %id, uid, "Tile moved to store");
        } else {
            tile.mark_aborted();
            self.source.unload_tile(&id, uid);
            tile.unload();
            debug!(tile = %id, uid, "Tile unloaded");
        }

        self.emit(SourceEvent::TileRemoved(id));
    }

    fn spawn_load(&mut self, id: OverscaledTileId, uid: u64, previous_state: TileState) {
        let request = LoadRequest {
            id,
            uid,
            previous_state,
        };
        let source = Arc::clone(&self.source);
        let tx = self.tx.clone();

        let guard = TaskGuard::spawn(move |guard_id| async move {
            let result = source.load_tile(&request).await;
            // receiver gone means the cache was dropped
            let _ = tx.send(CacheMessage::Loaded {
                uid,
                request: guard_id,
                previous_state,
                result,
            });
        });
        // replacing a guard aborts the older request
        self.loads.insert(uid, guard);
    }

    /// Issue a new load for an active tile.
    ///
    /// Tiles still loading keep their state; others move to `state`.
    fn reload_tile(&mut self, key: TileKey, state: TileState) {
        let Some(tile) = self.tiles.get_mut(&key) else {
            return;
        };
        if tile.state() != TileState::Loading {
            tile.set_state(state);
        }
        let (id, uid) = (*tile.id(), tile.uid());
        trace!(tile = %id, ?state, "Tile reload issued");
        self.spawn_load(id, uid, state);
    }

    fn on_loaded(
        &mut self,
        uid: u64,
        request: u64,
        previous_state: TileState,
        result: Result<TileData, LoadError>,
    ) {
        if !self.loads.get(&uid).is_some_and(|g| g.id() == request) {
            trace!(uid, "Stale load result ignored");
            return;
        }
        self.loads.remove(&uid);

        let Some(key) = self
            .tiles
            .iter()
            .find(|(_, t)| t.uid() == uid)
            .map(|(key, _)| *key)
        else {
            return;
        };

        let now_ms = self.clock.now_ms();
        let fade = self.options.raster_fade_duration;
        let Some(tile) = self.tiles.get_mut(&key) else {
            return;
        };
        let id = *tile.id();

        match result {
            Ok(data) => {
                tile.apply_loaded(data, previous_state, now_ms, Instant::now());
                if tile.self_fading() {
                    tile.restart_self_fade(fade);
                }
                let aborted = tile.is_aborted();
                debug!(tile = %id, uid, state = ?tile.state(), "Tile loaded");

                self.set_reload_timer(key);
                if !aborted {
                    self.emit(SourceEvent::TileData(id));
                }
            }
            Err(err) => {
                tile.apply_errored();
                if err.is_not_found() {
                    debug!(tile = %id, "Tile not found, substituting");
                    self.needs_update = true;
                } else {
                    warn!(tile = %id, error = %err, "Tile load failed");
                    self.emit(SourceEvent::TileError {
                        id,
                        message: err.to_string(),
                    });
                }
            }
        }

        if self.all_settled() {
            self.emit(SourceEvent::Idle);
        }
    }

    fn emit(&self, event: SourceEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Arm the expiry reload for `key`, replacing any earlier one.
    fn set_reload_timer(&mut self, key: TileKey) {
        self.reload_timers.remove(&key);
        let Some(tile) = self.tiles.get(&key) else {
            return;
        };
        let Some(delay) = tile.expiry_timeout(self.clock.now_ms()) else {
            return;
        };

        trace!(tile = %tile.id(), delay_ms = delay.as_millis() as u64, "Reload timer set");
        let guard = TaskGuard::timer(delay, self.tx.clone(), move |timer| {
            CacheMessage::ReloadDue { key, timer }
        });
        self.reload_timers.insert(key, guard);
    }

    /// Arm the fade-hold release for `key` if it is holding.
    fn arm_fade_timer(&mut self, key: TileKey) {
        self.fade_timers.remove(&key);
        let Some(until) = self.tiles.get(&key).and_then(Tile::fade_hold_until) else {
            return;
        };

        let delay = until.saturating_duration_since(Instant::now());
        let guard = TaskGuard::timer(delay, self.tx.clone(), move |timer| {
            CacheMessage::FadeHoldDue { key, timer }
        });
        self.fade_timers.insert(key, guard);
    }

    /// Point the store timer at the earliest store expiry.
    fn schedule_store_timer(&mut self) {
        let Some(next) = self.store.next_expiry() else {
            self.store_timer = None;
            return;
        };
        if self.store_timer.as_ref().is_some_and(|(at, _)| *at == next) {
            return;
        }

        let delay = next.saturating_duration_since(Instant::now());
        let guard = TaskGuard::timer(delay, self.tx.clone(), |timer| {
            CacheMessage::StoreExpiryDue { timer }
        });
        self.store_timer = Some((next, guard));
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Remove unretained tiles, holding those with symbols for their fade-out.
    fn release_unretained_with_fade(&mut self, retain: &Retain) {
        let now = Instant::now();
        let hold = self.options.fade_duration;
        let keys: Vec<TileKey> = self.tiles.keys().copied().collect();

        for key in keys {
            let Some(tile) = self.tiles.get_mut(&key) else {
                continue;
            };

            if retain.contains_key(&key) {
                if tile.holding_for_fade() {
                    tile.clear_fade_hold();
                    self.fade_timers.remove(&key);
                }
                continue;
            }

            if !tile.has_symbols() {
                self.remove_tile(key);
            } else if !tile.holding_for_fade() {
                tile.set_hold_duration(hold, now);
                self.arm_fade_timer(key);
            } else if tile.symbol_fade_finished(now) {
                self.remove_tile(key);
            }
        }
    }

    /// Remove every tile held for a symbol fade right away.
    pub fn release_symbol_fade_tiles(&mut self) {
        let holding: Vec<TileKey> = self
            .tiles
            .iter()
            .filter(|(_, t)| t.holding_for_fade())
            .map(|(key, _)| *key)
            .collect();
        for key in holding {
            self.remove_tile(key);
        }
    }

    /// Remove every active tile and empty the store. Leaves paused mode.
    ///
    /// Claimed tiles are removed too; outstanding [`TileClaim`]s no longer
    /// refer to anything the cache holds.
    pub fn clear_tiles(&mut self) {
        self.paused = false;
        self.reload_on_resume = false;
        self.deferred_reloads.clear();

        let keys: Vec<TileKey> = self.tiles.keys().copied().collect();
        for key in keys {
            self.evict_tile(key);
        }
        self.store.reset();
        self.store_timer = None;
        self.covered.clear();
        self.rebuild_loaded_caches();
    }

    // =========================================================================
    // Derived Indexes
    // =========================================================================

    /// Active tile with data, or a stored tile for the same location.
    fn loaded_tile(&self, id: &OverscaledTileId) -> Option<&Tile> {
        self.tiles
            .get(&id.key())
            .filter(|t| t.has_data())
            .or_else(|| self.store.get(id.wrapped().key()).filter(|t| t.has_data()))
    }

    fn rebuild_loaded_caches(&mut self) {
        self.loaded_parents.clear();
        self.loaded_siblings.clear();

        let ids: Vec<OverscaledTileId> = self.tiles.values().map(|t| *t.id()).collect();
        for id in &ids {
            let mut path = Vec::new();
            let mut found = None;
            let mut current = *id;

            while current.overscaled_z() > 0 {
                if let Some(cached) = self.loaded_parents.get(&current.key()) {
                    found = *cached;
                    break;
                }
                path.push(current.key());
                let parent = current.scaled_to_unchecked(current.overscaled_z() - 1);
                if self.loaded_tile(&parent).is_some() {
                    found = Some(parent);
                    break;
                }
                current = parent;
            }

            for key in path {
                self.loaded_parents.insert(key, found);
            }
        }

        for id in ids {
            let sibling = self.loaded_tile(&id).map(|_| id);
            self.loaded_siblings.insert(id.key(), sibling);
        }
    }

    /// Nearest ancestor of `id` with data, no shallower than `min_zoom`.
    pub fn find_loaded_parent(&self, id: &OverscaledTileId, min_zoom: u8) -> Option<&Tile> {
        if let Some(cached) = self.loaded_parents.get(&id.key()) {
            return cached
                .filter(|parent| parent.overscaled_z() >= min_zoom)
                .and_then(|parent| self.loaded_tile(&parent));
        }

        (min_zoom..id.overscaled_z())
            .rev()
            .find_map(|z| self.loaded_tile(&id.scaled_to_unchecked(z)))
    }

    /// A tile with data for the same location as `id`.
    pub fn find_loaded_sibling(&self, id: &OverscaledTileId) -> Option<&Tile> {
        match self.loaded_siblings.get(&id.key()) {
            Some(cached) => cached.and_then(|sibling| self.loaded_tile(&sibling)),
            None => self.loaded_tile(id),
        }
    }

    /// Whether the immediate parent of `id` is active and drawable.
    ///
    /// Parents below the source's minimum zoom never count, and neither do
    /// deeper ancestors.
    pub fn has_renderable_parent(&self, id: &OverscaledTileId) -> bool {
        let z = id.overscaled_z();
        if z == 0 || z - 1 < self.source.options().minzoom {
            return false;
        }
        let parent = id.scaled_to_unchecked(z - 1);
        self.is_renderable(parent.key(), false, Instant::now())
    }

    // =========================================================================
    // Reloading
    // =========================================================================

    /// Reload every active tile and drop the store.
    ///
    /// With `source_data_changed` every tile is marked expired; otherwise
    /// errored tiles are left alone. Deferred while paused.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since loads and timers are
    /// spawned tasks.
    pub fn reload(&mut self, source_data_changed: bool) {
        if self.paused {
            self.reload_on_resume = true;
            return;
        }
        self.store.reset();
        self.schedule_store_timer();

        let keys: Vec<TileKey> = self.tiles.keys().copied().collect();
        for key in keys {
            if source_data_changed {
                self.reload_tile(key, TileState::Expired);
            } else if self
                .tiles
                .get(&key)
                .is_some_and(|t| t.state() != TileState::Errored)
            {
                self.reload_tile(key, TileState::Reloading);
            }
        }
    }

    /// Reload drawable or errored tiles for the given locations.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since loads and timers are
    /// spawned tasks.
    pub fn refresh_tiles(&mut self, ids: &[CanonicalTileId]) {
        let wanted: HashSet<TileKey> = ids.iter().map(CanonicalTileId::key).collect();
        let now = Instant::now();

        let keys: Vec<TileKey> = self
            .tiles
            .iter()
            .filter(|(key, tile)| {
                wanted.contains(&tile.id().canonical().key())
                    && (self.is_renderable(**key, true, now) || tile.state() == TileState::Errored)
            })
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            self.reload_tile(key, TileState::Expired);
        }
    }

    /// Register dependency keys on an active tile.
    pub fn set_dependencies<I, D>(&mut self, id: &OverscaledTileId, namespace: &str, keys: I) -> bool
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        match self.tiles.get_mut(&id.key()) {
            Some(tile) => {
                tile.set_dependencies(namespace, keys);
                true
            }
            None => false,
        }
    }

    /// Reload active tiles depending on any of `keys` and drop stored ones.
    pub fn reload_tiles_for_dependencies(&mut self, namespaces: &[&str], keys: &[&str]) {
        let dependent: Vec<TileKey> = self
            .tiles
            .iter()
            .filter(|(_, t)| t.has_dependency(namespaces, keys))
            .map(|(key, _)| *key)
            .collect();
        for key in dependent {
            self.reload_tile(key, TileState::Reloading);
        }

        self.store.filter(|t| !t.has_dependency(namespaces, keys));
        self.schedule_store_timer();
    }

    // =========================================================================
    // Pause
    // =========================================================================

    /// Stop reconciling. Updates only record their inputs until resumed.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Leave paused mode, replaying deferred work and the last update.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since loads and timers are
    /// spawned tasks.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;

        if std::mem::take(&mut self.reload_on_resume) {
            self.reload(false);
        }
        for key in std::mem::take(&mut self.deferred_reloads) {
            self.reload_tile(key, TileState::Expired);
        }
        self.store.prune_expired(Instant::now());
        self.store_timer = None;
        self.schedule_store_timer();

        self.replay_last_frame();
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Apply finished loads and fired timers without waiting.
    ///
    /// A load that reported a missing tile re-runs the last update so that
    /// substitutes are picked. Returns the number of messages applied.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since loads and timers are
    /// spawned tasks.
    pub fn process_events(&mut self) -> usize {
        let applied = self.drain_messages();
        if self.needs_update && !self.paused {
            self.replay_last_frame();
        }
        applied
    }

    /// Apply messages until no load is in flight.
    ///
    /// Timers that fire meanwhile are applied too. Never returns while a
    /// source load hangs.
    pub async fn settle(&mut self) {
        loop {
            self.process_events();
            if self.loads.is_empty() {
                break;
            }
            match self.rx.recv().await {
                Some(message) => self.handle_message(message),
                None => break,
            }
        }
    }

    fn drain_messages(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
            applied += 1;
        }
        applied
    }

    fn handle_message(&mut self, message: CacheMessage) {
        match message {
            CacheMessage::Loaded {
                uid,
                request,
                previous_state,
                result,
            } => self.on_loaded(uid, request, previous_state, result),

            CacheMessage::ReloadDue { key, timer } => {
                if !self.reload_timers.get(&key).is_some_and(|g| g.id() == timer) {
                    return;
                }
                self.reload_timers.remove(&key);
                if self.paused {
                    self.deferred_reloads.push(key);
                } else {
                    self.reload_tile(key, TileState::Expired);
                }
            }

            CacheMessage::FadeHoldDue { key, timer } => {
                if !self.fade_timers.get(&key).is_some_and(|g| g.id() == timer) {
                    return;
                }
                self.fade_timers.remove(&key);
                if self.paused {
                    return;
                }
                let now = Instant::now();
                if self
                    .tiles
                    .get(&key)
                    .is_some_and(|t| t.holding_for_fade() && t.symbol_fade_finished(now))
                {
                    self.remove_tile(key);
                }
            }

            CacheMessage::StoreExpiryDue { timer } => {
                if !self.store_timer.as_ref().is_some_and(|(_, g)| g.id() == timer) {
                    return;
                }
                self.store_timer = None;
                // resume prunes and reschedules
                if self.paused {
                    return;
                }
                self.store.prune_expired(Instant::now());
                self.schedule_store_timer();
            }
        }
    }
}

impl<S: TileSource> std::fmt::Debug for TilePyramidCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TilePyramidCache")
            .field("options", &self.options)
            .field("tiles", &self.tiles.len())
            .field("store", &self.store)
            .field("loads", &self.loads.len())
            .field("paused", &self.paused)
            .finish()
    }
}

/// Whole worlds between two reported center longitudes.
fn wrap_delta(prev: f64, lng: f64) -> i32 {
    ((lng - prev) / 360.0).round() as i32
}

/// Whether `generation` covers all of `target`.
fn descendants_complete(target: &OverscaledTileId, generation: &[OverscaledTileId]) -> bool {
    if let [only] = generation {
        if only.is_overscaled() {
            return true;
        }
    }
    let Some(first) = generation.first() else {
        return false;
    };
    let dz = u32::from(first.canonical().z().saturating_sub(target.canonical().z()));
    4u64.checked_pow(dz) == Some(generation.len() as u64)
}
