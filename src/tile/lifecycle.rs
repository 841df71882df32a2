//! Per-tile lifecycle: load state, expiry bookkeeping and fade windows.
//!
//! A [`Tile`] knows nothing about where it lives. The pyramid cache owns it
//! while it is active, the bounded store owns it after eviction, and the
//! transitions below are driven by whichever owner holds it.
//!
//! ```text
//!   Loading ──► Loaded ◄──► Reloading
//!      │          │  ▲
//!      │          ▼  │ (reload)
//!      │        Expired
//!      ▼
//!   Errored            any ──► Unloaded (terminal)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::id::OverscaledTileId;

/// Minimum retry delay used when client and server clocks disagree.
pub const CLOCK_SKEW_RETRY_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Longest delay a single timer may be armed with (2^31 - 1 ms).
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis((1 << 31) - 1);

// =============================================================================
// Clock
// =============================================================================

/// Wall-clock time in milliseconds since the Unix epoch.
///
/// Anchored once with `chrono` and advanced with the Tokio clock, so that tests
/// running with a paused runtime see wall time move exactly as timers do.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_ms: i64,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            anchor_ms: Utc::now().timestamp_millis(),
            anchor: Instant::now(),
        }
    }

    /// Current wall-clock time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_ms.saturating_add(elapsed)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Expiry Hints
// =============================================================================

/// Freshness hints returned alongside tile data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryData {
    /// Raw `Cache-Control` header value.
    pub cache_control: Option<String>,
    /// Raw `Expires` header value (HTTP date).
    pub expires: Option<String>,
}

impl ExpiryData {
    pub fn max_age(seconds: u64) -> Self {
        Self {
            cache_control: Some(format!("max-age={seconds}")),
            expires: None,
        }
    }

    pub fn expires(value: impl Into<String>) -> Self {
        Self {
            cache_control: None,
            expires: Some(value.into()),
        }
    }
}

/// Parsed `Cache-Control` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// Directive name (lowercase) to its lowercased value, if any.
    pub directives: HashMap<String, Option<String>>,
    /// `max-age` in seconds, when present and numeric.
    pub max_age: Option<u64>,
}

/// Parse a `Cache-Control` header value.
///
/// Unknown directives are kept verbatim; a `max-age` that is not an integer is
/// dropped.
pub fn parse_cache_control(header: &str) -> CacheControl {
    let mut directives = HashMap::new();

    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, value) = match part.split_once('=') {
            Some((name, value)) => {
                let value = value.trim().trim_matches('"').to_ascii_lowercase();
                (name.trim(), (!value.is_empty()).then_some(value))
            }
            None => (part, None),
        };
        directives.insert(name.to_ascii_lowercase(), value);
    }

    let max_age = match directives.get("max-age") {
        Some(Some(value)) => match value.parse::<u64>() {
            Ok(seconds) => Some(seconds),
            Err(_) => {
                directives.remove("max-age");
                None
            }
        },
        _ => None,
    };

    CacheControl {
        directives,
        max_age,
    }
}

fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.timestamp_millis())
}

// =============================================================================
// Tile State
// =============================================================================

/// Load state of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TileState {
    /// First request in flight, no data yet
    Loading,
    /// Data present and fresh
    Loaded,
    /// Data present, a refresh request is in flight
    Reloading,
    /// Load failed; left visibly absent
    Errored,
    /// Data present but stale, waiting for its reload timer
    Expired,
    /// Payload released; terminal
    Unloaded,
}

/// Part a tile plays in a raster cross-fade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FadingRole {
    /// The deeper tile(s) of a many-to-one fade
    Base,
    /// The single shallower tile of a many-to-one fade
    Parent,
}

/// Whether a fading tile is appearing or disappearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FadingDirection {
    Incoming,
    Departing,
}

/// Payload delivered by a successful load.
#[derive(Debug, Clone, Default)]
pub struct TileData {
    /// Opaque tile contents, shared with readers by reference count.
    pub payload: Bytes,
    pub expiry: ExpiryData,
    /// Whether the payload carries symbol layers that fade out on removal.
    pub has_symbols: bool,
}

// =============================================================================
// Tile
// =============================================================================

/// A consumer's hold on an active tile.
///
/// While any claim is alive the cache keeps the tile in its active set, even
/// when no viewport retains it. Dropping the claim releases it; the tile
/// becomes evictable on the next update.
#[derive(Debug, Clone)]
pub struct TileClaim {
    uid: u64,
    _token: Arc<()>,
}

impl TileClaim {
    /// Uid of the claimed tile instance.
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

/// A resident tile and its lifecycle bookkeeping.
#[derive(Debug)]
pub struct Tile {
    id: OverscaledTileId,
    uid: u64,
    state: TileState,
    consumers: Arc<()>,
    payload: Option<Bytes>,
    has_symbols: bool,
    aborted: bool,

    time_added: Option<Instant>,
    fade_start: Option<Instant>,
    fade_end_time: Option<Instant>,
    symbol_fade_hold_until: Option<Instant>,

    expiration_time: Option<i64>,
    expired_request_count: u32,
    refreshed_upon_expiration: bool,

    fading_role: Option<FadingRole>,
    fading_direction: Option<FadingDirection>,
    fading_parent_id: Option<OverscaledTileId>,
    self_fading: bool,

    dependencies: HashMap<String, HashSet<String>>,
}

impl Tile {
    /// Create a tile in the `Loading` state.
    pub fn new(id: OverscaledTileId, uid: u64) -> Self {
        Self {
            id,
            uid,
            state: TileState::Loading,
            consumers: Arc::new(()),
            payload: None,
            has_symbols: false,
            aborted: false,
            time_added: None,
            fade_start: None,
            fade_end_time: None,
            symbol_fade_hold_until: None,
            expiration_time: None,
            expired_request_count: 0,
            refreshed_upon_expiration: false,
            fading_role: None,
            fading_direction: None,
            fading_parent_id: None,
            self_fading: false,
            dependencies: HashMap::new(),
        }
    }

    pub fn id(&self) -> &OverscaledTileId {
        &self.id
    }

    /// Re-address the tile (world-wrap renumbering or restore from the store).
    pub(crate) fn set_id(&mut self, id: OverscaledTileId) {
        self.id = id;
    }

    /// Unique id of this tile instance; changes only when a new tile is created.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TileState) {
        self.state = state;
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn has_symbols(&self) -> bool {
        self.has_symbols
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    /// Whether a response (success or failure) was ever received.
    pub fn was_requested(&self) -> bool {
        matches!(
            self.state,
            TileState::Errored | TileState::Loaded | TileState::Reloading
        )
    }

    /// Whether renderable data is present, possibly stale.
    pub fn has_data(&self) -> bool {
        matches!(
            self.state,
            TileState::Loaded | TileState::Reloading | TileState::Expired
        )
    }

    // -------------------------------------------------------------------------
    // Consumers
    // -------------------------------------------------------------------------

    /// Number of outstanding [`TileClaim`]s on this tile.
    pub fn claim_count(&self) -> usize {
        Arc::strong_count(&self.consumers) - 1
    }

    /// Whether a consumer outside the cache still holds this tile.
    pub fn is_claimed(&self) -> bool {
        self.claim_count() > 0
    }

    pub(crate) fn claim(&self) -> TileClaim {
        TileClaim {
            uid: self.uid,
            _token: Arc::clone(&self.consumers),
        }
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Install freshly loaded data and its freshness hints.
    ///
    /// `previous` is the state the tile was in when the request was issued.
    pub(crate) fn apply_loaded(
        &mut self,
        data: TileData,
        previous: TileState,
        now_ms: i64,
        now: Instant,
    ) {
        self.state = TileState::Loaded;
        self.payload = Some(data.payload);
        self.has_symbols = data.has_symbols;
        self.time_added = Some(now);
        self.refreshed_upon_expiration = previous == TileState::Expired;
        self.set_expiry_data(&data.expiry, now_ms);
    }

    pub(crate) fn apply_errored(&mut self) {
        self.state = TileState::Errored;
    }

    /// Release the payload. The tile is never reused afterwards.
    pub fn unload(&mut self) {
        self.state = TileState::Unloaded;
        self.payload = None;
        self.symbol_fade_hold_until = None;
    }

    /// Whether the last successful load replaced expired data.
    pub fn refreshed_upon_expiration(&self) -> bool {
        self.refreshed_upon_expiration
    }

    // -------------------------------------------------------------------------
    // Expiry
    // -------------------------------------------------------------------------

    pub fn expiration_time(&self) -> Option<i64> {
        self.expiration_time
    }

    pub fn expired_request_count(&self) -> u32 {
        self.expired_request_count
    }

    /// Update the expiration time from response hints.
    ///
    /// A response that is already stale marks the tile `Expired` and bumps the
    /// backoff counter, unless the expiration moved forward, in which case the
    /// clocks are assumed to disagree and a retry is scheduled instead.
    pub fn set_expiry_data(&mut self, data: &ExpiryData, now_ms: i64) {
        let prior = self.expiration_time;

        if let Some(cache_control) = &data.cache_control {
            if let Some(max_age) = parse_cache_control(cache_control).max_age.filter(|s| *s > 0) {
                let max_age_ms = i64::try_from(max_age.saturating_mul(1000)).unwrap_or(i64::MAX);
                self.expiration_time = Some(now_ms.saturating_add(max_age_ms));
            }
        } else if let Some(expires) = &data.expires {
            if let Some(time) = parse_http_date(expires) {
                self.expiration_time = Some(time);
            }
        }

        let Some(expiration) = self.expiration_time else {
            return;
        };

        let is_expired = if expiration > now_ms {
            false
        } else {
            match prior {
                None => true,
                Some(prior) if expiration <= prior => true,
                Some(prior) => {
                    let delta = expiration - prior;
                    let retry = (CLOCK_SKEW_RETRY_TIMEOUT.as_millis() as i64).max(delta);
                    self.expiration_time = Some(now_ms.saturating_add(retry));
                    false
                }
            }
        };

        if is_expired {
            self.expired_request_count = self.expired_request_count.saturating_add(1);
            self.state = TileState::Expired;
        } else {
            self.expired_request_count = 0;
        }
    }

    /// Delay until this tile should be reloaded, if it expires at all.
    ///
    /// Stale responses back off exponentially (1s, 2s, 4s, ...); otherwise the
    /// remaining lifetime is returned, capped at [`MAX_TIMER_DELAY`].
    pub fn expiry_timeout(&self, now_ms: i64) -> Option<Duration> {
        let expiration = self.expiration_time?;

        if self.expired_request_count > 0 {
            let shift = (self.expired_request_count - 1).min(31);
            return Some(Duration::from_millis(1000u64 << shift));
        }

        let remaining = u64::try_from(expiration.saturating_sub(now_ms)).unwrap_or(0);
        Some(Duration::from_millis(remaining).min(MAX_TIMER_DELAY))
    }

    // -------------------------------------------------------------------------
    // Fade
    // -------------------------------------------------------------------------

    pub fn time_added(&self) -> Option<Instant> {
        self.time_added
    }

    pub fn fade_end_time(&self) -> Option<Instant> {
        self.fade_end_time
    }

    /// Extend the fade window to at least `duration` after the tile was added.
    pub fn register_fade_duration(&mut self, duration: Duration) {
        let Some(added) = self.time_added else {
            return;
        };
        let end = added + duration;
        if self.fade_end_time.map_or(true, |current| end >= current) {
            self.fade_end_time = Some(end);
        }
    }

    pub fn holding_for_fade(&self) -> bool {
        self.symbol_fade_hold_until.is_some()
    }

    /// Whether the fade hold, if any, has elapsed at `now`.
    pub fn symbol_fade_finished(&self, now: Instant) -> bool {
        self.symbol_fade_hold_until.map_or(true, |until| until <= now)
    }

    pub fn fade_hold_until(&self) -> Option<Instant> {
        self.symbol_fade_hold_until
    }

    pub fn clear_fade_hold(&mut self) {
        self.symbol_fade_hold_until = None;
    }

    pub fn set_hold_duration(&mut self, duration: Duration, now: Instant) {
        self.symbol_fade_hold_until = Some(now + duration);
    }

    pub fn fading_role(&self) -> Option<FadingRole> {
        self.fading_role
    }

    pub fn fading_direction(&self) -> Option<FadingDirection> {
        self.fading_direction
    }

    pub fn fading_parent_id(&self) -> Option<&OverscaledTileId> {
        self.fading_parent_id.as_ref()
    }

    pub fn self_fading(&self) -> bool {
        self.self_fading
    }

    pub(crate) fn set_cross_fade(
        &mut self,
        role: FadingRole,
        direction: FadingDirection,
        parent: Option<OverscaledTileId>,
        now: Instant,
        end: Instant,
    ) {
        self.fading_role = Some(role);
        self.fading_direction = Some(direction);
        self.fading_parent_id = parent;
        self.self_fading = false;
        self.fade_start = Some(now);
        self.fade_end_time = Some(end);
    }

    pub(crate) fn set_self_fade(&mut self, now: Instant, end: Instant) {
        self.fading_role = None;
        self.fading_direction = Some(FadingDirection::Incoming);
        self.fading_parent_id = None;
        self.self_fading = true;
        self.fade_start = Some(now);
        self.fade_end_time = Some(end);
    }

    /// Restart a self fade from the moment data arrived.
    pub(crate) fn restart_self_fade(&mut self, duration: Duration) {
        if let Some(added) = self.time_added {
            self.fade_start = Some(added);
            self.fade_end_time = Some(added + duration);
        }
    }

    pub(crate) fn reset_fade(&mut self) {
        self.fading_role = None;
        self.fading_direction = None;
        self.fading_parent_id = None;
        self.self_fading = false;
        self.fade_start = None;
        self.fade_end_time = None;
    }

    /// Opacity of the tile in its current fade, in `[0, 1]`.
    pub fn fade_opacity(&self, now: Instant) -> f64 {
        let Some(end) = self.fade_end_time else {
            return 1.0;
        };
        let start = self.fade_start.or(self.time_added).unwrap_or(end);

        let progress = if now >= end || end <= start {
            1.0
        } else if now <= start {
            0.0
        } else {
            (now - start).as_secs_f64() / (end - start).as_secs_f64()
        };

        match self.fading_direction {
            Some(FadingDirection::Departing) => 1.0 - progress,
            _ => progress,
        }
    }

    /// Whether a fade is still running at `now`.
    pub fn is_fading(&self, now: Instant) -> bool {
        self.fade_end_time.is_some_and(|end| end >= now)
    }

    // -------------------------------------------------------------------------
    // Dependencies
    // -------------------------------------------------------------------------

    /// Replace the dependency keys registered under `namespace`.
    pub fn set_dependencies<I, S>(&mut self, namespace: &str, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.insert(
            namespace.to_string(),
            keys.into_iter().map(Into::into).collect(),
        );
    }

    /// Whether any of `keys` is registered under any of `namespaces`.
    pub fn has_dependency(&self, namespaces: &[&str], keys: &[&str]) -> bool {
        namespaces.iter().any(|ns| {
            self.dependencies
                .get(*ns)
                .is_some_and(|deps| keys.iter().any(|k| deps.contains(*k)))
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
