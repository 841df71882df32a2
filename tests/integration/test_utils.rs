//! Test utilities for integration tests.
//!
//! This module provides a mock tile source that records every request and can
//! be told to report specific tiles missing or failing, plus small helpers
//! for building ids and viewports.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use tile_pyramid::error::LoadError;
use tile_pyramid::source::{LoadRequest, SourceOptions, TileSource, Viewport};
use tile_pyramid::tile::{ExpiryData, OverscaledTileId, TileData, TileKey};
use tile_pyramid::SourceEvent;

// =============================================================================
// Mock Tile Source with Request Tracking
// =============================================================================

/// A mock tile source that tracks loads, aborts and unloads.
///
/// Clones share their counters, so a clone kept by the test observes the
/// source moved into the cache.
#[derive(Clone)]
pub struct MockTileSource {
    options: SourceOptions,
    latency: Duration,
    expiry: ExpiryData,
    has_symbols: bool,
    not_found: Arc<Mutex<HashSet<TileKey>>>,
    failing: Arc<Mutex<HashSet<TileKey>>>,
    requests: Arc<AtomicUsize>,
    loads: Arc<AtomicUsize>,
    aborts: Arc<AtomicUsize>,
    unloads: Arc<AtomicUsize>,
    requested: Arc<Mutex<Vec<OverscaledTileId>>>,
}

impl MockTileSource {
    pub fn new(options: SourceOptions) -> Self {
        Self {
            options,
            latency: Duration::ZERO,
            expiry: ExpiryData::default(),
            has_symbols: false,
            not_found: Arc::new(Mutex::new(HashSet::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            requests: Arc::new(AtomicUsize::new(0)),
            loads: Arc::new(AtomicUsize::new(0)),
            aborts: Arc::new(AtomicUsize::new(0)),
            unloads: Arc::new(AtomicUsize::new(0)),
            requested: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn vector() -> Self {
        Self::new(SourceOptions::vector())
    }

    pub fn raster() -> Self {
        Self::new(SourceOptions::raster())
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.expiry = ExpiryData::max_age(seconds);
        self
    }

    pub fn with_symbols(mut self) -> Self {
        self.has_symbols = true;
        self
    }

    /// Report `id`'s location as missing from now on.
    pub fn set_not_found(&self, id: &OverscaledTileId) {
        self.not_found.lock().unwrap().insert(id.canonical().key());
    }

    /// Fail loads of `id`'s location from now on.
    pub fn set_failing(&self, id: &OverscaledTileId) {
        self.failing.lock().unwrap().insert(id.canonical().key());
    }

    /// Number of `load_tile` calls.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of loads that completed successfully.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Number of requests issued for `id`.
    pub fn requests_for(&self, id: &OverscaledTileId) -> usize {
        self.requested
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r == &id)
            .count()
    }
}

#[async_trait]
impl TileSource for MockTileSource {
    fn options(&self) -> &SourceOptions {
        &self.options
    }

    async fn load_tile(&self, request: &LoadRequest) -> Result<TileData, LoadError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(request.id);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let canonical = request.id.canonical();
        if self.not_found.lock().unwrap().contains(&canonical.key()) {
            return Err(LoadError::NotFound(canonical.to_string()));
        }
        if self.failing.lock().unwrap().contains(&canonical.key()) {
            return Err(LoadError::Other(format!("mock failure for {}", canonical)));
        }

        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(TileData {
            payload: Bytes::from(request.id.to_string()),
            expiry: self.expiry.clone(),
            has_symbols: self.has_symbols,
        })
    }

    fn abort_tile(&self, _id: &OverscaledTileId, _uid: u64) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn unload_tile(&self, _id: &OverscaledTileId, _uid: u64) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// A non-overscaled tile in world copy 0.
pub fn tile(z: u8, x: u32, y: u32) -> OverscaledTileId {
    OverscaledTileId::new(z, 0, z, x, y).unwrap()
}

/// A 512x512 viewport.
pub fn view(lng: f64, zoom: f64) -> Viewport {
    Viewport::new(lng, 0.0, zoom, 512, 512)
}

/// Everything published since the last call.
pub fn drain_events(rx: &mut broadcast::Receiver<SourceEvent>) -> Vec<SourceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
