//! In-process tile source with simulated latency and gaps.
//!
//! Used by the `simulate` command and handy for exercising the cache without
//! a network: every tile resolves to a small payload naming its address after
//! a configurable delay, tiles above a zoom can be reported missing, and every
//! n-th request can be made to fail.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::{LoadRequest, SourceOptions, TileSource};
use crate::error::LoadError;
use crate::tile::{ExpiryData, OverscaledTileId, TileData};

/// Behaviour of a [`SyntheticSource`].
#[derive(Debug, Clone)]
pub struct SyntheticSourceConfig {
    pub options: SourceOptions,
    /// Delay before each load resolves
    pub latency: Duration,
    /// Canonical zooms above this report `NotFound`
    pub missing_above_zoom: Option<u8>,
    /// Every n-th request fails with a non-`NotFound` error
    pub error_every: Option<u64>,
    /// `max-age` attached to every response, in seconds
    pub max_age: Option<u64>,
}

impl Default for SyntheticSourceConfig {
    fn default() -> Self {
        Self {
            options: SourceOptions::default(),
            latency: Duration::from_millis(20),
            missing_above_zoom: None,
            error_every: None,
            max_age: None,
        }
    }
}

/// Tile source that fabricates data locally.
#[derive(Debug)]
pub struct SyntheticSource {
    config: SyntheticSourceConfig,
    requests: AtomicU64,
    loads: AtomicUsize,
    aborts: AtomicUsize,
    unloads: AtomicUsize,
}

impl SyntheticSource {
    pub fn new(config: SyntheticSourceConfig) -> Self {
        Self {
            config,
            requests: AtomicU64::new(0),
            loads: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        }
    }

    /// Number of completed successful loads.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Number of `load_tile` calls, including failures and aborted ones.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TileSource for SyntheticSource {
    fn options(&self) -> &SourceOptions {
        &self.config.options
    }

    async fn load_tile(&self, request: &LoadRequest) -> Result<TileData, LoadError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(tile = %request.id, uid = request.uid, "Synthetic load started");

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        let canonical = request.id.canonical();
        if self
            .config
            .missing_above_zoom
            .is_some_and(|z| canonical.z() > z)
        {
            return Err(LoadError::NotFound(canonical.to_string()));
        }
        if self.config.error_every.is_some_and(|every| every > 0 && n % every == 0) {
            return Err(LoadError::Other(format!("simulated failure for {canonical}")));
        }

        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(TileData {
            payload: Bytes::from(format!("{}:{}", self.config.options.tile_size, canonical)),
            expiry: self
                .config
                .max_age
                .map(ExpiryData::max_age)
                .unwrap_or_default(),
            has_symbols: !self.config.options.kind.is_raster(),
        })
    }

    fn abort_tile(&self, _id: &OverscaledTileId, _uid: u64) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn unload_tile(&self, _id: &OverscaledTileId, _uid: u64) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}
