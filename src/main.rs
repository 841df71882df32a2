//! Tile Pyramid - cache simulator.
//!
//! Drives a tile pyramid cache with a synthetic source, or prints the ideal
//! covering of a viewport.

use clap::Parser;
use serde::Serialize;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tile_pyramid::{
    config::{Cli, Command, CoverConfig, SimulateConfig},
    source::{
        covering_zoom_level, Coverage, CoverageParams, FlatCoverage, SyntheticSource,
        SyntheticSourceConfig, Viewport,
    },
    OverscaledTileId, SourceEvent, TilePyramidCache,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Simulate(config) => run_simulate(config).await,
        Command::Cover(config) => run_cover(config),
    }
}

// =============================================================================
// Simulate Command
// =============================================================================

/// Totals printed at the end of a simulation.
#[derive(Debug, Default, Serialize)]
struct SimulationSummary {
    frames: usize,
    final_viewport: Option<Viewport>,
    requests: u64,
    loads: usize,
    aborts: usize,
    unloads: usize,
    errors: usize,
    active: usize,
    renderable: usize,
    stored: usize,
    store_capacity: usize,
    loaded: bool,
}

/// Counters gathered from cache notifications.
#[derive(Debug, Default)]
struct EventCounts {
    loading: usize,
    data: usize,
    removed: usize,
    aborted: usize,
    errors: usize,
    idle: usize,
}

impl EventCounts {
    fn record(&mut self, event: &SourceEvent) {
        match event {
            SourceEvent::TileLoading(_) => self.loading += 1,
            SourceEvent::TileData(_) => self.data += 1,
            SourceEvent::TileRemoved(_) => self.removed += 1,
            SourceEvent::TileAborted(_) => self.aborted += 1,
            SourceEvent::TileError { .. } => self.errors += 1,
            SourceEvent::Idle => self.idle += 1,
        }
    }
}

async fn run_simulate(config: SimulateConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let source_options = config.source.source_options();
    let cache_options = config.cache_options();

    info!("Configuration:");
    info!(
        "  Source: {:?}, z{}-z{}, {}px tiles",
        source_options.kind, source_options.minzoom, source_options.maxzoom, source_options.tile_size
    );
    info!(
        "  Camera: {} frames every {}ms, {} deg/frame, {} zoom/frame",
        config.frames, config.frame_ms, config.pan_per_frame, config.zoom_per_frame
    );
    info!("  Latency: {}ms", config.latency_ms);
    if let Some(cap) = cache_options.max_tile_cache_size {
        info!("  Store cap: {} tiles", cap);
    }
    if let Some(every) = config.error_every {
        warn!("  Simulating failures every {} requests", every);
    }

    let source = SyntheticSource::new(SyntheticSourceConfig {
        options: source_options,
        latency: Duration::from_millis(config.latency_ms),
        missing_above_zoom: config.missing_above_zoom,
        error_every: config.error_every,
        max_age: config.max_age,
    });
    let mut cache = TilePyramidCache::new(source, cache_options);
    let mut events = cache.subscribe();
    let mut counts = EventCounts::default();

    let mut viewport = config.viewport.viewport();
    let frame_delay = Duration::from_millis(config.frame_ms);

    for frame in 0..config.frames {
        cache.update(&viewport);
        tokio::time::sleep(frame_delay).await;
        cache.process_events();

        loop {
            match events.try_recv() {
                Ok(event) => counts.record(&event),
                Err(TryRecvError::Lagged(missed)) => {
                    debug!(missed, "Event receiver lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }

        debug!(
            frame,
            lng = viewport.center_lng,
            zoom = viewport.zoom,
            active = cache.len(),
            stored = cache.store_len(),
            "Frame"
        );
        if frame % 10 == 0 {
            info!(
                "Frame {:>4}: zoom {:>5.2}, {:>3} active, {:>3} drawable, {:>3} stored",
                frame,
                viewport.zoom,
                cache.len(),
                cache.renderable_ids(false).len(),
                cache.store_len()
            );
        }

        viewport = advance(viewport, &config);
    }

    cache.settle().await;

    let source = cache.source();
    let summary = SimulationSummary {
        frames: config.frames,
        final_viewport: Some(viewport),
        requests: source.request_count(),
        loads: source.load_count(),
        aborts: source.abort_count(),
        unloads: source.unload_count(),
        errors: counts.errors,
        active: cache.len(),
        renderable: cache.renderable_ids(false).len(),
        stored: cache.store_len(),
        store_capacity: cache.store_capacity(),
        loaded: cache.loaded(),
    };

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Requests: {} ({} loaded, {} aborted)", summary.requests, summary.loads, summary.aborts);
    info!("  Unloaded: {}", summary.unloads);
    info!(
        "  Events: {} added, {} data, {} removed, {} idle",
        counts.loading, counts.data, counts.removed, counts.idle
    );
    if summary.errors > 0 {
        warn!("  Errors: {}", summary.errors);
    }
    info!(
        "  Final: {} active, {} stored (capacity {})",
        summary.active, summary.stored, summary.store_capacity
    );
    info!("────────────────────────────────────────────────────────────────");

    if config.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize summary: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

/// Move the camera one frame.
///
/// Longitude stays within [-180, 180) the way a map camera reports it, so
/// crossing the antimeridian shows up as a jump.
fn advance(viewport: Viewport, config: &SimulateConfig) -> Viewport {
    let lng = (viewport.center_lng + config.pan_per_frame + 180.0).rem_euclid(360.0) - 180.0;
    let zoom = (viewport.zoom + config.zoom_per_frame).clamp(0.0, 22.0);
    Viewport {
        center_lng: lng,
        zoom,
        ..viewport
    }
}

// =============================================================================
// Cover Command
// =============================================================================

#[derive(Debug, Serialize)]
struct CoverOutput {
    covering_zoom: u8,
    tiles: Vec<OverscaledTileId>,
}

fn run_cover(config: CoverConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let viewport = config.viewport.viewport();
    let params = CoverageParams::from(&config.source.source_options());
    let output = CoverOutput {
        covering_zoom: covering_zoom_level(viewport.zoom, &params),
        tiles: FlatCoverage.ideal_tiles(&viewport, &params),
    };
    debug!(tiles = output.tiles.len(), "Covering computed");

    if config.json {
        match serde_json::to_string_pretty(&output) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("Covering zoom: {}", output.covering_zoom);
        println!("Tiles: {}", output.tiles.len());
        for id in &output.tiles {
            println!("  {} (wrap {})", id, id.wrap());
        }
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Logging
// =============================================================================

/// Initialize the tracing subscriber for logging.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tile_pyramid=debug"
    } else {
        "tile_pyramid=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
