//! World-wrap renumbering integration tests.
//!
//! Tests verify:
//! - Crossing the antimeridian renumbers active tiles instead of refetching
//! - Panning with `update` reuses tiles whether or not the camera normalizes
//!   its longitude
//! - Moving within one world copy leaves tiles alone
//! - Expiry timers follow the renumbered tiles

use std::collections::BTreeSet;
use std::time::Duration;

use tile_pyramid::{CacheOptions, OverscaledTileId, TilePyramidCache, TileState};

use super::test_utils::{view, MockTileSource};

fn edge_tile(wrap: i32) -> OverscaledTileId {
    OverscaledTileId::new(5, wrap, 5, 31, 10).unwrap()
}

fn uids(cache: &TilePyramidCache<MockTileSource>) -> BTreeSet<u64> {
    cache
        .ids()
        .iter()
        .filter_map(|id| cache.get_tile(id))
        .map(|t| t.uid())
        .collect()
}

// =============================================================================
// Panning Through Coverage
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pan_to_normalized_longitude_reuses_tiles() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    cache.update(&view(179.0, 5.0));
    cache.settle().await;
    assert_eq!(cache.len(), 4);
    let before = uids(&cache);

    // the camera reports 181° as -179°
    cache.update(&view(-179.0, 5.0));
    cache.settle().await;

    assert_eq!(source.request_count(), 4);
    assert_eq!(uids(&cache), before);
    assert!(cache
        .get_tile(&OverscaledTileId::new(5, -1, 5, 31, 15).unwrap())
        .is_some());
    assert!(cache
        .get_tile(&OverscaledTileId::new(5, 0, 5, 0, 15).unwrap())
        .is_some());
    assert_eq!(cache.store_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pan_past_antimeridian_unnormalized_reuses_tiles() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    cache.update(&view(179.0, 5.0));
    cache.settle().await;
    let ids = cache.ids();
    let before = uids(&cache);

    cache.update(&view(181.0, 5.0));
    cache.settle().await;

    assert_eq!(source.request_count(), 4);
    assert_eq!(cache.ids(), ids);
    assert_eq!(uids(&cache), before);
}

#[tokio::test(start_paused = true)]
async fn test_pan_back_and_forth_reuses_tiles() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    cache.update(&view(179.0, 5.0));
    cache.settle().await;
    let ids = cache.ids();

    cache.update(&view(-179.0, 5.0));
    cache.update(&view(179.0, 5.0));
    cache.settle().await;

    assert_eq!(source.request_count(), 4);
    assert_eq!(cache.ids(), ids);
}

// =============================================================================
// Caller-Supplied Coverings
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_crossing_antimeridian_renumbers_tiles() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    cache.update_with_ideal(&[edge_tile(0)], &view(179.0, 5.0));
    cache.settle().await;
    let uid = cache.get_tile(&edge_tile(0)).map(|t| t.uid());

    cache.update_with_ideal(&[edge_tile(1)], &view(181.0, 5.0));

    assert!(cache.get_tile(&edge_tile(0)).is_none());
    let moved = cache.get_tile(&edge_tile(1)).unwrap();
    assert_eq!(moved.id().wrap(), 1);
    assert_eq!(Some(moved.uid()), uid);
    assert_eq!(moved.state(), TileState::Loaded);

    cache.settle().await;
    assert_eq!(source.request_count(), 1);
    assert_eq!(cache.store_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_crossing_back_renumbers_down() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    cache.update_with_ideal(&[edge_tile(1)], &view(181.0, 5.0));
    cache.settle().await;

    cache.update_with_ideal(&[edge_tile(0)], &view(179.0, 5.0));
    assert_eq!(cache.ids(), vec![edge_tile(0)]);

    cache.settle().await;
    assert_eq!(source.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panning_within_world_keeps_wrap() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    let id = edge_tile(0);
    cache.update_with_ideal(&[id], &view(10.0, 5.0));
    cache.settle().await;

    cache.update_with_ideal(&[id], &view(170.0, 5.0));
    assert_eq!(cache.ids(), vec![id]);

    // 630 degrees rounds to two worlds
    cache.update_with_ideal(&[edge_tile(2)], &view(800.0, 5.0));
    assert_eq!(cache.ids(), vec![edge_tile(2)]);
    assert_eq!(source.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reload_timer_follows_renumbered_tile() {
    let source = MockTileSource::vector().with_max_age(10);
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    cache.update_with_ideal(&[edge_tile(0)], &view(179.0, 5.0));
    cache.settle().await;
    cache.update_with_ideal(&[edge_tile(1)], &view(181.0, 5.0));

    tokio::time::sleep(Duration::from_secs(11)).await;
    cache.process_events();
    assert_eq!(
        cache.get_tile(&edge_tile(1)).map(|t| t.state()),
        Some(TileState::Expired)
    );

    cache.settle().await;
    assert_eq!(source.requests_for(&edge_tile(1)), 1);
    assert!(cache
        .get_tile(&edge_tile(1))
        .is_some_and(|t| t.refreshed_upon_expiration()));
}

#[tokio::test(start_paused = true)]
async fn test_claimed_copy_is_not_moved() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    cache.update_with_ideal(&[edge_tile(0)], &view(179.0, 5.0));
    cache.settle().await;
    let _claim = cache.claim_tile(&edge_tile(0)).unwrap();

    cache.update_with_ideal(&[edge_tile(1)], &view(181.0, 5.0));
    assert!(cache.get_tile(&edge_tile(0)).is_some());
    assert!(cache.get_tile(&edge_tile(1)).is_some());

    cache.settle().await;
    assert_eq!(source.requests_for(&edge_tile(1)), 1);
}
