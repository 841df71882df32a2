//! Reuse store integration tests.
//!
//! Tests verify:
//! - Tiles leaving the view are parked and restored without a refetch
//! - The store is bounded by the viewport size and the hard cap
//! - Stored tiles expire with their data
//! - Evicted values are handed to the callback exactly once

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tile_pyramid::cache::BoundedTileStore;
use tile_pyramid::tile::TileKey;
use tile_pyramid::{CacheOptions, OverscaledTileId, SourceEvent, TilePyramidCache, TileState};

use super::test_utils::{drain_events, tile, view, MockTileSource};

// =============================================================================
// Store Through The Cache
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_panning_back_restores_from_store() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());
    let mut events = cache.subscribe();

    let a = tile(5, 7, 7);
    let b = tile(5, 8, 7);

    cache.update_with_ideal(&[a], &view(0.0, 5.0));
    cache.settle().await;
    let uid = cache.get_tile(&a).map(|t| t.uid());

    cache.update_with_ideal(&[b], &view(0.0, 5.0));
    cache.settle().await;
    assert_eq!(cache.store_len(), 1);
    drain_events(&mut events);

    cache.update_with_ideal(&[a], &view(0.0, 5.0));
    let restored = cache.get_tile(&a).unwrap();
    assert_eq!(Some(restored.uid()), uid);
    assert_eq!(restored.state(), TileState::Loaded);
    assert_eq!(source.requests_for(&a), 1);

    // b took a's place in the store
    assert_eq!(cache.store_len(), 1);
    assert_eq!(drain_events(&mut events), vec![SourceEvent::TileRemoved(b)]);
}

#[tokio::test(start_paused = true)]
async fn test_store_restores_other_world_copy() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    let a = tile(5, 7, 7);
    let b = tile(5, 8, 7);
    cache.update_with_ideal(&[a], &view(0.0, 5.0));
    cache.settle().await;
    cache.update_with_ideal(&[b], &view(0.0, 5.0));
    cache.settle().await;

    let copy = a.unwrap_to(1);
    cache.update_with_ideal(&[copy], &view(0.0, 5.0));
    assert_eq!(cache.get_tile(&copy).map(|t| *t.id()), Some(copy));
    assert_eq!(source.request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_store_sized_from_viewport() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source, CacheOptions::default());

    // (1 + 1) * (1 + 1) tiles across five zoom levels
    cache.update_with_ideal(&[], &view(0.0, 5.0));
    assert_eq!(cache.store_capacity(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_store_cap_evicts_and_unloads() {
    let source = MockTileSource::vector();
    let options = CacheOptions {
        max_tile_cache_size: Some(1),
        ..Default::default()
    };
    let mut cache = TilePyramidCache::new(source.clone(), options);

    cache.update_with_ideal(&[tile(5, 1, 1), tile(5, 2, 1), tile(5, 3, 1)], &view(0.0, 5.0));
    cache.settle().await;
    assert_eq!(cache.store_capacity(), 1);

    cache.update_with_ideal(&[tile(5, 4, 1)], &view(0.0, 5.0));
    assert_eq!(cache.store_len(), 1);
    assert_eq!(source.unload_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stored_tile_expires() {
    let source = MockTileSource::vector().with_max_age(10);
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    let a = tile(5, 7, 7);
    cache.update_with_ideal(&[a], &view(0.0, 5.0));
    cache.settle().await;
    cache.update_with_ideal(&[], &view(0.0, 5.0));
    assert_eq!(cache.store_len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    cache.process_events();
    assert_eq!(cache.store_len(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    cache.process_events();
    assert_eq!(cache.store_len(), 0);
    assert_eq!(source.unload_count(), 1);

    // expired data is fetched again
    cache.update_with_ideal(&[a], &view(0.0, 5.0));
    assert_eq!(cache.get_tile(&a).map(|t| t.state()), Some(TileState::Loading));
    cache.settle().await;
    assert_eq!(source.requests_for(&a), 2);
}

#[tokio::test(start_paused = true)]
async fn test_paused_store_prunes_on_resume() {
    let source = MockTileSource::vector().with_max_age(1);
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    cache.update_with_ideal(&[tile(5, 7, 7)], &view(0.0, 5.0));
    cache.settle().await;
    cache.update_with_ideal(&[], &view(0.0, 5.0));

    cache.pause();
    tokio::time::sleep(Duration::from_secs(2)).await;
    cache.process_events();
    assert_eq!(cache.store_len(), 1);

    cache.resume();
    assert_eq!(cache.store_len(), 0);
    assert_eq!(source.unload_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dependency_change_drops_stored_tiles() {
    let source = MockTileSource::vector();
    let mut cache = TilePyramidCache::new(source.clone(), CacheOptions::default());

    let a = tile(5, 7, 7);
    let b = tile(5, 8, 7);
    cache.update_with_ideal(&[a, b], &view(0.0, 5.0));
    cache.settle().await;
    assert!(cache.set_dependencies(&a, "sprite", ["marker"]));
    cache.update_with_ideal(&[b], &view(0.0, 5.0));
    assert_eq!(cache.store_len(), 1);

    cache.reload_tiles_for_dependencies(&["sprite"], &["marker"]);
    assert_eq!(cache.store_len(), 0);
    assert_eq!(source.unload_count(), 1);
}

// =============================================================================
// Store API
// =============================================================================

fn key(x: u32) -> TileKey {
    OverscaledTileId::new(6, 0, 6, x, 0).unwrap().key()
}

#[test]
fn test_overflow_evicts_each_value_once() {
    let evicted = Arc::new(Mutex::new(Vec::new()));
    let sink = evicted.clone();
    let mut store = BoundedTileStore::new(4, Box::new(move |v: u32| sink.lock().unwrap().push(v)));

    for i in 0..10 {
        store.add(key(i % 3), i, None);
    }
    assert_eq!(store.len(), 4);
    assert_eq!(*evicted.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);

    // survivors come back FIFO per key
    assert_eq!(store.get_and_remove(key(0)), Some(6));
    assert_eq!(store.get_and_remove(key(0)), Some(9));
    assert_eq!(store.get_and_remove(key(0)), None);
    assert_eq!(evicted.lock().unwrap().len(), 6);
}

#[test]
fn test_shrinking_evicts_oldest() {
    let evicted = Arc::new(Mutex::new(Vec::new()));
    let sink = evicted.clone();
    let mut store = BoundedTileStore::new(10, Box::new(move |v: u32| sink.lock().unwrap().push(v)));

    store.add(key(1), 1, None);
    store.add(key(2), 2, None);
    store.add(key(3), 3, None);
    store.set_max_size(1);

    assert_eq!(*evicted.lock().unwrap(), vec![1, 2]);
    assert!(store.has(key(3)));
    assert_eq!(store.keys(), vec![key(3)]);
}
