//! Retention and loading integration tests.
//!
//! Tests verify:
//! - Ideal tiles are always requested, even when a substitute exists
//! - Loaded ancestors and descendants stand in for missing tiles
//! - Missing and failing tiles degrade without error storms
//! - Removal aborts in-flight loads
//! - Pause, resume, reload and refresh
//! - Claims keep tiles active until the last handle is dropped

use std::time::Duration;

use tile_pyramid::{CacheOptions, SourceEvent, TilePyramidCache, TileState};

use super::test_utils::{drain_events, tile, view, MockTileSource};

fn cache(source: &MockTileSource) -> TilePyramidCache<MockTileSource> {
    TilePyramidCache::new(source.clone(), CacheOptions::default())
}

// =============================================================================
// Substitution
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_ancestor_stands_in_until_children_load() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let ancestor = tile(4, 3, 5);
    cache.update_with_ideal(&[ancestor], &view(0.0, 4.0));
    cache.settle().await;
    assert_eq!(source.load_count(), 1);

    let children = ancestor.children(14);
    cache.update_with_ideal(&children, &view(0.0, 5.0));

    // the substitute does not suppress the ideal requests
    assert_eq!(cache.len(), 5);
    assert_eq!(cache.renderable_ids(false), vec![ancestor]);

    cache.settle().await;
    assert_eq!(source.load_count(), 5);

    cache.update_with_ideal(&children, &view(0.0, 5.0));
    assert!(cache.get_tile(&ancestor).is_none());
    assert_eq!(cache.store_len(), 1);

    let mut expected = children.clone();
    expected.sort();
    assert_eq!(cache.renderable_ids(false), expected);
}

#[tokio::test(start_paused = true)]
async fn test_descendants_stand_in_when_zooming_out() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let parent = tile(4, 3, 5);
    let children = parent.children(14);
    cache.update_with_ideal(&children, &view(0.0, 5.0));
    cache.settle().await;

    cache.update_with_ideal(&[parent], &view(0.0, 4.0));
    assert_eq!(cache.len(), 5);
    assert_eq!(cache.renderable_ids(false).len(), 4);
    assert!(!cache.renderable_ids(false).contains(&parent));

    cache.settle().await;
    cache.update_with_ideal(&[parent], &view(0.0, 4.0));
    assert_eq!(cache.ids(), vec![parent]);
    assert_eq!(cache.store_len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_partial_descendants_still_climb_to_ancestor() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let grandparent = tile(3, 1, 2);
    let parent = tile(4, 3, 5);
    let children = parent.children(14);

    cache.update_with_ideal(&[grandparent], &view(0.0, 3.0));
    cache.settle().await;
    cache.update_with_ideal(&children[..2], &view(0.0, 5.0));
    cache.settle().await;

    // two of four children cannot cover the parent alone
    cache.update_with_ideal(&[parent], &view(0.0, 4.0));
    let ids = cache.ids();
    assert!(ids.contains(&children[0]));
    assert!(ids.contains(&children[1]));
    assert!(ids.contains(&grandparent));
}

// =============================================================================
// Missing And Failing Tiles
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_not_found_falls_back_without_error() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);
    let mut events = cache.subscribe();

    let parent = tile(5, 10, 12);
    cache.update_with_ideal(&[parent], &view(0.0, 5.0));
    cache.settle().await;

    let child = tile(6, 20, 24);
    source.set_not_found(&child);
    cache.update_with_ideal(&[child], &view(0.0, 6.0));
    cache.settle().await;

    assert_eq!(cache.get_tile(&child).map(|t| t.state()), Some(TileState::Errored));
    assert_eq!(cache.renderable_ids(false), vec![parent]);
    assert!(cache.loaded());

    let events = drain_events(&mut events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SourceEvent::TileError { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_not_found_requests_parent() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let child = tile(6, 20, 24);
    let parent = tile(5, 10, 12);
    source.set_not_found(&child);

    cache.update_with_ideal(&[child], &view(0.0, 6.0));
    cache.settle().await;

    // once the child is known missing its parent is fetched in its place
    assert_eq!(source.requests_for(&parent), 1);
    assert_eq!(cache.renderable_ids(false), vec![parent]);
}

#[tokio::test(start_paused = true)]
async fn test_failure_surfaces_one_error() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);
    let mut events = cache.subscribe();

    let broken = tile(5, 1, 1);
    source.set_failing(&broken);
    cache.update_with_ideal(&[broken], &view(0.0, 5.0));
    cache.settle().await;

    assert_eq!(cache.get_tile(&broken).map(|t| t.state()), Some(TileState::Errored));
    let errors: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SourceEvent::TileError { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        SourceEvent::TileError { id, message } => {
            assert_eq!(id, &broken);
            assert!(message.contains("mock failure"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // no retry storm; the parent is fetched as a substitute instead
    cache.update_with_ideal(&[broken], &view(0.0, 5.0));
    cache.settle().await;
    assert_eq!(source.requests_for(&broken), 1);
    assert_eq!(source.requests_for(&tile(4, 0, 0)), 1);
}

// =============================================================================
// Events And Aborts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_load_events() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);
    let mut events = cache.subscribe();

    let id = tile(5, 7, 7);
    cache.update_with_ideal(&[id], &view(0.0, 5.0));
    cache.settle().await;

    assert_eq!(
        drain_events(&mut events),
        vec![
            SourceEvent::TileLoading(id),
            SourceEvent::TileData(id),
            SourceEvent::Idle
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_removal_aborts_pending_load() {
    let source = MockTileSource::vector().with_latency(Duration::from_millis(100));
    let mut cache = cache(&source);
    let mut events = cache.subscribe();

    let id = tile(5, 7, 7);
    cache.update_with_ideal(&[id], &view(0.0, 5.0));
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.update_with_ideal(&[], &view(0.0, 5.0));

    assert!(cache.is_empty());
    assert_eq!(cache.store_len(), 0);
    assert_eq!(source.abort_count(), 1);
    assert_eq!(source.unload_count(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    cache.process_events();
    assert_eq!(source.load_count(), 0);

    assert_eq!(
        drain_events(&mut events),
        vec![
            SourceEvent::TileLoading(id),
            SourceEvent::TileAborted(id),
            SourceEvent::TileRemoved(id)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_viewport_update_uses_flat_coverage() {
    let source = MockTileSource::raster();
    let mut cache = cache(&source);

    cache.update(&view(0.0, 2.0));
    cache.settle().await;

    let ids = cache.renderable_ids(false);
    assert_eq!(ids.len(), 4);
    assert!(ids.iter().all(|id| id.overscaled_z() == 2));
    assert_eq!(cache.visible_coordinates().len(), 4);
}

// =============================================================================
// Pause, Reload And Refresh
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pause_defers_removal() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let id = tile(5, 7, 7);
    cache.update_with_ideal(&[id], &view(0.0, 5.0));
    cache.settle().await;

    cache.pause();
    cache.update_with_ideal(&[], &view(0.0, 5.0));
    assert!(cache.is_paused());
    assert!(cache.get_tile(&id).is_some());

    cache.resume();
    assert!(cache.get_tile(&id).is_none());
    assert_eq!(cache.store_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reload_while_paused_runs_on_resume() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let id = tile(5, 7, 7);
    cache.update_with_ideal(&[id], &view(0.0, 5.0));
    cache.settle().await;

    cache.pause();
    cache.reload(false);
    assert_eq!(cache.get_tile(&id).map(|t| t.state()), Some(TileState::Loaded));
    cache.settle().await;
    assert_eq!(source.request_count(), 1);

    cache.resume();
    assert_eq!(cache.get_tile(&id).map(|t| t.state()), Some(TileState::Reloading));
    cache.settle().await;
    assert_eq!(source.request_count(), 2);
    assert_eq!(cache.get_tile(&id).map(|t| t.state()), Some(TileState::Loaded));
}

#[tokio::test(start_paused = true)]
async fn test_reload_after_data_change_expires_everything() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let ok = tile(5, 7, 7);
    let broken = tile(5, 8, 7);
    source.set_failing(&broken);
    cache.update_with_ideal(&[ok, broken], &view(0.0, 5.0));
    cache.settle().await;

    cache.reload(false);
    assert_eq!(cache.get_tile(&broken).map(|t| t.state()), Some(TileState::Errored));
    cache.settle().await;
    assert_eq!(source.requests_for(&broken), 1);

    cache.reload(true);
    assert_eq!(cache.get_tile(&ok).map(|t| t.state()), Some(TileState::Expired));
    cache.settle().await;
    assert_eq!(source.requests_for(&broken), 2);
    assert!(cache.get_tile(&ok).unwrap().refreshed_upon_expiration());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_tiles_by_location() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let a = tile(5, 7, 7);
    let b = tile(5, 8, 7);
    cache.update_with_ideal(&[a, b], &view(0.0, 5.0));
    cache.settle().await;

    cache.refresh_tiles(&[*a.canonical()]);
    cache.settle().await;
    assert_eq!(source.requests_for(&a), 2);
    assert_eq!(source.requests_for(&b), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clear_tiles() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    cache.update_with_ideal(&[tile(5, 7, 7), tile(5, 8, 7)], &view(0.0, 5.0));
    cache.settle().await;
    cache.update_with_ideal(&[tile(5, 8, 7)], &view(0.0, 5.0));
    assert_eq!(cache.store_len(), 1);

    cache.pause();
    cache.clear_tiles();
    assert!(!cache.is_paused());
    assert!(cache.is_empty());
    assert_eq!(cache.store_len(), 0);
    assert_eq!(source.unload_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clear_tiles_drops_claimed_tiles() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let id = tile(5, 7, 7);
    cache.update_with_ideal(&[id], &view(0.0, 5.0));
    cache.settle().await;
    let claim = cache.claim_tile(&id).unwrap();

    cache.clear_tiles();
    assert!(cache.is_empty());
    assert_eq!(cache.store_len(), 0);
    assert_eq!(source.unload_count(), 1);

    // a stale claim keeps nothing alive
    drop(claim);
    cache.update_with_ideal(&[], &view(0.0, 5.0));
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_claim_lets_tile_leave() {
    let source = MockTileSource::vector();
    let mut cache = cache(&source);

    let id = tile(5, 7, 7);
    cache.update_with_ideal(&[id], &view(0.0, 5.0));
    cache.settle().await;

    let first = cache.claim_tile(&id).unwrap();
    let second = first.clone();
    cache.update_with_ideal(&[], &view(0.0, 5.0));
    assert_eq!(cache.get_tile(&id).map(|t| t.claim_count()), Some(2));

    drop(first);
    cache.update_with_ideal(&[], &view(0.0, 5.0));
    assert!(cache.get_tile(&id).is_some());

    drop(second);
    cache.update_with_ideal(&[], &view(0.0, 5.0));
    assert!(cache.get_tile(&id).is_none());
    assert_eq!(cache.store_len(), 1);
}
