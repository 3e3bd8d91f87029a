//! Two-node convergence for the eventually-consistent strategy in both
//! delta layouts, and the rollup interplay: reads agree before the
//! rollup, the accumulator disappears after it, and the value holds.

use std::sync::Arc;
use std::time::Duration;

use redis_tally::counters::EventuallyConsistentCounter;
use redis_tally::store::MemoryStore;
use redis_tally::{
    Consistency, Counter, DeltaLayout, IdempotencyToken, RollupScheduler, StoreConfig,
    StoreManager,
};

fn manager_over(store: &MemoryStore) -> Arc<StoreManager> {
    Arc::new(
        StoreManager::blocking_with_provider(StoreConfig::test(), Arc::new(store.clone())).unwrap(),
    )
}

fn node(manager: &Arc<StoreManager>, node_id: &str, layout: DeltaLayout) -> Box<dyn Counter> {
    Box::new(
        EventuallyConsistentCounter::with_layout(Arc::clone(manager), node_id, layout).unwrap(),
    )
}

fn two_nodes_converge_and_roll_up(layout: DeltaLayout) {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let node_a = node(&manager, "node-a", layout);
    let node_b = node(&manager, "node-b", layout);

    node_a.add("orders", "count", 3, None).unwrap();
    node_b.add("orders", "count", 4, None).unwrap();

    // both nodes see the combined pending deltas
    assert_eq!(node_a.get("orders", "count").unwrap().value(), 7);
    assert_eq!(node_b.get("orders", "count").unwrap().value(), 7);

    let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
    scheduler.run_once("orders");

    // the accumulator is gone and the total carries the value
    let total = manager
        .execute(|commands| commands.get("counter:orders:count:total"))
        .unwrap();
    assert_eq!(total, Some("7".to_string()));
    assert_eq!(node_a.get("orders", "count").unwrap().value(), 7);
    assert_eq!(node_b.get("orders", "count").unwrap().value(), 7);
}

#[test]
fn test_hash_layout_two_nodes() {
    two_nodes_converge_and_roll_up(DeltaLayout::Hash);
}

#[test]
fn test_flat_layout_two_nodes() {
    two_nodes_converge_and_roll_up(DeltaLayout::Flat);
}

#[test]
fn test_hash_layout_leaves_one_accumulator_key() {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let node_a = node(&manager, "node-a", DeltaLayout::Hash);
    let node_b = node(&manager, "node-b", DeltaLayout::Hash);

    node_a.add("orders", "count", 1, None).unwrap();
    node_b.add("orders", "count", 1, None).unwrap();

    let deltas = manager
        .execute(|commands| commands.hgetall("counter:orders:count:deltas"))
        .unwrap();
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas["node-a"], "1");
}

#[test]
fn test_flat_layout_writes_one_key_per_node() {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let node_a = node(&manager, "node-a", DeltaLayout::Flat);
    let node_b = node(&manager, "node-b", DeltaLayout::Flat);

    node_a.add("orders", "count", 2, None).unwrap();
    node_b.add("orders", "count", 5, None).unwrap();

    assert_eq!(
        store.peek("counter:orders:count:deltas:node-a"),
        Some("2".to_string())
    );
    assert_eq!(
        store.peek("counter:orders:count:deltas:node-b"),
        Some("5".to_string())
    );
}

#[test]
fn test_add_and_get_includes_other_writers() {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let node_a = node(&manager, "node-a", DeltaLayout::Hash);
    let node_b = node(&manager, "node-b", DeltaLayout::Hash);

    node_a.add("orders", "count", 3, None).unwrap();

    // add-then-get: node B's result includes node A's pending delta
    let result = node_b.add_and_get("orders", "count", 4, None).unwrap();
    assert_eq!(result.value(), 7);
    assert_eq!(result.consistency(), Consistency::EventuallyConsistent);
}

#[test]
fn test_reads_are_monotone_under_positive_adds() {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let counter = node(&manager, "node-a", DeltaLayout::Hash);

    let mut previous = counter.get("orders", "count").unwrap().value();
    for delta in [5, 1, 3] {
        counter.add("orders", "count", delta, None).unwrap();
        let observed = counter.get("orders", "count").unwrap().value();
        assert!(observed >= previous + delta);
        previous = observed;
    }
}

#[test]
fn test_tokened_adds_sum_after_rollup() {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let counter = node(&manager, "node-a", DeltaLayout::Hash);

    let deltas = [4, -1, 7, 2];
    for delta in deltas {
        let token = IdempotencyToken::generate();
        counter.add("orders", "count", delta, Some(&token)).unwrap();
    }

    let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
    scheduler.run_once("orders");

    let expected: i64 = deltas.iter().sum();
    assert_eq!(counter.get("orders", "count").unwrap().value(), expected);
}

#[test]
fn test_idempotent_add_with_token() {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let counter = node(&manager, "node-a", DeltaLayout::Hash);

    let token = IdempotencyToken::generate();
    counter.add("orders", "count", 6, Some(&token)).unwrap();
    counter.add("orders", "count", 6, Some(&token)).unwrap();

    assert_eq!(counter.get("orders", "count").unwrap().value(), 6);
}

#[test]
fn test_clear_drops_total_and_both_delta_layouts() {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let hash_node = node(&manager, "node-a", DeltaLayout::Hash);
    let flat_node = node(&manager, "node-b", DeltaLayout::Flat);

    hash_node.add("orders", "count", 3, None).unwrap();
    flat_node.add("orders", "count", 4, None).unwrap();

    let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
    scheduler.run_once("orders");
    hash_node.add("orders", "count", 1, None).unwrap();
    flat_node.add("orders", "count", 1, None).unwrap();

    hash_node.clear("orders", "count", None).unwrap();

    assert_eq!(hash_node.get("orders", "count").unwrap().value(), 0);
    assert_eq!(flat_node.get("orders", "count").unwrap().value(), 0);
    assert_eq!(store.peek("counter:orders:count:deltas:node-b"), None);
}

#[test]
fn test_value_survives_clear_then_new_adds_and_rollup() {
    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let counter = node(&manager, "node-a", DeltaLayout::Hash);

    counter.add("orders", "count", 9, None).unwrap();
    counter.clear("orders", "count", None).unwrap();
    counter.add("orders", "count", 2, None).unwrap();

    let scheduler = RollupScheduler::new(Arc::clone(&manager), Duration::from_secs(60));
    scheduler.run_once("orders");

    assert_eq!(counter.get("orders", "count").unwrap().value(), 2);
}
