//! Key-space naming for counters, deltas, snapshots and idempotency markers.
//!
//! Every component derives store keys through this module so writers,
//! readers and rollups agree on one layout. Inputs are used verbatim; `:`
//! is the reserved separator and callers must keep it out of namespaces,
//! counter names and node ids.
//!
//! Key forms:
//! - `counter:<ns>:<name>` — single-key counter
//! - `counter:<ns>:<name>:total` — consolidated total
//! - `counter:<ns>:<name>:deltas` — delta hash, field = node id
//! - `counter:<ns>:<name>:deltas:<node>` — flat per-node delta
//! - `counter:<ns>:<name>:snapshot` — reconciled snapshot
//! - `counter:<ns>:<name>:snapshot:lastSnapshotTs` — reconciliation instant
//! - `idempotency:<ns>:<name>:<token>` — mutation-observed marker

use crate::token::IdempotencyToken;

pub fn counter_key(namespace: &str, counter: &str) -> String {
    format!("counter:{namespace}:{counter}")
}

pub fn total_key(namespace: &str, counter: &str) -> String {
    format!("counter:{namespace}:{counter}:total")
}

pub fn deltas_key(namespace: &str, counter: &str) -> String {
    format!("counter:{namespace}:{counter}:deltas")
}

pub fn delta_key_for_node(namespace: &str, counter: &str, node_id: &str) -> String {
    format!("counter:{namespace}:{counter}:deltas:{node_id}")
}

pub fn snapshot_key(namespace: &str, counter: &str) -> String {
    format!("counter:{namespace}:{counter}:snapshot")
}

pub fn snapshot_ts_key(namespace: &str, counter: &str) -> String {
    format!("counter:{namespace}:{counter}:snapshot:lastSnapshotTs")
}

pub fn idempotency_key(namespace: &str, counter: &str, token: &IdempotencyToken) -> String {
    format!("idempotency:{namespace}:{counter}:{}", token.id())
}

/// Pattern matching one counter's flat per-node delta keys.
pub fn flat_delta_pattern(namespace: &str, counter: &str) -> String {
    format!("counter:{namespace}:{counter}:deltas:*")
}

/// Pattern matching every delta accumulator in a namespace, both the hash
/// layout (`…:deltas`) and the flat layout (`…:deltas:<node>`).
pub fn namespace_delta_pattern(namespace: &str) -> String {
    format!("counter:{namespace}:*:deltas*")
}

/// True when `key` is a hash-layout accumulator (`counter:<ns>:<name>:deltas`),
/// false for the flat layout with its node-id suffix.
pub fn is_hash_delta_key(key: &str) -> bool {
    key.split(':').count() == 4
}

/// Recover the counter name from a delta accumulator key. Returns `None`
/// for keys that do not follow the delta layout.
pub fn counter_name_from_delta_key(key: &str) -> Option<&str> {
    let parts: Vec<&str> = key.split(':').collect();
    match parts.as_slice() {
        ["counter", _, name, "deltas"] => Some(name),
        ["counter", _, name, "deltas", _] => Some(name),
        _ => None,
    }
}

/// Lenient integer parse used for all stored counter values: an absent or
/// malformed value reads as zero, matching the lazy-creation contract.
pub fn parse_i64(value: Option<&str>) -> i64 {
    value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0)
}
