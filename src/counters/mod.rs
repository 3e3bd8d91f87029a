//! The three counter strategies and their factory.
//!
//! Each strategy exists in a blocking form (implementing
//! [`crate::core::Counter`]) and a non-blocking form (implementing
//! [`crate::core::AsyncCounter`]); all six share the key-space contract in
//! [`crate::keys`] and the idempotency protocol implemented here.

pub mod accurate;
pub mod best_effort;
pub mod eventual;
pub mod factory;

use std::time::Duration;

pub use accurate::{AccurateAsyncCounter, AccurateCounter};
pub use best_effort::{BestEffortAsyncCounter, BestEffortCounter};
pub use eventual::{DeltaLayout, EventuallyConsistentAsyncCounter, EventuallyConsistentCounter};
pub use factory::{CounterFactory, CounterHandle, ExecutionMode};

use crate::core::CounterError;
use crate::store::{AsyncCommands, StoreError, SyncCommands};

/// Page size for cursor scans over flat delta keys.
pub(crate) const SCAN_PAGE: usize = 200;

/// Reject blank identifiers and the reserved `:` separator before any
/// store traffic.
pub(crate) fn validate_identifiers(namespace: &str, counter: &str) -> Result<(), CounterError> {
    validate_identifier(namespace, "namespace")?;
    validate_identifier(counter, "counter name")
}

pub(crate) fn validate_identifier(value: &str, what: &str) -> Result<(), CounterError> {
    if value.trim().is_empty() {
        return Err(CounterError::InvalidArgument(format!(
            "{what} must not be blank"
        )));
    }
    if value.contains(':') {
        return Err(CounterError::InvalidArgument(format!(
            "{what} must not contain the reserved separator ':'"
        )));
    }
    Ok(())
}

/// Idempotency gate, blocking side: returns `true` when the marker already
/// exists (the mutation must be skipped), otherwise writes the marker and
/// returns `false`. Marker write and mutation are two separate store
/// writes; a crash between them leaves the marker without its mutation.
pub(crate) fn marker_hit_or_set(
    commands: &mut SyncCommands<'_>,
    marker_key: &str,
    ttl: Option<Duration>,
) -> Result<bool, StoreError> {
    if commands.exists(marker_key)? > 0 {
        return Ok(true);
    }
    match ttl {
        Some(ttl) => commands.set_with_ttl(marker_key, "1", ttl)?,
        None => commands.set(marker_key, "1")?,
    }
    Ok(false)
}

/// Idempotency gate, non-blocking side.
pub(crate) async fn marker_hit_or_set_async(
    conn: &mut AsyncCommands,
    marker_key: &str,
    ttl: Option<Duration>,
) -> Result<bool, StoreError> {
    if conn.exists(marker_key).await? > 0 {
        return Ok(true);
    }
    match ttl {
        Some(ttl) => conn.set_with_ttl(marker_key, "1", ttl).await?,
        None => conn.set(marker_key, "1").await?,
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifiers("orders", "count").is_ok());
        assert!(validate_identifiers("", "count").is_err());
        assert!(validate_identifiers("orders", "  ").is_err());
        assert!(validate_identifiers("or:ders", "count").is_err());
        assert!(validate_identifiers("orders", "co:unt").is_err());
    }
}
