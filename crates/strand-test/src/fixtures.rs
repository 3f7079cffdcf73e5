//! Test fixtures for common types.

use std::sync::Arc;
use std::time::Duration;

use strand_bus::Bus;
use strand_core::{Location, Value};
use strand_state::{ConnectOptions, ModelRegistry, Store, StoreSettings};
use strand_storage::{MemoryKvStore, RecordStore};

/// Parse a location.
///
/// # Panics
///
/// Panics if `path` is not a valid location.
#[must_use]
pub fn test_location(path: &str) -> Location {
    path.parse().expect("invalid test location")
}

/// Options that seed `{"count": 0}`.
#[must_use]
pub fn counter_options() -> ConnectOptions {
    ConnectOptions::new().initial(|| Value::from_iter([("count", 0)]))
}

/// Fresh in-memory record storage.
#[must_use]
pub fn memory_records() -> RecordStore {
    RecordStore::new(Arc::new(MemoryKvStore::new()))
}

/// An authoritative store over `bus` with in-memory records.
#[must_use]
pub fn hub_store(bus: Bus) -> Store {
    Store::authoritative(
        bus,
        memory_records(),
        Arc::new(ModelRegistry::new()),
        StoreSettings::default(),
    )
}

/// A dependent store over `bus`.
#[must_use]
pub fn dependent_store(bus: Bus) -> Store {
    Store::dependent(
        bus,
        Arc::new(ModelRegistry::new()),
        StoreSettings::default(),
    )
}

/// Poll `condition` until it holds or `timeout` passes.
///
/// Returns whether the condition held.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_fixture() {
        assert_eq!(test_location("proj/s/x").to_string(), "proj/s/x");
    }

    #[tokio::test]
    async fn test_counter_options_seed() {
        let store = hub_store(Bus::local());
        let state = store
            .connect(&test_location("proj/s/x"), counter_options())
            .await
            .unwrap();
        assert_eq!(state.get("count"), Some(Value::Int(0)));
    }

    #[tokio::test]
    async fn test_eventually_times_out() {
        assert!(!eventually(Duration::from_millis(20), || false).await);
        assert!(eventually(Duration::from_millis(20), || true).await);
    }
}
