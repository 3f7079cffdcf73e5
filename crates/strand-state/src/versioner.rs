//! Schema migrations.
//!
//! A [`Versioner`] maps target versions to migration steps. A step receives
//! the instance as it was before the step and rewrites it in place. Steps run
//! in ascending order starting above the stored version, so a step never runs
//! twice for the same instance.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use strand_core::value::Map;

/// Why a migration step gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MigrationError(String);

impl MigrationError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for MigrationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for MigrationError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// One migration step.
pub type MigrationFn = Arc<dyn Fn(&mut Map) -> Result<(), MigrationError> + Send + Sync>;

/// Ordered migration steps keyed by the version they upgrade to.
#[derive(Clone, Default)]
pub struct Versioner {
    steps: BTreeMap<u64, MigrationFn>,
}

impl fmt::Debug for Versioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioner")
            .field("versions", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Versioner {
    /// A versioner with no steps. Instances stay at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the step that upgrades an instance to `version`.
    ///
    /// Registering the same version twice keeps the later step.
    #[must_use]
    pub fn step<F>(mut self, version: u64, step: F) -> Self
    where
        F: Fn(&mut Map) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        self.steps.insert(version, Arc::new(step));
        self
    }

    /// The highest declared version, 0 without steps.
    #[must_use]
    pub fn latest(&self) -> u64 {
        self.steps.keys().next_back().copied().unwrap_or(0)
    }

    /// Steps above `current`, lowest first.
    pub fn pending(&self, current: u64) -> impl Iterator<Item = (u64, &MigrationFn)> + '_ {
        self.steps
            .range((std::ops::Bound::Excluded(current), std::ops::Bound::Unbounded))
            .map(|(version, step)| (*version, step))
    }

    /// Whether no steps are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_latest_is_highest_version() {
        let versioner = Versioner::new()
            .step(3, |_| Ok(()))
            .step(1, |_| Ok(()))
            .step(2, |_| Ok(()));
        assert_eq!(versioner.latest(), 3);
        assert_eq!(Versioner::new().latest(), 0);
    }

    #[test]
    fn test_pending_skips_applied_steps_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut versioner = Versioner::new();
        for version in [4, 1, 2, 7] {
            let seen = Arc::clone(&seen);
            versioner = versioner.step(version, move |_| {
                seen.lock().unwrap().push(version);
                Ok(())
            });
        }

        let mut map = Map::new();
        for (_, step) in versioner.pending(2) {
            step(&mut map).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![4, 7]);
        assert_eq!(versioner.pending(7).count(), 0);
    }

    #[test]
    fn test_step_errors_carry_message() {
        let versioner = Versioner::new().step(1, |_| Err("missing field".into()));
        let (_, step) = versioner.pending(0).next().unwrap();
        assert_eq!(step(&mut Map::new()).unwrap_err().to_string(), "missing field");
    }
}
