//! Strand Storage - persistence primitive for Strand state.
//!
//! The state engine never talks to a concrete database. It consumes a
//! [`KvStore`]: byte values under `(namespace, key)` pairs. The host decides
//! where those bytes live; [`MemoryKvStore`] covers tests and ephemeral
//! contexts.
//!
//! On top of the raw store:
//! - [`ScopedKvStore`] pre-binds a namespace and adds JSON helpers
//! - [`RecordStore`] maps a [`Location`](strand_core::Location) to its
//!   persisted [`Record`]

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod kv;
pub mod record;

pub use error::{StorageError, StorageResult};
pub use kv::{KvStore, MemoryKvStore, ScopedKvStore};
pub use record::{Record, RecordStore};
