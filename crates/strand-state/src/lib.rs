//! Strand State - CRDT-backed reactive state shared across contexts.
//!
//! Each [`Location`](strand_core::Location) names one state instance. The
//! instance lives in an automerge document in every context that connects
//! to it; the hub context owns the persisted copy and hands out write leases
//! so transactions from different contexts never lose each other's writes.
//!
//! - [`Store`]: `connect`/`disconnect`/`transaction`/`list`/`destroy`
//! - [`State`]: reads, revision watching and transactions on one instance
//! - [`NodeRef`]/[`NodeMut`]: the observable graph over the document
//! - [`ModelDescriptor`]/[`ModelRegistry`]: typed, hooked map instances
//! - [`Versioner`]: ordered schema migrations
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use strand_bus::Bus;
//! use strand_core::Value;
//! use strand_state::{ConnectOptions, ModelRegistry, Store, StoreSettings};
//! use strand_storage::{MemoryKvStore, RecordStore};
//!
//! # async fn example() -> strand_state::StateResult<()> {
//! let store = Store::authoritative(
//!     Bus::local(),
//!     RecordStore::new(Arc::new(MemoryKvStore::new())),
//!     Arc::new(ModelRegistry::new()),
//!     StoreSettings::default(),
//! );
//! let location = "proj/s/counter".parse()?;
//! let options = ConnectOptions::new().initial(|| Value::from_iter([("n", 0)]));
//! let state = store.connect(&location, options).await?;
//!
//! state
//!     .transaction(|root| {
//!         let n = root.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
//!         root.set("n", n.saturating_add(1))
//!     })
//!     .await?;
//! assert_eq!(state.get("n"), Some(Value::Int(1)));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod connector;
pub mod error;
pub mod model;
pub mod node;
pub mod state;
pub mod store;
pub mod versioner;

mod doc;
mod lease;

pub use connector::{ConnectOptions, InitialFn};
pub use error::{StateError, StateResult};
pub use lease::DEFAULT_LEASE_TIMEOUT;
pub use model::{MODEL_KEY, ModelDescriptor, ModelHook, ModelInstance, ModelRegistry, VERSION_KEY};
pub use node::{NodeKind, NodeMut, NodeRef, PathSegment};
pub use state::{State, UPDATE};
pub use store::{DESTROY, LIST, LOCK, Store, StoreSettings, UNLOCK};
pub use versioner::{MigrationError, MigrationFn, Versioner};
