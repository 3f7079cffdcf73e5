//! Strand Bus - cross-context publish/subscribe and RPC.
//!
//! A browser extension runs in several isolated contexts: the background
//! hub, content scripts, page frames, popups and panels. This crate makes a
//! handler registered in any of them callable from all of them.
//!
//! - [`Bus`]: `on`/`off`/`once`/`send`/`emit` plus named signals
//! - [`ActionRegistry`]: local and proxy actions, at most one proxy per
//!   `(name, peer)`
//! - [`Serializer`]: JSON wire form with blob references resolved back to
//!   the sender
//! - Bridges over the host's [`ExtensionPort`] and [`PagePort`]
//! - [`Liveness`]: periodic probing that drops proxies of dead peers
//!
//! # Example
//!
//! ```rust
//! use strand_bus::Bus;
//! use strand_core::Value;
//!
//! # async fn example() {
//! let bus = Bus::local();
//! bus.on("ping", |_| async { Ok(Some(Value::from("pong"))) });
//!
//! let reply = bus.send("ping", vec![]).await.unwrap();
//! assert_eq!(reply, Some(Value::from("pong")));
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod action;
pub mod envelope;
pub mod error;
pub mod liveness;
pub mod prelude;
pub mod serializer;
pub mod transport;

mod bridge;
mod bus;
mod scoped;

pub use action::{
    Action, ActionId, ActionRegistry, Handler, HandlerFuture, HandlerResult, PeerHandle, Via,
    handler_fn,
};
pub use bus::{Bus, BusBuilder};
pub use error::{BusError, BusResult, HandlerError, TransportError};
pub use liveness::{DEFAULT_LIVENESS_INTERVAL, Disposer, Liveness, Probe};
pub use scoped::{SCOPE_SEPARATOR, ScopedBus};
pub use serializer::{BlobSource, BlobTable, DEFAULT_BLOB_IDLE_TIMEOUT, Serializer};
pub use transport::{ExtensionPort, Inbox, PagePort};
