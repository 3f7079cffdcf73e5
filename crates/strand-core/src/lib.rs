//! Strand Core - shared types and primitives for the Strand extension runtime.
//!
//! This crate provides:
//! - [`Value`], the plain-data model every context exchanges and persists
//! - [`Location`], the path-like key identifying one state instance
//! - Peer identity types ([`PeerId`], [`PeerAddress`], [`ContextKind`])
//! - [`Queue`] and [`KeyedMutex`], the per-key ordering primitives used by
//!   every stateful operation that must not interleave
//!
//! Nothing in here talks to another context. The bus and the state engine
//! build on these types.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod location;
pub mod peer;
pub mod queue;
pub mod value;

pub use error::{CoreError, CoreResult};
pub use location::Location;
pub use peer::{ContextKind, PeerAddress, PeerId, Upstream};
pub use queue::{KeyedGuard, KeyedMutex, Queue};
pub use value::{Map, Value};
