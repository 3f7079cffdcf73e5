//! Prelude module - commonly used types for convenient import.
//!
//! Use `use strand_bus::prelude::*;` to import the types handlers and
//! transports need.

// Bus
pub use crate::{Bus, BusBuilder, ScopedBus};

// Handlers
pub use crate::{ActionId, Handler, HandlerError, HandlerResult, handler_fn};

// Errors
pub use crate::{BusError, BusResult, TransportError};

// Transports
pub use crate::{ExtensionPort, Inbox, PagePort};
