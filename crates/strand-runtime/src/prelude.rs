//! Commonly used types for code running inside a context.
//!
//! ```rust,ignore
//! use strand_runtime::prelude::*;
//! ```

pub use crate::{Runtime, RuntimeBuilder, RuntimeError, RuntimeResult};

pub use strand_bus::{Bus, BusError, HandlerError, HandlerResult, ScopedBus};
pub use strand_config::Config;
pub use strand_core::{ContextKind, Location, Value};
pub use strand_state::{ConnectOptions, State, StateError, StateResult, Store};
