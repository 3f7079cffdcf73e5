//! Commonly used test helpers.
//!
//! ```rust,ignore
//! use strand_test::prelude::*;
//! ```

pub use crate::fixtures::*;
pub use crate::harness::*;
pub use crate::host::*;
