//! Strand Test - simulated browser host and shared test utilities.
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! strand-test.workspace = true
//! ```
//!
//! Then wire contexts over a [`LocalHost`]:
//!
//! ```rust,ignore
//! use strand_bus::Bus;
//! use strand_test::LocalHost;
//!
//! #[tokio::test]
//! async fn test_spoke_calls_hub() {
//!     let host = LocalHost::new();
//!     let hub = Bus::builder().extension_port(host.hub("background")).build();
//!     let tab = Bus::builder().extension_port(host.spoke("tab-1")).build();
//!     hub.on("ping", |_| async { Ok(Some("pong".into())) });
//!     tab.settle().await;
//!     assert!(tab.send("ping", vec![]).await.unwrap().is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod host;

pub use fixtures::*;
pub use harness::*;
pub use host::*;
