//! Host transport primitives the bridges run on.
//!
//! The host provides two point-to-point request/response channels that carry
//! string payloads. Each request gets exactly one response.
//!
//! - [`ExtensionPort`]: extension messaging between the hub (background) and
//!   every other context.
//! - [`PagePort`]: an in-page channel between nested frames and their top
//!   frame.

use std::sync::Arc;

use async_trait::async_trait;
use strand_core::PeerAddress;

use crate::error::TransportError;

/// Receives requests delivered to this context.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Handle one request and produce its response payload.
    async fn receive(&self, sender: PeerAddress, payload: String) -> String;
}

/// Extension messaging: the hub and its spokes.
#[async_trait]
pub trait ExtensionPort: Send + Sync {
    /// This context's address as other contexts see it.
    fn address(&self) -> PeerAddress;

    /// Whether this context is the hub.
    fn is_hub(&self) -> bool;

    /// Send a request to the hub.
    async fn send_to_hub(&self, payload: String) -> Result<String, TransportError>;

    /// Send a request to a specific context. Used by the hub.
    async fn send_to(&self, target: &PeerAddress, payload: String)
    -> Result<String, TransportError>;

    /// Install the inbox for incoming requests. Replaces any previous one.
    fn listen(&self, inbox: Arc<dyn Inbox>);
}

/// In-page channel: nested frames and their top frame.
#[async_trait]
pub trait PagePort: Send + Sync {
    /// This frame's address as other frames see it.
    fn address(&self) -> PeerAddress;

    /// Whether this is the top frame.
    fn is_top(&self) -> bool;

    /// Send a request to the top frame.
    async fn send_to_top(&self, payload: String) -> Result<String, TransportError>;

    /// Send a request to a nested frame. Used by the top frame.
    async fn send_to_frame(
        &self,
        target: &PeerAddress,
        payload: String,
    ) -> Result<String, TransportError>;

    /// Install the inbox for incoming requests. Replaces any previous one.
    fn listen(&self, inbox: Arc<dyn Inbox>);
}
