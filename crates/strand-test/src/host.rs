//! In-process stand-in for the browser's messaging primitives.
//!
//! [`LocalHost`] plays the role of the browser: it knows which contexts are
//! alive, routes extension messages between the hub and its spokes, and
//! routes in-page messages between nested frames and their top frame. Every
//! request is handled on its own spawned task, like a real host delivering
//! to another process.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use strand_bus::{ExtensionPort, Inbox, PagePort, TransportError};
use strand_core::PeerAddress;
use tracing::trace;

#[derive(Default)]
struct HostInner {
    hub: Mutex<Option<PeerAddress>>,
    extension: DashMap<PeerAddress, Arc<dyn Inbox>>,
    page: DashMap<PeerAddress, Arc<dyn Inbox>>,
}

impl HostInner {
    fn hub(&self) -> Option<PeerAddress> {
        self.hub
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn deliver(
    channel: &DashMap<PeerAddress, Arc<dyn Inbox>>,
    from: &PeerAddress,
    to: &PeerAddress,
    payload: String,
) -> Result<String, TransportError> {
    let inbox = channel
        .get(to)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;
    trace!(%from, %to, bytes = payload.len(), "delivering");
    let from = from.clone();
    tokio::spawn(async move { inbox.receive(from, payload).await })
        .await
        .map_err(|_| TransportError::Closed)
}

/// A simulated browser.
///
/// Cloning is cheap; clones share the same contexts.
#[derive(Clone, Default)]
pub struct LocalHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for LocalHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHost")
            .field("hub", &self.inner.hub())
            .field("extension", &self.inner.extension.len())
            .field("page", &self.inner.page.len())
            .finish()
    }
}

impl LocalHost {
    /// An empty browser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The background context's extension port. Replaces any previous hub.
    #[must_use]
    pub fn hub(&self, address: &str) -> Arc<LocalExtensionPort> {
        let address = PeerAddress::from(address);
        *self.inner.hub.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.clone());
        Arc::new(LocalExtensionPort {
            host: Arc::clone(&self.inner),
            address,
            hub: true,
        })
    }

    /// Extension port of any non-background context.
    #[must_use]
    pub fn spoke(&self, address: &str) -> Arc<LocalExtensionPort> {
        Arc::new(LocalExtensionPort {
            host: Arc::clone(&self.inner),
            address: PeerAddress::from(address),
            hub: false,
        })
    }

    /// In-page port of a top frame.
    #[must_use]
    pub fn top_frame(&self, address: &str) -> Arc<LocalPagePort> {
        let address = PeerAddress::from(address);
        Arc::new(LocalPagePort {
            host: Arc::clone(&self.inner),
            top: address.clone(),
            address,
        })
    }

    /// In-page port of a frame nested under `top`.
    #[must_use]
    pub fn nested_frame(&self, top: &str, address: &str) -> Arc<LocalPagePort> {
        Arc::new(LocalPagePort {
            host: Arc::clone(&self.inner),
            top: PeerAddress::from(top),
            address: PeerAddress::from(address),
        })
    }

    /// Tear down the context at `address`, as when a tab closes or a frame
    /// navigates away. Later sends to it fail as unreachable.
    ///
    /// Returns whether anything was listening there.
    pub fn kill(&self, address: &str) -> bool {
        let address = PeerAddress::from(address);
        let extension = self.inner.extension.remove(&address).is_some();
        let page = self.inner.page.remove(&address).is_some();
        trace!(%address, "context killed");
        extension || page
    }

    /// Whether a context is listening at `address`.
    #[must_use]
    pub fn is_alive(&self, address: &str) -> bool {
        let address = PeerAddress::from(address);
        self.inner.extension.contains_key(&address) || self.inner.page.contains_key(&address)
    }
}

/// Extension messaging endpoint of one simulated context.
pub struct LocalExtensionPort {
    host: Arc<HostInner>,
    address: PeerAddress,
    hub: bool,
}

impl std::fmt::Debug for LocalExtensionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExtensionPort")
            .field("address", &self.address)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ExtensionPort for LocalExtensionPort {
    fn address(&self) -> PeerAddress {
        self.address.clone()
    }

    fn is_hub(&self) -> bool {
        self.hub
    }

    async fn send_to_hub(&self, payload: String) -> Result<String, TransportError> {
        let hub = self
            .host
            .hub()
            .ok_or_else(|| TransportError::Unreachable("background".into()))?;
        deliver(&self.host.extension, &self.address, &hub, payload).await
    }

    async fn send_to(
        &self,
        target: &PeerAddress,
        payload: String,
    ) -> Result<String, TransportError> {
        deliver(&self.host.extension, &self.address, target, payload).await
    }

    fn listen(&self, inbox: Arc<dyn Inbox>) {
        self.host.extension.insert(self.address.clone(), inbox);
    }
}

/// In-page endpoint of one simulated frame.
pub struct LocalPagePort {
    host: Arc<HostInner>,
    address: PeerAddress,
    top: PeerAddress,
}

impl std::fmt::Debug for LocalPagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPagePort")
            .field("address", &self.address)
            .field("top", &self.top)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PagePort for LocalPagePort {
    fn address(&self) -> PeerAddress {
        self.address.clone()
    }

    fn is_top(&self) -> bool {
        self.address == self.top
    }

    async fn send_to_top(&self, payload: String) -> Result<String, TransportError> {
        deliver(&self.host.page, &self.address, &self.top, payload).await
    }

    async fn send_to_frame(
        &self,
        target: &PeerAddress,
        payload: String,
    ) -> Result<String, TransportError> {
        deliver(&self.host.page, &self.address, target, payload).await
    }

    fn listen(&self, inbox: Arc<dyn Inbox>) {
        self.host.page.insert(self.address.clone(), inbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Inbox for Echo {
        async fn receive(&self, sender: PeerAddress, payload: String) -> String {
            format!("{sender}:{payload}")
        }
    }

    #[tokio::test]
    async fn test_spoke_reaches_hub() {
        let host = LocalHost::new();
        let hub = host.hub("background");
        hub.listen(Arc::new(Echo));
        let spoke = host.spoke("tab-1");
        assert_eq!(spoke.send_to_hub("hi".into()).await.unwrap(), "tab-1:hi");
    }

    #[tokio::test]
    async fn test_killed_context_is_unreachable() {
        let host = LocalHost::new();
        let hub = host.hub("background");
        let spoke = host.spoke("tab-1");
        spoke.listen(Arc::new(Echo));
        assert!(host.is_alive("tab-1"));

        assert!(host.kill("tab-1"));
        let err = hub.send_to(&"tab-1".into(), "x".into()).await.unwrap_err();
        assert!(err.to_string().contains("receiving end does not exist"));
        assert!(!host.kill("tab-1"));
    }

    #[tokio::test]
    async fn test_no_hub_is_unreachable() {
        let host = LocalHost::new();
        let spoke = host.spoke("popup");
        assert!(matches!(
            spoke.send_to_hub("x".into()).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_frames_talk_through_top() {
        let host = LocalHost::new();
        let top = host.top_frame("tab-1");
        let nested = host.nested_frame("tab-1", "tab-1/frame-2");
        assert!(top.is_top());
        assert!(!nested.is_top());

        top.listen(Arc::new(Echo));
        nested.listen(Arc::new(Echo));
        assert_eq!(
            nested.send_to_top("up".into()).await.unwrap(),
            "tab-1/frame-2:up"
        );
        assert_eq!(
            top.send_to_frame(&"tab-1/frame-2".into(), "down".into())
                .await
                .unwrap(),
            "tab-1:down"
        );
    }
}
