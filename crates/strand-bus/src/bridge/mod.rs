//! Bridges: moving bus traffic across context boundaries.
//!
//! Two transports sit under the bus and behave the same way:
//!
//! - the **extension bridge** connects every context to the hub over the
//!   host's extension messaging;
//! - the **page bridge** connects nested page frames to their top frame over
//!   an in-page channel. The top frame re-dispatches through its own
//!   extension bridge, so a nested frame reaches the hub in two hops.
//!
//! A context sends requests *upstream* (toward the hub) and receives requests
//! from *downstream* contexts, which register proxies with it. Which side of
//! a port is which follows from [`ExtensionPort::is_hub`] and
//! [`PagePort::is_top`].

mod inbox;

use std::panic::Location as CallSite;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value as Json;
use strand_core::{PeerAddress, PeerId, Value};
use tracing::{trace, warn};

use crate::action::{PeerHandle, Via};
use crate::bus::BusInner;
use crate::envelope::{BLOB_RESOLVE, Envelope, PING, Reply};
use crate::error::{BusError, BusResult, TransportError};
use crate::liveness::Probe;
use crate::serializer::BlobSource;
use crate::transport::{ExtensionPort, Inbox, PagePort};

pub(crate) use inbox::LinkInbox;

/// The ports a context was started with.
pub(crate) struct Links {
    extension: Option<Arc<dyn ExtensionPort>>,
    page: Option<Arc<dyn PagePort>>,
}

impl Links {
    pub(crate) fn new(
        extension: Option<Arc<dyn ExtensionPort>>,
        page: Option<Arc<dyn PagePort>>,
    ) -> Self {
        Self { extension, page }
    }

    /// The transport toward the hub, if this context is not the hub.
    ///
    /// A nested frame goes through its top frame even if it could also talk
    /// extension messaging.
    pub(crate) fn upstream(&self) -> Option<Via> {
        if let Some(page) = &self.page
            && !page.is_top()
        {
            return Some(Via::Page);
        }
        if let Some(extension) = &self.extension
            && !extension.is_hub()
        {
            return Some(Via::Extension);
        }
        None
    }

    /// Install an inbox on every port. `make` gets the transport and whether
    /// requests arriving on it come from downstream.
    pub(crate) fn listen<F>(&self, make: F)
    where
        F: Fn(Via, bool) -> Arc<dyn Inbox>,
    {
        if let Some(extension) = &self.extension {
            extension.listen(make(Via::Extension, extension.is_hub()));
        }
        if let Some(page) = &self.page {
            page.listen(make(Via::Page, page.is_top()));
        }
    }

    /// Deliver `payload` upstream (`to == None`) or to a downstream peer.
    pub(crate) async fn request(
        &self,
        via: Via,
        to: Option<&PeerAddress>,
        payload: String,
    ) -> Result<String, TransportError> {
        match (via, to) {
            (Via::Extension, to) => {
                let port = self
                    .extension
                    .as_ref()
                    .ok_or_else(|| TransportError::Unreachable("extension port".into()))?;
                match to {
                    None => port.send_to_hub(payload).await,
                    Some(target) => port.send_to(target, payload).await,
                }
            },
            (Via::Page, to) => {
                let port = self
                    .page
                    .as_ref()
                    .ok_or_else(|| TransportError::Unreachable("page port".into()))?;
                match to {
                    None => port.send_to_top(payload).await,
                    Some(target) => port.send_to_frame(target, payload).await,
                }
            },
        }
    }
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) via: Via,
    pub(crate) to: Option<PeerAddress>,
}

impl Route {
    pub(crate) fn upstream(via: Via) -> Self {
        Self { via, to: None }
    }

    pub(crate) fn peer(via: Via, address: PeerAddress) -> Self {
        Self {
            via,
            to: Some(address),
        }
    }
}

impl BusInner {
    /// Call `name` in the context at `route` and decode its answer.
    ///
    /// A transport failure is logged and reported as no answer.
    pub(crate) async fn call(
        &self,
        route: &Route,
        name: &str,
        args: &[Value],
        site: &'static CallSite<'static>,
    ) -> BusResult<Option<Value>> {
        let envelope = Envelope::new(name, self.serializer.serialize_args(args)?, self.peer);
        trace!(name, id = %envelope.id, to = ?route.to, "forwarding");
        let raw = match self
            .links
            .request(route.via, route.to.as_ref(), envelope.encode()?)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(name, to = ?route.to, error = %e, "no answer from remote context");
                return Ok(None);
            },
        };

        match Reply::decode(&raw)? {
            Reply::Absent => Ok(None),
            Reply::Value { payload } => {
                let blobs = RouteBlobs { bus: self, route };
                Ok(Some(self.serializer.deserialize(payload, &blobs).await?))
            },
            Reply::Error { message } => Err(BusError::Handler {
                name: name.to_owned(),
                message,
                site,
            }),
        }
    }
}

/// Fetches blobs from the context a payload came from.
pub(crate) struct RouteBlobs<'a> {
    pub(crate) bus: &'a BusInner,
    pub(crate) route: &'a Route,
}

#[async_trait]
impl BlobSource for RouteBlobs<'_> {
    async fn fetch(&self, id: &str) -> BusResult<Vec<u8>> {
        let envelope = Envelope::new(BLOB_RESOLVE, vec![Json::String(id.to_owned())], self.bus.peer);
        let raw = self
            .bus
            .links
            .request(self.route.via, self.route.to.as_ref(), envelope.encode()?)
            .await
            .map_err(|e| BusError::Protocol(format!("blob {id} unavailable: {e}")))?;
        match Reply::decode(&raw)? {
            Reply::Value { payload } => Value::from_json(payload)?
                .as_bytes()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| BusError::Protocol(format!("blob {id} did not resolve to bytes"))),
            Reply::Error { message } => Err(BusError::Protocol(message)),
            Reply::Absent => Err(BusError::Protocol(format!("unknown blob {id}"))),
        }
    }
}

/// Pings peers over whichever transport reaches them.
pub(crate) struct BusProbe {
    bus: Weak<BusInner>,
}

impl BusProbe {
    pub(crate) fn new(bus: Weak<BusInner>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Probe for BusProbe {
    async fn ping(&self, target: &PeerHandle) -> Option<PeerId> {
        let bus = self.bus.upgrade()?;
        let payload = Envelope::new(PING, Vec::new(), bus.peer).encode().ok()?;
        let raw = bus
            .links
            .request(target.via, Some(&target.address), payload)
            .await
            .ok()?;
        match Reply::decode(&raw).ok()? {
            Reply::Value {
                payload: Json::String(peer),
            } => peer.parse().ok(),
            _ => None,
        }
    }
}
