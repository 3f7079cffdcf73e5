//! Handling requests that arrive on a port.

use std::panic::Location as CallSite;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value as Json;
use strand_core::{PeerAddress, Value};
use tracing::{debug, trace, warn};

use super::{Route, RouteBlobs};
use crate::action::{Handler, PeerHandle, Scope, Via, handler_fn};
use crate::bus::BusInner;
use crate::envelope::{BLOB_RESOLVE, Envelope, PING, PROXY_OFF, PROXY_ON, PROXY_RESET, Reply};
use crate::error::{BusError, HandlerError};
use crate::transport::Inbox;

/// The inbox a bus installs on one of its ports.
pub(crate) struct LinkInbox {
    bus: Weak<BusInner>,
    via: Via,
    downstream: bool,
}

impl LinkInbox {
    pub(crate) fn new(bus: Weak<BusInner>, via: Via, downstream: bool) -> Self {
        Self {
            bus,
            via,
            downstream,
        }
    }
}

#[async_trait]
impl Inbox for LinkInbox {
    async fn receive(&self, sender: PeerAddress, payload: String) -> String {
        let Some(bus) = self.bus.upgrade() else {
            return Reply::Error {
                message: "context has shut down".into(),
            }
            .encode();
        };
        bus.handle_inbound(self.via, self.downstream, sender, &payload)
            .await
            .encode()
    }
}

/// A proxy action's handler: forward the call to the peer that registered it.
fn proxy_handler(bus: Weak<BusInner>, name: String, target: &PeerHandle) -> Handler {
    let route = Route::peer(target.via, target.address.clone());
    handler_fn(move |args| {
        let bus = bus.clone();
        let name = name.clone();
        let route = route.clone();
        async move {
            let Some(bus) = bus.upgrade() else {
                return Ok(None);
            };
            bus.call(&route, &name, &args, CallSite::caller())
                .await
                .map_err(HandlerError::from)
        }
    })
}

fn failure(e: &BusError) -> Reply {
    Reply::Error {
        message: e.wire_message(),
    }
}

impl BusInner {
    pub(crate) async fn handle_inbound(
        self: &Arc<Self>,
        via: Via,
        downstream: bool,
        sender: PeerAddress,
        payload: &str,
    ) -> Reply {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%sender, error = %e, "dropping malformed request");
                return failure(&e);
            },
        };
        trace!(%sender, name = %envelope.name, id = %envelope.id, downstream, "inbound");

        if envelope.is_admin() {
            return self.handle_admin(via, downstream, sender, &envelope).await;
        }

        let route = if downstream {
            Route::peer(via, sender.clone())
        } else {
            Route::upstream(via)
        };
        let blobs = RouteBlobs {
            bus: self,
            route: &route,
        };
        let args = match self.serializer.deserialize_args(envelope.args, &blobs).await {
            Ok(args) => args,
            Err(e) => return failure(&e),
        };

        let site = CallSite::caller();
        let outcome = if downstream {
            self.route_send(&envelope.name, args, Scope::Except(&sender), site)
                .await
        } else {
            self.dispatch(&envelope.name, args, Scope::All, site).await
        };

        match outcome {
            Ok(Some(value)) => match self.serializer.serialize(&value) {
                Ok(payload) => Reply::Value { payload },
                Err(e) => failure(&e),
            },
            Ok(None) => Reply::Absent,
            Err(e) => failure(&e),
        }
    }

    async fn handle_admin(
        self: &Arc<Self>,
        via: Via,
        downstream: bool,
        sender: PeerAddress,
        envelope: &Envelope,
    ) -> Reply {
        match envelope.name.as_str() {
            PING => Reply::Value {
                payload: Json::String(self.peer.to_string()),
            },
            BLOB_RESOLVE => {
                let id = match envelope.name_arg() {
                    Ok(id) => id,
                    Err(e) => return failure(&e),
                };
                match self.serializer.blobs().get(id) {
                    Some(bytes) => match Value::Bytes(bytes).to_json() {
                        Ok(payload) => Reply::Value { payload },
                        Err(e) => failure(&BusError::from(e)),
                    },
                    None => Reply::Error {
                        message: format!("unknown blob {id}"),
                    },
                }
            },
            _ if !downstream => Reply::Error {
                message: format!("{} is only accepted from downstream", envelope.name),
            },
            PROXY_RESET => {
                self.reset_peer(&sender);
                self.settle().await;
                Reply::Absent
            },
            PROXY_ON | PROXY_OFF => {
                let name = match envelope.name_arg() {
                    Ok(name) => name,
                    Err(e) => return failure(&e),
                };
                if envelope.name == PROXY_ON {
                    let target = PeerHandle {
                        address: sender,
                        peer: envelope.peer,
                        via,
                    };
                    debug!(name, target = %target.address, "proxy registered");
                    let handler = proxy_handler(Arc::downgrade(self), name.to_owned(), &target);
                    self.add_proxy(name, target, handler);
                } else {
                    debug!(name, target = %sender, "proxy retracted");
                    self.remove_proxy(name, &sender);
                }
                // Relay before acknowledging so the sender's settle covers us.
                self.settle().await;
                Reply::Absent
            },
            other => Reply::Error {
                message: format!("unknown admin message {other}"),
            },
        }
    }
}
