//! Context identity types.
//!
//! A context has two identities. Its [`PeerAddress`] is the route the host
//! messaging layer uses to reach it (a tab/frame pair, the background page)
//! and survives a reload. Its [`PeerId`] is minted fresh every time the
//! context starts, so a reloaded context answers from the same address with a
//! different id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical identity of one running context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Mint a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Host-level route to a context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// How a context reaches the rest of the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// The context is the hub.
    None,
    /// Through the host's extension messaging primitive.
    Extension,
    /// Through the in-page channel to the top frame.
    Page,
}

/// The kind of execution context a runtime is running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Long-lived background process; the hub.
    Background,
    /// Isolated content-script world of a top frame.
    ContentScript,
    /// Script injected into a page frame that cannot reach the hub directly.
    Page,
    /// Offscreen document.
    Offscreen,
    /// Browser-action popup.
    Popup,
    /// Side panel.
    SidePanel,
    /// Devtools panel.
    DevTools,
}

impl ContextKind {
    /// Whether this context is the hub all extension messages route through.
    #[must_use]
    pub fn is_hub(self) -> bool {
        matches!(self, Self::Background)
    }

    /// Whether this context owns persistence for state instances.
    #[must_use]
    pub fn is_authoritative(self) -> bool {
        self.is_hub()
    }

    /// The route this context uses for messages it cannot answer itself.
    #[must_use]
    pub fn upstream(self) -> Upstream {
        match self {
            Self::Background => Upstream::None,
            Self::Page => Upstream::Page,
            _ => Upstream::Extension,
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Background => "background",
            Self::ContentScript => "content_script",
            Self::Page => "page",
            Self::Offscreen => "offscreen",
            Self::Popup => "popup",
            Self::SidePanel => "side_panel",
            Self::DevTools => "devtools",
        };
        f.write_str(name)
    }
}
