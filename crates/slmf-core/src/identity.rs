// SPDX-License-Identifier: MIT OR Apache-2.0
//! Component identities and the fixed authorized set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved identity of the broker process itself.
pub const BROKER_IDENTITY: &str = "message_bus_broker";

/// One entry in the immutable allow-list of fabric participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorizedComponent {
    /// Stable identity string presented during the transport handshake.
    pub identity: &'static str,
    /// Whether this component may issue control-plane requests.
    pub admin_capable: bool,
}

/// The complete, immutable set of component identities the broker accepts.
///
/// Connections presenting a key derived for any identity outside this list
/// are closed without further exchange.
pub const AUTHORIZED_COMPONENTS: &[AuthorizedComponent] = &[
    AuthorizedComponent { identity: BROKER_IDENTITY, admin_capable: true },
    AuthorizedComponent { identity: "message_bus_client_api_gateway", admin_capable: true },
    AuthorizedComponent { identity: "message_bus_client_log_consumer", admin_capable: false },
    AuthorizedComponent { identity: "message_bus_client_scheduler", admin_capable: true },
    AuthorizedComponent { identity: "message_bus_client_cli", admin_capable: true },
    AuthorizedComponent { identity: "message_bus_client_modelservice", admin_capable: false },
    AuthorizedComponent { identity: "message_bus_client_system_host", admin_capable: true },
    AuthorizedComponent { identity: "message_bus_client_backend_modules", admin_capable: false },
];

/// Identity of a fabric participant.
///
/// A thin wrapper over the raw string so call sites cannot accidentally swap
/// a topic and a source. Construction does not imply authorization; use
/// [`ComponentId::is_authorized`] for that.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    /// Wrap a raw identity string.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// The broker's reserved identity.
    #[must_use]
    pub fn broker() -> Self {
        Self(BROKER_IDENTITY.to_owned())
    }

    /// View the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this identity appears in [`AUTHORIZED_COMPONENTS`].
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        AUTHORIZED_COMPONENTS.iter().any(|c| c.identity == self.0)
    }

    /// Whether this identity may issue control-plane requests.
    #[must_use]
    pub fn is_admin_capable(&self) -> bool {
        AUTHORIZED_COMPONENTS
            .iter()
            .any(|c| c.identity == self.0 && c.admin_capable)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_is_authorized_and_admin_capable() {
        let broker = ComponentId::broker();
        assert!(broker.is_authorized());
        assert!(broker.is_admin_capable());
    }

    #[test]
    fn log_consumer_is_not_admin_capable() {
        let id = ComponentId::new("message_bus_client_log_consumer");
        assert!(id.is_authorized());
        assert!(!id.is_admin_capable());
    }

    #[test]
    fn unknown_identity_is_rejected() {
        let id = ComponentId::new("rogue_module");
        assert!(!id.is_authorized());
        assert!(!id.is_admin_capable());
    }

    #[test]
    fn authorized_set_has_no_duplicates() {
        for (i, a) in AUTHORIZED_COMPONENTS.iter().enumerate() {
            for b in &AUTHORIZED_COMPONENTS[i + 1..] {
                assert_ne!(a.identity, b.identity);
            }
        }
    }

    #[test]
    fn serde_is_transparent() {
        let id = ComponentId::new("message_bus_client_cli");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"message_bus_client_cli\"");
        let back: ComponentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
