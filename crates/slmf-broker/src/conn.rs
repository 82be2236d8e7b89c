// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-connection lifecycle.
//!
//! Every connection walks `Unauthenticated → Authenticated → Active →
//! {Closing, Faulted} → Closed`. The transport layer owns the first
//! transition (a [`slmf_transport::SecureListener`] never surfaces an
//! unauthenticated stream), the router loop owns the rest. Reaching
//! `Closed` releases every subscription the connection held.

use std::fmt;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket accepted, handshake not yet complete.
    Unauthenticated,
    /// Handshake complete, peer identity proven.
    Authenticated,
    /// Registered with the router and eligible for delivery.
    Active,
    /// Graceful teardown in progress.
    Closing,
    /// Torn down after an error or watermark breach.
    Faulted,
    /// Terminal. Subscriptions released.
    Closed,
}

impl ConnState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticated)
                | (Authenticated, Active)
                | (Active, Closing)
                | (Active, Faulted)
                | (Closing, Closed)
                | (Faulted, Closed)
                // A handshake can die before or after authentication.
                | (Unauthenticated, Faulted)
                | (Authenticated, Faulted)
        )
    }

    /// Step to `next`, falling back to `Faulted` on an illegal move.
    ///
    /// An illegal transition is a programming error on the router loop;
    /// treating it as a fault keeps the connection headed for `Closed`
    /// instead of wedging.
    #[must_use]
    pub fn advance(self, next: ConnState) -> ConnState {
        if self.can_transition_to(next) {
            next
        } else {
            ConnState::Faulted
        }
    }

    /// Terminal states get no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Faulted => "faulted",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}
