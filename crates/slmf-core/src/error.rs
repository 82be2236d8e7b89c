// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable error codes shared across the fabric.
//!
//! Individual crates define their own `thiserror` enums; every one of those
//! errors maps onto a [`FabricCode`] so that control-plane replies, log
//! records and health events carry a machine-readable tag that never changes
//! across releases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad family a [`FabricCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Key material and handshake failures.
    Security,
    /// Envelope or topic form violations.
    Schema,
    /// Flow-control conditions (queues, deadlines).
    Flow,
    /// Persistent store failures.
    Storage,
    /// Scheduled-task failures.
    Task,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Security => "security",
            Self::Schema => "schema",
            Self::Flow => "flow",
            Self::Storage => "storage",
            Self::Task => "task",
        };
        f.write_str(s)
    }
}

/// Machine-readable, stable error code.
///
/// Serialises to `SCREAMING_SNAKE_CASE`; the serialized form is part of the
/// control-plane contract and must not change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FabricCode {
    /// Master secret missing or keypair derivation failed.
    KeyMaterialUnavailable,
    /// Handshake or crypto primitive failure; the connection is dead.
    SecurityInitializationFailed,
    /// Connecting key is not in the allow-list.
    UnauthorizedPeer,
    /// Envelope malformed, topic non-canonical, or payload over the cap.
    SchemaError,
    /// Local send queue saturated; caller decides what to shed.
    Backpressure,
    /// Subscriber exceeded its queue watermark and was dropped.
    SlowSubscriber,
    /// A deadline elapsed.
    Timeout,
    /// An operation was cancelled before completion.
    Cancelled,
    /// Task raised an error that must not be retried.
    TaskPermanentError,
    /// Task raised an error eligible for the retry policy.
    TaskTransientError,
    /// The persistent store could not commit; routing continues.
    StoreWriteFailed,
}

impl FabricCode {
    /// The family this code belongs to.
    #[must_use]
    pub fn class(self) -> ErrorClass {
        match self {
            Self::KeyMaterialUnavailable
            | Self::SecurityInitializationFailed
            | Self::UnauthorizedPeer => ErrorClass::Security,
            Self::SchemaError => ErrorClass::Schema,
            Self::Backpressure | Self::SlowSubscriber | Self::Timeout | Self::Cancelled => {
                ErrorClass::Flow
            }
            Self::StoreWriteFailed => ErrorClass::Storage,
            Self::TaskPermanentError | Self::TaskTransientError => ErrorClass::Task,
        }
    }

    /// Whether retrying the same operation can ever succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::SecurityInitializationFailed
                | Self::Backpressure
                | Self::Timeout
                | Self::TaskTransientError
                | Self::StoreWriteFailed
        )
    }

    /// The stable wire string for this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeyMaterialUnavailable => "KEY_MATERIAL_UNAVAILABLE",
            Self::SecurityInitializationFailed => "SECURITY_INITIALIZATION_FAILED",
            Self::UnauthorizedPeer => "UNAUTHORIZED_PEER",
            Self::SchemaError => "SCHEMA_ERROR",
            Self::Backpressure => "BACKPRESSURE",
            Self::SlowSubscriber => "SLOW_SUBSCRIBER",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::TaskPermanentError => "TASK_PERMANENT_ERROR",
            Self::TaskTransientError => "TASK_TRANSIENT_ERROR",
            Self::StoreWriteFailed => "STORE_WRITE_FAILED",
        }
    }
}

impl fmt::Display for FabricCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every crate-level error enum in the workspace.
pub trait Coded {
    /// The stable code describing this error.
    fn code(&self) -> FabricCode;
}
