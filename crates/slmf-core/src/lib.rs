// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core primitives shared by every fabric crate.
//!
//! This crate carries no I/O. It defines the vocabulary the rest of the
//! workspace speaks: component identities and the fixed authorized set,
//! canonical hierarchical topics, subscription patterns with their two-stage
//! matching contract, and the stable error-code taxonomy surfaced on the
//! control plane and in log records.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod identity;
pub mod pattern;
pub mod topic;

pub use error::{Coded, ErrorClass, FabricCode};
pub use identity::{AuthorizedComponent, ComponentId, AUTHORIZED_COMPONENTS, BROKER_IDENTITY};
pub use pattern::Pattern;
pub use topic::{canonicalize, Topic, TopicError};
