// SPDX-License-Identifier: MIT OR Apache-2.0
//! Explicit payload-schema registry.
//!
//! Schema versions are registered once, during startup, by the composition
//! root; there is no runtime discovery. The registry enforces the contract
//! that `schema_version` is monotonically non-decreasing per topic.

use slmf_core::Topic;
use std::collections::BTreeMap;
use thiserror::Error;

/// Registry misuse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Attempted to register a version lower than the current one.
    #[error("schema version for {topic} would regress from {current} to {proposed}")]
    VersionRegression {
        /// Topic whose schema was being registered.
        topic: String,
        /// Currently registered version.
        current: u32,
        /// The lower version that was rejected.
        proposed: u32,
    },
}

/// Tracks the current payload schema version per topic.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    versions: BTreeMap<String, u32>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `version` for `topic`.
    ///
    /// Re-registering the same version is a no-op; raising it is allowed;
    /// lowering it is refused.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::VersionRegression`] when `version` is lower
    /// than the version already registered.
    pub fn register(&mut self, topic: &Topic, version: u32) -> Result<(), RegistryError> {
        match self.versions.get(topic.as_str()) {
            Some(&current) if version < current => Err(RegistryError::VersionRegression {
                topic: topic.as_str().to_owned(),
                current,
                proposed: version,
            }),
            _ => {
                self.versions.insert(topic.as_str().to_owned(), version);
                Ok(())
            }
        }
    }

    /// The currently registered version for `topic`, if any.
    #[must_use]
    pub fn current(&self, topic: &Topic) -> Option<u32> {
        self.versions.get(topic.as_str()).copied()
    }

    /// Whether an incoming envelope's version is acceptable for its topic.
    ///
    /// Topics never registered are accepted at any version; subscribers
    /// that care register explicitly.
    #[must_use]
    pub fn accepts(&self, topic: &Topic, version: u32) -> bool {
        match self.current(topic) {
            None => true,
            Some(current) => version >= current,
        }
    }

    /// Number of registered topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
