// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broker counters exposed through the control plane.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters for one topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCounters {
    /// Envelopes accepted on this topic.
    pub published: u64,
    /// Encoded bytes accepted on this topic.
    pub bytes: u64,
    /// Subscribers that matched the most recent publish.
    pub subscribers: u64,
}

/// Snapshot of the broker's counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerStats {
    /// When the broker loop started, milliseconds since the epoch.
    pub started_at_utc_ms: u64,
    /// Total envelopes accepted.
    pub total_published: u64,
    /// Total encoded bytes accepted.
    pub total_bytes: u64,
    /// Envelopes dropped because they failed to decode.
    pub schema_rejects: u64,
    /// Subscribers dropped for exceeding their queue watermark.
    pub dropped_subscribers: u64,
    /// Tee writes that failed; routing continued.
    pub store_write_failures: u64,
    /// Currently registered subscriber connections.
    pub active_subscribers: usize,
    /// Per-topic counters, deterministic ordering.
    pub per_topic: BTreeMap<String, TopicCounters>,
}

impl BrokerStats {
    /// Record one accepted publish.
    pub(crate) fn record_publish(&mut self, topic: &str, bytes: usize, matched: u64) {
        self.total_published += 1;
        self.total_bytes += bytes as u64;
        let entry = self.per_topic.entry(topic.to_owned()).or_default();
        entry.published += 1;
        entry.bytes += bytes as u64;
        entry.subscribers = matched;
    }
}
