// SPDX-License-Identifier: MIT OR Apache-2.0
//! The single routing loop.
//!
//! All routing-table mutations happen on this loop; connection tasks only
//! ever talk to it through [`RouterMsg`]. Forwarding is fire-and-forget
//! per subscriber: a full queue means the subscriber is too slow and gets
//! dropped, never that a publisher blocks.

use crate::conn::ConnState;
use crate::stats::BrokerStats;
use chrono::Utc;
use slmf_core::{ComponentId, Topic};
use slmf_log::{LogLevel, LogPipeline, LogRecord};
use slmf_protocol::{BinaryCodec, Envelope, EnvelopeBuilder, FilterOp};
use slmf_store::{EventStore, PersistencePolicy};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Payload schema for broker lifecycle and health signals.
pub const SYSTEM_EVENT_TYPE: &str = "aico.system.Event";

/// Commands processed by the routing loop.
pub(crate) enum RouterMsg {
    /// An encoded envelope arrived on the frontend.
    Inbound { bytes: Vec<u8> },
    /// An envelope originated inside the broker process.
    Internal { envelope: Envelope },
    /// A backend connection finished its handshake.
    SubscriberJoined {
        conn_id: u64,
        identity: ComponentId,
        tx: mpsc::Sender<Vec<u8>>,
        queued_bytes: Arc<AtomicUsize>,
    },
    /// A backend connection asked to change its transport filter.
    Filter { conn_id: u64, op: FilterOp },
    /// A backend connection went away.
    SubscriberClosed { conn_id: u64, faulted: bool },
    /// Control-plane stats snapshot.
    Stats { reply: oneshot::Sender<BrokerStats> },
    /// Graceful stop: announce, release subscriptions, acknowledge.
    Shutdown { reply: oneshot::Sender<()> },
}

struct Subscriber {
    identity: ComponentId,
    state: ConnState,
    prefixes: Vec<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
}

/// Persistence tee attached to the routing loop.
pub struct BrokerTee {
    /// Destination store.
    pub store: EventStore,
    /// Which topics to keep.
    pub policy: PersistencePolicy,
}

pub(crate) struct RouterLoop {
    rx: mpsc::Receiver<RouterMsg>,
    subscribers: HashMap<u64, Subscriber>,
    stats: BrokerStats,
    tee: Option<BrokerTee>,
    store_failures: Arc<AtomicU64>,
    pipeline: Arc<LogPipeline>,
    queue_bytes_watermark: usize,
}

impl RouterLoop {
    pub(crate) fn new(
        rx: mpsc::Receiver<RouterMsg>,
        tee: Option<BrokerTee>,
        store_failures: Arc<AtomicU64>,
        pipeline: Arc<LogPipeline>,
        queue_bytes_watermark: usize,
    ) -> Self {
        let stats = BrokerStats {
            started_at_utc_ms: Utc::now().timestamp_millis().max(0) as u64,
            ..BrokerStats::default()
        };
        Self {
            rx,
            subscribers: HashMap::new(),
            stats,
            tee,
            store_failures,
            pipeline,
            queue_bytes_watermark,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                RouterMsg::Inbound { bytes } => self.handle_inbound(bytes),
                RouterMsg::Internal { envelope } => self.handle_internal(envelope),
                RouterMsg::SubscriberJoined { conn_id, identity, tx, queued_bytes } => {
                    debug!(conn_id, %identity, "subscriber joined");
                    self.subscribers.insert(
                        conn_id,
                        Subscriber {
                            identity,
                            state: ConnState::Authenticated.advance(ConnState::Active),
                            prefixes: Vec::new(),
                            tx,
                            queued_bytes,
                        },
                    );
                    self.stats.active_subscribers = self.subscribers.len();
                }
                RouterMsg::Filter { conn_id, op } => self.handle_filter(conn_id, op),
                RouterMsg::SubscriberClosed { conn_id, faulted } => {
                    self.release(conn_id, faulted);
                }
                RouterMsg::Stats { reply } => {
                    let mut snapshot = self.stats.clone();
                    snapshot.store_write_failures = self.store_failures.load(Ordering::Relaxed);
                    let _ = reply.send(snapshot);
                }
                RouterMsg::Shutdown { reply } => {
                    self.handle_internal(self.system_envelope(
                        "system/bus/stopping",
                        serde_json::json!({}),
                    ));
                    let ids: Vec<u64> = self.subscribers.keys().copied().collect();
                    for conn_id in ids {
                        if let Some(sub) = self.subscribers.get_mut(&conn_id) {
                            sub.state = sub.state.advance(ConnState::Closing);
                        }
                        self.release(conn_id, false);
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    /// Decode, count, tee and forward one inbound record.
    ///
    /// A record that fails to decode is dropped here and logged at
    /// WARNING; subscribers never see it.
    fn handle_inbound(&mut self, bytes: Vec<u8>) {
        let envelope = match BinaryCodec::decode(&bytes) {
            Ok(env) => env,
            Err(err) => {
                self.stats.schema_rejects += 1;
                self.pipeline.emit(
                    "router",
                    LogRecord::new(LogLevel::Warning, "router", "handle_inbound", err.to_string())
                        .with_extra(serde_json::json!({ "reason": err.reason() })),
                );
                return;
            }
        };
        self.dispatch(envelope, bytes);
    }

    fn handle_internal(&mut self, envelope: Envelope) {
        match BinaryCodec::encode(&envelope) {
            Ok(bytes) => self.dispatch(envelope, bytes),
            Err(err) => {
                warn!(%err, "internal envelope failed to encode");
            }
        }
    }

    /// Forward an envelope, then drain any health events the forwarding
    /// itself produced (slow-subscriber drops).
    fn dispatch(&mut self, envelope: Envelope, bytes: Vec<u8>) {
        let mut follow_ups = VecDeque::new();
        self.forward_once(&envelope, bytes, &mut follow_ups);
        self.tee(&envelope);
        while let Some(event) = follow_ups.pop_front() {
            match BinaryCodec::encode(&event) {
                Ok(event_bytes) => {
                    let mut nested = VecDeque::new();
                    self.forward_once(&event, event_bytes, &mut nested);
                    self.tee(&event);
                    follow_ups.extend(nested);
                }
                Err(err) => warn!(%err, "health envelope failed to encode"),
            }
        }
    }

    fn forward_once(
        &mut self,
        envelope: &Envelope,
        bytes: Vec<u8>,
        follow_ups: &mut VecDeque<Envelope>,
    ) {
        let topic_bytes = envelope.topic.as_bytes();
        let mut matched: u64 = 0;
        let mut to_drop: Vec<u64> = Vec::new();

        for (&conn_id, sub) in &self.subscribers {
            if sub.state != ConnState::Active {
                continue;
            }
            if !sub.prefixes.iter().any(|p| topic_bytes.starts_with(p)) {
                continue;
            }
            matched += 1;

            let len = bytes.len();
            let queued = sub.queued_bytes.fetch_add(len, Ordering::Relaxed) + len;
            if queued > self.queue_bytes_watermark {
                sub.queued_bytes.fetch_sub(len, Ordering::Relaxed);
                to_drop.push(conn_id);
                continue;
            }
            match sub.tx.try_send(bytes.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_))
                | Err(mpsc::error::TrySendError::Closed(_)) => {
                    sub.queued_bytes.fetch_sub(len, Ordering::Relaxed);
                    to_drop.push(conn_id);
                }
            }
        }

        self.stats
            .record_publish(envelope.topic.as_str(), bytes.len(), matched);

        for conn_id in to_drop {
            if let Some(identity) = self.drop_slow_subscriber(conn_id) {
                follow_ups.push_back(self.system_envelope(
                    "system/health",
                    serde_json::json!({
                        "event": "slow_subscriber_dropped",
                        "subscriber": identity.as_str(),
                    }),
                ));
            }
        }
    }

    /// Drop a subscriber that breached its queue watermark.
    fn drop_slow_subscriber(&mut self, conn_id: u64) -> Option<ComponentId> {
        let sub = self.subscribers.get_mut(&conn_id)?;
        sub.state = sub.state.advance(ConnState::Faulted);
        let identity = sub.identity.clone();
        self.stats.dropped_subscribers += 1;
        self.pipeline.emit(
            "broker",
            LogRecord::new(
                LogLevel::Warning,
                "broker",
                "drop_slow_subscriber",
                format!("dropping slow subscriber {identity}"),
            ),
        );
        self.release(conn_id, true);
        Some(identity)
    }

    fn handle_filter(&mut self, conn_id: u64, op: FilterOp) {
        let Some(sub) = self.subscribers.get_mut(&conn_id) else {
            return;
        };
        match op {
            FilterOp::Subscribe(prefix) => {
                if !sub.prefixes.contains(&prefix) {
                    sub.prefixes.push(prefix);
                }
            }
            FilterOp::Unsubscribe(prefix) => {
                sub.prefixes.retain(|p| p != &prefix);
            }
        }
    }

    /// Remove a connection and release everything it owned.
    fn release(&mut self, conn_id: u64, faulted: bool) {
        if let Some(mut sub) = self.subscribers.remove(&conn_id) {
            if faulted {
                sub.state = sub.state.advance(ConnState::Faulted);
            } else if sub.state == ConnState::Active {
                sub.state = sub.state.advance(ConnState::Closing);
            }
            sub.state = sub.state.advance(ConnState::Closed);
            debug!(conn_id, identity = %sub.identity, state = %sub.state, "subscriber released");
            // Dropping `tx` ends the writer task, which closes the socket.
        }
        self.stats.active_subscribers = self.subscribers.len();
    }

    fn tee(&self, envelope: &Envelope) {
        let Some(tee) = &self.tee else { return };
        if !tee.policy.decide(envelope) {
            return;
        }
        let store = tee.store.clone();
        let envelope = envelope.clone();
        let failures = self.store_failures.clone();
        tokio::spawn(async move {
            if let Err(err) = store.append_envelope(&envelope).await {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(%err, topic = %envelope.topic, "event store tee failed; routing unaffected");
            }
        });
    }

    fn system_envelope(&self, topic: &str, payload: serde_json::Value) -> Envelope {
        let topic = Topic::parse(topic).expect("system topics are canonical constants");
        EnvelopeBuilder::new(ComponentId::broker(), topic)
            .payload(SYSTEM_EVENT_TYPE, payload.to_string().into_bytes())
            .build()
    }
}
