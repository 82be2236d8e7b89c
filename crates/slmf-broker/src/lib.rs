// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fabric broker: ingest on the frontend, fan out on the backend.
//!
//! One broker process owns two encrypted endpoints. Publishers connect to
//! the frontend and stream envelope frames in; subscribers connect to the
//! backend, install byte-prefix filters, and receive matching envelopes
//! verbatim. The broker decodes envelope metadata to route and count, but
//! never touches payload bytes and never rewrites a field.
//!
//! Slow subscribers are dropped, publishers are never blocked by them, and
//! a persistence tee copies selected envelopes into the event store
//! without ever stalling routing.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conn;
mod router;
mod stats;

pub use conn::ConnState;
pub use router::{BrokerTee, SYSTEM_EVENT_TYPE};
pub use stats::{BrokerStats, TopicCounters};

use router::{RouterLoop, RouterMsg};
use slmf_core::{Coded, ComponentId, FabricCode, Topic};
use slmf_keyvault::Keypair;
use slmf_log::{transport_write_scope, LogLevel, LogPipeline, LogRecord};
use slmf_protocol::{Envelope, EnvelopeBuilder, FilterOp};
use slmf_transport::{
    AuthorizedKeys, SecureListener, SecureStream, TransportConfig, TransportError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Endpoint could not be bound or a handshake layer failed fatally.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The routing loop is gone.
    #[error("broker is stopped")]
    Stopped,
}

impl Coded for BrokerError {
    fn code(&self) -> FabricCode {
        match self {
            Self::Transport(t) => t.code(),
            Self::Stopped => FabricCode::SecurityInitializationFailed,
        }
    }
}

/// Broker tunables. Defaults follow the deployed fabric: loopback
/// endpoints 5555/5556 and a 1024-message / 16 MiB subscriber watermark.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Publishers connect here.
    pub frontend_addr: SocketAddr,
    /// Subscribers connect here.
    pub backend_addr: SocketAddr,
    /// Per-subscriber queue capacity in messages.
    pub subscriber_queue_messages: usize,
    /// Per-subscriber queue capacity in bytes.
    pub subscriber_queue_bytes: usize,
    /// Depth of the routing loop's command queue.
    pub command_queue_depth: usize,
    /// Transport settings shared by both endpoints.
    pub transport: TransportConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frontend_addr: "127.0.0.1:5555".parse().expect("static address parses"),
            backend_addr: "127.0.0.1:5556".parse().expect("static address parses"),
            subscriber_queue_messages: 1024,
            subscriber_queue_bytes: 16 * 1024 * 1024,
            command_queue_depth: 1024,
            transport: TransportConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Ephemeral loopback ports, for tests running several brokers.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            frontend_addr: "127.0.0.1:0".parse().expect("static address parses"),
            backend_addr: "127.0.0.1:0".parse().expect("static address parses"),
            ..Self::default()
        }
    }
}

/// Cloneable control surface over a running broker: counters and
/// internal publishing, without ownership of the broker tasks.
#[derive(Clone)]
pub struct BrokerController {
    cmd_tx: mpsc::Sender<RouterMsg>,
    frontend_addr: SocketAddr,
    backend_addr: SocketAddr,
}

impl BrokerController {
    /// Actual frontend address (relevant when bound to port 0).
    #[must_use]
    pub fn frontend_addr(&self) -> SocketAddr {
        self.frontend_addr
    }

    /// Actual backend address.
    #[must_use]
    pub fn backend_addr(&self) -> SocketAddr {
        self.backend_addr
    }

    /// Inject an envelope from inside the broker process.
    ///
    /// Used for lifecycle topics and by the log pipeline sink. Best
    /// effort: returns `false` when the routing loop's queue is full or
    /// the loop is gone.
    pub fn publish_internal(&self, envelope: Envelope) -> bool {
        self.cmd_tx.try_send(RouterMsg::Internal { envelope }).is_ok()
    }

    /// Snapshot the broker counters.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Stopped`] once the routing loop has exited.
    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RouterMsg::Stats { reply })
            .await
            .map_err(|_| BrokerError::Stopped)?;
        rx.await.map_err(|_| BrokerError::Stopped)
    }
}

impl std::fmt::Debug for BrokerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerController")
            .field("frontend", &self.frontend_addr)
            .field("backend", &self.backend_addr)
            .finish()
    }
}

/// Handle to a running broker.
pub struct BrokerHandle {
    controller: BrokerController,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerHandle {
    /// Actual frontend address (relevant when bound to port 0).
    #[must_use]
    pub fn frontend_addr(&self) -> SocketAddr {
        self.controller.frontend_addr()
    }

    /// Actual backend address.
    #[must_use]
    pub fn backend_addr(&self) -> SocketAddr {
        self.controller.backend_addr()
    }

    /// A cloneable control surface for the control plane and log sink.
    #[must_use]
    pub fn controller(&self) -> BrokerController {
        self.controller.clone()
    }

    /// See [`BrokerController::publish_internal`].
    pub fn publish_internal(&self, envelope: Envelope) -> bool {
        self.controller.publish_internal(envelope)
    }

    /// See [`BrokerController::stats`].
    ///
    /// # Errors
    ///
    /// [`BrokerError::Stopped`] once the routing loop has exited.
    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        self.controller.stats().await
    }

    /// Graceful stop: announce `system/bus/stopping`, release every
    /// subscription, then tear the endpoints down.
    pub async fn shutdown(mut self) {
        let (reply, rx) = oneshot::channel();
        if self
            .controller
            .cmd_tx
            .send(RouterMsg::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// The broker process entry point.
pub struct Broker;

impl Broker {
    /// Bind both endpoints and start routing.
    ///
    /// `identity` must be the keypair derived for the broker's reserved
    /// identity; `authorized` is the complete client allow-list. Without
    /// valid key material this fails before any socket is bound.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Transport`] when an endpoint cannot be bound.
    pub async fn start(
        config: BrokerConfig,
        identity: Keypair,
        authorized: AuthorizedKeys,
        tee: Option<BrokerTee>,
        pipeline: Arc<LogPipeline>,
    ) -> Result<BrokerHandle, BrokerError> {
        let frontend = SecureListener::bind(
            config.frontend_addr,
            identity.clone(),
            authorized.clone(),
            config.transport.clone(),
        )
        .await?;
        let backend = SecureListener::bind(
            config.backend_addr,
            identity,
            authorized,
            config.transport.clone(),
        )
        .await?;
        let frontend_addr = frontend.local_addr()?;
        let backend_addr = backend.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_depth);
        let store_failures = Arc::new(AtomicU64::new(0));

        let router = RouterLoop::new(
            cmd_rx,
            tee,
            store_failures,
            pipeline.clone(),
            config.subscriber_queue_bytes,
        );
        let router_task = tokio::spawn(router.run());

        let frontend_task = tokio::spawn(Self::frontend_accept_loop(
            frontend,
            cmd_tx.clone(),
            pipeline.clone(),
        ));
        let backend_task = tokio::spawn(Self::backend_accept_loop(
            backend,
            cmd_tx.clone(),
            pipeline.clone(),
            config.subscriber_queue_messages,
        ));

        let handle = BrokerHandle {
            controller: BrokerController { cmd_tx, frontend_addr, backend_addr },
            tasks: vec![router_task, frontend_task, backend_task],
        };

        info!(%frontend_addr, %backend_addr, "broker started");
        handle.publish_internal(system_started_envelope());
        Ok(handle)
    }

    async fn frontend_accept_loop(
        listener: SecureListener,
        cmd_tx: mpsc::Sender<RouterMsg>,
        pipeline: Arc<LogPipeline>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, identity)) => {
                    debug!(%identity, "publisher connected");
                    tokio::spawn(Self::publisher_session(stream, cmd_tx.clone()));
                }
                Err(err) => {
                    log_accept_failure(&pipeline, &err);
                    if matches!(err, TransportError::Io(_)) {
                        // Listener-level I/O failure; keep trying.
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    /// One publisher connection: read envelope frames, feed the router.
    ///
    /// The router queue is bounded, so a firehose publisher is slowed at
    /// this await rather than ballooning memory.
    async fn publisher_session(stream: SecureStream, cmd_tx: mpsc::Sender<RouterMsg>) {
        let (mut reader, _writer) = stream.into_split();
        loop {
            match reader.recv_frame().await {
                Ok(bytes) => {
                    if cmd_tx.send(RouterMsg::Inbound { bytes }).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    async fn backend_accept_loop(
        listener: SecureListener,
        cmd_tx: mpsc::Sender<RouterMsg>,
        pipeline: Arc<LogPipeline>,
        queue_messages: usize,
    ) {
        let mut next_conn_id: u64 = 0;
        loop {
            match listener.accept().await {
                Ok((stream, identity)) => {
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    debug!(conn_id, %identity, "subscriber connected");

                    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(queue_messages);
                    let queued_bytes = Arc::new(AtomicUsize::new(0));
                    let joined = RouterMsg::SubscriberJoined {
                        conn_id,
                        identity,
                        tx: data_tx,
                        queued_bytes: queued_bytes.clone(),
                    };
                    if cmd_tx.send(joined).await.is_err() {
                        return;
                    }
                    tokio::spawn(Self::subscriber_session(
                        stream,
                        conn_id,
                        data_rx,
                        queued_bytes,
                        cmd_tx.clone(),
                    ));
                }
                Err(err) => {
                    log_accept_failure(&pipeline, &err);
                    if matches!(err, TransportError::Io(_)) {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    /// One subscriber connection: a writer draining the delivery queue and
    /// a reader applying filter changes.
    async fn subscriber_session(
        stream: SecureStream,
        conn_id: u64,
        mut data_rx: mpsc::Receiver<Vec<u8>>,
        queued_bytes: Arc<AtomicUsize>,
        cmd_tx: mpsc::Sender<RouterMsg>,
    ) {
        let (mut reader, mut writer) = stream.into_split();

        let writer_cmd_tx = cmd_tx.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = data_rx.recv().await {
                let result = transport_write_scope(writer.send_frame(&bytes)).await;
                queued_bytes.fetch_sub(bytes.len(), Ordering::Relaxed);
                if result.is_err() {
                    let _ = writer_cmd_tx
                        .send(RouterMsg::SubscriberClosed { conn_id, faulted: true })
                        .await;
                    return;
                }
            }
            // Queue dropped by the router: graceful close.
            let _ = transport_write_scope(writer.shutdown()).await;
        });

        loop {
            match reader.recv_frame().await {
                Ok(bytes) => match FilterOp::decode(&bytes) {
                    Ok(op) => {
                        if cmd_tx.send(RouterMsg::Filter { conn_id, op }).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(conn_id, %err, "bad filter frame; closing subscriber");
                        let _ = cmd_tx
                            .send(RouterMsg::SubscriberClosed { conn_id, faulted: true })
                            .await;
                        break;
                    }
                },
                Err(_) => {
                    let _ = cmd_tx
                        .send(RouterMsg::SubscriberClosed { conn_id, faulted: false })
                        .await;
                    break;
                }
            }
        }
        writer_task.abort();
    }
}

fn system_started_envelope() -> Envelope {
    let topic = Topic::parse("system/bus/started").expect("system topics are canonical constants");
    EnvelopeBuilder::new(ComponentId::broker(), topic)
        .payload(SYSTEM_EVENT_TYPE, b"{}".to_vec())
        .build()
}

fn log_accept_failure(pipeline: &LogPipeline, err: &TransportError) {
    match err {
        TransportError::UnauthorizedPeer { peer_z85 } => {
            pipeline.emit(
                "security",
                LogRecord::new(
                    LogLevel::Security,
                    "security",
                    "accept",
                    "rejected connection from unauthorized peer",
                )
                .with_extra(serde_json::json!({
                    "reason": "UnauthorizedPeer",
                    "peer": peer_z85,
                })),
            );
        }
        other => {
            pipeline.emit(
                "transport",
                LogRecord::new(
                    LogLevel::Warning,
                    "transport",
                    "accept",
                    format!("handshake failed: {other}"),
                ),
            );
        }
    }
}
