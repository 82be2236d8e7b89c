// SPDX-License-Identifier: MIT OR Apache-2.0
//! The client runtime.
//!
//! Every collaborator talks to the fabric through a [`FabricClient`]: one
//! encrypted connection to the broker frontend for publishing and one to
//! the backend for subscribing. The runtime canonicalizes topics at the
//! boundary, enforces the envelope size cap before encryption, applies
//! backpressure instead of dropping, reconnects with jittered exponential
//! backoff, and re-installs transport filters after every reconnect.
//!
//! Delivery contract: per publisher and topic, handlers see envelopes in
//! publish order; a single subscription's handler is never invoked
//! concurrently with itself.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod sub;

pub use sub::{handler, Handler, SubscriptionToken};

use slmf_core::{canonicalize, Coded, ComponentId, FabricCode, Pattern, Topic, TopicError};
use slmf_keyvault::Keypair;
use slmf_log::transport_write_scope;
use slmf_protocol::{BinaryCodec, Envelope, EnvelopeBuilder, FilterOp, SchemaError, SchemaRegistry};
use slmf_transport::{SecureStream, TransportConfig, TransportError};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sub::{InstallOutcome, SubscriptionTable};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;
use x25519_dalek::PublicKey;

/// Client runtime failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Topic or envelope failed validation before leaving the process.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The local send queue stayed full past the publish timeout.
    #[error("send queue saturated")]
    Backpressure,

    /// A request deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// Connection establishment failed after every retry.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The runtime's background tasks are gone.
    #[error("client runtime disconnected")]
    Disconnected,
}

impl From<TopicError> for ClientError {
    fn from(err: TopicError) -> Self {
        Self::Schema(SchemaError::Topic(err))
    }
}

impl Coded for ClientError {
    fn code(&self) -> FabricCode {
        match self {
            Self::Schema(_) => FabricCode::SchemaError,
            Self::Backpressure => FabricCode::Backpressure,
            Self::Timeout => FabricCode::Timeout,
            Self::Cancelled => FabricCode::Cancelled,
            Self::Transport(t) => t.code(),
            Self::Disconnected => FabricCode::SecurityInitializationFailed,
        }
    }
}

/// Client tunables. Defaults follow the deployed fabric.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// This component's identity.
    pub identity: ComponentId,
    /// Broker frontend (publish) endpoint.
    pub frontend_addr: SocketAddr,
    /// Broker backend (subscribe) endpoint.
    pub backend_addr: SocketAddr,
    /// Local send queue depth.
    pub send_queue_depth: usize,
    /// How long a publish may wait on a full queue before
    /// [`ClientError::Backpressure`].
    pub publish_timeout: Duration,
    /// Default deadline for [`FabricClient::request`].
    pub request_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_base: Duration,
    /// Reconnect delay cap.
    pub reconnect_cap: Duration,
    /// Attempts for the initial connect before giving up.
    pub connect_attempts: u32,
    /// Transport settings.
    pub transport: TransportConfig,
    /// Payload schema versions this component insists on, registered
    /// explicitly at startup. Envelopes carrying an older version for a
    /// registered topic are dropped at delivery with a warning.
    pub schemas: SchemaRegistry,
}

impl ClientConfig {
    /// Defaults for `identity` against the loopback broker.
    #[must_use]
    pub fn for_identity(identity: ComponentId) -> Self {
        Self {
            identity,
            frontend_addr: "127.0.0.1:5555".parse().expect("static address parses"),
            backend_addr: "127.0.0.1:5556".parse().expect("static address parses"),
            send_queue_depth: 1024,
            publish_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            reconnect_base: Duration::from_millis(250),
            reconnect_cap: Duration::from_secs(10),
            connect_attempts: 10,
            transport: TransportConfig::default(),
            schemas: SchemaRegistry::new(),
        }
    }
}

/// Optional publish metadata.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Payload schema version; defaults to 1.
    pub schema_version: Option<u32>,
    /// Correlation id for request/reply flows.
    pub correlation_id: Option<Uuid>,
    /// End-to-end trace id.
    pub trace_id: Option<Uuid>,
}

/// The reply topic convention: replies to a request from `source` with
/// correlation id `correlation` are published here.
///
/// # Errors
///
/// Fails only if `source` is not expressible as a topic segment.
pub fn reply_topic_for(source: &ComponentId, correlation: Uuid) -> Result<Topic, TopicError> {
    canonicalize(&format!("{}/reply/{}", source.as_str(), correlation.simple()))
}

/// Parse a subscription pattern at the API boundary, accepting the legacy
/// dot notation for literal and prefix forms.
fn parse_pattern(raw: &str) -> Result<Pattern, TopicError> {
    match raw {
        "" | "*" | "**" => Ok(Pattern::All),
        _ if raw.ends_with('/') => {
            let body = canonicalize(&raw[..raw.len() - 1])?;
            Ok(Pattern::Prefix(format!("{}/", body.as_str())))
        }
        _ => Ok(Pattern::Exact(canonicalize(raw)?)),
    }
}

/// Handle to the connected client runtime.
///
/// Cheap to clone-share via `Arc`; dropping the last handle aborts the
/// background tasks.
pub struct FabricClient {
    identity: ComponentId,
    config: ClientConfig,
    send_tx: mpsc::Sender<Vec<u8>>,
    ctrl_tx: mpsc::UnboundedSender<FilterOp>,
    subs: Arc<Mutex<SubscriptionTable>>,
    tasks: Vec<JoinHandle<()>>,
}

impl FabricClient {
    /// Connect both runtime streams, with jittered exponential backoff.
    ///
    /// Publishes `system/module/registered` once connected.
    ///
    /// # Errors
    ///
    /// The last [`TransportError`] once `connect_attempts` is exhausted.
    pub async fn connect(
        config: ClientConfig,
        keypair: Keypair,
        broker_key: PublicKey,
    ) -> Result<Self, ClientError> {
        let frontend = connect_with_backoff(
            config.frontend_addr,
            &keypair,
            &broker_key,
            &config,
            Some(config.connect_attempts),
        )
        .await?;
        let backend = connect_with_backoff(
            config.backend_addr,
            &keypair,
            &broker_key,
            &config,
            Some(config.connect_attempts),
        )
        .await?;

        let (send_tx, send_rx) = mpsc::channel::<Vec<u8>>(config.send_queue_depth);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<FilterOp>();
        let subs: Arc<Mutex<SubscriptionTable>> = Arc::new(Mutex::new(SubscriptionTable::default()));

        let publisher = tokio::spawn(publisher_task(
            frontend,
            send_rx,
            config.clone(),
            keypair.clone(),
            broker_key,
        ));
        let dispatcher = tokio::spawn(backend_task(
            backend,
            ctrl_rx,
            subs.clone(),
            config.clone(),
            keypair,
            broker_key,
        ));

        let client = Self {
            identity: config.identity.clone(),
            config,
            send_tx,
            ctrl_tx,
            subs,
            tasks: vec![publisher, dispatcher],
        };

        // Announce ourselves; best effort.
        let _ = client
            .publish(
                "system/module/registered",
                "aico.system.Event",
                serde_json::json!({ "module": client.identity.as_str() })
                    .to_string()
                    .into_bytes(),
            )
            .await;
        Ok(client)
    }

    /// This client's identity.
    #[must_use]
    pub fn identity(&self) -> &ComponentId {
        &self.identity
    }

    /// Publish a payload on `topic`.
    ///
    /// The topic is canonicalized at this boundary (legacy dot notation
    /// accepted); the message id of the built envelope is returned.
    ///
    /// # Errors
    ///
    /// [`ClientError::Schema`] for invalid topics or oversized envelopes,
    /// [`ClientError::Backpressure`] when the send queue stays full past
    /// the publish timeout.
    pub async fn publish(
        &self,
        topic: &str,
        payload_type_url: &str,
        payload: Vec<u8>,
    ) -> Result<Uuid, ClientError> {
        self.publish_with(topic, payload_type_url, payload, PublishOptions::default())
            .await
    }

    /// [`FabricClient::publish`] with explicit metadata.
    ///
    /// # Errors
    ///
    /// See [`FabricClient::publish`].
    pub async fn publish_with(
        &self,
        topic: &str,
        payload_type_url: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<Uuid, ClientError> {
        let topic = match canonicalize(topic) {
            Ok(t) => t,
            Err(err) => {
                warn!(%err, raw = topic, "publish rejected before leaving the process");
                return Err(err.into());
            }
        };
        let mut builder = EnvelopeBuilder::new(self.identity.clone(), topic)
            .payload(payload_type_url, payload)
            .schema_version(options.schema_version.unwrap_or(1));
        if let Some(id) = options.correlation_id {
            builder = builder.correlation_id(id);
        }
        if let Some(id) = options.trace_id {
            builder = builder.trace_id(id);
        }
        let envelope = builder.build();
        let message_id = envelope.message_id;
        let bytes = BinaryCodec::encode(&envelope)?;
        self.send_bytes(bytes).await?;
        Ok(message_id)
    }

    /// Publish an already-built envelope. Used by reply paths and the log
    /// pipeline sink; the envelope's source should be this identity.
    ///
    /// # Errors
    ///
    /// See [`FabricClient::publish`].
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let bytes = BinaryCodec::encode(envelope)?;
        self.send_bytes(bytes).await
    }

    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        match self.send_tx.send_timeout(bytes, self.config.publish_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(ClientError::Backpressure),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(ClientError::Disconnected),
        }
    }

    /// Subscribe `handler` to every topic matching `pattern`.
    ///
    /// Patterns: a literal topic, a `prefix/` subtree, or `""`/`*`/`**`
    /// for everything. Duplicate (pattern, handler) pairs coalesce into
    /// one subscription. Idempotent in effect: the duplicate install
    /// causes no second delivery.
    ///
    /// # Errors
    ///
    /// [`ClientError::Schema`] for an unparseable pattern.
    pub fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionToken, ClientError> {
        let pattern = parse_pattern(pattern)?;
        self.subscribe_pattern(pattern, handler)
    }

    fn subscribe_pattern(
        &self,
        pattern: Pattern,
        handler: Handler,
    ) -> Result<SubscriptionToken, ClientError> {
        let outcome = {
            let mut table = self.subs.lock().expect("subscription table lock poisoned");
            table.install(pattern, handler)
        };
        match outcome {
            InstallOutcome::Added { token, new_prefix } => {
                if let Some(prefix) = new_prefix {
                    // Failure here means the backend task is reconnecting;
                    // it re-installs every active prefix when it returns.
                    let _ = self.ctrl_tx.send(FilterOp::Subscribe(prefix));
                }
                Ok(token)
            }
            InstallOutcome::Coalesced { token } => Ok(token),
        }
    }

    /// Remove a subscription. Returns `false` for an unknown token.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let outcome = {
            let mut table = self.subs.lock().expect("subscription table lock poisoned");
            table.remove(token)
        };
        match outcome {
            None => false,
            Some(removed) => {
                if let Some(prefix) = removed.released_prefix {
                    let _ = self.ctrl_tx.send(FilterOp::Unsubscribe(prefix));
                }
                true
            }
        }
    }

    /// Request/reply: publish with a fresh correlation id, await the first
    /// matching reply on this identity's reply topic.
    ///
    /// The transient reply subscription is torn down on every exit path.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] when no reply arrives within `deadline`
    /// (defaults to the configured request timeout); publish errors pass
    /// through.
    pub async fn request(
        &self,
        topic: &str,
        payload_type_url: &str,
        payload: Vec<u8>,
        deadline: Option<Duration>,
    ) -> Result<Envelope, ClientError> {
        let correlation = Uuid::new_v4();
        let reply_topic = reply_topic_for(&self.identity, correlation)?;

        let (reply_tx, reply_rx) = oneshot::channel::<Envelope>();
        let slot = Arc::new(Mutex::new(Some(reply_tx)));
        let reply_handler = handler(move |envelope: Envelope| {
            let slot = slot.clone();
            async move {
                if envelope.correlation_id == Some(correlation) {
                    if let Some(tx) = slot.lock().expect("reply slot lock poisoned").take() {
                        let _ = tx.send(envelope);
                    }
                }
            }
        });
        let token = self.subscribe_pattern(Pattern::Exact(reply_topic), reply_handler)?;

        let options = PublishOptions {
            correlation_id: Some(correlation),
            ..PublishOptions::default()
        };
        let wait = deadline.unwrap_or(self.config.request_timeout);
        let result = async {
            self.publish_with(topic, payload_type_url, payload, options).await?;
            match timeout(wait, reply_rx).await {
                Err(_) => Err(ClientError::Timeout),
                Ok(Err(_)) => Err(ClientError::Cancelled),
                Ok(Ok(envelope)) => Ok(envelope),
            }
        }
        .await;

        self.unsubscribe(token);
        result
    }

    /// Publish a reply to `request`, on the requester's reply topic, with
    /// the request's correlation id.
    ///
    /// # Errors
    ///
    /// [`ClientError::Schema`] when the request has no correlation id;
    /// publish errors pass through.
    pub async fn respond(
        &self,
        request: &Envelope,
        payload_type_url: &str,
        payload: Vec<u8>,
    ) -> Result<Uuid, ClientError> {
        let correlation = request.correlation_id.ok_or(ClientError::Schema(
            SchemaError::MissingField { field: "correlation_id" },
        ))?;
        let reply_topic = reply_topic_for(&request.source, correlation)?;
        self.publish_with(
            reply_topic.as_str(),
            payload_type_url,
            payload,
            PublishOptions {
                correlation_id: Some(correlation),
                ..PublishOptions::default()
            },
        )
        .await
    }

    /// A sink for the log pipeline: encodes and queues without blocking.
    #[must_use]
    pub fn envelope_sink(&self) -> slmf_log::EnvelopeSink {
        let send_tx = self.send_tx.clone();
        Arc::new(move |envelope| match BinaryCodec::encode(&envelope) {
            Ok(bytes) => {
                // Logs shed rather than block.
                let _ = send_tx.try_send(bytes);
            }
            Err(err) => warn!(%err, "log envelope failed to encode"),
        })
    }

    /// Number of installed subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subs.lock().expect("subscription table lock poisoned").len()
    }

    /// Tear the runtime down.
    pub fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for FabricClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for FabricClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricClient")
            .field("identity", &self.identity)
            .finish()
    }
}

/// Jittered exponential backoff connect. `attempts = None` retries until
/// it succeeds (the owning task is aborted when the client goes away);
/// `Some(n)` gives up after `n` tries with the last error.
async fn connect_with_backoff(
    addr: SocketAddr,
    keypair: &Keypair,
    broker_key: &PublicKey,
    config: &ClientConfig,
    attempts: Option<u32>,
) -> Result<SecureStream, TransportError> {
    let mut attempt: u32 = 0;
    loop {
        match SecureStream::connect(addr, keypair, broker_key, &config.transport).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                attempt += 1;
                if let Some(max) = attempts {
                    if attempt >= max {
                        return Err(err);
                    }
                }
                let exp = config
                    .reconnect_base
                    .saturating_mul(1u32 << (attempt - 1).min(16))
                    .min(config.reconnect_cap);
                let jitter = {
                    use rand::Rng;
                    rand::thread_rng().gen_range(0.8..=1.2)
                };
                let delay = exp.mul_f64(jitter);
                debug!(%addr, attempt, ?delay, %err, "connect failed; backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Owns the frontend stream: drains the send queue, reconnecting forever
/// on write failure. The envelope that hit the failure is retried on the
/// fresh connection, preserving per-publisher ordering.
async fn publisher_task(
    stream: SecureStream,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
    config: ClientConfig,
    keypair: Keypair,
    broker_key: PublicKey,
) {
    let (_read_half, mut writer) = stream.into_split();
    while let Some(bytes) = send_rx.recv().await {
        loop {
            match transport_write_scope(writer.send_frame(&bytes)).await {
                Ok(()) => break,
                Err(err) => {
                    debug!(%err, "publish stream failed; reconnecting");
                    match connect_with_backoff(
                        config.frontend_addr,
                        &keypair,
                        &broker_key,
                        &config,
                        None,
                    )
                    .await
                    {
                        Ok(stream) => {
                            let (_r, w) = stream.into_split();
                            writer = w;
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }
}

/// Owns the backend stream: applies filter changes, dispatches inbound
/// envelopes, reconnects and re-installs every active prefix on failure.
async fn backend_task(
    stream: SecureStream,
    mut ctrl_rx: mpsc::UnboundedReceiver<FilterOp>,
    subs: Arc<Mutex<SubscriptionTable>>,
    config: ClientConfig,
    keypair: Keypair,
    broker_key: PublicKey,
) {
    let mut stream = Some(stream);
    loop {
        let current = match stream.take() {
            Some(s) => s,
            None => {
                match connect_with_backoff(
                    config.backend_addr,
                    &keypair,
                    &broker_key,
                    &config,
                    None,
                )
                .await
                {
                    Ok(s) => s,
                    Err(_) => return,
                }
            }
        };
        let (mut reader, mut writer) = current.into_split();

        // Socket reads live in their own task so that the select loop
        // below never cancels a half-read frame.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(64);
        let read_task = tokio::spawn(async move {
            loop {
                match reader.recv_frame().await {
                    Ok(bytes) => {
                        if frame_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(%err, "subscribe stream read failed");
                        break;
                    }
                }
            }
        });

        // (Re-)install every prefix the table currently needs.
        let prefixes = {
            let table = subs.lock().expect("subscription table lock poisoned");
            table.active_prefixes()
        };
        let mut broken = false;
        for prefix in prefixes {
            let frame = FilterOp::Subscribe(prefix).encode();
            if transport_write_scope(writer.send_frame(&frame)).await.is_err() {
                broken = true;
                break;
            }
        }

        while !broken {
            tokio::select! {
                op = ctrl_rx.recv() => match op {
                    None => {
                        // Client dropped.
                        read_task.abort();
                        return;
                    }
                    Some(op) => {
                        let frame = op.encode();
                        if transport_write_scope(writer.send_frame(&frame)).await.is_err() {
                            broken = true;
                        }
                    }
                },
                frame = frame_rx.recv() => match frame {
                    Some(bytes) => match BinaryCodec::decode(&bytes) {
                        Ok(envelope) => {
                            if !config.schemas.accepts(&envelope.topic, envelope.schema_version) {
                                warn!(
                                    topic = %envelope.topic,
                                    version = envelope.schema_version,
                                    "dropping envelope below the registered schema version"
                                );
                            } else {
                                let table = subs.lock().expect("subscription table lock poisoned");
                                table.dispatch(&envelope);
                            }
                        }
                        Err(err) => {
                            warn!(%err, "dropping undecodable envelope");
                        }
                    },
                    None => {
                        debug!("subscribe stream closed; reconnecting");
                        broken = true;
                    }
                },
            }
        }
        read_task.abort();
    }
}
