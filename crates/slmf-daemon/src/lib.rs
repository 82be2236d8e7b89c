// SPDX-License-Identifier: MIT OR Apache-2.0
//! The composition root.
//!
//! Constructs the key vault, store, broker, scheduler client, scheduler
//! and control plane, and threads them through each other explicitly.
//! There are no module-level singletons: everything a component needs
//! arrives through its constructor.
//!
//! Fail-secure ordering: key material is derived before any socket is
//! bound, so a missing master secret aborts startup without ever
//! listening.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use slmf_broker::{Broker, BrokerConfig, BrokerError, BrokerHandle, BrokerTee};
use slmf_client::{ClientConfig, ClientError, FabricClient};
use slmf_control::ControlService;
use slmf_core::{ComponentId, Topic};
use slmf_keyvault::{KeyVault, KeyVaultError, MasterSecret};
use slmf_log::LogPipeline;
use slmf_protocol::SchemaRegistry;
use slmf_scheduler::{
    CancelToken, LoopLagWatchdog, Scheduler, SchedulerConfig, SchedulerError, StatusPublisher,
    TaskRegistry, TaskSpec, WatchdogConfig,
};
use slmf_store::{EventStore, PersistencePolicy, StoreCipher, StoreConfig, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Identity used to derive the store's at-rest key. Not a connecting
/// component, so it is deliberately absent from the allow-list.
const STORE_KEY_IDENTITY: &str = "event_store_at_rest";

/// Daemon startup failures.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Key material missing or derivation failed. Fatal at startup.
    #[error(transparent)]
    KeyVault(#[from] KeyVaultError),

    /// Broker endpoints could not start.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The encrypted store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The in-process scheduler client could not connect.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Built-in task registration failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Everything the daemon process runs.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Broker endpoints and watermarks.
    pub broker: BrokerConfig,
    /// Scheduler cadence and policies.
    pub scheduler: SchedulerConfig,
    /// Where the encrypted store lives.
    pub store: StoreConfig,
    /// Gates `Conditional` persistence rules.
    pub debug_persistence: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::in_memory(),
            debug_persistence: false,
        }
    }
}

/// Publishes scheduler status through the fabric client.
struct ClientPublisher(Arc<FabricClient>);

#[async_trait]
impl StatusPublisher for ClientPublisher {
    async fn publish_status(&self, topic: &str, payload_type_url: &str, payload: Vec<u8>) {
        if let Err(err) = self.0.publish(topic, payload_type_url, payload).await {
            warn!(%err, topic, "status publish failed");
        }
    }
}

/// A running daemon: broker, scheduler, control plane, log pipeline.
pub struct Daemon {
    broker: BrokerHandle,
    control: ControlService,
    scheduler_shutdown: CancelToken,
    scheduler_task: tokio::task::JoinHandle<()>,
    client: Arc<FabricClient>,
}

impl Daemon {
    /// Start the whole fabric core.
    ///
    /// `master` is whatever the external key manager produced; `None`
    /// fails with `KeyMaterialUnavailable` before any socket exists.
    ///
    /// # Errors
    ///
    /// See [`DaemonError`]; every variant is fatal for startup.
    pub async fn start(
        config: DaemonConfig,
        master: Option<MasterSecret>,
    ) -> Result<Self, DaemonError> {
        let vault = Arc::new(match master {
            Some(secret) => KeyVault::new(secret),
            None => KeyVault::locked(),
        });

        // Derive everything before binding anything.
        let broker_keypair = vault.derive(&ComponentId::broker())?;
        let broker_public = *broker_keypair.public();
        let authorized = Arc::new(vault.authorized_client_keys()?);
        let scheduler_identity = ComponentId::new("message_bus_client_scheduler");
        let scheduler_keypair = vault.derive(&scheduler_identity)?;
        let store_seed = vault.derive(&ComponentId::new(STORE_KEY_IDENTITY))?;

        let store = EventStore::open(
            &config.store,
            StoreCipher::derive(&store_seed.secret().to_bytes()),
        )
        .await?;

        let pipeline = LogPipeline::new(ComponentId::broker(), "system");
        pipeline.install_fallback(store.clone());

        let policy = PersistencePolicy::standard()
            .with_debug_persistence(config.debug_persistence)
            .with_probe(Arc::new(slmf_log::warning_or_above));

        let broker = Broker::start(
            config.broker,
            broker_keypair,
            authorized,
            Some(BrokerTee { store: store.clone(), policy }),
            pipeline.clone(),
        )
        .await?;

        // Broker-process log records now flow straight into the router.
        let controller = broker.controller();
        pipeline.install_sink(Arc::new(move |envelope| {
            controller.publish_internal(envelope);
        }));

        let mut client_config = ClientConfig::for_identity(scheduler_identity);
        client_config.frontend_addr = broker.frontend_addr();
        client_config.backend_addr = broker.backend_addr();
        client_config.schemas = fabric_schemas();
        let client = Arc::new(
            FabricClient::connect(client_config, scheduler_keypair, broker_public).await?,
        );

        let scheduler = Scheduler::new(
            config.scheduler,
            TaskRegistry::with_builtins(),
            store,
            Arc::new(ClientPublisher(client.clone())),
            LoopLagWatchdog::spawn(WatchdogConfig::default()),
        );
        register_builtin_tasks(&scheduler).await?;

        let scheduler_shutdown = CancelToken::new();
        let scheduler_task = tokio::spawn(scheduler.clone().run(scheduler_shutdown.clone()));

        let control = ControlService::start(
            client.clone(),
            scheduler,
            broker.controller(),
            vault,
        )?;

        info!("fabric daemon started");
        Ok(Self {
            broker,
            control,
            scheduler_shutdown,
            scheduler_task,
            client,
        })
    }

    /// Broker frontend address.
    #[must_use]
    pub fn frontend_addr(&self) -> std::net::SocketAddr {
        self.broker.frontend_addr()
    }

    /// Broker backend address.
    #[must_use]
    pub fn backend_addr(&self) -> std::net::SocketAddr {
        self.broker.backend_addr()
    }

    /// Graceful stop: control plane, scheduler, then broker.
    pub async fn shutdown(self) {
        self.control.stop();
        self.scheduler_shutdown.cancel();
        let _ = self.scheduler_task.await;
        self.broker.shutdown().await;
        drop(self.client);
        info!("fabric daemon stopped");
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("frontend", &self.frontend_addr())
            .field("backend", &self.backend_addr())
            .finish()
    }
}

/// The explicit schema list for the core topic families. Collaborator
/// processes build their own list the same way; there is no discovery.
fn fabric_schemas() -> SchemaRegistry {
    let mut schemas = SchemaRegistry::new();
    for (topic, version) in [
        ("conversation/user/input/v1", 1),
        ("conversation/ai/response/v1", 1),
        ("system/health", 1),
        ("system/bus/started", 1),
        ("system/bus/stopping", 1),
        ("system/module/registered", 1),
    ] {
        let topic = Topic::parse(topic).expect("core topics are canonical constants");
        schemas
            .register(&topic, version)
            .expect("a fresh registry cannot regress");
    }
    schemas
}

/// Install the standing maintenance tasks unless the operator already
/// customized them.
async fn register_builtin_tasks(scheduler: &Scheduler) -> Result<(), SchedulerError> {
    let builtins = [
        TaskSpec {
            task_id: "maintenance.log_retention".into(),
            task_class: "maintenance.log_retention".into(),
            schedule: "cron:0 3 * * *".into(),
            config: serde_json::json!({ "retention_days": 30, "prefix": "logs/" }),
            enabled: true,
        },
        TaskSpec {
            task_id: "system.health_check".into(),
            task_class: "system.health_check".into(),
            schedule: "interval:300".into(),
            config: serde_json::json!({}),
            enabled: true,
        },
        TaskSpec {
            task_id: "maintenance.vacuum".into(),
            task_class: "maintenance.vacuum".into(),
            schedule: "cron:0 4 * * 1".into(),
            config: serde_json::json!({}),
            enabled: true,
        },
    ];
    for spec in builtins {
        if scheduler.status(&spec.task_id).await.is_ok() {
            continue;
        }
        scheduler.create_task(spec).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_master_secret_fails_before_binding() {
        let mut config = DaemonConfig::default();
        // A fixed port we can probe afterwards.
        config.broker = BrokerConfig::ephemeral();
        config.broker.frontend_addr = "127.0.0.1:59155".parse().unwrap();
        config.broker.backend_addr = "127.0.0.1:59156".parse().unwrap();

        let err = Daemon::start(config, None).await.unwrap_err();
        assert!(matches!(
            err,
            DaemonError::KeyVault(KeyVaultError::KeyMaterialUnavailable)
        ));

        // Nothing must be listening.
        for port in [59155u16, 59156] {
            let addr = format!("127.0.0.1:{port}");
            assert!(
                tokio::net::TcpStream::connect(&addr).await.is_err(),
                "no socket may be bound on {addr}"
            );
        }
    }

    #[tokio::test]
    async fn daemon_starts_and_stops_with_a_secret() {
        let mut config = DaemonConfig::default();
        config.broker = BrokerConfig::ephemeral();
        let master = MasterSecret::new(vec![21u8; 32]).unwrap();

        let daemon = Daemon::start(config, Some(master)).await.unwrap();
        assert_ne!(daemon.frontend_addr().port(), 0);
        assert_ne!(daemon.backend_addr().port(), 0);
        daemon.shutdown().await;
    }
}
