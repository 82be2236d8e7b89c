// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixture: a full in-process fabric on ephemeral loopback ports.

use slmf_broker::{Broker, BrokerConfig, BrokerHandle, BrokerTee};
use slmf_client::{ClientConfig, FabricClient};
use slmf_core::ComponentId;
use slmf_keyvault::{KeyVault, Keypair, MasterSecret};
use slmf_log::LogPipeline;
use slmf_store::{EventStore, PersistencePolicy, StoreCipher, StoreConfig};
use std::sync::Arc;
use std::time::Duration;
use x25519_dalek::PublicKey;

pub struct TestFabric {
    pub broker: BrokerHandle,
    pub store: EventStore,
    pub vault: Arc<KeyVault>,
    pub broker_key: PublicKey,
}

impl TestFabric {
    /// Broker + encrypted store + standard persistence policy, wired the
    /// way the daemon wires them.
    pub async fn start() -> Self {
        Self::start_with(BrokerConfig::ephemeral()).await
    }

    pub async fn start_with(config: BrokerConfig) -> Self {
        let vault = Arc::new(KeyVault::new(MasterSecret::new(vec![7u8; 32]).unwrap()));
        let broker_keypair = vault.derive(&ComponentId::broker()).unwrap();
        let broker_key = *broker_keypair.public();
        let authorized = Arc::new(vault.authorized_client_keys().unwrap());

        let store = EventStore::open(&StoreConfig::in_memory(), StoreCipher::derive(&[9u8; 32]))
            .await
            .unwrap();
        let policy = PersistencePolicy::standard()
            .with_probe(Arc::new(slmf_log::warning_or_above));

        let pipeline = LogPipeline::new(ComponentId::broker(), "system");
        pipeline.install_fallback(store.clone());

        let broker = Broker::start(
            config,
            broker_keypair,
            authorized,
            Some(BrokerTee { store: store.clone(), policy }),
            pipeline.clone(),
        )
        .await
        .unwrap();

        let controller = broker.controller();
        pipeline.install_sink(Arc::new(move |envelope| {
            controller.publish_internal(envelope);
        }));

        Self { broker, store, vault, broker_key }
    }

    pub fn keypair(&self, identity: &str) -> Keypair {
        self.vault.derive(&ComponentId::new(identity)).unwrap()
    }

    /// Connect an authorized client runtime.
    pub async fn client(&self, identity: &str) -> FabricClient {
        let mut config = ClientConfig::for_identity(ComponentId::new(identity));
        config.frontend_addr = self.broker.frontend_addr();
        config.backend_addr = self.broker.backend_addr();
        FabricClient::connect(config, self.keypair(identity), self.broker_key)
            .await
            .unwrap()
    }
}

/// Give in-flight subscriptions and deliveries a moment to land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// Poll `probe` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
