// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subscription bookkeeping and per-subscription delivery workers.
//!
//! Every subscription owns a FIFO queue drained by a dedicated worker, so
//! one handler is never invoked concurrently with itself and sees
//! envelopes in arrival order. Independent subscriptions interleave only
//! at await points, which is the cooperative contract.

use futures::future::BoxFuture;
use slmf_core::Pattern;
use slmf_protocol::Envelope;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// An installed handler. Build one with [`handler`].
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
///
/// Keeping the same `Handler` value and subscribing it twice with the same
/// pattern coalesces into a single subscription.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |env| Box::pin(f(env)))
}

/// Opaque id of one installed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub(crate) u64);

pub(crate) struct SubEntry {
    pub(crate) token: SubscriptionToken,
    pub(crate) pattern: Pattern,
    pub(crate) handler: Handler,
    queue: mpsc::UnboundedSender<Envelope>,
    worker: JoinHandle<()>,
}

/// What [`SubscriptionTable::install`] decided.
pub(crate) enum InstallOutcome {
    /// Fresh subscription; install the transport prefix if it is new.
    Added {
        token: SubscriptionToken,
        new_prefix: Option<Vec<u8>>,
    },
    /// Same pattern and same handler already present.
    Coalesced { token: SubscriptionToken },
}

/// What [`SubscriptionTable::remove`] decided.
pub(crate) struct RemoveOutcome {
    /// The transport prefix to drop, when no other subscription shares it.
    pub(crate) released_prefix: Option<Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: Vec<SubEntry>,
    next_token: u64,
}

impl SubscriptionTable {
    /// Install a subscription, spawning its delivery worker.
    pub(crate) fn install(&mut self, pattern: Pattern, handler: Handler) -> InstallOutcome {
        if let Some(existing) = self
            .entries
            .iter()
            .find(|e| e.pattern == pattern && Arc::ptr_eq(&e.handler, &handler))
        {
            return InstallOutcome::Coalesced { token: existing.token };
        }

        let prefix = pattern.transport_prefix().to_vec();
        let prefix_is_new = !self
            .entries
            .iter()
            .any(|e| e.pattern.transport_prefix() == prefix.as_slice());

        let token = SubscriptionToken(self.next_token);
        self.next_token += 1;

        let (queue, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let worker_handler = handler.clone();
        let worker = tokio::spawn(async move {
            // One at a time, in arrival order.
            while let Some(envelope) = rx.recv().await {
                worker_handler(envelope).await;
            }
        });

        self.entries.push(SubEntry { token, pattern, handler, queue, worker });
        InstallOutcome::Added {
            token,
            new_prefix: prefix_is_new.then_some(prefix),
        }
    }

    /// Remove a subscription and stop its worker.
    pub(crate) fn remove(&mut self, token: SubscriptionToken) -> Option<RemoveOutcome> {
        let idx = self.entries.iter().position(|e| e.token == token)?;
        let entry = self.entries.remove(idx);
        entry.worker.abort();
        let prefix = entry.pattern.transport_prefix().to_vec();
        let still_shared = self
            .entries
            .iter()
            .any(|e| e.pattern.transport_prefix() == prefix.as_slice());
        Some(RemoveOutcome {
            released_prefix: (!still_shared).then_some(prefix),
        })
    }

    /// Fan an envelope out to every matching subscription, in
    /// registration order.
    pub(crate) fn dispatch(&self, envelope: &Envelope) {
        for entry in &self.entries {
            if entry.pattern.matches(&envelope.topic) {
                // A closed queue means the worker died; skip quietly, the
                // subscription is torn down separately.
                let _ = entry.queue.send(envelope.clone());
            }
        }
    }

    /// Every distinct transport prefix currently required.
    pub(crate) fn active_prefixes(&self) -> Vec<Vec<u8>> {
        let mut prefixes: Vec<Vec<u8>> = Vec::new();
        for entry in &self.entries {
            let p = entry.pattern.transport_prefix().to_vec();
            if !prefixes.contains(&p) {
                prefixes.push(p);
            }
        }
        prefixes
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for SubscriptionTable {
    fn drop(&mut self) {
        for entry in &self.entries {
            entry.worker.abort();
        }
    }
}
