// SPDX-License-Identifier: MIT OR Apache-2.0
//! The administrative plane: request/reply over ordinary fabric messages.
//!
//! There is no separate RPC surface. Admin-capable components publish
//! JSON requests on `control/…` topics with a fresh `correlation_id`; the
//! control service replies on the requester's reply topic with a stable
//! error code on failure. Requests from identities outside the
//! admin-capable subset are answered with `UNAUTHORIZED_PEER` and logged.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use slmf_broker::BrokerController;
use slmf_client::{handler, ClientError, FabricClient, SubscriptionToken};
use slmf_core::{Coded, FabricCode};
use slmf_keyvault::KeyVault;
use slmf_protocol::Envelope;
use slmf_scheduler::{Scheduler, TaskSpec};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Payload schema for control replies.
pub const CONTROL_REPLY_TYPE: &str = "aico.control.Reply";

/// Wire shape of every control reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    /// Whether the request succeeded.
    pub ok: bool,
    /// Stable error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Operation-specific result data.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ControlReply {
    fn success(data: serde_json::Value) -> Self {
        Self { ok: true, error_code: None, error: None, data }
    }

    fn failure(code: FabricCode, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_code: Some(code.as_str().to_owned()),
            error: Some(detail.into()),
            data: serde_json::Value::Null,
        }
    }
}

/// Body of `control/scheduler/task/create`.
#[derive(Debug, Clone, Deserialize)]
struct CreateTaskRequest {
    task_id: String,
    task_class: String,
    schedule: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Body of task requests addressing one task.
#[derive(Debug, Clone, Deserialize)]
struct TaskIdRequest {
    task_id: String,
}

/// Handle to the running control service.
pub struct ControlService {
    token: SubscriptionToken,
    client: Arc<FabricClient>,
    worker: JoinHandle<()>,
}

impl ControlService {
    /// Subscribe to `control/` and start answering requests.
    ///
    /// # Errors
    ///
    /// Propagates subscription failures from the client runtime.
    pub fn start(
        client: Arc<FabricClient>,
        scheduler: Arc<Scheduler>,
        broker: BrokerController,
        keyvault: Arc<KeyVault>,
    ) -> Result<Self, ClientError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel::<Envelope>();
        let token = client.subscribe(
            "control/",
            handler(move |envelope: Envelope| {
                let request_tx = request_tx.clone();
                async move {
                    let _ = request_tx.send(envelope);
                }
            }),
        )?;

        let worker = tokio::spawn(service_loop(
            request_rx,
            client.clone(),
            scheduler,
            broker,
            keyvault,
        ));
        Ok(Self { token, client, worker })
    }

    /// Stop answering control requests.
    pub fn stop(self) {
        self.client.unsubscribe(self.token);
        self.worker.abort();
    }
}

impl std::fmt::Debug for ControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ControlService")
    }
}

/// Requests are handled one at a time, in arrival order, which keeps
/// admin mutations serialized the same way the broker loop serializes
/// routing-table changes.
async fn service_loop(
    mut requests: mpsc::UnboundedReceiver<Envelope>,
    client: Arc<FabricClient>,
    scheduler: Arc<Scheduler>,
    broker: BrokerController,
    keyvault: Arc<KeyVault>,
) {
    let started_at_ms = Utc::now().timestamp_millis();
    while let Some(request) = requests.recv().await {
        if request.correlation_id.is_none() {
            warn!(topic = %request.topic, "control request without correlation id; dropped");
            continue;
        }
        if !request.source.is_admin_capable() {
            warn!(
                source = %request.source,
                topic = %request.topic,
                "control request from non-admin identity"
            );
            let reply = ControlReply::failure(
                FabricCode::UnauthorizedPeer,
                "identity is not admin-capable",
            );
            send_reply(&client, &request, reply).await;
            continue;
        }

        let reply = handle_request(&request, &scheduler, &broker, &keyvault, started_at_ms).await;
        send_reply(&client, &request, reply).await;
    }
}

async fn send_reply(client: &FabricClient, request: &Envelope, reply: ControlReply) {
    let payload = match serde_json::to_vec(&reply) {
        Ok(p) => p,
        Err(err) => {
            warn!(%err, "control reply serialization failed");
            return;
        }
    };
    if let Err(err) = client.respond(request, CONTROL_REPLY_TYPE, payload).await {
        debug!(%err, topic = %request.topic, "control reply publish failed");
    }
}

async fn handle_request(
    request: &Envelope,
    scheduler: &Scheduler,
    broker: &BrokerController,
    keyvault: &KeyVault,
    started_at_ms: i64,
) -> ControlReply {
    match request.topic.as_str() {
        "control/scheduler/task/list" => match scheduler.list().await {
            Ok(tasks) => match serde_json::to_value(&tasks) {
                Ok(data) => ControlReply::success(serde_json::json!({ "tasks": data })),
                Err(err) => ControlReply::failure(FabricCode::SchemaError, err.to_string()),
            },
            Err(err) => ControlReply::failure(err.code(), err.to_string()),
        },

        "control/scheduler/task/create" => {
            match serde_json::from_slice::<CreateTaskRequest>(&request.payload) {
                Err(err) => ControlReply::failure(FabricCode::SchemaError, err.to_string()),
                Ok(body) => {
                    let spec = TaskSpec {
                        task_id: body.task_id,
                        task_class: body.task_class,
                        schedule: body.schedule,
                        config: body.config,
                        enabled: body.enabled,
                    };
                    match scheduler.create_task(spec).await {
                        Ok(record) => ControlReply::success(
                            serde_json::to_value(&record).unwrap_or_default(),
                        ),
                        Err(err) => ControlReply::failure(err.code(), err.to_string()),
                    }
                }
            }
        }

        "control/scheduler/task/delete" => with_task_id(request, |task_id| async move {
            match scheduler.delete_task(&task_id).await {
                Ok(true) => ControlReply::success(serde_json::json!({ "deleted": true })),
                Ok(false) => ControlReply::failure(FabricCode::SchemaError, "unknown task"),
                Err(err) => ControlReply::failure(err.code(), err.to_string()),
            }
        })
        .await,

        "control/scheduler/task/enable" => with_task_id(request, |task_id| async move {
            match scheduler.set_enabled(&task_id, true).await {
                Ok(()) => ControlReply::success(serde_json::json!({ "enabled": true })),
                Err(err) => ControlReply::failure(err.code(), err.to_string()),
            }
        })
        .await,

        "control/scheduler/task/disable" => with_task_id(request, |task_id| async move {
            match scheduler.set_enabled(&task_id, false).await {
                Ok(()) => ControlReply::success(serde_json::json!({ "enabled": false })),
                Err(err) => ControlReply::failure(err.code(), err.to_string()),
            }
        })
        .await,

        "control/scheduler/task/status" => with_task_id(request, |task_id| async move {
            match scheduler.status(&task_id).await {
                Ok(status) => ControlReply::success(
                    serde_json::to_value(&status).unwrap_or_default(),
                ),
                Err(err) => ControlReply::failure(err.code(), err.to_string()),
            }
        })
        .await,

        "control/bus/stats" => match broker.stats().await {
            Ok(stats) => ControlReply::success(serde_json::to_value(&stats).unwrap_or_default()),
            Err(err) => ControlReply::failure(err.code(), err.to_string()),
        },

        "control/bus/health" => match broker.stats().await {
            Ok(stats) => ControlReply::success(serde_json::json!({
                "status": "healthy",
                "uptime_ms": Utc::now().timestamp_millis() - started_at_ms,
                "active_subscribers": stats.active_subscribers,
                "total_published": stats.total_published,
                "dropped_subscribers": stats.dropped_subscribers,
                "store_write_failures": stats.store_write_failures,
            })),
            Err(err) => ControlReply::failure(err.code(), err.to_string()),
        },

        "control/security/rotate_keys" => {
            // No secret crosses the fabric. The external key manager has
            // already rotated the master secret; dropping the cache makes
            // the next derivation pick it up.
            keyvault.forget_cached();
            ControlReply::success(serde_json::json!({ "rotated": true }))
        }

        other => ControlReply::failure(
            FabricCode::SchemaError,
            format!("unknown control operation: {other}"),
        ),
    }
}

async fn with_task_id<F, Fut>(request: &Envelope, f: F) -> ControlReply
where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = ControlReply>,
{
    match serde_json::from_slice::<TaskIdRequest>(&request.payload) {
        Ok(body) => f(body.task_id).await,
        Err(err) => ControlReply::failure(FabricCode::SchemaError, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_serialization_success() {
        let reply = ControlReply::success(serde_json::json!({ "n": 1 }));
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"ok\":true"));
        assert!(!json.contains("error_code"));
    }

    #[test]
    fn reply_serialization_failure_carries_stable_code() {
        let reply = ControlReply::failure(FabricCode::UnauthorizedPeer, "nope");
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"UNAUTHORIZED_PEER\""));
        let back: ControlReply = serde_json::from_str(&json).unwrap();
        assert!(!back.ok);
        assert_eq!(back.error_code.as_deref(), Some("UNAUTHORIZED_PEER"));
    }

    #[test]
    fn create_request_defaults() {
        let body: CreateTaskRequest = serde_json::from_str(
            r#"{"task_id":"a","task_class":"b","schedule":"interval:5"}"#,
        )
        .unwrap();
        assert!(body.enabled);
        assert_eq!(body.config, serde_json::Value::Null);
    }
}
