// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The status writer: reconciles computed statuses with the API when this
//! instance holds leadership, and drops them on the floor when it does not.
//! The build stays pure either way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rudder_k8s::{HttpProxy, IngressRoute, ResourceKey, ResourceKind};

use crate::context::Context;
use crate::dag::status::{ResourceStatus, StatusMap};

const MAX_CONFLICT_RETRIES: usize = 4;
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StatusWriteError {
    /// Optimistic concurrency failure; safe to retry with the same computed
    /// status.
    #[error("resource version conflict")]
    Conflict,
    #[error("{0}")]
    Other(String),
}

/// One write cycle against the API: read the current object, apply the
/// computed status, write back with its resource version. Behind a trait so
/// the writer is testable without a cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn write_status(
        &self,
        key: &ResourceKey,
        status: &ResourceStatus,
    ) -> Result<(), StatusWriteError>;
}

pub struct StatusWriter {
    context: Arc<Context>,
    client: Arc<dyn StatusClient>,
    leadership: watch::Receiver<bool>,
    statuses: mpsc::UnboundedReceiver<StatusMap>,
    /// Last status successfully written per resource; writes are skipped
    /// when nothing changed.
    written: HashMap<ResourceKey, ResourceStatus>,
}

impl StatusWriter {
    pub fn new(
        context: Arc<Context>,
        client: Arc<dyn StatusClient>,
        leadership: watch::Receiver<bool>,
        statuses: mpsc::UnboundedReceiver<StatusMap>,
    ) -> Self {
        Self {
            context,
            client,
            leadership,
            statuses,
            written: HashMap::new(),
        }
    }

    fn is_leader(&self) -> bool {
        !self.context.parameters.leader_election_enabled || *self.leadership.borrow()
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Bounded drain: flush whatever is queued, then stop.
                    let mut latest = None;
                    while let Ok(map) = self.statuses.try_recv() {
                        latest = Some(map);
                    }
                    if let Some(map) = latest {
                        if self.is_leader() {
                            let _ = tokio::time::timeout(
                                SHUTDOWN_DRAIN_DEADLINE,
                                self.reconcile(map),
                            )
                            .await;
                        }
                    }
                    debug!("status writer stopping");
                    return;
                }

                map = self.statuses.recv() => {
                    let Some(mut map) = map else {
                        debug!("status source dropped; status writer stopping");
                        return;
                    };
                    // Each map replaces the previous; only the newest queued
                    // one matters.
                    while let Ok(newer) = self.statuses.try_recv() {
                        map = newer;
                    }
                    if !self.is_leader() {
                        self.context.metrics.status_dropped_not_leader.inc();
                        debug!("not leader; dropping status map");
                        // A later leadership gain re-writes everything.
                        self.written.clear();
                        continue;
                    }
                    self.reconcile(map).await;
                }
            }
        }
    }

    async fn reconcile(&mut self, map: StatusMap) {
        // The map is a replacement: forget resources it no longer covers.
        self.written.retain(|key, _| map.contains_key(key));

        for (key, status) in map {
            if self.written.get(&key) == Some(&status) {
                continue;
            }
            match self.write_with_retry(&key, &status).await {
                Ok(()) => {
                    self.context.metrics.status_writes.inc();
                    self.written.insert(key, status);
                }
                Err(e) => {
                    warn!(resource = %key, error = %e, "status write failed");
                }
            }
        }
    }

    async fn write_with_retry(
        &self,
        key: &ResourceKey,
        status: &ResourceStatus,
    ) -> Result<(), StatusWriteError> {
        for attempt in 0..MAX_CONFLICT_RETRIES {
            match self.client.write_status(key, status).await {
                Ok(()) => return Ok(()),
                Err(StatusWriteError::Conflict) => {
                    self.context.metrics.status_conflicts.inc();
                    debug!(resource = %key, attempt, "status write conflicted; retrying");
                }
                Err(other) => return Err(other),
            }
        }
        Err(StatusWriteError::Other(format!(
            "gave up after {MAX_CONFLICT_RETRIES} resource version conflicts"
        )))
    }
}

/// API-backed client. Each write is a read-modify-write against the status
/// subresource; a 409 surfaces as [`StatusWriteError::Conflict`].
pub struct KubeStatusClient {
    client: kube::Client,
}

impl KubeStatusClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn write_status(
        &self,
        key: &ResourceKey,
        status: &ResourceStatus,
    ) -> Result<(), StatusWriteError> {
        match key.kind {
            ResourceKind::HttpProxy => {
                let api = kube::Api::<HttpProxy>::namespaced(
                    self.client.clone(),
                    &key.key.namespace,
                );
                let mut proxy = api.get(&key.key.name).await.map_err(to_write_error)?;
                proxy.api_version =
                    Some(<HttpProxy as k8s_openapi::Resource>::API_VERSION.to_string());
                proxy.kind = Some(<HttpProxy as k8s_openapi::Resource>::KIND.to_string());
                proxy.status = Some(rudder_k8s::HttpProxyStatus {
                    current_status: Some(status.state.as_str().to_string()),
                    description: Some(status.description.clone()),
                });
                let data = serde_json::to_vec(&proxy)
                    .map_err(|e| StatusWriteError::Other(e.to_string()))?;
                api.replace_status(&key.key.name, &kube::api::PostParams::default(), data)
                    .await
                    .map_err(to_write_error)?;
                Ok(())
            }
            ResourceKind::IngressRoute => {
                let api = kube::Api::<IngressRoute>::namespaced(
                    self.client.clone(),
                    &key.key.namespace,
                );
                let mut route = api.get(&key.key.name).await.map_err(to_write_error)?;
                route.api_version =
                    Some(<IngressRoute as k8s_openapi::Resource>::API_VERSION.to_string());
                route.kind = Some(<IngressRoute as k8s_openapi::Resource>::KIND.to_string());
                route.status = Some(rudder_k8s::IngressRouteStatus {
                    current_status: Some(status.state.as_str().to_string()),
                    description: Some(status.description.clone()),
                });
                let data = serde_json::to_vec(&route)
                    .map_err(|e| StatusWriteError::Other(e.to_string()))?;
                api.replace_status(&key.key.name, &kube::api::PostParams::default(), data)
                    .await
                    .map_err(to_write_error)?;
                Ok(())
            }
            ResourceKind::HttpRoute
            | ResourceKind::TlsRoute
            | ResourceKind::TcpRoute
            | ResourceKind::Gateway
            | ResourceKind::GatewayClass => {
                // Gateway API statuses are typed conditions owned per
                // controller; a merge patch of the summarised condition
                // leaves other controllers' fields alone.
                let accepted = match status.state {
                    crate::dag::status::StatusState::Accepted => "True",
                    _ => "False",
                };
                let patch = json!({
                    "status": {
                        "conditions": [{
                            "type": "Accepted",
                            "status": accepted,
                            "reason": status.state.as_str(),
                            "message": status.description,
                        }]
                    }
                });
                self.merge_status_patch(key, patch).await
            }
            _ => Ok(()),
        }
    }
}

impl KubeStatusClient {
    async fn merge_status_patch(
        &self,
        key: &ResourceKey,
        patch: serde_json::Value,
    ) -> Result<(), StatusWriteError> {
        let params = kube::api::PatchParams::default();
        let patch = kube::api::Patch::Merge(patch);
        match key.kind {
            ResourceKind::HttpRoute => {
                kube::Api::<rudder_k8s::HttpRoute>::namespaced(
                    self.client.clone(),
                    &key.key.namespace,
                )
                .patch_status(&key.key.name, &params, &patch)
                .await
                .map_err(to_write_error)?;
            }
            ResourceKind::TlsRoute => {
                kube::Api::<rudder_k8s::TlsRoute>::namespaced(
                    self.client.clone(),
                    &key.key.namespace,
                )
                .patch_status(&key.key.name, &params, &patch)
                .await
                .map_err(to_write_error)?;
            }
            ResourceKind::TcpRoute => {
                kube::Api::<rudder_k8s::TcpRoute>::namespaced(
                    self.client.clone(),
                    &key.key.namespace,
                )
                .patch_status(&key.key.name, &params, &patch)
                .await
                .map_err(to_write_error)?;
            }
            ResourceKind::Gateway => {
                kube::Api::<rudder_k8s::Gateway>::namespaced(
                    self.client.clone(),
                    &key.key.namespace,
                )
                .patch_status(&key.key.name, &params, &patch)
                .await
                .map_err(to_write_error)?;
            }
            ResourceKind::GatewayClass => {
                kube::Api::<rudder_k8s::GatewayClass>::all(self.client.clone())
                    .patch_status(&key.key.name, &params, &patch)
                    .await
                    .map_err(to_write_error)?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn to_write_error(e: kube::Error) -> StatusWriteError {
    match e {
        kube::Error::Api(response) if response.code == 409 => StatusWriteError::Conflict,
        other => StatusWriteError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::status::StatusState;
    use rudder_k8s::ObjectKey;

    fn status_map(name: &str, state: StatusState) -> StatusMap {
        let mut map = StatusMap::new();
        map.insert(
            ResourceKey::new(ResourceKind::HttpProxy, ObjectKey::new("default", name)),
            ResourceStatus {
                state,
                description: "test".to_string(),
            },
        );
        map
    }

    fn writer(
        client: MockStatusClient,
        leader: bool,
    ) -> (StatusWriter, mpsc::UnboundedSender<StatusMap>, watch::Sender<bool>) {
        let context = Context::new_for_test();
        let (leader_tx, leader_rx) = watch::channel(leader);
        let (map_tx, map_rx) = mpsc::unbounded_channel();
        let writer = StatusWriter::new(context, Arc::new(client), leader_rx, map_rx);
        (writer, map_tx, leader_tx)
    }

    #[tokio::test]
    async fn follower_drops_statuses() {
        let mut client = MockStatusClient::new();
        client.expect_write_status().times(0);

        let (writer, map_tx, _leader_tx) = writer(client, false);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(writer.run(shutdown.clone()));

        map_tx.send(status_map("site", StatusState::Accepted)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn leader_writes_each_changed_status_once() {
        let mut client = MockStatusClient::new();
        client
            .expect_write_status()
            .times(1)
            .returning(|_, _| Ok(()));

        let (writer, map_tx, _leader_tx) = writer(client, true);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(writer.run(shutdown.clone()));

        // The same status twice: one write.
        map_tx.send(status_map("site", StatusState::Accepted)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        map_tx.send(status_map("site", StatusState::Accepted)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_the_write_lands() {
        let mut client = MockStatusClient::new();
        let mut attempts = 0;
        client.expect_write_status().times(3).returning(move |_, _| {
            attempts += 1;
            if attempts < 3 {
                Err(StatusWriteError::Conflict)
            } else {
                Ok(())
            }
        });

        let (writer, map_tx, _leader_tx) = writer(client, true);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(writer.run(shutdown.clone()));

        map_tx.send(status_map("site", StatusState::Invalid)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_leader_election_always_writes() {
        let mut client = MockStatusClient::new();
        client
            .expect_write_status()
            .times(1)
            .returning(|_, _| Ok(()));

        let context = {
            let mut parameters = rudder_config::Parameters::default();
            parameters.leader_election_enabled = false;
            Context::new_for_test_with(parameters)
        };
        let (_leader_tx, leader_rx) = watch::channel(false);
        let (map_tx, map_rx) = mpsc::unbounded_channel();
        let writer = StatusWriter::new(context, Arc::new(client), leader_rx, map_rx);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(writer.run(shutdown.clone()));
        map_tx.send(status_map("site", StatusState::Accepted)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        task.await.unwrap();
    }
}
