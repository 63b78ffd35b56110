// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The debounced driver loop: store notifications in, rebuild requests out.
//! Endpoint-only notifications take the cheap path (EDS regroup + install)
//! and never trigger a DAG build.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::builder_thread::BuildDispatcher;
use crate::cache::SnapshotCache;
use crate::context::Context;
use crate::error::CoreResult;
use crate::store::{ResourceStore, StoreEvent};
use crate::xds;

/// A pending rebuild and its coalescing window.
struct Pending {
    first: Instant,
    deadline: Instant,
}

impl Pending {
    fn arm(min_hold: std::time::Duration) -> Self {
        let now = Instant::now();
        Self {
            first: now,
            deadline: now + min_hold,
        }
    }

    /// Extends the quiet period, capped at `max_hold` past the first event.
    fn extend(&mut self, min_hold: std::time::Duration, max_hold: std::time::Duration) {
        self.deadline = std::cmp::min(Instant::now() + min_hold, self.first + max_hold);
    }
}

pub struct EventHandler {
    context: Arc<Context>,
    store: Arc<ResourceStore>,
    dispatcher: BuildDispatcher,
    cache: Arc<SnapshotCache>,
}

impl EventHandler {
    pub fn new(
        context: Arc<Context>,
        store: Arc<ResourceStore>,
        dispatcher: BuildDispatcher,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        Self {
            context,
            store,
            dispatcher,
            cache,
        }
    }

    /// Runs until cancelled. The first build happens immediately so streams
    /// have something to serve as soon as the initial sync lands.
    pub async fn run(self, shutdown: CancellationToken) -> CoreResult<()> {
        let mut events = self.store.subscribe();

        self.rebuild_dag().await?;
        self.rebuild_endpoints();

        let debounce = self.context.parameters.debounce.clone();
        let mut dag_pending: Option<Pending> = None;
        let mut endpoint_pending: Option<Pending> = None;

        loop {
            let dag_deadline = dag_pending
                .as_ref()
                .map(|p| p.deadline)
                .unwrap_or_else(far_future);
            let endpoint_deadline = endpoint_pending
                .as_ref()
                .map(|p| p.deadline)
                .unwrap_or_else(far_future);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("event handler stopping");
                    return Ok(());
                }

                event = events.recv() => match event {
                    Ok(StoreEvent { kind, .. }) => {
                        self.context
                            .metrics
                            .store_events
                            .with_label_values(&[kind.as_str()])
                            .inc();
                        if kind.is_endpoint_only() {
                            match &mut endpoint_pending {
                                None => endpoint_pending = Some(Pending::arm(debounce.endpoint_min_hold)),
                                Some(p) => p.extend(debounce.endpoint_min_hold, debounce.endpoint_max_hold),
                            }
                        } else {
                            match &mut dag_pending {
                                None => dag_pending = Some(Pending::arm(debounce.min_hold)),
                                Some(p) => p.extend(debounce.min_hold, debounce.max_hold),
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed notifications are harmless: the next rebuild
                        // reads a full snapshot anyway.
                        warn!(missed = n, "event handler lagged behind the store");
                        dag_pending.get_or_insert_with(|| Pending::arm(debounce.min_hold));
                        endpoint_pending
                            .get_or_insert_with(|| Pending::arm(debounce.endpoint_min_hold));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("store dropped; event handler stopping");
                        return Ok(());
                    }
                },

                _ = tokio::time::sleep_until(dag_deadline), if dag_pending.is_some() => {
                    dag_pending = None;
                    self.rebuild_dag().await?;
                }

                _ = tokio::time::sleep_until(endpoint_deadline), if endpoint_pending.is_some() => {
                    endpoint_pending = None;
                    self.rebuild_endpoints();
                }
            }
        }
    }

    async fn rebuild_dag(&self) -> CoreResult<()> {
        let generation = self.dispatcher.rebuild(self.store.snapshot()).await?;
        debug!(generation, "DAG rebuild dispatched");
        Ok(())
    }

    fn rebuild_endpoints(&self) {
        let view = self.store.snapshot();
        self.cache.install_endpoints(xds::endpoint::endpoints(&view));
        self.context.metrics.endpoint_rebuilds.inc();
    }
}

fn far_future() -> Instant {
    // A year is far enough; select arms with no pending work are disabled
    // anyway.
    Instant::now() + std::time::Duration::from_secs(86400 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder_thread;
    use crate::metrics::test_metrics;
    use crate::observer::ObserverSet;
    use crate::store::KnownObject;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    fn service(name: &str) -> KnownObject {
        KnownObject::Service(Arc::new(Service {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    /// The build happens on a real OS thread while test time is paused; poll
    /// the counter instead of assuming scheduling order.
    async fn wait_for_builds(context: &crate::context::Context, at_least: u64) {
        for _ in 0..2000 {
            if context.metrics.dag_builds.get() >= at_least {
                return;
            }
            std::thread::sleep(Duration::from_micros(500));
            tokio::task::yield_now().await;
        }
        panic!("timed out waiting for {at_least} builds");
    }

    #[tokio::test(start_paused = true)]
    async fn events_within_the_hold_coalesce_into_one_rebuild() {
        let context = crate::context::Context::new_for_test();
        let store = Arc::new(ResourceStore::new());
        let cache = Arc::new(SnapshotCache::new(test_metrics()));
        let (dispatcher, handle) = builder_thread::start(context.clone(), ObserverSet::new());

        let handler = EventHandler::new(
            context.clone(),
            store.clone(),
            dispatcher,
            cache.clone(),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(handler.run(shutdown.clone()));
        wait_for_builds(&context, 1).await;

        store.upsert(service("a"));
        store.upsert(service("b"));
        store.upsert(service("c"));

        // Less than min_hold: still quiet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(context.metrics.dag_builds.get(), 1);

        // Past min_hold: exactly one rebuild for the whole burst.
        tokio::time::sleep(Duration::from_millis(100)).await;
        wait_for_builds(&context, 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(context.metrics.dag_builds.get(), 2);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn continued_events_cannot_defer_past_max_hold() {
        let context = crate::context::Context::new_for_test();
        let store = Arc::new(ResourceStore::new());
        let cache = Arc::new(SnapshotCache::new(test_metrics()));
        let (dispatcher, handle) = builder_thread::start(context.clone(), ObserverSet::new());

        let handler = EventHandler::new(
            context.clone(),
            store.clone(),
            dispatcher,
            cache.clone(),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(handler.run(shutdown.clone()));
        wait_for_builds(&context, 1).await;

        // Keep poking every 60ms (inside min_hold=100ms) for 600ms; max_hold
        // (500ms) must force a rebuild regardless.
        for i in 0..10 {
            store.upsert(service(&format!("svc-{i}")));
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        wait_for_builds(&context, 2).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        handle.stop();
    }
}
