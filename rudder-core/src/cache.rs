// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The versioned snapshot cache the xDS server reads from. Reads are
//! lock-free against the live snapshot; writes are serialised per type and
//! notification is register-and-fire-once, which sidesteps the slow-consumer
//! problem entirely.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use envoy_types::pb::google::protobuf::Any;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::metrics::Metrics;
use crate::xds::ResourceType;

/// One xDS resource and its name.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedResource {
    pub name: String,
    pub body: Any,
}

/// Immutable published state of one resource type.
#[derive(Debug, Default)]
pub struct TypeSnapshot {
    pub version: u64,
    pub resources: Vec<NamedResource>,
    index: BTreeMap<String, usize>,
}

impl TypeSnapshot {
    fn new(version: u64, resources: Vec<NamedResource>) -> Self {
        let index = resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        Self {
            version,
            resources,
            index,
        }
    }

    pub fn get(&self, name: &str) -> Option<&NamedResource> {
        self.index.get(name).map(|i| &self.resources[*i])
    }
}

struct TypedCache {
    current: ArcSwap<TypeSnapshot>,
    waiters: Mutex<Vec<oneshot::Sender<u64>>>,
}

impl TypedCache {
    fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(TypeSnapshot::default()),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Publishes `resources` at `version` if they differ from the current
    /// snapshot. Returns whether a swap happened. The very first install
    /// always publishes, even when empty: an empty table the proxy can ACK
    /// is not the same as never having synced.
    fn install(&self, version: u64, resources: Vec<NamedResource>) -> bool {
        let current = self.current.load();
        if current.version != 0 && current.resources == resources {
            return false;
        }
        self.current
            .store(Arc::new(TypeSnapshot::new(version, resources)));
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            // A dropped receiver just means the stream went away.
            let _ = waiter.send(version);
        }
        true
    }

    fn register(&self, last_seen: u64) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        // Taking the waiter lock before re-reading the version closes the
        // race with a concurrent install.
        let mut waiters = self.waiters.lock();
        let current = self.current.load().version;
        if current > last_seen {
            let _ = tx.send(current);
        } else {
            waiters.push(tx);
        }
        rx
    }
}

/// Snapshot tables for all five resource types. LDS/RDS/CDS/SDS share one
/// version sequence and install as a unit; EDS has its own counter and its
/// own install path.
pub struct SnapshotCache {
    types: [TypedCache; 5],
    dag_version: Mutex<u64>,
    endpoint_version: Mutex<u64>,
    metrics: Arc<Metrics>,
}

impl SnapshotCache {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            types: [
                TypedCache::new(),
                TypedCache::new(),
                TypedCache::new(),
                TypedCache::new(),
                TypedCache::new(),
            ],
            dag_version: Mutex::new(0),
            endpoint_version: Mutex::new(0),
            metrics,
        }
    }

    fn typed(&self, rt: ResourceType) -> &TypedCache {
        &self.types[rt as usize]
    }

    /// Atomically installs the four DAG-derived tables under a single new
    /// version. Types whose contents did not change keep their version (and
    /// their streams stay quiet).
    pub fn install_dag_tables(&self, resources: crate::xds::DagResources) {
        let mut version = self.dag_version.lock();
        *version += 1;
        let v = *version;

        for (rt, table) in [
            (ResourceType::Cluster, resources.clusters),
            (ResourceType::Listener, resources.listeners),
            (ResourceType::Route, resources.routes),
            (ResourceType::Secret, resources.secrets),
        ] {
            if self.typed(rt).install(v, table) {
                self.metrics
                    .cache_updates
                    .with_label_values(&[rt.label()])
                    .inc();
                debug!(r#type = rt.label(), version = v, "snapshot installed");
            }
        }
    }

    /// Installs the endpoint table on its independent version sequence.
    pub fn install_endpoints(&self, endpoints: Vec<NamedResource>) {
        let mut version = self.endpoint_version.lock();
        *version += 1;
        let v = *version;
        if self.typed(ResourceType::Endpoint).install(v, endpoints) {
            self.metrics
                .cache_updates
                .with_label_values(&[ResourceType::Endpoint.label()])
                .inc();
            debug!(version = v, "endpoint snapshot installed");
        }
    }

    /// The live snapshot for `rt`. Lock-free.
    pub fn contents(&self, rt: ResourceType) -> Arc<TypeSnapshot> {
        self.typed(rt).current.load_full()
    }

    /// The subset of `names` present in the cache, plus the snapshot version.
    /// Requested names that do not exist are simply absent.
    pub fn query(&self, rt: ResourceType, names: &[String]) -> (u64, Vec<NamedResource>) {
        let snapshot = self.contents(rt);
        let resources = names
            .iter()
            .filter_map(|name| snapshot.get(name).cloned())
            .collect();
        (snapshot.version, resources)
    }

    /// Registers for the next version bump of `rt`. Fires immediately when
    /// the current version already exceeds `last_seen`; otherwise the
    /// returned channel fires exactly once on the next install.
    pub fn register(&self, rt: ResourceType, last_seen: u64) -> oneshot::Receiver<u64> {
        self.typed(rt).register(last_seen)
    }
}
