// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use rudder_k8s::{
    Gateway, GatewayClass, HttpProxy, HttpRoute, IngressRoute, ObjectKey, ResourceKind, TcpRoute,
    TlsCertificateDelegation, TlsRoute,
};
use tokio::sync::broadcast;
use tracing::trace;

use crate::validation;

const STORE_EVENTS_CHANNEL_SIZE: usize = 1024;

/// A watched object in its validated-typed form. The store owns the only
/// long-lived copy; consumers hold `Arc`s out of snapshots.
#[derive(Clone, Debug)]
pub enum KnownObject {
    Ingress(Arc<Ingress>),
    HttpProxy(Arc<HttpProxy>),
    IngressRoute(Arc<IngressRoute>),
    TlsCertificateDelegation(Arc<TlsCertificateDelegation>),
    GatewayClass(Arc<GatewayClass>),
    Gateway(Arc<Gateway>),
    HttpRoute(Arc<HttpRoute>),
    TlsRoute(Arc<TlsRoute>),
    TcpRoute(Arc<TcpRoute>),
    Service(Arc<Service>),
    EndpointSlice(Arc<EndpointSlice>),
    Secret(Arc<Secret>),
    Namespace(Arc<Namespace>),
}

impl KnownObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            KnownObject::Ingress(_) => ResourceKind::Ingress,
            KnownObject::HttpProxy(_) => ResourceKind::HttpProxy,
            KnownObject::IngressRoute(_) => ResourceKind::IngressRoute,
            KnownObject::TlsCertificateDelegation(_) => ResourceKind::TlsCertificateDelegation,
            KnownObject::GatewayClass(_) => ResourceKind::GatewayClass,
            KnownObject::Gateway(_) => ResourceKind::Gateway,
            KnownObject::HttpRoute(_) => ResourceKind::HttpRoute,
            KnownObject::TlsRoute(_) => ResourceKind::TlsRoute,
            KnownObject::TcpRoute(_) => ResourceKind::TcpRoute,
            KnownObject::Service(_) => ResourceKind::Service,
            KnownObject::EndpointSlice(_) => ResourceKind::EndpointSlice,
            KnownObject::Secret(_) => ResourceKind::Secret,
            KnownObject::Namespace(_) => ResourceKind::Namespace,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            KnownObject::Ingress(o) => &o.metadata,
            KnownObject::HttpProxy(o) => &o.metadata,
            KnownObject::IngressRoute(o) => &o.metadata,
            KnownObject::TlsCertificateDelegation(o) => &o.metadata,
            KnownObject::GatewayClass(o) => &o.metadata,
            KnownObject::Gateway(o) => &o.metadata,
            KnownObject::HttpRoute(o) => &o.metadata,
            KnownObject::TlsRoute(o) => &o.metadata,
            KnownObject::TcpRoute(o) => &o.metadata,
            KnownObject::Service(o) => &o.metadata,
            KnownObject::EndpointSlice(o) => &o.metadata,
            KnownObject::Secret(o) => &o.metadata,
            KnownObject::Namespace(o) => &o.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_meta(self.metadata())
    }
}

type KindTable = BTreeMap<ObjectKey, KnownObject>;

/// A change happened for `kind`. Subscribers do not receive deltas; they take
/// a fresh snapshot.
#[derive(Clone, Copy, Debug)]
pub struct StoreEvent {
    pub kind: ResourceKind,
    pub generation: u64,
}

/// Point-in-time view of the store. Cheap to clone; per-kind tables are
/// shared immutable maps.
#[derive(Clone, Debug, Default)]
pub struct StoreView {
    tables: BTreeMap<ResourceKind, Arc<KindTable>>,
    generation: u64,
}

impl StoreView {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Objects of `kind` in namespace/name order.
    pub fn iter(&self, kind: ResourceKind) -> impl Iterator<Item = &KnownObject> {
        self.tables.get(&kind).into_iter().flat_map(|t| t.values())
    }

    pub fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Option<&KnownObject> {
        self.tables.get(&kind)?.get(key)
    }

    pub fn ingresses(&self) -> impl Iterator<Item = &Arc<Ingress>> {
        self.iter(ResourceKind::Ingress).filter_map(|o| match o {
            KnownObject::Ingress(ing) => Some(ing),
            _ => None,
        })
    }

    pub fn http_proxies(&self) -> impl Iterator<Item = &Arc<HttpProxy>> {
        self.iter(ResourceKind::HttpProxy).filter_map(|o| match o {
            KnownObject::HttpProxy(p) => Some(p),
            _ => None,
        })
    }

    pub fn ingress_routes(&self) -> impl Iterator<Item = &Arc<IngressRoute>> {
        self.iter(ResourceKind::IngressRoute).filter_map(|o| match o {
            KnownObject::IngressRoute(r) => Some(r),
            _ => None,
        })
    }

    pub fn certificate_delegations(&self) -> impl Iterator<Item = &Arc<TlsCertificateDelegation>> {
        self.iter(ResourceKind::TlsCertificateDelegation)
            .filter_map(|o| match o {
                KnownObject::TlsCertificateDelegation(d) => Some(d),
                _ => None,
            })
    }

    pub fn gateway_classes(&self) -> impl Iterator<Item = &Arc<GatewayClass>> {
        self.iter(ResourceKind::GatewayClass).filter_map(|o| match o {
            KnownObject::GatewayClass(c) => Some(c),
            _ => None,
        })
    }

    pub fn gateways(&self) -> impl Iterator<Item = &Arc<Gateway>> {
        self.iter(ResourceKind::Gateway).filter_map(|o| match o {
            KnownObject::Gateway(g) => Some(g),
            _ => None,
        })
    }

    pub fn http_routes(&self) -> impl Iterator<Item = &Arc<HttpRoute>> {
        self.iter(ResourceKind::HttpRoute).filter_map(|o| match o {
            KnownObject::HttpRoute(r) => Some(r),
            _ => None,
        })
    }

    pub fn tls_routes(&self) -> impl Iterator<Item = &Arc<TlsRoute>> {
        self.iter(ResourceKind::TlsRoute).filter_map(|o| match o {
            KnownObject::TlsRoute(r) => Some(r),
            _ => None,
        })
    }

    pub fn tcp_routes(&self) -> impl Iterator<Item = &Arc<TcpRoute>> {
        self.iter(ResourceKind::TcpRoute).filter_map(|o| match o {
            KnownObject::TcpRoute(r) => Some(r),
            _ => None,
        })
    }

    pub fn endpoint_slices(&self) -> impl Iterator<Item = &Arc<EndpointSlice>> {
        self.iter(ResourceKind::EndpointSlice).filter_map(|o| match o {
            KnownObject::EndpointSlice(e) => Some(e),
            _ => None,
        })
    }

    pub fn service(&self, key: &ObjectKey) -> Option<&Arc<Service>> {
        match self.get(ResourceKind::Service, key)? {
            KnownObject::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn secret(&self, key: &ObjectKey) -> Option<&Arc<Secret>> {
        match self.get(ResourceKind::Secret, key)? {
            KnownObject::Secret(s) => Some(s),
            _ => None,
        }
    }

    pub fn http_proxy(&self, key: &ObjectKey) -> Option<&Arc<HttpProxy>> {
        match self.get(ResourceKind::HttpProxy, key)? {
            KnownObject::HttpProxy(p) => Some(p),
            _ => None,
        }
    }

    pub fn ingress_route(&self, key: &ObjectKey) -> Option<&Arc<IngressRoute>> {
        match self.get(ResourceKind::IngressRoute, key)? {
            KnownObject::IngressRoute(r) => Some(r),
            _ => None,
        }
    }
}

struct Inner {
    tables: BTreeMap<ResourceKind, Arc<KindTable>>,
    generation: u64,
}

/// The in-memory cache of every watched object. Single writer discipline is
/// not required: all mutations are serialised behind one lock, and readers
/// never take it — a snapshot clones the table of `Arc`s and the per-kind
/// maps are immutable once published.
pub struct ResourceStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STORE_EVENTS_CHANNEL_SIZE);
        Self {
            inner: Mutex::new(Inner {
                tables: BTreeMap::new(),
                generation: 0,
            }),
            events,
        }
    }

    /// Inserts or replaces an object. Returns false when the object is
    /// dropped at the boundary (currently: secrets that are neither TLS
    /// serving certificates nor CA bundles).
    pub fn upsert(&self, obj: KnownObject) -> bool {
        if let KnownObject::Secret(secret) = &obj {
            if !validation::is_recognised_secret(secret) {
                trace!(secret = %obj.key(), "dropping secret of unrecognised type");
                return false;
            }
        }

        let kind = obj.kind();
        let key = obj.key();
        let generation = self.mutate(kind, |table| {
            table.insert(key, obj);
        });
        self.notify(kind, generation);
        true
    }

    /// Removes an object if present.
    pub fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> bool {
        let mut removed = false;
        let generation = self.mutate(kind, |table| {
            removed = table.remove(key).is_some();
        });
        if removed {
            self.notify(kind, generation);
        }
        removed
    }

    /// A consistent point-in-time view of all entries.
    pub fn snapshot(&self) -> StoreView {
        let inner = self.inner.lock();
        StoreView {
            tables: inner.tables.clone(),
            generation: inner.generation,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Copy-on-write update of one kind table: the published map is never
    /// mutated, a modified clone replaces it.
    fn mutate(&self, kind: ResourceKind, f: impl FnOnce(&mut KindTable)) -> u64 {
        let mut inner = self.inner.lock();
        let mut table = inner
            .tables
            .get(&kind)
            .map(|t| KindTable::clone(t))
            .unwrap_or_default();
        f(&mut table);
        inner.tables.insert(kind, Arc::new(table));
        inner.generation += 1;
        inner.generation
    }

    fn notify(&self, kind: ResourceKind, generation: u64) {
        // Nothing to do when no subscriber is registered yet.
        let _ = self.events.send(StoreEvent { kind, generation });
    }
}
