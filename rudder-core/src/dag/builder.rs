// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The single-writer DAG compile. [`build`] never suspends and never fails:
//! per-resource problems become status conditions and the graph is built from
//! whatever remains.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rudder_config::TlsVersion;
use rudder_k8s::{ObjectKey, ResourceKey};
use tracing::debug;

use crate::context::Context;
use crate::store::StoreView;
use crate::validation::{self, ValidTlsSecret};

use super::status::{record, StatusMap, StatusState};
use super::{
    gateway, httpproxy, ingress, ingressroute, route_order, BuiltDag, CircuitBreakers, ClientValidation, Cluster,
    ClusterName, Dag, HealthCheck, LbStrategy, Listener, ListenerProtocol, Route, SecureVirtualHost,
    TcpProxy, UpstreamProtocol, UpstreamTls, VirtualHost,
};

/// Compiles a consistent store view into a fresh DAG plus the status of every
/// resource that participated. Deterministic: equal views produce equal
/// output.
pub fn build(context: &Context, view: &StoreView) -> BuiltDag {
    let mut builder = Builder::new(context, view);

    ingress::process(&mut builder);
    httpproxy::process(&mut builder);
    ingressroute::process(&mut builder);
    gateway::process(&mut builder);

    builder.finish()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ListenerClass {
    Http,
    Https,
    Tcp,
}

type ListenerKey = (u16, ListenerClass);

/// TLS settings of a secure virtual host under construction.
pub(crate) struct SecureSettings {
    pub secret: ObjectKey,
    pub min_tls_version: TlsVersion,
    pub max_tls_version: TlsVersion,
    pub client_validation: Option<ClientValidation>,
}

struct VirtualHostAssembly {
    /// Exclusive claim by a root resource, if any. Ingress contributions are
    /// shared and never claim.
    claim: Option<(ResourceKey, DateTime<Utc>)>,
    routes: BTreeMap<String, Route>,
}

impl VirtualHostAssembly {
    fn new() -> Self {
        Self {
            claim: None,
            routes: BTreeMap::new(),
        }
    }
}

struct SecureAssembly {
    claim: (ResourceKey, DateTime<Utc>),
    secret: ObjectKey,
    min_tls_version: TlsVersion,
    max_tls_version: TlsVersion,
    client_validation: Option<ClientValidation>,
    routes: BTreeMap<String, Route>,
    tcp_proxy: Option<TcpProxy>,
}

struct ListenerAssembly {
    vhosts: BTreeMap<String, VirtualHostAssembly>,
    secure: BTreeMap<String, SecureAssembly>,
    /// Keyed by SNI; `None` is the single un-matched proxy of a raw TCP
    /// listener.
    tcp_proxies: BTreeMap<Option<String>, (DateTime<Utc>, TcpProxy)>,
}

impl ListenerAssembly {
    fn new() -> Self {
        Self {
            vhosts: BTreeMap::new(),
            secure: BTreeMap::new(),
            tcp_proxies: BTreeMap::new(),
        }
    }
}

/// How an upstream service reference names its port.
#[derive(Clone, Debug)]
pub(crate) enum PortRef {
    Number(u16),
    Name(String),
}

/// Per-reference cluster settings; part of the cluster identity.
#[derive(Default)]
pub(crate) struct ClusterSettings {
    pub protocol: Option<UpstreamProtocol>,
    pub lb_strategy: LbStrategy,
    pub health_check: Option<HealthCheck>,
    /// `(ca secret, expected subject name)`, resolved in the owner's
    /// namespace.
    pub upstream_validation: Option<(String, String)>,
}

pub(crate) struct Builder<'a> {
    pub context: &'a Context,
    pub view: &'a StoreView,
    pub statuses: StatusMap,
    listeners: BTreeMap<ListenerKey, ListenerAssembly>,
    clusters: BTreeMap<ClusterName, Cluster>,
    secrets: BTreeMap<ObjectKey, ValidTlsSecret>,
}

impl<'a> Builder<'a> {
    fn new(context: &'a Context, view: &'a StoreView) -> Self {
        Self {
            context,
            view,
            statuses: StatusMap::new(),
            listeners: BTreeMap::new(),
            clusters: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    pub(crate) fn http_port(&self) -> u16 {
        self.context.parameters.listen.http_port
    }

    pub(crate) fn https_port(&self) -> u16 {
        self.context.parameters.listen.https_port
    }

    pub(crate) fn record_status(
        &mut self,
        key: ResourceKey,
        state: StatusState,
        description: impl Into<String>,
    ) {
        record(&mut self.statuses, key, state, description);
    }

    fn listener(&mut self, port: u16, class: ListenerClass) -> &mut ListenerAssembly {
        self.listeners
            .entry((port, class))
            .or_insert_with(ListenerAssembly::new)
    }

    /// Takes an exclusive claim on `(port, fqdn)` for a root resource. On
    /// conflict the oldest creation timestamp wins, namespace/name breaking
    /// ties; the loser's routes are discarded and its status marked
    /// conflicting. Returns whether the caller holds the claim.
    pub(crate) fn claim_virtual_host(
        &mut self,
        port: u16,
        fqdn: &str,
        owner: ResourceKey,
        created: DateTime<Utc>,
    ) -> bool {
        enum Outcome {
            Claimed,
            TookOver(ResourceKey),
            Lost(ResourceKey),
        }

        let outcome = {
            let assembly = self
                .listener(port, ListenerClass::Http)
                .vhosts
                .entry(fqdn.to_string())
                .or_insert_with(VirtualHostAssembly::new);
            match &assembly.claim {
                None => {
                    assembly.claim = Some((owner.clone(), created));
                    Outcome::Claimed
                }
                Some((holder, holder_created)) => {
                    if (created, &owner.key) < (*holder_created, &holder.key) {
                        let loser = holder.clone();
                        // Everything the loser contributed goes, including
                        // routes its include chain added under child owners.
                        // Shared Ingress routes are the only other residents.
                        assembly
                            .routes
                            .retain(|_, route| route.owner.kind == rudder_k8s::ResourceKind::Ingress);
                        assembly.claim = Some((owner.clone(), created));
                        Outcome::TookOver(loser)
                    } else {
                        Outcome::Lost(holder.clone())
                    }
                }
            }
        };

        match outcome {
            Outcome::Claimed => true,
            Outcome::TookOver(loser) => {
                record(
                    &mut self.statuses,
                    loser,
                    StatusState::Conflicting,
                    format!("fqdn {fqdn:?} is already configured by an older resource"),
                );
                true
            }
            Outcome::Lost(holder) => {
                record(
                    &mut self.statuses,
                    owner,
                    StatusState::Conflicting,
                    format!("fqdn {fqdn:?} is already configured by {holder}"),
                );
                false
            }
        }
    }

    /// Claims the secure side of `(port, fqdn)`. Same conflict rule as
    /// [`Self::claim_virtual_host`].
    pub(crate) fn claim_secure_host(
        &mut self,
        port: u16,
        fqdn: &str,
        owner: ResourceKey,
        created: DateTime<Utc>,
        settings: SecureSettings,
    ) -> bool {
        let existing_claim = self
            .listener(port, ListenerClass::Https)
            .secure
            .get(fqdn)
            .map(|assembly| assembly.claim.clone());

        if let Some((holder, holder_created)) = existing_claim {
            if (created, &owner.key) < (holder_created, &holder.key) {
                record(
                    &mut self.statuses,
                    holder,
                    StatusState::Conflicting,
                    format!("fqdn {fqdn:?} is already configured by an older resource"),
                );
            } else {
                record(
                    &mut self.statuses,
                    owner,
                    StatusState::Conflicting,
                    format!("fqdn {fqdn:?} is already configured by {holder}"),
                );
                return false;
            }
        }

        self.listener(port, ListenerClass::Https).secure.insert(
            fqdn.to_string(),
            SecureAssembly {
                claim: (owner, created),
                secret: settings.secret,
                min_tls_version: settings.min_tls_version,
                max_tls_version: settings.max_tls_version,
                client_validation: settings.client_validation,
                routes: BTreeMap::new(),
                tcp_proxy: None,
            },
        );
        true
    }

    /// Inserts a route into the plain-HTTP side of `(port, fqdn)`. Sibling
    /// routes with strictly overlapping (identical) match sets resolve to the
    /// older route; the younger's owner records a partial conflict.
    pub(crate) fn insert_route(&mut self, port: u16, fqdn: &str, route: Route) {
        let signature = route.match_signature();
        let loser = {
            let assembly = self
                .listener(port, ListenerClass::Http)
                .vhosts
                .entry(fqdn.to_string())
                .or_insert_with(VirtualHostAssembly::new);
            match assembly.routes.get(&signature) {
                None => {
                    assembly.routes.insert(signature, route);
                    None
                }
                Some(existing) => {
                    if (route.created, &route.owner.key)
                        < (existing.created, &existing.owner.key)
                    {
                        let loser = existing.owner.clone();
                        assembly.routes.insert(signature, route);
                        Some(loser)
                    } else {
                        Some(route.owner.clone())
                    }
                }
            }
        };
        if let Some(loser) = loser {
            record(
                &mut self.statuses,
                loser,
                StatusState::PartiallyAccepted,
                format!("route match on {fqdn:?} conflicts with an older route"),
            );
        }
    }

    /// Inserts a route into the secure side of `(port, fqdn)`.
    pub(crate) fn insert_secure_route(&mut self, port: u16, fqdn: &str, route: Route) {
        let Some(assembly) = self
            .listener(port, ListenerClass::Https)
            .secure
            .get_mut(fqdn)
        else {
            debug!(fqdn, "dropping secure route for unclaimed host");
            return;
        };
        assembly.routes.insert(route.match_signature(), route);
    }

    /// Attaches a TCP proxy behind terminated TLS on `(port, fqdn)`.
    pub(crate) fn set_secure_tcp_proxy(&mut self, port: u16, fqdn: &str, proxy: TcpProxy) {
        if let Some(assembly) = self
            .listener(port, ListenerClass::Https)
            .secure
            .get_mut(fqdn)
        {
            assembly.tcp_proxy = Some(proxy);
        }
    }

    /// Adds an SNI-matched passthrough proxy (or a raw TCP proxy when `sni`
    /// is `None`). At most one proxy per SNI value per listener: the older
    /// owner wins.
    pub(crate) fn insert_tcp_proxy(
        &mut self,
        port: u16,
        class: ListenerClass,
        sni: Option<String>,
        created: DateTime<Utc>,
        proxy: TcpProxy,
    ) -> bool {
        let (accepted, loser) = {
            let assembly = self.listener(port, class);
            match assembly.tcp_proxies.get(&sni) {
                None => {
                    assembly.tcp_proxies.insert(sni.clone(), (created, proxy));
                    (true, None)
                }
                Some((existing_created, existing)) => {
                    if (created, &proxy.owner.key) < (*existing_created, &existing.owner.key) {
                        let loser = existing.owner.clone();
                        assembly.tcp_proxies.insert(sni.clone(), (created, proxy));
                        (true, Some(loser))
                    } else {
                        (false, Some(proxy.owner))
                    }
                }
            }
        };
        if let Some(loser) = loser {
            record(
                &mut self.statuses,
                loser,
                StatusState::Conflicting,
                sni_conflict_message(&sni),
            );
        }
        accepted
    }

    /// Resolves a serving-certificate reference (`name` or `namespace/name`),
    /// enforcing certificate delegation for cross-namespace access, and
    /// validates the secret. The validated secret is added to the DAG. An
    /// already-expired leaf certificate is served anyway and surfaced on the
    /// owner's status.
    pub(crate) fn resolve_serving_secret(
        &mut self,
        owner: &ResourceKey,
        from_namespace: &str,
        reference: &str,
    ) -> Result<ObjectKey, String> {
        let key = match reference.split_once('/') {
            Some((ns, name)) => ObjectKey::new(ns, name),
            None => ObjectKey::new(from_namespace, reference),
        };

        if key.namespace != from_namespace && !self.delegation_permits(&key, from_namespace) {
            return Err(format!(
                "secret {key} is not delegated to namespace {from_namespace:?}"
            ));
        }

        let secret = self
            .view
            .secret(&key)
            .ok_or_else(|| format!("secret {key} not found"))?
            .clone();
        let valid = validation::validate_tls_secret(&secret)
            .map_err(|e| format!("secret {key} is invalid: {e}"))?;

        if let Some(not_after) = valid.not_after {
            if not_after < Utc::now() {
                record(
                    &mut self.statuses,
                    owner.clone(),
                    StatusState::PartiallyAccepted,
                    format!("serving certificate in secret {key} expired on {not_after}"),
                );
            }
        }

        let result = valid.key.clone();
        self.secrets.insert(valid.key.clone(), valid);
        Ok(result)
    }

    fn delegation_permits(&self, secret: &ObjectKey, to_namespace: &str) -> bool {
        self.view
            .certificate_delegations()
            .filter(|d| d.metadata.namespace.as_deref() == Some(secret.namespace.as_str()))
            .filter_map(|d| d.spec.as_ref())
            .flat_map(|spec| spec.delegations.iter())
            .any(|d| {
                (d.secret_name == secret.name || d.secret_name == "*") && d.permits(to_namespace)
            })
    }

    /// Resolves a CA-bundle secret in `namespace`.
    pub(crate) fn resolve_ca_bundle(
        &mut self,
        namespace: &str,
        name: &str,
    ) -> Result<Bytes, String> {
        let key = ObjectKey::new(namespace, name);
        let secret = self
            .view
            .secret(&key)
            .ok_or_else(|| format!("secret {key} not found"))?;
        validation::ca_bundle(secret).map_err(|e| format!("secret {key} is invalid: {e}"))
    }

    /// Emits (or reuses) the cluster for one upstream reference. A missing
    /// Service still yields a cluster — with no endpoints behind it the proxy
    /// answers 503 — but an unresolvable named port cannot.
    pub(crate) fn cluster_for(
        &mut self,
        namespace: &str,
        service_name: &str,
        port: PortRef,
        settings: ClusterSettings,
    ) -> Result<(ClusterName, Option<String>), String> {
        let key = ObjectKey::new(namespace, service_name);
        let service = self.view.service(&key).cloned();
        let mut warning = None;

        let (port_number, port_name) = match (&service, &port) {
            (Some(svc), port) => {
                let ports = svc
                    .spec
                    .as_ref()
                    .and_then(|s| s.ports.as_ref())
                    .cloned()
                    .unwrap_or_default();
                let matched = ports.iter().find(|p| match port {
                    PortRef::Number(n) => p.port == *n as i32,
                    PortRef::Name(name) => p.name.as_deref() == Some(name.as_str()),
                });
                match (matched, port) {
                    (Some(p), _) => (p.port as u16, p.name.clone()),
                    (None, PortRef::Number(n)) => {
                        warning = Some(format!("port {n} not found on service {key}"));
                        (*n, None)
                    }
                    (None, PortRef::Name(name)) => {
                        return Err(format!("port {name:?} not found on service {key}"));
                    }
                }
            }
            (None, PortRef::Number(n)) => {
                warning = Some(format!("service {key} not found"));
                (*n, None)
            }
            (None, PortRef::Name(name)) => {
                return Err(format!(
                    "service {key} not found, named port {name:?} cannot be resolved"
                ));
            }
        };

        let protocol = settings.protocol.or_else(|| {
            service
                .as_ref()
                .and_then(|svc| {
                    crate::annotations::upstream_protocol(svc, port_number, port_name.as_deref())
                })
        });
        let circuit_breakers = service
            .as_ref()
            .map(|svc| crate::annotations::circuit_breakers(svc).0)
            .unwrap_or_default();

        let upstream_validation = match &settings.upstream_validation {
            Some((ca_secret, subject_name)) => Some(UpstreamTls {
                ca: self.resolve_ca_bundle(namespace, ca_secret)?,
                subject_name: subject_name.clone(),
            }),
            None => None,
        };
        let sni = upstream_validation
            .as_ref()
            .filter(|_| matches!(protocol, Some(UpstreamProtocol::Tls) | Some(UpstreamProtocol::H2)))
            .map(|v| v.subject_name.clone());

        let signature = settings_signature(
            &protocol,
            settings.lb_strategy,
            &settings.health_check,
            &upstream_validation,
            &circuit_breakers,
        );
        let name = match signature {
            None => format!("{key}/{port_number}"),
            Some(sig) => format!("{key}/{port_number}/{sig}"),
        };

        // Endpoint sets are keyed by the service port name when it has one,
        // matching how EndpointSlice ports are named.
        let eds_port_name = port_name.clone().filter(|n| !n.is_empty());

        self.clusters.entry(name.clone()).or_insert_with(|| Cluster {
            name: name.clone(),
            service: key,
            service_port: port_number,
            service_port_name: eds_port_name,
            service_found: service.is_some(),
            protocol,
            lb_strategy: settings.lb_strategy,
            health_check: settings.health_check,
            upstream_validation,
            circuit_breakers,
            sni,
        });

        Ok((name, warning))
    }

    fn finish(mut self) -> BuiltDag {
        let mut listeners = Vec::new();
        let listener_assemblies = std::mem::take(&mut self.listeners);

        for ((port, class), assembly) in listener_assemblies {
            match class {
                ListenerClass::Http => {
                    let virtual_hosts: Vec<VirtualHost> = assembly
                        .vhosts
                        .into_iter()
                        .filter(|(_, a)| !a.routes.is_empty())
                        .map(|(fqdn, a)| VirtualHost {
                            fqdn,
                            routes: sorted_routes(a.routes),
                        })
                        .collect();
                    if virtual_hosts.is_empty() {
                        continue;
                    }
                    listeners.push(Listener {
                        name: if port == self.http_port() {
                            "ingress_http".to_string()
                        } else {
                            format!("http-{port}")
                        },
                        protocol: ListenerProtocol::Http,
                        port,
                        virtual_hosts,
                        secure_hosts: Vec::new(),
                        tcp_proxies: Vec::new(),
                    });
                }
                ListenerClass::Https => {
                    let secure_hosts: Vec<SecureVirtualHost> = assembly
                        .secure
                        .into_iter()
                        .filter(|(_, a)| !a.routes.is_empty() || a.tcp_proxy.is_some())
                        .map(|(fqdn, a)| SecureVirtualHost {
                            host: VirtualHost {
                                fqdn,
                                routes: sorted_routes(a.routes),
                            },
                            secret: a.secret,
                            min_tls_version: a.min_tls_version,
                            max_tls_version: a.max_tls_version,
                            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
                            client_validation: a.client_validation,
                            tcp_proxy: a.tcp_proxy,
                        })
                        .collect();
                    let tcp_proxies: Vec<TcpProxy> = assembly
                        .tcp_proxies
                        .into_iter()
                        .map(|(_, (_, proxy))| proxy)
                        .collect();
                    if secure_hosts.is_empty() && tcp_proxies.is_empty() {
                        continue;
                    }
                    let protocol = if secure_hosts.is_empty() {
                        ListenerProtocol::TlsPassthrough
                    } else {
                        ListenerProtocol::Https
                    };
                    listeners.push(Listener {
                        name: if port == self.https_port() {
                            "ingress_https".to_string()
                        } else {
                            format!("https-{port}")
                        },
                        protocol,
                        port,
                        virtual_hosts: Vec::new(),
                        secure_hosts,
                        tcp_proxies,
                    });
                }
                ListenerClass::Tcp => {
                    let tcp_proxies: Vec<TcpProxy> = assembly
                        .tcp_proxies
                        .into_iter()
                        .map(|(_, (_, proxy))| proxy)
                        .collect();
                    if tcp_proxies.is_empty() {
                        continue;
                    }
                    listeners.push(Listener {
                        name: format!("tcp-{port}"),
                        protocol: ListenerProtocol::Tcp,
                        port,
                        virtual_hosts: Vec::new(),
                        secure_hosts: Vec::new(),
                        tcp_proxies,
                    });
                }
            }
        }

        listeners.sort_by_key(|l| (l.port, l.protocol));

        // Secrets referenced by no surviving secure host are not part of the
        // graph.
        let referenced: std::collections::BTreeSet<ObjectKey> = listeners
            .iter()
            .flat_map(|l| l.secure_hosts.iter().map(|s| s.secret.clone()))
            .collect();
        self.secrets.retain(|key, _| referenced.contains(key));

        BuiltDag {
            dag: Arc::new(Dag {
                listeners,
                clusters: self.clusters,
                secrets: self.secrets,
            }),
            statuses: self.statuses,
            generation: self.view.generation(),
        }
    }
}

fn sorted_routes(routes: BTreeMap<String, Route>) -> Vec<Route> {
    let mut routes: Vec<Route> = routes.into_values().collect();
    routes.sort_by(route_order);
    routes
}

fn sni_conflict_message(sni: &Option<String>) -> String {
    match sni {
        Some(sni) => format!("SNI {sni:?} is already configured by an older resource"),
        None => "a TCP proxy is already configured on this listener by an older resource"
            .to_string(),
    }
}

/// Short stable signature of non-default cluster settings; `None` when
/// everything is default, which keeps the common cluster name bare.
fn settings_signature(
    protocol: &Option<UpstreamProtocol>,
    lb_strategy: LbStrategy,
    health_check: &Option<HealthCheck>,
    upstream_validation: &Option<UpstreamTls>,
    circuit_breakers: &CircuitBreakers,
) -> Option<String> {
    if protocol.is_none()
        && lb_strategy == LbStrategy::RoundRobin
        && health_check.is_none()
        && upstream_validation.is_none()
        && *circuit_breakers == CircuitBreakers::default()
    {
        return None;
    }
    let canonical = format!(
        "{protocol:?}|{lb_strategy:?}|{health_check:?}|{upstream_validation:?}|{circuit_breakers:?}"
    );
    Some(format!("{:08x}", fnv1a(canonical.as_bytes()) as u32))
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_have_no_signature() {
        assert_eq!(
            settings_signature(
                &None,
                LbStrategy::RoundRobin,
                &None,
                &None,
                &CircuitBreakers::default()
            ),
            None
        );
    }

    #[test]
    fn signature_is_stable_and_distinguishing() {
        let a = settings_signature(
            &Some(UpstreamProtocol::H2),
            LbStrategy::RoundRobin,
            &None,
            &None,
            &CircuitBreakers::default(),
        )
        .unwrap();
        let b = settings_signature(
            &Some(UpstreamProtocol::H2),
            LbStrategy::RoundRobin,
            &None,
            &None,
            &CircuitBreakers::default(),
        )
        .unwrap();
        let c = settings_signature(
            &Some(UpstreamProtocol::H2c),
            LbStrategy::RoundRobin,
            &None,
            &None,
            &CircuitBreakers::default(),
        )
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }
}
