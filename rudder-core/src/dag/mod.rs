// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The routing graph. Each build produces a fresh immutable [`Dag`]; nodes
//! reference each other by identifier (cluster names, secret keys), never by
//! live pointer, so a published graph is shared freely across tasks.

pub mod builder;
pub mod conditions;
pub mod gateway;
pub mod httpproxy;
pub mod ingress;
pub mod ingressroute;
pub mod status;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rudder_config::TlsVersion;
use rudder_k8s::{ObjectKey, ResourceKey};

use crate::validation::{Timeout, ValidTlsSecret};
use status::StatusMap;

/// Identifier of a [`Cluster`] within one DAG:
/// `namespace/service/port[/settings-hash]`.
pub type ClusterName = String;

/// Output of one build. The status map is a full replacement, not a delta.
#[derive(Clone)]
pub struct BuiltDag {
    pub dag: Arc<Dag>,
    pub statuses: StatusMap,
    /// Store generation the build was taken from.
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct Dag {
    /// Listeners in port order. A listener exists only if something
    /// references its port.
    pub listeners: Vec<Listener>,
    pub clusters: BTreeMap<ClusterName, Cluster>,
    /// Serving certificates referenced by secure virtual hosts.
    pub secrets: BTreeMap<ObjectKey, ValidTlsSecret>,
}

impl Dag {
    pub fn listener(&self, port: u16) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.port == port)
    }

    pub fn virtual_host(&self, port: u16, fqdn: &str) -> Option<&VirtualHost> {
        self.listener(port)?
            .virtual_hosts
            .iter()
            .find(|v| v.fqdn == fqdn)
    }

    pub fn secure_virtual_host(&self, port: u16, fqdn: &str) -> Option<&SecureVirtualHost> {
        self.listener(port)?
            .secure_hosts
            .iter()
            .find(|v| v.host.fqdn == fqdn)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerProtocol {
    Http,
    Https,
    TlsPassthrough,
    Tcp,
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenerProtocol::Http => "http",
            ListenerProtocol::Https => "https",
            ListenerProtocol::TlsPassthrough => "tls-passthrough",
            ListenerProtocol::Tcp => "tcp",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Listener {
    pub name: String,
    pub protocol: ListenerProtocol,
    pub port: u16,
    /// Plain HTTP hosts, fqdn order.
    pub virtual_hosts: Vec<VirtualHost>,
    /// TLS-terminating hosts, fqdn order.
    pub secure_hosts: Vec<SecureVirtualHost>,
    /// Raw forwarding: SNI-matched on TLS listeners, at most one un-matched
    /// proxy on TCP listeners.
    pub tcp_proxies: Vec<TcpProxy>,
}

#[derive(Debug)]
pub struct VirtualHost {
    pub fqdn: String,
    /// Routes in match order (most specific first).
    pub routes: Vec<Route>,
}

#[derive(Debug)]
pub struct SecureVirtualHost {
    pub host: VirtualHost,
    /// Identifier into [`Dag::secrets`].
    pub secret: ObjectKey,
    pub min_tls_version: TlsVersion,
    pub max_tls_version: TlsVersion,
    pub alpn: Vec<String>,
    /// Downstream client certificate validation.
    pub client_validation: Option<ClientValidation>,
    /// Terminated TLS handed to raw TCP forwarding instead of HTTP routing.
    pub tcp_proxy: Option<TcpProxy>,
}

#[derive(Clone, Debug)]
pub struct ClientValidation {
    /// CA bundle PEM, copied out of the secret at build time.
    pub ca: Bytes,
}

#[derive(Debug)]
pub struct TcpProxy {
    /// SNI server name for filter chain matching; `None` for raw TCP.
    pub sni: Option<String>,
    pub clusters: Vec<WeightedCluster>,
    /// TLS is forwarded undecrypted.
    pub passthrough: bool,
    pub owner: ResourceKey,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathMatch {
    /// Path-segment prefix. "/a" matches "/a" and "/a/b" but never "/ab";
    /// "/a/" is a distinct, string-prefix form.
    Prefix(String),
    Exact(String),
    Regex(String),
}

impl PathMatch {
    /// Match ordering rank: exact before regex before prefix.
    fn rank(&self) -> u8 {
        match self {
            PathMatch::Exact(_) => 0,
            PathMatch::Regex(_) => 1,
            PathMatch::Prefix(_) => 2,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            PathMatch::Prefix(s) | PathMatch::Exact(s) | PathMatch::Regex(s) => s,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeaderMatchKind {
    Present,
    NotPresent,
    Exact(String),
    NotExact(String),
    Contains(String),
    NotContains(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeaderMatch {
    pub name: String,
    pub kind: HeaderMatchKind,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueryParamMatchKind {
    Exact { value: String, ignore_case: bool },
    Prefix(String),
    Contains(String),
    Present,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueryParamMatch {
    pub name: String,
    pub kind: QueryParamMatchKind,
}

#[derive(Clone, Debug)]
pub struct Route {
    pub path: PathMatch,
    /// Sorted; ordering is part of the deterministic output.
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
    pub action: RouteAction,
    pub timeouts: TimeoutPolicy,
    pub retry: Option<RetryPolicy>,
    pub request_headers: HeaderMutation,
    pub response_headers: HeaderMutation,
    pub prefix_rewrite: Option<String>,
    pub hash_policies: Vec<HashPolicy>,
    pub cors: Option<CorsPolicy>,
    pub local_rate_limit: Option<LocalRateLimit>,
    pub websocket: bool,
    /// On a host that also terminates TLS: serve plain HTTP instead of
    /// redirecting.
    pub permit_insecure: bool,
    /// This instance of the route lives on the HTTP listener only to 301 to
    /// the secure host.
    pub redirect_to_https: bool,
    /// Traffic copied (not load balanced) to this cluster.
    pub mirror: Option<ClusterName>,
    pub owner: ResourceKey,
    pub created: DateTime<Utc>,
}

impl Route {
    /// Signature of the full match set; two sibling routes with equal
    /// signatures are in strict overlap.
    pub fn match_signature(&self) -> String {
        format!(
            "{:?}|{:?}|{:?}",
            self.path, self.headers, self.query_params
        )
    }
}

#[derive(Clone, Debug)]
pub enum RouteAction {
    /// Weighted forwarding; weights are relative shares over the set.
    Forward(Vec<WeightedCluster>),
    Redirect(Redirect),
    DirectResponse { status: u32, body: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedCluster {
    pub cluster: ClusterName,
    pub weight: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Redirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub status_code: u32,
    pub path: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub response: Timeout,
    pub idle: Timeout,
    pub idle_connection: Timeout,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub count: u32,
    pub per_try_timeout: Timeout,
    pub retry_on: Vec<String>,
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMutation {
    pub set: Vec<(String, String)>,
    pub add: Vec<(String, String)>,
    pub remove: Vec<String>,
}

impl HeaderMutation {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HashPolicy {
    Header { name: String, terminal: bool },
    QueryParameter { name: String, terminal: bool },
    SourceIp { terminal: bool },
    Cookie { name: String, ttl: Option<Duration>, path: Option<String>, terminal: bool },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorsPolicy {
    pub allow_origin: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age: Option<Duration>,
    pub allow_credentials: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitUnit {
    Second,
    Minute,
    Hour,
}

impl RateLimitUnit {
    pub fn as_duration(&self) -> Duration {
        match self {
            RateLimitUnit::Second => Duration::from_secs(1),
            RateLimitUnit::Minute => Duration::from_secs(60),
            RateLimitUnit::Hour => Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRateLimit {
    pub requests: u32,
    pub unit: RateLimitUnit,
    pub burst: u32,
}

/// One upstream, unique per `(service, port, settings)`.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub name: ClusterName,
    pub service: ObjectKey,
    /// Resolved numeric target port.
    pub service_port: u16,
    /// Name of the service port, when it has one; selects the endpoint set.
    pub service_port_name: Option<String>,
    /// Whether the backing Service existed at build time. A missing service
    /// still yields a cluster — with no endpoints it serves 503s.
    pub service_found: bool,
    pub protocol: Option<UpstreamProtocol>,
    pub lb_strategy: LbStrategy,
    pub health_check: Option<HealthCheck>,
    pub upstream_validation: Option<UpstreamTls>,
    pub circuit_breakers: CircuitBreakers,
    pub sni: Option<String>,
}

impl Cluster {
    /// The EDS resource this cluster's endpoints are published under.
    pub fn eds_name(&self) -> String {
        match &self.service_port_name {
            Some(port_name) => format!("{}/{}", self.service, port_name),
            None => self.service.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpstreamProtocol {
    H2,
    H2c,
    Tls,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    RingHash,
    Maglev,
    Cookie,
    RequestHash,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HealthCheck {
    pub path: String,
    pub host: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

pub const HEALTH_CHECK_DEFAULT_HOST: &str = "rudder-envoy-healthcheck";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTls {
    /// CA bundle PEM the upstream certificate must chain to.
    pub ca: Bytes,
    pub subject_name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CircuitBreakers {
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
    pub max_retries: Option<u32>,
}

/// Stable ordering for routes within a virtual host: exact matches first,
/// longer prefixes before shorter, more constrained matches before less
/// constrained, with the full signature as the final tiebreak so the order is
/// total.
pub fn route_order(a: &Route, b: &Route) -> std::cmp::Ordering {
    a.path
        .rank()
        .cmp(&b.path.rank())
        .then_with(|| b.path.value().len().cmp(&a.path.value().len()))
        .then_with(|| a.path.value().cmp(b.path.value()))
        .then_with(|| {
            (b.headers.len() + b.query_params.len()).cmp(&(a.headers.len() + a.query_params.len()))
        })
        .then_with(|| a.match_signature().cmp(&b.match_signature()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rudder_k8s::ResourceKind;

    fn route(path: PathMatch, headers: Vec<HeaderMatch>) -> Route {
        Route {
            path,
            headers,
            query_params: Vec::new(),
            action: RouteAction::DirectResponse { status: 200, body: None },
            timeouts: TimeoutPolicy::default(),
            retry: None,
            request_headers: HeaderMutation::default(),
            response_headers: HeaderMutation::default(),
            prefix_rewrite: None,
            hash_policies: Vec::new(),
            cors: None,
            local_rate_limit: None,
            websocket: false,
            permit_insecure: false,
            redirect_to_https: false,
            mirror: None,
            owner: ResourceKey::new(ResourceKind::HttpProxy, ObjectKey::new("default", "x")),
            created: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn routes_sort_most_specific_first() {
        let mut routes = vec![
            route(PathMatch::Prefix("/".to_string()), vec![]),
            route(PathMatch::Prefix("/api/v1".to_string()), vec![]),
            route(PathMatch::Exact("/health".to_string()), vec![]),
            route(
                PathMatch::Prefix("/api/v1".to_string()),
                vec![HeaderMatch {
                    name: "x-canary".to_string(),
                    kind: HeaderMatchKind::Present,
                }],
            ),
        ];
        routes.sort_by(route_order);

        assert_eq!(routes[0].path, PathMatch::Exact("/health".to_string()));
        assert_eq!(routes[1].path, PathMatch::Prefix("/api/v1".to_string()));
        assert!(!routes[1].headers.is_empty());
        assert_eq!(routes[3].path, PathMatch::Prefix("/".to_string()));
    }

    #[test]
    fn signatures_distinguish_trailing_slash() {
        let a = route(PathMatch::Prefix("/a".to_string()), vec![]);
        let b = route(PathMatch::Prefix("/a/".to_string()), vec![]);
        assert_ne!(a.match_signature(), b.match_signature());
    }
}
