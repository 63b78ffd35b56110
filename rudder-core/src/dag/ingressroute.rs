// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! IngressRoute translation. The legacy CRD only matches on path prefixes;
//! delegation hands a prefix subtree to another resource, and a delegated
//! route must stay inside the prefix it was handed.

use std::collections::BTreeSet;
use std::sync::Arc;

use rudder_k8s::{
    creation_timestamp, IngressRoute, IngressRouteTcpProxy, ObjectKey, ResourceKey, ResourceKind,
    RouteService,
};

use crate::annotations;
use crate::validation;

use super::builder::{Builder, ClusterSettings, ListenerClass, PortRef, SecureSettings};
use super::status::StatusState;
use super::{
    HeaderMutation, HealthCheck, LbStrategy, PathMatch, Route, RouteAction, TcpProxy,
    TimeoutPolicy, WeightedCluster,
};

pub(crate) fn process(b: &mut Builder<'_>) {
    let all: Vec<Arc<IngressRoute>> = b.view.ingress_routes().cloned().collect();

    let mut roots: Vec<Arc<IngressRoute>> = all.iter().filter(|r| is_root(r)).cloned().collect();
    roots.sort_by_key(|r| (creation_timestamp(&r.metadata), ObjectKey::from_meta(&r.metadata)));

    let mut included: BTreeSet<ObjectKey> = BTreeSet::new();
    for root in &roots {
        if !class_matches(b, root) {
            continue;
        }
        process_root(b, root, &mut included);
    }

    for route in &all {
        if !class_matches(b, route) {
            continue;
        }
        let key = ObjectKey::from_meta(&route.metadata);
        let rk = ResourceKey::new(ResourceKind::IngressRoute, key.clone());
        if !is_root(route) && !included.contains(&key) {
            b.record_status(
                rk,
                StatusState::Orphaned,
                "this IngressRoute is not delegated to by any root IngressRoute",
            );
        } else {
            b.record_status(rk, StatusState::Accepted, "valid IngressRoute");
        }
    }
}

fn is_root(route: &IngressRoute) -> bool {
    route
        .spec
        .as_ref()
        .map(|s| s.virtualhost.is_some())
        .unwrap_or(false)
}

fn class_matches(b: &Builder<'_>, route: &IngressRoute) -> bool {
    annotations::ingress_class_matches(
        &route.metadata,
        None,
        b.context.parameters.ingress_class.as_deref(),
    )
}

fn process_root(b: &mut Builder<'_>, root: &Arc<IngressRoute>, included: &mut BTreeSet<ObjectKey>) {
    let key = ObjectKey::from_meta(&root.metadata);
    let rk = ResourceKey::new(ResourceKind::IngressRoute, key.clone());
    let created = creation_timestamp(&root.metadata);
    let spec = root.spec.as_ref().expect("roots have a spec");
    let vhost = spec.virtualhost.as_ref().expect("roots have a virtualhost");

    if let Some(allowed) = &b.context.parameters.root_namespaces {
        if !allowed.contains(&key.namespace) {
            b.record_status(
                rk,
                StatusState::Invalid,
                format!(
                    "root IngressRoute is not allowed in namespace {:?}",
                    key.namespace
                ),
            );
            return;
        }
    }

    if let Err(e) = validation::validate_fqdn(&vhost.fqdn) {
        b.record_status(rk, StatusState::Invalid, e);
        return;
    }
    let fqdn = vhost.fqdn.clone();

    if vhost.tls.as_ref().map(|t| t.passthrough).unwrap_or(false) {
        let Some(tcpproxy) = &spec.tcpproxy else {
            b.record_status(
                rk,
                StatusState::Invalid,
                "tls passthrough requires a tcpproxy",
            );
            return;
        };
        match build_tcp_proxy(b, &rk, &key, tcpproxy, Some(fqdn.clone()), &mut vec![key.clone()], included) {
            Ok(proxy) => {
                b.insert_tcp_proxy(
                    b.https_port(),
                    ListenerClass::Https,
                    Some(fqdn),
                    created,
                    proxy,
                );
            }
            Err(e) => b.record_status(rk, StatusState::Invalid, e),
        }
        return;
    }

    let mut secure = false;
    if let Some(tls) = &vhost.tls {
        let Some(secret_name) = tls.secret_name.as_deref() else {
            b.record_status(
                rk,
                StatusState::Invalid,
                "tls requires a secretName or passthrough",
            );
            return;
        };
        let secret = match b.resolve_serving_secret(&rk, &key.namespace, secret_name) {
            Ok(secret) => secret,
            Err(e) => {
                b.record_status(rk, StatusState::Invalid, e);
                return;
            }
        };
        let min_tls_version = match tls.minimum_protocol_version.as_deref() {
            None | Some("") => b.context.parameters.tls.min_protocol_version,
            Some("1.2") => rudder_config::TlsVersion::V1_2,
            Some("1.3") => rudder_config::TlsVersion::V1_3,
            Some(other) => {
                b.record_status(
                    rk,
                    StatusState::Invalid,
                    format!("invalid TLS protocol version {other:?}"),
                );
                return;
            }
        };
        if !b.claim_secure_host(
            b.https_port(),
            &fqdn,
            rk.clone(),
            created,
            SecureSettings {
                secret,
                min_tls_version,
                max_tls_version: b.context.parameters.tls.max_protocol_version,
                client_validation: None,
            },
        ) {
            return;
        }
        secure = true;
    }

    if !b.claim_virtual_host(b.http_port(), &fqdn, rk.clone(), created) {
        return;
    }

    let mut routes = Vec::new();
    let mut visited = vec![key.clone()];
    if expand(b, root, "/", &mut visited, included, &mut routes).is_err() {
        return;
    }

    for mut route in routes {
        if secure {
            b.insert_secure_route(b.https_port(), &fqdn, route.clone());
            route.redirect_to_https = !route.permit_insecure;
        }
        b.insert_route(b.http_port(), &fqdn, route);
    }
}

struct Aborted;

fn expand(
    b: &mut Builder<'_>,
    current: &Arc<IngressRoute>,
    delegated_prefix: &str,
    visited: &mut Vec<ObjectKey>,
    included: &mut BTreeSet<ObjectKey>,
    out: &mut Vec<Route>,
) -> Result<(), Aborted> {
    let key = ObjectKey::from_meta(&current.metadata);
    let rk = ResourceKey::new(ResourceKind::IngressRoute, key.clone());
    let created = creation_timestamp(&current.metadata);
    let Some(spec) = current.spec.as_ref() else {
        return Ok(());
    };

    for rule in spec.routes.as_deref().unwrap_or_default() {
        let prefix = rule.match_prefix.as_str();
        if !prefix.starts_with('/') {
            b.record_status(
                rk.clone(),
                StatusState::Invalid,
                format!("route match {prefix:?} must start with /"),
            );
            return Err(Aborted);
        }
        if !within_prefix(prefix, delegated_prefix) {
            b.record_status(
                rk.clone(),
                StatusState::Invalid,
                format!(
                    "route match {prefix:?} is outside the delegated prefix {delegated_prefix:?}"
                ),
            );
            return Err(Aborted);
        }

        match (&rule.services, &rule.delegate) {
            (Some(services), None) if !services.is_empty() => {
                let clusters = match rule_clusters(b, &rk, &key, services) {
                    Ok(clusters) => clusters,
                    Err(e) => {
                        b.record_status(rk.clone(), StatusState::Invalid, e);
                        return Err(Aborted);
                    }
                };
                out.push(Route {
                    path: PathMatch::Prefix(prefix.to_string()),
                    headers: Vec::new(),
                    query_params: Vec::new(),
                    action: RouteAction::Forward(clusters),
                    timeouts: TimeoutPolicy::default(),
                    retry: None,
                    request_headers: HeaderMutation::default(),
                    response_headers: HeaderMutation::default(),
                    prefix_rewrite: None,
                    hash_policies: Vec::new(),
                    cors: None,
                    local_rate_limit: None,
                    websocket: rule.enable_websockets,
                    permit_insecure: rule.permit_insecure,
                    redirect_to_https: false,
                    mirror: None,
                    owner: rk.clone(),
                    created,
                });
            }
            (None, Some(delegate)) | (Some(_), Some(delegate)) => {
                if rule.services.as_deref().map(|s| !s.is_empty()).unwrap_or(false) {
                    b.record_status(
                        rk.clone(),
                        StatusState::Invalid,
                        "route cannot both forward to services and delegate",
                    );
                    return Err(Aborted);
                }
                let child_key =
                    ObjectKey::relative_to(delegate.namespace.as_deref(), &delegate.name, &key);

                if visited.contains(&child_key) {
                    let cycle = visited
                        .iter()
                        .chain(std::iter::once(&child_key))
                        .map(ObjectKey::to_string)
                        .collect::<Vec<_>>()
                        .join(" -> ");
                    for participant in visited.iter() {
                        b.record_status(
                            ResourceKey::new(ResourceKind::IngressRoute, participant.clone()),
                            StatusState::Invalid,
                            format!("delegation creates a cycle: {cycle}"),
                        );
                    }
                    return Err(Aborted);
                }

                let Some(child) = b.view.ingress_route(&child_key).cloned() else {
                    b.record_status(
                        rk.clone(),
                        StatusState::Invalid,
                        format!("delegation to non-existent IngressRoute {child_key}"),
                    );
                    return Err(Aborted);
                };
                if is_root(&child) {
                    b.record_status(
                        rk.clone(),
                        StatusState::Invalid,
                        format!("delegation to root IngressRoute {child_key}"),
                    );
                    return Err(Aborted);
                }

                included.insert(child_key.clone());
                visited.push(child_key);
                let result = expand(b, &child, prefix, visited, included, out);
                visited.pop();
                result?;
            }
            _ => {
                b.record_status(
                    rk.clone(),
                    StatusState::Invalid,
                    format!("route {prefix:?} must forward to services or delegate"),
                );
                return Err(Aborted);
            }
        }
    }

    Ok(())
}

fn build_tcp_proxy(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    tcpproxy: &IngressRouteTcpProxy,
    sni: Option<String>,
    visited: &mut Vec<ObjectKey>,
    included: &mut BTreeSet<ObjectKey>,
) -> Result<TcpProxy, String> {
    if let Some(delegate) = &tcpproxy.delegate {
        let child_key = ObjectKey::relative_to(delegate.namespace.as_deref(), &delegate.name, key);
        if visited.contains(&child_key) {
            // Same rule as route delegation: every participant in the chain
            // is invalid, not just the root the error bubbles up to.
            let cycle = visited
                .iter()
                .chain(std::iter::once(&child_key))
                .map(ObjectKey::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");
            for participant in visited.iter() {
                b.record_status(
                    ResourceKey::new(ResourceKind::IngressRoute, participant.clone()),
                    StatusState::Invalid,
                    format!("tcpproxy delegation creates a cycle: {cycle}"),
                );
            }
            return Err(format!("tcpproxy delegation creates a cycle: {cycle}"));
        }
        let child = b
            .view
            .ingress_route(&child_key)
            .cloned()
            .ok_or_else(|| format!("tcpproxy delegation to non-existent IngressRoute {child_key}"))?;
        let child_tcpproxy = child
            .spec
            .as_ref()
            .and_then(|s| s.tcpproxy.as_ref())
            .ok_or_else(|| format!("IngressRoute {child_key} has no tcpproxy to delegate to"))?
            .clone();
        let child_rk = ResourceKey::new(ResourceKind::IngressRoute, child_key.clone());
        included.insert(child_key.clone());
        visited.push(child_key.clone());
        let result = build_tcp_proxy(b, &child_rk, &child_key, &child_tcpproxy, sni, visited, included);
        visited.pop();
        let mut proxy = result?;
        proxy.owner = rk.clone();
        return Ok(proxy);
    }

    let services = tcpproxy
        .services
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or("tcpproxy requires at least one service")?;
    let clusters = rule_clusters(b, rk, key, services)?;
    Ok(TcpProxy {
        sni,
        clusters,
        passthrough: true,
        owner: rk.clone(),
    })
}

/// Whether `path` stays inside the delegated segment prefix.
fn within_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Weighted clusters for the services of one rule, with per-service strategy
/// and health check settings.
fn rule_clusters(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    services: &[RouteService],
) -> Result<Vec<WeightedCluster>, String> {
    let any_weighted = services.iter().any(|s| s.weight.is_some());
    if any_weighted && services.iter().all(|s| s.weight.unwrap_or(0) == 0) {
        return Err("route has no service with a positive weight".to_string());
    }

    let mut clusters = Vec::new();
    for service in services {
        if service.port <= 0 || service.port > u16::MAX as i32 {
            return Err(format!(
                "service {:?} port {} is out of range",
                service.name, service.port
            ));
        }
        let lb_strategy: LbStrategy = validation::parse_lb_strategy(service.strategy.as_deref())?;
        let health_check: Option<HealthCheck> = service
            .health_check
            .as_ref()
            .map(|p| {
                if p.path.is_empty() {
                    return Err("healthCheck requires a path".to_string());
                }
                Ok(HealthCheck {
                    path: p.path.clone(),
                    host: p
                        .host
                        .clone()
                        .unwrap_or_else(|| super::HEALTH_CHECK_DEFAULT_HOST.to_string()),
                    interval: std::time::Duration::from_secs(
                        p.interval_seconds.unwrap_or(5).max(0) as u64
                    ),
                    timeout: std::time::Duration::from_secs(
                        p.timeout_seconds.unwrap_or(2).max(0) as u64
                    ),
                    unhealthy_threshold: p.unhealthy_threshold_count.unwrap_or(3),
                    healthy_threshold: p.healthy_threshold_count.unwrap_or(2),
                })
            })
            .transpose()?;

        let settings = ClusterSettings {
            protocol: None,
            lb_strategy,
            health_check,
            upstream_validation: service
                .validation
                .as_ref()
                .map(|v| (v.ca_secret.clone(), v.subject_name.clone())),
        };
        let (name, warning) = b.cluster_for(
            &key.namespace,
            &service.name,
            PortRef::Number(service.port as u16),
            settings,
        )?;
        if let Some(warning) = warning {
            b.record_status(rk.clone(), StatusState::PartiallyAccepted, warning);
        }
        let weight = if any_weighted {
            service.weight.unwrap_or(0)
        } else {
            1
        };
        clusters.push(WeightedCluster {
            cluster: name,
            weight,
        });
    }
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::within_prefix;

    #[test]
    fn prefix_containment_respects_segment_boundaries() {
        assert!(within_prefix("/a", "/a"));
        assert!(within_prefix("/a/", "/a"));
        assert!(within_prefix("/a/b", "/a"));
        assert!(!within_prefix("/ab", "/a"));
        assert!(!within_prefix("/b", "/a"));

        // A trailing slash on the delegated prefix does not loosen the match.
        assert!(within_prefix("/a/b", "/a/"));
        assert!(!within_prefix("/ab", "/a/"));

        // The root prefix delegates everything.
        assert!(within_prefix("/anything", "/"));
    }
}
