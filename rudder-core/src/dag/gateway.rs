// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Gateway API translation: the oldest matching GatewayClass and the oldest
//! Gateway for it are accepted; listeners attach HTTPRoute/TLSRoute/TCPRoute
//! resources by parent reference and hostname intersection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rudder_k8s::{
    creation_timestamp, Gateway, GatewayListener, HttpBackendRef, HttpRoute, HttpRouteRule,
    ObjectKey, ParentReference, ResourceKey, ResourceKind,
};

use crate::validation;

use super::builder::{Builder, ClusterSettings, ListenerClass, PortRef, SecureSettings};
use super::status::StatusState;
use super::{
    HeaderMatch, HeaderMatchKind, HeaderMutation, PathMatch, QueryParamMatch, QueryParamMatchKind,
    Route, RouteAction, TcpProxy, TimeoutPolicy, WeightedCluster,
};

pub(crate) fn process(b: &mut Builder<'_>) {
    let Some(controller) = b.context.parameters.gateway_controller_name.clone() else {
        return;
    };

    // The oldest class owned by this controller wins; newer ones are told an
    // older one exists.
    let mut classes: Vec<_> = b
        .view
        .gateway_classes()
        .filter(|c| {
            c.spec
                .as_ref()
                .map(|s| s.controller_name == controller)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    classes.sort_by_key(|c| (creation_timestamp(&c.metadata), ObjectKey::from_meta(&c.metadata)));
    let Some(accepted_class) = classes.first().cloned() else {
        return;
    };
    for class in &classes[1..] {
        b.record_status(
            ResourceKey::new(ResourceKind::GatewayClass, ObjectKey::from_meta(&class.metadata)),
            StatusState::Conflicting,
            "an older GatewayClass for this controller exists",
        );
    }
    b.record_status(
        ResourceKey::new(
            ResourceKind::GatewayClass,
            ObjectKey::from_meta(&accepted_class.metadata),
        ),
        StatusState::Accepted,
        "valid GatewayClass",
    );

    let class_name = accepted_class
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    let mut gateways: Vec<Arc<Gateway>> = b
        .view
        .gateways()
        .filter(|g| {
            g.spec
                .as_ref()
                .map(|s| s.gateway_class_name == class_name)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    gateways.sort_by_key(|g| (creation_timestamp(&g.metadata), ObjectKey::from_meta(&g.metadata)));
    let Some(gateway) = gateways.first().cloned() else {
        return;
    };
    for newer in &gateways[1..] {
        b.record_status(
            ResourceKey::new(ResourceKind::Gateway, ObjectKey::from_meta(&newer.metadata)),
            StatusState::Conflicting,
            "an older Gateway for this class exists",
        );
    }
    b.record_status(
        ResourceKey::new(ResourceKind::Gateway, ObjectKey::from_meta(&gateway.metadata)),
        StatusState::Accepted,
        "valid Gateway",
    );

    let listeners = gateway
        .spec
        .as_ref()
        .map(|s| s.listeners.clone())
        .unwrap_or_default();
    for listener in &listeners {
        match listener.protocol.as_str() {
            "HTTP" => attach_http_routes(b, &gateway, listener),
            "HTTPS" => attach_https_listener(b, &gateway, listener),
            "TLS" => attach_tls_routes(b, &gateway, listener),
            "TCP" => attach_tcp_routes(b, &gateway, listener),
            other => {
                b.record_status(
                    ResourceKey::new(
                        ResourceKind::Gateway,
                        ObjectKey::from_meta(&gateway.metadata),
                    ),
                    StatusState::PartiallyAccepted,
                    format!("listener {:?} has unsupported protocol {other:?}", listener.name),
                );
            }
        }
    }
}

fn parent_matches(parent: &ParentReference, gateway_key: &ObjectKey, listener: &GatewayListener, route_namespace: &str) -> bool {
    parent.name == gateway_key.name
        && parent.namespace.as_deref().unwrap_or(route_namespace) == gateway_key.namespace
        && parent
            .section_name
            .as_deref()
            .map(|s| s == listener.name)
            .unwrap_or(true)
}

/// Hostnames served for a route attached to a listener: the intersection of
/// the listener hostname (possibly wildcard) and the route's hostnames.
fn intersect_hostnames(listener: Option<&str>, route_hostnames: &[String]) -> Vec<String> {
    match (listener, route_hostnames.is_empty()) {
        (None, true) => vec!["*".to_string()],
        (Some(host), true) => vec![host.to_string()],
        (None, false) => route_hostnames.to_vec(),
        (Some(host), false) => route_hostnames
            .iter()
            .filter(|candidate| hostname_compatible(host, candidate))
            .cloned()
            .collect(),
    }
}

fn hostname_compatible(listener: &str, candidate: &str) -> bool {
    if listener == candidate {
        return true;
    }
    if let Some(suffix) = listener.strip_prefix("*.") {
        return candidate
            .strip_suffix(suffix)
            .map(|rest| rest.ends_with('.') && rest.len() > 1)
            .unwrap_or(false);
    }
    if let Some(suffix) = candidate.strip_prefix("*.") {
        return listener
            .strip_suffix(suffix)
            .map(|rest| rest.ends_with('.') && rest.len() > 1)
            .unwrap_or(false);
    }
    false
}

fn attach_https_listener(b: &mut Builder<'_>, gateway: &Arc<Gateway>, listener: &GatewayListener) {
    let gateway_key = ObjectKey::from_meta(&gateway.metadata);
    let gateway_rk = ResourceKey::new(ResourceKind::Gateway, gateway_key.clone());
    let created = creation_timestamp(&gateway.metadata);

    let Some(tls) = listener.tls.as_ref() else {
        b.record_status(
            gateway_rk,
            StatusState::PartiallyAccepted,
            format!("HTTPS listener {:?} has no TLS configuration", listener.name),
        );
        return;
    };
    if tls.mode.as_deref() == Some("Passthrough") {
        attach_tls_routes(b, gateway, listener);
        return;
    }
    let Some(cert_ref) = tls.certificate_refs.first() else {
        b.record_status(
            gateway_rk,
            StatusState::PartiallyAccepted,
            format!("HTTPS listener {:?} has no certificateRefs", listener.name),
        );
        return;
    };
    let reference = match cert_ref.namespace.as_deref() {
        Some(ns) => format!("{ns}/{}", cert_ref.name),
        None => cert_ref.name.clone(),
    };
    let secret = match b.resolve_serving_secret(&gateway_rk, &gateway_key.namespace, &reference) {
        Ok(secret) => secret,
        Err(e) => {
            b.record_status(gateway_rk, StatusState::PartiallyAccepted, e);
            return;
        }
    };

    // One secure host per hostname the attached routes serve. SNI needs a
    // concrete (possibly wildcard-prefixed) name, so the catch-all host
    // cannot terminate TLS.
    let routes = collect_http_routes(b, &gateway_key, listener);
    for (fqdn, compiled) in routes {
        if fqdn == "*" || validation::validate_fqdn(&fqdn).is_err() {
            continue;
        }
        if !b.claim_secure_host(
            listener.port,
            &fqdn,
            gateway_rk.clone(),
            created,
            SecureSettings {
                secret: secret.clone(),
                min_tls_version: b.context.parameters.tls.min_protocol_version,
                max_tls_version: b.context.parameters.tls.max_protocol_version,
                client_validation: None,
            },
        ) {
            continue;
        }
        for route in compiled {
            b.insert_secure_route(listener.port, &fqdn, route);
        }
    }
}

fn attach_http_routes(b: &mut Builder<'_>, gateway: &Arc<Gateway>, listener: &GatewayListener) {
    let gateway_key = ObjectKey::from_meta(&gateway.metadata);
    let routes = collect_http_routes(b, &gateway_key, listener);
    for (fqdn, compiled) in routes {
        for route in compiled {
            b.insert_route(listener.port, &fqdn, route);
        }
    }
}

/// Compiles every HTTPRoute attached to `listener`, grouped by served
/// hostname.
fn collect_http_routes(
    b: &mut Builder<'_>,
    gateway_key: &ObjectKey,
    listener: &GatewayListener,
) -> Vec<(String, Vec<Route>)> {
    let mut by_host: std::collections::BTreeMap<String, Vec<Route>> = Default::default();

    let routes: Vec<Arc<HttpRoute>> = b.view.http_routes().cloned().collect();
    for http_route in &routes {
        let key = ObjectKey::from_meta(&http_route.metadata);
        let rk = ResourceKey::new(ResourceKind::HttpRoute, key.clone());
        let created = creation_timestamp(&http_route.metadata);
        let Some(spec) = http_route.spec.as_ref() else {
            continue;
        };
        if !spec
            .parent_refs
            .iter()
            .any(|p| parent_matches(p, gateway_key, listener, &key.namespace))
        {
            continue;
        }

        let hostnames = intersect_hostnames(listener.hostname.as_deref(), &spec.hostnames);
        if hostnames.is_empty() {
            b.record_status(
                rk.clone(),
                StatusState::Invalid,
                format!(
                    "no hostnames intersect with listener {:?}",
                    listener.name
                ),
            );
            continue;
        }

        let mut compiled = Vec::new();
        let mut route_ok = true;
        for rule in &spec.rules {
            match compile_rule(b, &rk, &key, rule, created) {
                Ok(mut rule_routes) => compiled.append(&mut rule_routes),
                Err(e) => {
                    b.record_status(rk.clone(), StatusState::PartiallyAccepted, e);
                    route_ok = false;
                }
            }
        }
        if route_ok {
            b.record_status(rk.clone(), StatusState::Accepted, "valid HTTPRoute");
        }

        for hostname in &hostnames {
            for route in &compiled {
                by_host.entry(hostname.clone()).or_default().push(route.clone());
            }
        }
    }

    by_host.into_iter().collect()
}

/// One Gateway rule can expand to several DAG routes, one per match.
fn compile_rule(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    rule: &HttpRouteRule,
    created: DateTime<Utc>,
) -> Result<Vec<Route>, String> {
    let clusters = backend_clusters(b, rk, key, &rule.backend_refs)?;
    let action = match clusters {
        Some(clusters) => RouteAction::Forward(clusters),
        None => RouteAction::DirectResponse {
            status: 503,
            body: None,
        },
    };

    let mut request_headers = HeaderMutation::default();
    let mut response_headers = HeaderMutation::default();
    let mut prefix_rewrite = None;
    for filter in &rule.filters {
        match filter.filter_type.as_str() {
            "RequestHeaderModifier" => {
                if let Some(modifier) = &filter.request_header_modifier {
                    apply_modifier(&mut request_headers, modifier);
                }
            }
            "ResponseHeaderModifier" => {
                if let Some(modifier) = &filter.response_header_modifier {
                    apply_modifier(&mut response_headers, modifier);
                }
            }
            "URLRewrite" => {
                let path = filter.url_rewrite.as_ref().and_then(|r| r.path.as_ref());
                match path.and_then(|p| p.replace_prefix_match.as_deref()) {
                    Some(replacement) => prefix_rewrite = Some(replacement.to_string()),
                    None => {
                        return Err("URLRewrite supports replacePrefixMatch only".to_string())
                    }
                }
            }
            other => {
                return Err(format!("unsupported filter type {other:?}"));
            }
        }
    }

    let matches: Vec<_> = if rule.matches.is_empty() {
        vec![Default::default()]
    } else {
        rule.matches.clone()
    };

    let mut routes = Vec::new();
    for m in &matches {
        let path = match m.path.as_ref() {
            None => PathMatch::Prefix("/".to_string()),
            Some(p) => {
                let value = p.value.clone().unwrap_or_else(|| "/".to_string());
                match p.match_type.as_deref().unwrap_or("PathPrefix") {
                    "Exact" => PathMatch::Exact(value),
                    "RegularExpression" => PathMatch::Regex(value),
                    _ => PathMatch::Prefix(value),
                }
            }
        };
        let mut headers = Vec::new();
        for h in &m.headers {
            match h.match_type.as_deref().unwrap_or("Exact") {
                "Exact" => headers.push(HeaderMatch {
                    name: h.name.to_ascii_lowercase(),
                    kind: HeaderMatchKind::Exact(h.value.clone()),
                }),
                other => {
                    return Err(format!("unsupported header match type {other:?}"));
                }
            }
        }
        headers.sort();
        let mut query_params = Vec::new();
        for q in &m.query_params {
            match q.match_type.as_deref().unwrap_or("Exact") {
                "Exact" => query_params.push(QueryParamMatch {
                    name: q.name.clone(),
                    kind: QueryParamMatchKind::Exact {
                        value: q.value.clone(),
                        ignore_case: false,
                    },
                }),
                other => {
                    return Err(format!("unsupported query match type {other:?}"));
                }
            }
        }
        query_params.sort();

        routes.push(Route {
            path,
            headers,
            query_params,
            action: action.clone(),
            timeouts: TimeoutPolicy::default(),
            retry: None,
            request_headers: request_headers.clone(),
            response_headers: response_headers.clone(),
            prefix_rewrite: prefix_rewrite.clone(),
            hash_policies: Vec::new(),
            cors: None,
            local_rate_limit: None,
            websocket: false,
            permit_insecure: true,
            redirect_to_https: false,
            mirror: None,
            owner: rk.clone(),
            created,
        });
    }
    Ok(routes)
}

fn apply_modifier(mutation: &mut HeaderMutation, modifier: &rudder_k8s::HttpHeaderModifier) {
    for h in &modifier.set {
        mutation.set.push((h.name.clone(), h.value.clone()));
    }
    for h in &modifier.add {
        mutation.add.push((h.name.clone(), h.value.clone()));
    }
    for name in &modifier.remove {
        mutation.remove.push(name.clone());
    }
}

/// Weighted clusters for Gateway backendRefs. `None` when no backend is
/// usable (the rule then answers 503). Gateway weights default to 1 and an
/// explicit 0 receives no traffic.
fn backend_clusters(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    backend_refs: &[HttpBackendRef],
) -> Result<Option<Vec<WeightedCluster>>, String> {
    let mut clusters = Vec::new();
    for backend in backend_refs {
        if let Some(ns) = backend.namespace.as_deref() {
            if ns != key.namespace {
                b.record_status(
                    rk.clone(),
                    StatusState::PartiallyAccepted,
                    format!(
                        "cross-namespace backendRef {}/{} is not permitted",
                        ns, backend.name
                    ),
                );
                continue;
            }
        }
        let Some(port) = backend.port.filter(|p| *p > 0 && *p <= u16::MAX as i32) else {
            b.record_status(
                rk.clone(),
                StatusState::PartiallyAccepted,
                format!("backendRef {:?} requires a port", backend.name),
            );
            continue;
        };
        let (name, warning) = b.cluster_for(
            &key.namespace,
            &backend.name,
            PortRef::Number(port as u16),
            ClusterSettings::default(),
        )?;
        if let Some(warning) = warning {
            b.record_status(rk.clone(), StatusState::PartiallyAccepted, warning);
        }
        clusters.push(WeightedCluster {
            cluster: name,
            weight: backend.weight.unwrap_or(1),
        });
    }
    if clusters.is_empty() || clusters.iter().all(|c| c.weight == 0) {
        return Ok(None);
    }
    Ok(Some(clusters))
}

fn attach_tls_routes(b: &mut Builder<'_>, gateway: &Arc<Gateway>, listener: &GatewayListener) {
    let gateway_key = ObjectKey::from_meta(&gateway.metadata);
    let routes: Vec<_> = b.view.tls_routes().cloned().collect();
    for tls_route in &routes {
        let key = ObjectKey::from_meta(&tls_route.metadata);
        let rk = ResourceKey::new(ResourceKind::TlsRoute, key.clone());
        let created = creation_timestamp(&tls_route.metadata);
        let Some(spec) = tls_route.spec.as_ref() else {
            continue;
        };
        if !spec
            .parent_refs
            .iter()
            .any(|p| parent_matches(p, &gateway_key, listener, &key.namespace))
        {
            continue;
        }
        let hostnames = intersect_hostnames(listener.hostname.as_deref(), &spec.hostnames);
        if hostnames.is_empty() {
            b.record_status(
                rk.clone(),
                StatusState::Invalid,
                format!("no hostnames intersect with listener {:?}", listener.name),
            );
            continue;
        }
        let Some(rule) = spec.rules.first() else {
            b.record_status(rk.clone(), StatusState::Invalid, "TLSRoute has no rules");
            continue;
        };
        match backend_clusters(b, &rk, &key, &rule.backend_refs) {
            Ok(Some(clusters)) => {
                let mut accepted = false;
                for hostname in &hostnames {
                    // SNI matching needs a concrete name; a bare wildcard
                    // cannot be matched pre-handshake.
                    if hostname == "*" {
                        continue;
                    }
                    accepted |= b.insert_tcp_proxy(
                        listener.port,
                        ListenerClass::Https,
                        Some(hostname.clone()),
                        created,
                        TcpProxy {
                            sni: Some(hostname.clone()),
                            clusters: clusters.clone(),
                            passthrough: true,
                            owner: rk.clone(),
                        },
                    );
                }
                if accepted {
                    b.record_status(rk.clone(), StatusState::Accepted, "valid TLSRoute");
                }
            }
            Ok(None) => {
                b.record_status(
                    rk.clone(),
                    StatusState::Invalid,
                    "TLSRoute has no usable backends",
                );
            }
            Err(e) => {
                b.record_status(rk.clone(), StatusState::Invalid, e);
            }
        }
    }
}

fn attach_tcp_routes(b: &mut Builder<'_>, gateway: &Arc<Gateway>, listener: &GatewayListener) {
    let gateway_key = ObjectKey::from_meta(&gateway.metadata);
    let routes: Vec<_> = b.view.tcp_routes().cloned().collect();
    for tcp_route in &routes {
        let key = ObjectKey::from_meta(&tcp_route.metadata);
        let rk = ResourceKey::new(ResourceKind::TcpRoute, key.clone());
        let created = creation_timestamp(&tcp_route.metadata);
        let Some(spec) = tcp_route.spec.as_ref() else {
            continue;
        };
        if !spec
            .parent_refs
            .iter()
            .any(|p| parent_matches(p, &gateway_key, listener, &key.namespace))
        {
            continue;
        }
        let Some(rule) = spec.rules.first() else {
            b.record_status(rk.clone(), StatusState::Invalid, "TCPRoute has no rules");
            continue;
        };
        match backend_clusters(b, &rk, &key, &rule.backend_refs) {
            Ok(Some(clusters)) => {
                if b.insert_tcp_proxy(
                    listener.port,
                    ListenerClass::Tcp,
                    None,
                    created,
                    TcpProxy {
                        sni: None,
                        clusters,
                        passthrough: false,
                        owner: rk.clone(),
                    },
                ) {
                    b.record_status(rk.clone(), StatusState::Accepted, "valid TCPRoute");
                }
            }
            Ok(None) => {
                b.record_status(
                    rk.clone(),
                    StatusState::Invalid,
                    "TCPRoute has no usable backends",
                );
            }
            Err(e) => {
                b.record_status(rk.clone(), StatusState::Invalid, e);
            }
        }
    }
}
