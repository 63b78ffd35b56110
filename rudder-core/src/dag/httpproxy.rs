// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! HTTPProxy translation: root detection, include expansion with cycle and
//! orphan tracking, condition compilation, and TCP proxying.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rudder_config::TlsVersion;
use rudder_k8s::{
    creation_timestamp, HeadersPolicy, HttpProxy, LoadBalancerPolicy, ObjectKey, ProxyRoute,
    ProxyService, ProxyTcpProxy, ResourceKey, ResourceKind,
};

use crate::validation::{self, Timeout};

use super::builder::{Builder, ClusterSettings, ListenerClass, PortRef, SecureSettings};
use super::conditions::{self, ConditionChain};
use super::status::StatusState;
use super::{
    ClientValidation, CorsPolicy, HashPolicy, HeaderMutation, HealthCheck, LbStrategy,
    LocalRateLimit, RateLimitUnit, Redirect, RetryPolicy, Route, RouteAction, TcpProxy,
    TimeoutPolicy, WeightedCluster, HEALTH_CHECK_DEFAULT_HOST,
};

const SESSION_AFFINITY_COOKIE: &str = "X-Rudder-Session-Affinity";

pub(crate) fn process(b: &mut Builder<'_>) {
    let proxies: Vec<Arc<HttpProxy>> = b.view.http_proxies().cloned().collect();

    // Roots claim virtual hosts oldest-first so claim conflicts resolve the
    // same way regardless of store order.
    let mut roots: Vec<Arc<HttpProxy>> = proxies
        .iter()
        .filter(|p| is_root(p))
        .cloned()
        .collect();
    roots.sort_by_key(|p| (creation_timestamp(&p.metadata), ObjectKey::from_meta(&p.metadata)));

    let mut included: BTreeSet<ObjectKey> = BTreeSet::new();
    for root in &roots {
        if !class_matches(b, root) {
            continue;
        }
        process_root(b, root, &mut included);
    }

    for proxy in &proxies {
        if !class_matches(b, proxy) {
            continue;
        }
        let key = ObjectKey::from_meta(&proxy.metadata);
        let rk = ResourceKey::new(ResourceKind::HttpProxy, key.clone());
        if !is_root(proxy) && !included.contains(&key) {
            b.record_status(
                rk,
                StatusState::Orphaned,
                "this HTTPProxy is not included by any root HTTPProxy",
            );
        } else {
            // Keeps any worse state already recorded.
            b.record_status(rk, StatusState::Accepted, "valid HTTPProxy");
        }
    }
}

fn is_root(proxy: &HttpProxy) -> bool {
    proxy
        .spec
        .as_ref()
        .map(|s| s.virtualhost.is_some())
        .unwrap_or(false)
}

fn class_matches(b: &Builder<'_>, proxy: &HttpProxy) -> bool {
    crate::annotations::ingress_class_matches(
        &proxy.metadata,
        proxy
            .spec
            .as_ref()
            .and_then(|s| s.ingress_class_name.as_deref()),
        b.context.parameters.ingress_class.as_deref(),
    )
}

fn process_root(b: &mut Builder<'_>, root: &Arc<HttpProxy>, included: &mut BTreeSet<ObjectKey>) {
    let key = ObjectKey::from_meta(&root.metadata);
    let rk = ResourceKey::new(ResourceKind::HttpProxy, key.clone());
    let created = creation_timestamp(&root.metadata);
    let spec = root.spec.as_ref().expect("roots have a spec");
    let vhost = spec.virtualhost.as_ref().expect("roots have a virtualhost");

    if let Some(allowed) = &b.context.parameters.root_namespaces {
        if !allowed.contains(&key.namespace) {
            b.record_status(
                rk,
                StatusState::Invalid,
                format!(
                    "root HTTPProxy is not allowed in namespace {:?}",
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

    // TLS passthrough routes raw TCP by SNI and cannot carry HTTP routes.
    if vhost.tls.as_ref().map(|t| t.passthrough).unwrap_or(false) {
        process_passthrough(b, root, rk, created, &fqdn);
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
        let min_tls_version = match parse_tls_version(
            tls.minimum_protocol_version.as_deref(),
            b.context.parameters.tls.min_protocol_version,
        ) {
            Ok(v) => v,
            Err(e) => {
                b.record_status(rk, StatusState::Invalid, e);
                return;
            }
        };
        let max_tls_version = match parse_tls_version(
            tls.maximum_protocol_version.as_deref(),
            b.context.parameters.tls.max_protocol_version,
        ) {
            Ok(v) => v,
            Err(e) => {
                b.record_status(rk, StatusState::Invalid, e);
                return;
            }
        };
        let client_validation = match &tls.client_validation {
            Some(validation) => match b.resolve_ca_bundle(&key.namespace, &validation.ca_secret) {
                Ok(ca) => Some(ClientValidation { ca }),
                Err(e) => {
                    b.record_status(rk, StatusState::Invalid, e);
                    return;
                }
            },
            None => None,
        };

        if !b.claim_secure_host(
            b.https_port(),
            &fqdn,
            rk.clone(),
            created,
            SecureSettings {
                secret,
                min_tls_version,
                max_tls_version,
                client_validation,
            },
        ) {
            return;
        }
        secure = true;
    }

    if !b.claim_virtual_host(b.http_port(), &fqdn, rk.clone(), created) {
        return;
    }

    // Terminated TLS handed off to raw TCP forwarding.
    if let Some(tcpproxy) = &spec.tcpproxy {
        if !secure {
            b.record_status(
                rk,
                StatusState::Invalid,
                "tcpproxy requires tls termination or passthrough",
            );
            return;
        }
        match build_tcp_proxy(b, &rk, &key, tcpproxy, None, false) {
            Ok(proxy) => b.set_secure_tcp_proxy(b.https_port(), &fqdn, proxy),
            Err(e) => {
                b.record_status(rk, StatusState::Invalid, e);
            }
        }
        return;
    }

    // Expand the include tree; nothing is committed unless the whole root
    // expands cleanly.
    let mut routes = Vec::new();
    let mut visited = vec![key.clone()];
    if expand(b, root, &ConditionChain::default(), &mut visited, included, &mut routes).is_err() {
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

fn process_passthrough(
    b: &mut Builder<'_>,
    root: &Arc<HttpProxy>,
    rk: ResourceKey,
    created: DateTime<Utc>,
    fqdn: &str,
) {
    let spec = root.spec.as_ref().expect("roots have a spec");
    let key = ObjectKey::from_meta(&root.metadata);
    let Some(tcpproxy) = &spec.tcpproxy else {
        b.record_status(
            rk,
            StatusState::Invalid,
            "tls passthrough requires a tcpproxy",
        );
        return;
    };
    match build_tcp_proxy(b, &rk, &key, tcpproxy, Some(fqdn.to_string()), true) {
        Ok(proxy) => {
            b.insert_tcp_proxy(
                b.https_port(),
                ListenerClass::Https,
                Some(fqdn.to_string()),
                created,
                proxy,
            );
        }
        Err(e) => {
            b.record_status(rk, StatusState::Invalid, e);
        }
    }
}

fn build_tcp_proxy(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    tcpproxy: &ProxyTcpProxy,
    sni: Option<String>,
    passthrough: bool,
) -> Result<TcpProxy, String> {
    let services = tcpproxy
        .services
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or("tcpproxy requires at least one service")?;
    let lb_strategy = validation::parse_lb_strategy(
        tcpproxy
            .load_balancer_policy
            .as_ref()
            .and_then(|p| p.strategy.as_deref()),
    )?;
    let health_check = tcpproxy
        .health_check_policy
        .as_ref()
        .map(compile_health_check)
        .transpose()?;

    let clusters = forward_clusters(b, rk, key, services, lb_strategy, &health_check)?;
    Ok(TcpProxy {
        sni,
        clusters,
        passthrough,
        owner: rk.clone(),
    })
}

/// Cycle marker; participants already carry their status.
struct Aborted;

fn expand(
    b: &mut Builder<'_>,
    current: &Arc<HttpProxy>,
    chain: &ConditionChain,
    visited: &mut Vec<ObjectKey>,
    included: &mut BTreeSet<ObjectKey>,
    out: &mut Vec<Route>,
) -> Result<(), Aborted> {
    let key = ObjectKey::from_meta(&current.metadata);
    let rk = ResourceKey::new(ResourceKind::HttpProxy, key.clone());
    let created = creation_timestamp(&current.metadata);
    let Some(spec) = current.spec.as_ref() else {
        return Ok(());
    };

    let mut local_signatures = BTreeSet::new();
    for proxy_route in spec.routes.as_deref().unwrap_or_default() {
        match compile_route(b, &rk, &key, created, chain, proxy_route) {
            Ok(route) => {
                // A resource repeating its own match set is a defect, not a
                // sibling conflict.
                if !local_signatures.insert(route.match_signature()) {
                    b.record_status(
                        rk.clone(),
                        StatusState::Invalid,
                        "duplicate match conditions defined on a route",
                    );
                    return Err(Aborted);
                }
                out.push(route);
            }
            Err(e) => {
                b.record_status(rk.clone(), StatusState::Invalid, e);
                return Err(Aborted);
            }
        }
    }

    for include in spec.includes.as_deref().unwrap_or_default() {
        let child_key = ObjectKey::relative_to(include.namespace.as_deref(), &include.name, &key);

        if visited.contains(&child_key) {
            let cycle = visited
                .iter()
                .chain(std::iter::once(&child_key))
                .map(ObjectKey::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");
            for participant in visited.iter() {
                b.record_status(
                    ResourceKey::new(ResourceKind::HttpProxy, participant.clone()),
                    StatusState::Invalid,
                    format!("include creates a delegation cycle: {cycle}"),
                );
            }
            return Err(Aborted);
        }

        let Some(child) = b.view.http_proxy(&child_key).cloned() else {
            b.record_status(
                rk.clone(),
                StatusState::Invalid,
                format!("include of non-existent HTTPProxy {child_key}"),
            );
            return Err(Aborted);
        };
        if is_root(&child) {
            b.record_status(
                rk.clone(),
                StatusState::Invalid,
                format!("include of root HTTPProxy {child_key}"),
            );
            return Err(Aborted);
        }

        let child_chain =
            match conditions::include_chain(chain, include.conditions.as_deref().unwrap_or_default())
            {
                Ok(chain) => chain,
                Err(e) => {
                    b.record_status(rk.clone(), StatusState::Invalid, e);
                    return Err(Aborted);
                }
            };

        included.insert(child_key.clone());
        visited.push(child_key);
        let result = expand(b, &child, &child_chain, visited, included, out);
        visited.pop();
        result?;
    }

    Ok(())
}

fn compile_route(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    created: DateTime<Utc>,
    chain: &ConditionChain,
    proxy_route: &ProxyRoute,
) -> Result<Route, String> {
    let spec = conditions::route_match(chain, proxy_route.conditions.as_deref().unwrap_or_default())?;

    let timeouts = compile_timeouts(proxy_route)?;
    let retry = compile_retry(proxy_route)?;
    let request_headers = header_mutation(proxy_route.request_headers_policy.as_ref())?;
    let response_headers = header_mutation(proxy_route.response_headers_policy.as_ref())?;
    let cors = compile_cors(proxy_route)?;
    let local_rate_limit = compile_rate_limit(proxy_route)?;

    let lb_policy = proxy_route.load_balancer_policy.as_ref();
    let lb_strategy = validation::parse_lb_strategy(lb_policy.and_then(|p| p.strategy.as_deref()))?;
    let hash_policies = compile_hash_policies(lb_strategy, lb_policy)?;
    let health_check = proxy_route
        .health_check_policy
        .as_ref()
        .map(compile_health_check)
        .transpose()?;

    let services = proxy_route.services.as_deref().unwrap_or_default();
    let has_services = !services.is_empty();
    let actions_defined = has_services as u8
        + proxy_route.request_redirect_policy.is_some() as u8
        + proxy_route.direct_response_policy.is_some() as u8;
    if actions_defined == 0 {
        return Err("route must forward to services, redirect or respond directly".to_string());
    }
    if actions_defined > 1 {
        return Err(
            "route may define only one of services, redirect and direct response".to_string(),
        );
    }

    let mut mirror = None;
    let action = if let Some(redirect) = &proxy_route.request_redirect_policy {
        RouteAction::Redirect(Redirect {
            scheme: redirect.scheme.clone(),
            hostname: redirect.hostname.clone(),
            port: redirect.port.map(|p| p as u16),
            status_code: redirect.status_code.unwrap_or(302),
            path: redirect.path.clone(),
        })
    } else if let Some(direct) = &proxy_route.direct_response_policy {
        RouteAction::DirectResponse {
            status: direct.status_code,
            body: direct.body.clone(),
        }
    } else {
        let forwards = forward_clusters(
            b,
            rk,
            key,
            services,
            lb_strategy,
            &health_check,
        )?;
        mirror = mirror_cluster(b, rk, key, services, lb_strategy)?;
        RouteAction::Forward(forwards)
    };

    Ok(Route {
        path: spec.path,
        headers: spec.headers,
        query_params: spec.query_params,
        action,
        timeouts,
        retry,
        request_headers,
        response_headers,
        prefix_rewrite: None,
        hash_policies,
        cors,
        local_rate_limit,
        websocket: proxy_route.enable_websockets,
        permit_insecure: proxy_route.permit_insecure,
        redirect_to_https: false,
        mirror,
        owner: rk.clone(),
        created,
    })
}

/// Compiles the non-mirror services of a forward action into weighted
/// clusters, applying the relative-share weight rules.
fn forward_clusters(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    services: &[ProxyService],
    lb_strategy: LbStrategy,
    health_check: &Option<HealthCheck>,
) -> Result<Vec<WeightedCluster>, String> {
    let forwards: Vec<&ProxyService> = services.iter().filter(|s| !s.mirror).collect();
    if forwards.is_empty() {
        return Err("route requires at least one non-mirror service".to_string());
    }

    let any_weighted = forwards.iter().any(|s| s.weight.is_some());
    if any_weighted && forwards.iter().all(|s| s.weight.unwrap_or(0) == 0) {
        return Err("route has no service with a positive weight".to_string());
    }

    let mut clusters = Vec::new();
    for service in forwards {
        let name = service_cluster(b, rk, key, service, lb_strategy, health_check)?;
        // With any explicit weight in the set, unset weights default to zero;
        // with none, shares equalise.
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

fn mirror_cluster(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    services: &[ProxyService],
    lb_strategy: LbStrategy,
) -> Result<Option<String>, String> {
    let mirrors: Vec<&ProxyService> = services.iter().filter(|s| s.mirror).collect();
    match mirrors.as_slice() {
        [] => Ok(None),
        [mirror] => Ok(Some(service_cluster(b, rk, key, mirror, lb_strategy, &None)?)),
        _ => Err("route may mirror to at most one service".to_string()),
    }
}

fn service_cluster(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    service: &ProxyService,
    lb_strategy: LbStrategy,
    health_check: &Option<HealthCheck>,
) -> Result<String, String> {
    if service.port <= 0 || service.port > u16::MAX as i32 {
        return Err(format!(
            "service {:?} port {} is out of range",
            service.name, service.port
        ));
    }
    let protocol = validation::parse_upstream_protocol(service.protocol.as_deref())?;
    let settings = ClusterSettings {
        protocol,
        lb_strategy,
        health_check: health_check.clone(),
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
    Ok(name)
}

fn compile_timeouts(route: &ProxyRoute) -> Result<TimeoutPolicy, String> {
    let policy = route.timeout_policy.as_ref();
    Ok(TimeoutPolicy {
        response: validation::parse_timeout(policy.and_then(|p| p.response.as_deref()))
            .map_err(|e| format!("timeoutPolicy.response: {e}"))?,
        idle: validation::parse_timeout(policy.and_then(|p| p.idle.as_deref()))
            .map_err(|e| format!("timeoutPolicy.idle: {e}"))?,
        idle_connection: validation::parse_timeout(policy.and_then(|p| p.idle_connection.as_deref()))
            .map_err(|e| format!("timeoutPolicy.idleConnection: {e}"))?,
    })
}

fn compile_retry(route: &ProxyRoute) -> Result<Option<RetryPolicy>, String> {
    let Some(policy) = route.retry_policy.as_ref() else {
        return Ok(None);
    };
    Ok(Some(RetryPolicy {
        count: policy.count.unwrap_or(1),
        per_try_timeout: validation::parse_timeout(policy.per_try_timeout.as_deref())
            .map_err(|e| format!("retryPolicy.perTryTimeout: {e}"))?,
        retry_on: policy
            .retry_on
            .clone()
            .unwrap_or_else(|| vec!["5xx".to_string()]),
        retriable_status_codes: policy.retriable_status_codes.clone().unwrap_or_default(),
    }))
}

fn compile_cors(route: &ProxyRoute) -> Result<Option<CorsPolicy>, String> {
    let Some(policy) = route.cors_policy.as_ref() else {
        return Ok(None);
    };
    let allow_origin = policy.allow_origin.clone().unwrap_or_default();
    if allow_origin.is_empty() {
        return Err("corsPolicy requires at least one allowOrigin".to_string());
    }
    let max_age = match validation::parse_timeout(policy.max_age.as_deref())
        .map_err(|e| format!("corsPolicy.maxAge: {e}"))?
    {
        Timeout::Duration(d) => Some(d),
        _ => None,
    };
    Ok(Some(CorsPolicy {
        allow_origin,
        allow_methods: policy.allow_methods.clone().unwrap_or_default(),
        allow_headers: policy.allow_headers.clone().unwrap_or_default(),
        expose_headers: policy.expose_headers.clone().unwrap_or_default(),
        max_age,
        allow_credentials: policy.allow_credentials,
    }))
}

fn compile_rate_limit(route: &ProxyRoute) -> Result<Option<LocalRateLimit>, String> {
    let Some(local) = route.rate_limit_policy.as_ref().and_then(|p| p.local.as_ref()) else {
        return Ok(None);
    };
    if local.requests == 0 {
        return Err("rateLimitPolicy.local.requests must be positive".to_string());
    }
    let unit = match local.unit.as_str() {
        "second" => RateLimitUnit::Second,
        "minute" => RateLimitUnit::Minute,
        "hour" => RateLimitUnit::Hour,
        other => return Err(format!("rateLimitPolicy.local.unit {other:?} is not recognised")),
    };
    Ok(Some(LocalRateLimit {
        requests: local.requests,
        unit,
        burst: local.burst.unwrap_or(0),
    }))
}

fn compile_hash_policies(
    lb_strategy: LbStrategy,
    policy: Option<&LoadBalancerPolicy>,
) -> Result<Vec<HashPolicy>, String> {
    match lb_strategy {
        LbStrategy::Cookie => Ok(vec![HashPolicy::Cookie {
            name: SESSION_AFFINITY_COOKIE.to_string(),
            ttl: Some(std::time::Duration::ZERO),
            path: Some("/".to_string()),
            terminal: false,
        }]),
        LbStrategy::RequestHash => {
            let hash_policies = policy
                .and_then(|p| p.request_hash_policies.as_deref())
                .unwrap_or_default();
            if hash_policies.is_empty() {
                return Err("RequestHash strategy requires requestHashPolicies".to_string());
            }
            let mut compiled = Vec::new();
            for hash_policy in hash_policies {
                let sources = hash_policy.header_hash_options.is_some() as u8
                    + hash_policy.query_parameter_hash_options.is_some() as u8
                    + hash_policy.hash_source_ip as u8;
                if sources != 1 {
                    return Err(
                        "requestHashPolicy must define exactly one hash source".to_string()
                    );
                }
                if let Some(header) = &hash_policy.header_hash_options {
                    compiled.push(HashPolicy::Header {
                        name: header.header_name.clone(),
                        terminal: hash_policy.terminal,
                    });
                } else if let Some(query) = &hash_policy.query_parameter_hash_options {
                    compiled.push(HashPolicy::QueryParameter {
                        name: query.parameter_name.clone(),
                        terminal: hash_policy.terminal,
                    });
                } else {
                    compiled.push(HashPolicy::SourceIp {
                        terminal: hash_policy.terminal,
                    });
                }
            }
            Ok(compiled)
        }
        _ => Ok(Vec::new()),
    }
}

fn compile_health_check(policy: &rudder_k8s::HealthCheckPolicy) -> Result<HealthCheck, String> {
    if policy.path.is_empty() {
        return Err("healthCheckPolicy requires a path".to_string());
    }
    Ok(HealthCheck {
        path: policy.path.clone(),
        host: policy
            .host
            .clone()
            .unwrap_or_else(|| HEALTH_CHECK_DEFAULT_HOST.to_string()),
        interval: std::time::Duration::from_secs(policy.interval_seconds.unwrap_or(5).max(0) as u64),
        timeout: std::time::Duration::from_secs(policy.timeout_seconds.unwrap_or(2).max(0) as u64),
        unhealthy_threshold: policy.unhealthy_threshold_count.unwrap_or(3),
        healthy_threshold: policy.healthy_threshold_count.unwrap_or(2),
    })
}

fn header_mutation(policy: Option<&HeadersPolicy>) -> Result<HeaderMutation, String> {
    let Some(policy) = policy else {
        return Ok(HeaderMutation::default());
    };
    let mut mutation = HeaderMutation::default();
    for entry in policy.set.as_deref().unwrap_or_default() {
        check_mutable_header(&entry.name)?;
        mutation.set.push((entry.name.clone(), entry.value.clone()));
    }
    for entry in policy.add.as_deref().unwrap_or_default() {
        check_mutable_header(&entry.name)?;
        mutation.add.push((entry.name.clone(), entry.value.clone()));
    }
    for name in policy.remove.as_deref().unwrap_or_default() {
        check_mutable_header(name)?;
        mutation.remove.push(name.clone());
    }
    Ok(mutation)
}

fn check_mutable_header(name: &str) -> Result<(), String> {
    const PROTECTED: [&str; 4] = ["host", "connection", "transfer-encoding", "upgrade"];
    if PROTECTED.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(format!("header {name:?} may not be mutated"));
    }
    Ok(())
}

fn parse_tls_version(value: Option<&str>, default: TlsVersion) -> Result<TlsVersion, String> {
    match value {
        None | Some("") => Ok(default),
        Some("1.2") => Ok(TlsVersion::V1_2),
        Some("1.3") => Ok(TlsVersion::V1_3),
        Some(other) => Err(format!("invalid TLS protocol version {other:?}")),
    }
}

