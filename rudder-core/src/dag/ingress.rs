// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ingress translation. Ingress has no delegation and no conditions; all of
//! its extended behaviour arrives through annotations, which are normalised
//! before this module runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress, IngressBackend};
use rudder_k8s::{creation_timestamp, ObjectKey, ResourceKey, ResourceKind};

use crate::annotations;
use crate::validation;

use super::builder::{Builder, ClusterSettings, PortRef, SecureSettings};
use super::status::StatusState;
use super::{
    HeaderMutation, PathMatch, Route, RouteAction, TimeoutPolicy, WeightedCluster,
};

pub(crate) fn process(b: &mut Builder<'_>) {
    let ingresses: Vec<Arc<Ingress>> = b.view.ingresses().cloned().collect();
    for ingress in &ingresses {
        let class_field = ingress
            .spec
            .as_ref()
            .and_then(|s| s.ingress_class_name.as_deref());
        if !annotations::ingress_class_matches(
            &ingress.metadata,
            class_field,
            b.context.parameters.ingress_class.as_deref(),
        ) {
            continue;
        }
        process_ingress(b, ingress);
    }
}

fn process_ingress(b: &mut Builder<'_>, ingress: &Arc<Ingress>) {
    let key = ObjectKey::from_meta(&ingress.metadata);
    let rk = ResourceKey::new(ResourceKind::Ingress, key.clone());
    let created = creation_timestamp(&ingress.metadata);
    let Some(spec) = ingress.spec.as_ref() else {
        return;
    };

    let policies = annotations::ingress_policies(&ingress.metadata);
    for error in &policies.errors {
        b.record_status(rk.clone(), StatusState::PartiallyAccepted, error.clone());
    }

    let min_tls_version = match policies.min_tls_version.as_deref() {
        None => b.context.parameters.tls.min_protocol_version,
        Some("1.2") => rudder_config::TlsVersion::V1_2,
        Some("1.3") => rudder_config::TlsVersion::V1_3,
        Some(other) => {
            b.record_status(
                rk.clone(),
                StatusState::PartiallyAccepted,
                format!("invalid TLS protocol version {other:?}"),
            );
            b.context.parameters.tls.min_protocol_version
        }
    };

    // TLS stanzas decide which hosts also terminate on the HTTPS listener.
    let mut secured: BTreeMap<String, ()> = BTreeMap::new();
    for tls in spec.tls.as_deref().unwrap_or_default() {
        let Some(secret_name) = tls.secret_name.as_deref() else {
            continue;
        };
        let secret = match b.resolve_serving_secret(&rk, &key.namespace, secret_name) {
            Ok(secret) => secret,
            Err(e) => {
                b.record_status(rk.clone(), StatusState::PartiallyAccepted, e);
                continue;
            }
        };
        for host in tls.hosts.as_deref().unwrap_or_default() {
            if validation::validate_fqdn(host).is_err() {
                b.record_status(
                    rk.clone(),
                    StatusState::PartiallyAccepted,
                    format!("invalid TLS host {host:?}"),
                );
                continue;
            }
            if b.claim_secure_host(
                b.https_port(),
                host,
                rk.clone(),
                created,
                SecureSettings {
                    secret: secret.clone(),
                    min_tls_version,
                    max_tls_version: b.context.parameters.tls.max_protocol_version,
                    client_validation: None,
                },
            ) {
                secured.insert(host.clone(), ());
            }
        }
    }

    for rule in spec.rules.as_deref().unwrap_or_default() {
        let host = rule.host.as_deref().unwrap_or("*");
        if host != "*" && validation::validate_fqdn(host).is_err() {
            b.record_status(
                rk.clone(),
                StatusState::PartiallyAccepted,
                format!("invalid host {host:?}"),
            );
            continue;
        }
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        for path in &http.paths {
            add_path_route(b, &rk, &key, &policies, &secured, host, path, created);
        }
    }

    if let Some(default_backend) = spec.default_backend.as_ref() {
        let route = backend_route(
            b,
            &rk,
            &key,
            &policies,
            default_backend,
            PathMatch::Prefix("/".to_string()),
            created,
        );
        if let Some(route) = route {
            b.insert_route(b.http_port(), "*", route);
        }
    }

    b.record_status(rk, StatusState::Accepted, "valid Ingress");
}

#[allow(clippy::too_many_arguments)]
fn add_path_route(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    policies: &annotations::IngressPolicies,
    secured: &BTreeMap<String, ()>,
    host: &str,
    path: &HTTPIngressPath,
    created: chrono::DateTime<chrono::Utc>,
) {
    let value = path.path.as_deref().unwrap_or("/");
    if !value.starts_with('/') {
        b.record_status(
            rk.clone(),
            StatusState::PartiallyAccepted,
            format!("path {value:?} must start with /"),
        );
        return;
    }
    // ImplementationSpecific behaves as a prefix here.
    let path_match = match path.path_type.as_str() {
        "Exact" => PathMatch::Exact(value.to_string()),
        _ => PathMatch::Prefix(value.to_string()),
    };

    let Some(mut route) = backend_route(b, rk, key, policies, &path.backend, path_match, created)
    else {
        return;
    };
    route.websocket = policies.websocket_paths.contains(value);

    if secured.contains_key(host) {
        b.insert_secure_route(b.https_port(), host, route.clone());
        route.redirect_to_https = policies.force_ssl_redirect;
        route.permit_insecure = !policies.force_ssl_redirect;
    }
    b.insert_route(b.http_port(), host, route);
}

/// Builds the forwarding route for one Ingress backend. A backend whose
/// named port cannot resolve is retained as a 503 so the path shape stays
/// visible, and the Ingress is partially accepted.
fn backend_route(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    policies: &annotations::IngressPolicies,
    backend: &IngressBackend,
    path: PathMatch,
    created: chrono::DateTime<chrono::Utc>,
) -> Option<Route> {
    let action = match compile_backend(b, rk, key, backend) {
        Ok(clusters) => RouteAction::Forward(clusters),
        Err(e) => {
            b.record_status(rk.clone(), StatusState::PartiallyAccepted, e);
            RouteAction::DirectResponse {
                status: 503,
                body: None,
            }
        }
    };

    Some(Route {
        path,
        headers: Vec::new(),
        query_params: Vec::new(),
        action,
        timeouts: TimeoutPolicy {
            response: policies.response_timeout,
            ..Default::default()
        },
        retry: policies.retry.clone(),
        request_headers: HeaderMutation::default(),
        response_headers: HeaderMutation::default(),
        prefix_rewrite: None,
        hash_policies: Vec::new(),
        cors: None,
        local_rate_limit: None,
        websocket: false,
        permit_insecure: true,
        redirect_to_https: false,
        mirror: None,
        owner: rk.clone(),
        created,
    })
}

fn compile_backend(
    b: &mut Builder<'_>,
    rk: &ResourceKey,
    key: &ObjectKey,
    backend: &IngressBackend,
) -> Result<Vec<WeightedCluster>, String> {
    let service = backend
        .service
        .as_ref()
        .ok_or("ingress backend must reference a service")?;
    let port = service
        .port
        .as_ref()
        .ok_or("ingress backend must name a service port")?;
    let port_ref = match (port.number, port.name.as_deref()) {
        (Some(number), _) if number > 0 && number <= u16::MAX as i32 => {
            PortRef::Number(number as u16)
        }
        (None, Some(name)) => PortRef::Name(name.to_string()),
        _ => return Err("ingress backend port is invalid".to_string()),
    };

    // A missing Service still resolves to a cluster; with no endpoints
    // behind it the proxy answers 503.
    let (cluster, warning) = b.cluster_for(
        &key.namespace,
        &service.name,
        port_ref,
        ClusterSettings::default(),
    )?;
    if let Some(warning) = warning {
        b.record_status(rk.clone(), StatusState::PartiallyAccepted, warning);
    }
    Ok(vec![WeightedCluster {
        cluster,
        weight: 1,
    }])
}
