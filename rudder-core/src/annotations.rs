// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Legacy annotation parsing. Annotations are normalised here into the same
//! structures the CRD fields produce, so the DAG builder never branches on
//! where a policy came from.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::dag::{CircuitBreakers, RetryPolicy, UpstreamProtocol};
use crate::validation::{self, Timeout};

pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const FORCE_SSL_REDIRECT_ANNOTATION: &str = "ingress.kubernetes.io/force-ssl-redirect";

const REQUEST_TIMEOUT: &str = "rudder.io/request-timeout";
const RETRY_ON: &str = "rudder.io/retry-on";
const NUM_RETRIES: &str = "rudder.io/num-retries";
const PER_TRY_TIMEOUT: &str = "rudder.io/per-try-timeout";
const WEBSOCKET_ROUTES: &str = "rudder.io/websocket-routes";
const TLS_MINIMUM_PROTOCOL_VERSION: &str = "rudder.io/tls-minimum-protocol-version";

const MAX_CONNECTIONS: &str = "rudder.io/max-connections";
const MAX_PENDING_REQUESTS: &str = "rudder.io/max-pending-requests";
const MAX_REQUESTS: &str = "rudder.io/max-requests";
const MAX_RETRIES: &str = "rudder.io/max-retries";
const UPSTREAM_PROTOCOL_PREFIX: &str = "rudder.io/upstream-protocol.";

/// The class accepted when the operator configures none.
pub const DEFAULT_CLASS: &str = "rudder";

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref()?.get(key).map(String::as_str)
}

/// Matches a resource's class (annotation first, then the spec field) against
/// the configured class. Without configuration, unclassed resources and the
/// default class are accepted.
pub fn ingress_class_matches(
    meta: &ObjectMeta,
    class_field: Option<&str>,
    configured: Option<&str>,
) -> bool {
    let class = annotation(meta, INGRESS_CLASS_ANNOTATION).or(class_field);
    match configured {
        Some(configured) => class == Some(configured),
        None => matches!(class, None | Some(DEFAULT_CLASS)),
    }
}

/// Route policies an Ingress can only express through annotations.
#[derive(Debug, Default)]
pub struct IngressPolicies {
    pub response_timeout: Timeout,
    pub retry: Option<RetryPolicy>,
    /// Paths (exact annotation values) that should be upgraded to websocket.
    pub websocket_paths: BTreeSet<String>,
    pub min_tls_version: Option<String>,
    /// Redirect plain HTTP to the secure host instead of serving both.
    pub force_ssl_redirect: bool,
    /// Human-readable parse failures; the resource is partially accepted.
    pub errors: Vec<String>,
}

pub fn ingress_policies(meta: &ObjectMeta) -> IngressPolicies {
    let mut policies = IngressPolicies::default();

    match validation::parse_timeout(annotation(meta, REQUEST_TIMEOUT)) {
        Ok(timeout) => policies.response_timeout = timeout,
        Err(e) => policies.errors.push(format!("{REQUEST_TIMEOUT}: {e}")),
    }

    let retry_on: Vec<String> = annotation(meta, RETRY_ON)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if !retry_on.is_empty() {
        let count = match annotation(meta, NUM_RETRIES).map(str::parse::<u32>) {
            None => 1,
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                policies.errors.push(format!("{NUM_RETRIES}: {e}"));
                1
            }
        };
        let per_try_timeout = match validation::parse_timeout(annotation(meta, PER_TRY_TIMEOUT)) {
            Ok(timeout) => timeout,
            Err(e) => {
                policies.errors.push(format!("{PER_TRY_TIMEOUT}: {e}"));
                Timeout::Unset
            }
        };
        policies.retry = Some(RetryPolicy {
            count,
            per_try_timeout,
            retry_on,
            retriable_status_codes: Vec::new(),
        });
    }

    policies.websocket_paths = annotation(meta, WEBSOCKET_ROUTES)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    policies.min_tls_version = annotation(meta, TLS_MINIMUM_PROTOCOL_VERSION).map(String::from);
    policies.force_ssl_redirect =
        annotation(meta, FORCE_SSL_REDIRECT_ANNOTATION) == Some("true");

    policies
}

/// Connection-pool limits carried on the backing Service.
pub fn circuit_breakers(service: &Service) -> (CircuitBreakers, Vec<String>) {
    let mut breakers = CircuitBreakers::default();
    let mut errors = Vec::new();

    let mut parse = |key: &str, slot: &mut Option<u32>| {
        if let Some(value) = annotation(&service.metadata, key) {
            match value.parse::<u32>() {
                Ok(n) => *slot = Some(n),
                Err(e) => errors.push(format!("{key}: {e}")),
            }
        }
    };
    parse(MAX_CONNECTIONS, &mut breakers.max_connections);
    parse(MAX_PENDING_REQUESTS, &mut breakers.max_pending_requests);
    parse(MAX_REQUESTS, &mut breakers.max_requests);
    parse(MAX_RETRIES, &mut breakers.max_retries);

    (breakers, errors)
}

/// Upstream protocol selected by Service annotation, e.g.
/// `rudder.io/upstream-protocol.h2: "443,https"` — a list of port numbers or
/// names the protocol applies to.
pub fn upstream_protocol(
    service: &Service,
    port: u16,
    port_name: Option<&str>,
) -> Option<UpstreamProtocol> {
    let annotations = service.metadata.annotations.as_ref()?;
    for proto in ["h2", "h2c", "tls"] {
        let key = format!("{UPSTREAM_PROTOCOL_PREFIX}{proto}");
        let Some(ports) = annotations.get(&key) else {
            continue;
        };
        let applies = ports.split(',').map(str::trim).any(|entry| {
            entry == port.to_string() || Some(entry) == port_name
        });
        if applies {
            // The protocol names are closed; the key built above always
            // parses.
            return validation::parse_upstream_protocol(Some(proto)).unwrap();
        }
    }
    None
}
