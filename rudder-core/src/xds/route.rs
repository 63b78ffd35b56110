// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! RDS: one RouteConfiguration per HTTP listener plus one per secure virtual
//! host (each HTTPS filter chain points at its own table).

use envoy_types::pb::envoy::config::core::v3 as core_v3;
use envoy_types::pb::envoy::config::route::v3 as route_v3;
use envoy_types::pb::envoy::extensions::filters::http::local_ratelimit::v3 as ratelimit_v3;
use envoy_types::pb::envoy::r#type::matcher::v3 as matcher_v3;
use envoy_types::pb::envoy::r#type::v3 as type_v3;
use envoy_types::pb::google::protobuf::{BoolValue, Duration as PbDuration, UInt32Value};

use crate::cache::NamedResource;
use crate::dag::{
    CorsPolicy, Dag, HashPolicy, HeaderMatch, HeaderMatchKind, HeaderMutation, Listener,
    ListenerProtocol, LocalRateLimit, PathMatch, QueryParamMatch, QueryParamMatchKind, Route,
    RouteAction, VirtualHost,
};
use crate::validation::Timeout;

use super::any_from;

const LOCAL_RATE_LIMIT_FILTER: &str = "envoy.filters.http.local_ratelimit";
const LOCAL_RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";

/// Name of the RouteConfiguration an HTTP listener consumes.
pub(crate) fn http_route_config_name(listener: &Listener) -> String {
    listener.name.clone()
}

/// Name of the RouteConfiguration one secure host consumes.
pub(crate) fn secure_route_config_name(listener: &Listener, fqdn: &str) -> String {
    if listener.name == "ingress_https" {
        format!("https/{fqdn}")
    } else {
        format!("{}/{fqdn}", listener.name)
    }
}

pub fn route_configurations(dag: &Dag) -> Vec<NamedResource> {
    let mut resources = Vec::new();

    for listener in &dag.listeners {
        match listener.protocol {
            ListenerProtocol::Http => {
                let message = route_v3::RouteConfiguration {
                    name: http_route_config_name(listener),
                    virtual_hosts: listener
                        .virtual_hosts
                        .iter()
                        .map(|vhost| virtual_host(vhost, false))
                        .collect(),
                    ..Default::default()
                };
                resources.push(NamedResource {
                    name: message.name.clone(),
                    body: any_from(super::ROUTE_TYPE_URL, &message),
                });
            }
            ListenerProtocol::Https => {
                for secure in &listener.secure_hosts {
                    if secure.host.routes.is_empty() {
                        continue;
                    }
                    let message = route_v3::RouteConfiguration {
                        name: secure_route_config_name(listener, &secure.host.fqdn),
                        virtual_hosts: vec![virtual_host(&secure.host, true)],
                        ..Default::default()
                    };
                    resources.push(NamedResource {
                        name: message.name.clone(),
                        body: any_from(super::ROUTE_TYPE_URL, &message),
                    });
                }
            }
            ListenerProtocol::TlsPassthrough | ListenerProtocol::Tcp => {}
        }
    }

    resources.sort_by(|a, b| a.name.cmp(&b.name));
    resources
}

/// `domains` carries both the bare FQDN and its any-port form; the catch-all
/// host stays a single `*`.
fn domains(fqdn: &str) -> Vec<String> {
    if fqdn == "*" {
        vec!["*".to_string()]
    } else {
        vec![fqdn.to_string(), format!("{fqdn}:*")]
    }
}

fn virtual_host(vhost: &VirtualHost, secure: bool) -> route_v3::VirtualHost {
    route_v3::VirtualHost {
        name: vhost.fqdn.clone(),
        domains: domains(&vhost.fqdn),
        routes: vhost
            .routes
            .iter()
            .map(|route| envoy_route(route, secure))
            .collect(),
        ..Default::default()
    }
}

fn envoy_route(route: &Route, secure: bool) -> route_v3::Route {
    let action = if !secure && route.redirect_to_https {
        route_v3::route::Action::Redirect(route_v3::RedirectAction {
            scheme_rewrite_specifier: Some(
                route_v3::redirect_action::SchemeRewriteSpecifier::HttpsRedirect(true),
            ),
            response_code: route_v3::redirect_action::RedirectResponseCode::MovedPermanently
                as i32,
            ..Default::default()
        })
    } else {
        match &route.action {
            RouteAction::Forward(clusters) => {
                route_v3::route::Action::Route(forward_action(route, clusters))
            }
            RouteAction::Redirect(redirect) => {
                route_v3::route::Action::Redirect(redirect_action(redirect))
            }
            RouteAction::DirectResponse { status, body } => {
                route_v3::route::Action::DirectResponse(route_v3::DirectResponseAction {
                    status: *status,
                    body: body.as_ref().map(|body| core_v3::DataSource {
                        specifier: Some(core_v3::data_source::Specifier::InlineString(
                            body.clone(),
                        )),
                        ..Default::default()
                    }),
                })
            }
        }
    };

    let mut message = route_v3::Route {
        r#match: Some(route_match(route)),
        action: Some(action),
        request_headers_to_add: headers_to_add(&route.request_headers),
        request_headers_to_remove: route.request_headers.remove.clone(),
        response_headers_to_add: headers_to_add(&route.response_headers),
        response_headers_to_remove: route.response_headers.remove.clone(),
        ..Default::default()
    };

    if let Some(limit) = &route.local_rate_limit {
        message
            .typed_per_filter_config
            .insert(
                LOCAL_RATE_LIMIT_FILTER.to_string(),
                any_from(LOCAL_RATE_LIMIT_TYPE_URL, &local_rate_limit(limit)),
            );
    }

    message
}

fn route_match(route: &Route) -> route_v3::RouteMatch {
    use route_v3::route_match::PathSpecifier;

    // "/a" is a path-segment prefix ("/a", "/a/b", never "/ab"); "/a/" is a
    // plain string prefix and already segment safe.
    let path_specifier = match &route.path {
        PathMatch::Prefix(prefix) if prefix == "/" => Some(PathSpecifier::Prefix(prefix.clone())),
        PathMatch::Prefix(prefix) if prefix.ends_with('/') => {
            Some(PathSpecifier::Prefix(prefix.clone()))
        }
        PathMatch::Prefix(prefix) => Some(PathSpecifier::PathSeparatedPrefix(prefix.clone())),
        PathMatch::Exact(path) => Some(PathSpecifier::Path(path.clone())),
        PathMatch::Regex(regex) => Some(PathSpecifier::SafeRegex(matcher_v3::RegexMatcher {
            regex: regex.clone(),
            ..Default::default()
        })),
    };

    route_v3::RouteMatch {
        path_specifier,
        headers: route.headers.iter().map(header_matcher).collect(),
        query_parameters: route.query_params.iter().map(query_matcher).collect(),
        ..Default::default()
    }
}

fn header_matcher(header: &HeaderMatch) -> route_v3::HeaderMatcher {
    use route_v3::header_matcher::HeaderMatchSpecifier;

    let exact = |value: &str| {
        HeaderMatchSpecifier::StringMatch(matcher_v3::StringMatcher {
            match_pattern: Some(matcher_v3::string_matcher::MatchPattern::Exact(
                value.to_string(),
            )),
            ..Default::default()
        })
    };
    let contains = |value: &str| {
        HeaderMatchSpecifier::StringMatch(matcher_v3::StringMatcher {
            match_pattern: Some(matcher_v3::string_matcher::MatchPattern::Contains(
                value.to_string(),
            )),
            ..Default::default()
        })
    };

    let (specifier, invert) = match &header.kind {
        HeaderMatchKind::Present => (HeaderMatchSpecifier::PresentMatch(true), false),
        HeaderMatchKind::NotPresent => (HeaderMatchSpecifier::PresentMatch(true), true),
        HeaderMatchKind::Exact(value) => (exact(value), false),
        HeaderMatchKind::NotExact(value) => (exact(value), true),
        HeaderMatchKind::Contains(value) => (contains(value), false),
        HeaderMatchKind::NotContains(value) => (contains(value), true),
    };

    route_v3::HeaderMatcher {
        name: header.name.clone(),
        invert_match: invert,
        header_match_specifier: Some(specifier),
        ..Default::default()
    }
}

fn query_matcher(query: &QueryParamMatch) -> route_v3::QueryParameterMatcher {
    use route_v3::query_parameter_matcher::QueryParameterMatchSpecifier;

    let specifier = match &query.kind {
        QueryParamMatchKind::Present => QueryParameterMatchSpecifier::PresentMatch(true),
        QueryParamMatchKind::Exact { value, ignore_case } => {
            QueryParameterMatchSpecifier::StringMatch(matcher_v3::StringMatcher {
                match_pattern: Some(matcher_v3::string_matcher::MatchPattern::Exact(
                    value.clone(),
                )),
                ignore_case: *ignore_case,
            })
        }
        QueryParamMatchKind::Prefix(value) => {
            QueryParameterMatchSpecifier::StringMatch(matcher_v3::StringMatcher {
                match_pattern: Some(matcher_v3::string_matcher::MatchPattern::Prefix(
                    value.clone(),
                )),
                ..Default::default()
            })
        }
        QueryParamMatchKind::Contains(value) => {
            QueryParameterMatchSpecifier::StringMatch(matcher_v3::StringMatcher {
                match_pattern: Some(matcher_v3::string_matcher::MatchPattern::Contains(
                    value.clone(),
                )),
                ..Default::default()
            })
        }
    };

    route_v3::QueryParameterMatcher {
        name: query.name.clone(),
        query_parameter_match_specifier: Some(specifier),
    }
}

fn forward_action(
    route: &Route,
    clusters: &[crate::dag::WeightedCluster],
) -> route_v3::RouteAction {
    use route_v3::route_action::ClusterSpecifier;

    let cluster_specifier = if clusters.len() == 1 {
        Some(ClusterSpecifier::Cluster(clusters[0].cluster.clone()))
    } else {
        Some(ClusterSpecifier::WeightedClusters(
            route_v3::WeightedCluster {
                clusters: clusters
                    .iter()
                    .map(|wc| route_v3::weighted_cluster::ClusterWeight {
                        name: wc.cluster.clone(),
                        weight: Some(UInt32Value { value: wc.weight }),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
        ))
    };

    let mut action = route_v3::RouteAction {
        cluster_specifier,
        timeout: timeout_field(route.timeouts.response),
        idle_timeout: timeout_field(route.timeouts.idle),
        prefix_rewrite: route.prefix_rewrite.clone().unwrap_or_default(),
        hash_policy: route.hash_policies.iter().map(hash_policy).collect(),
        ..Default::default()
    };

    if let Some(retry) = &route.retry {
        action.retry_policy = Some(route_v3::RetryPolicy {
            retry_on: retry.retry_on.join(","),
            num_retries: Some(UInt32Value { value: retry.count }),
            per_try_timeout: timeout_field(retry.per_try_timeout),
            retriable_status_codes: retry.retriable_status_codes.clone(),
            ..Default::default()
        });
    }

    if route.websocket {
        action.upgrade_configs = vec![route_v3::route_action::UpgradeConfig {
            upgrade_type: "websocket".to_string(),
            enabled: Some(BoolValue { value: true }),
            ..Default::default()
        }];
    }

    if let Some(mirror) = &route.mirror {
        action.request_mirror_policies = vec![route_v3::route_action::RequestMirrorPolicy {
            cluster: mirror.clone(),
            ..Default::default()
        }];
    }

    if let Some(cors) = &route.cors {
        action.cors = Some(cors_policy(cors));
    }

    action
}

fn redirect_action(redirect: &crate::dag::Redirect) -> route_v3::RedirectAction {
    use route_v3::redirect_action::{
        PathRewriteSpecifier, RedirectResponseCode, SchemeRewriteSpecifier,
    };

    let response_code = match redirect.status_code {
        302 => RedirectResponseCode::Found,
        _ => RedirectResponseCode::MovedPermanently,
    };

    route_v3::RedirectAction {
        host_redirect: redirect.hostname.clone().unwrap_or_default(),
        port_redirect: redirect.port.map(|p| p as u32).unwrap_or_default(),
        response_code: response_code as i32,
        scheme_rewrite_specifier: redirect
            .scheme
            .clone()
            .map(SchemeRewriteSpecifier::SchemeRedirect),
        path_rewrite_specifier: redirect
            .path
            .clone()
            .map(PathRewriteSpecifier::PathRedirect),
        ..Default::default()
    }
}

fn hash_policy(policy: &HashPolicy) -> route_v3::route_action::HashPolicy {
    use route_v3::route_action::hash_policy::{
        ConnectionProperties, Cookie, Header, PolicySpecifier, QueryParameter,
    };

    let (specifier, terminal) = match policy {
        HashPolicy::Header { name, terminal } => (
            PolicySpecifier::Header(Header {
                header_name: name.clone(),
                ..Default::default()
            }),
            *terminal,
        ),
        HashPolicy::QueryParameter { name, terminal } => (
            PolicySpecifier::QueryParameter(QueryParameter { name: name.clone() }),
            *terminal,
        ),
        HashPolicy::SourceIp { terminal } => (
            PolicySpecifier::ConnectionProperties(ConnectionProperties { source_ip: true }),
            *terminal,
        ),
        HashPolicy::Cookie {
            name,
            ttl,
            path,
            terminal,
        } => (
            PolicySpecifier::Cookie(Cookie {
                name: name.clone(),
                ttl: ttl.map(|ttl| PbDuration {
                    seconds: ttl.as_secs() as i64,
                    nanos: ttl.subsec_nanos() as i32,
                }),
                path: path.clone().unwrap_or_default(),
                ..Default::default()
            }),
            *terminal,
        ),
    };

    route_v3::route_action::HashPolicy {
        policy_specifier: Some(specifier),
        terminal,
    }
}

fn cors_policy(cors: &CorsPolicy) -> route_v3::CorsPolicy {
    route_v3::CorsPolicy {
        allow_origin_string_match: cors
            .allow_origin
            .iter()
            .map(|origin| matcher_v3::StringMatcher {
                match_pattern: Some(if origin == "*" {
                    matcher_v3::string_matcher::MatchPattern::SafeRegex(
                        matcher_v3::RegexMatcher {
                            regex: ".*".to_string(),
                            ..Default::default()
                        },
                    )
                } else {
                    matcher_v3::string_matcher::MatchPattern::Exact(origin.clone())
                }),
                ..Default::default()
            })
            .collect(),
        allow_methods: cors.allow_methods.join(","),
        allow_headers: cors.allow_headers.join(","),
        expose_headers: cors.expose_headers.join(","),
        max_age: cors
            .max_age
            .map(|age| age.as_secs().to_string())
            .unwrap_or_default(),
        allow_credentials: Some(BoolValue {
            value: cors.allow_credentials,
        }),
        ..Default::default()
    }
}

fn local_rate_limit(limit: &LocalRateLimit) -> ratelimit_v3::LocalRateLimit {
    let fill_interval = limit.unit.as_duration();
    ratelimit_v3::LocalRateLimit {
        stat_prefix: "vhost_rate_limit".to_string(),
        token_bucket: Some(type_v3::TokenBucket {
            max_tokens: limit.requests + limit.burst,
            tokens_per_fill: Some(UInt32Value {
                value: limit.requests,
            }),
            fill_interval: Some(PbDuration {
                seconds: fill_interval.as_secs() as i64,
                nanos: 0,
            }),
        }),
        filter_enabled: Some(core_v3::RuntimeFractionalPercent {
            default_value: Some(type_v3::FractionalPercent {
                numerator: 100,
                denominator: type_v3::fractional_percent::DenominatorType::Hundred as i32,
            }),
            ..Default::default()
        }),
        filter_enforced: Some(core_v3::RuntimeFractionalPercent {
            default_value: Some(type_v3::FractionalPercent {
                numerator: 100,
                denominator: type_v3::fractional_percent::DenominatorType::Hundred as i32,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn headers_to_add(mutation: &HeaderMutation) -> Vec<core_v3::HeaderValueOption> {
    use core_v3::header_value_option::HeaderAppendAction;

    let option = |name: &str, value: &str, action: HeaderAppendAction| core_v3::HeaderValueOption {
        header: Some(core_v3::HeaderValue {
            key: name.to_string(),
            value: value.to_string(),
            ..Default::default()
        }),
        append_action: action as i32,
        ..Default::default()
    };

    mutation
        .set
        .iter()
        .map(|(name, value)| option(name, value, HeaderAppendAction::OverwriteIfExistsOrAdd))
        .chain(
            mutation
                .add
                .iter()
                .map(|(name, value)| option(name, value, HeaderAppendAction::AppendIfExistsOrAdd)),
        )
        .collect()
}

/// Unset timeouts stay absent (the proxy default applies); "infinity" maps
/// to an explicit zero, which disables the timeout.
fn timeout_field(timeout: Timeout) -> Option<PbDuration> {
    match timeout {
        Timeout::Unset => None,
        Timeout::Disabled => Some(PbDuration {
            seconds: 0,
            nanos: 0,
        }),
        Timeout::Duration(d) => Some(PbDuration {
            seconds: d.as_secs() as i64,
            nanos: d.subsec_nanos() as i32,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{TimeoutPolicy, WeightedCluster};
    use chrono::TimeZone;
    use rudder_k8s::{ObjectKey, ResourceKey, ResourceKind};

    fn forward_route(clusters: Vec<WeightedCluster>) -> Route {
        Route {
            path: PathMatch::Prefix("/".to_string()),
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
            websocket: false,
            permit_insecure: false,
            redirect_to_https: false,
            mirror: None,
            owner: ResourceKey::new(ResourceKind::Ingress, ObjectKey::new("default", "basic")),
            created: chrono::Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn domains_include_the_any_port_form() {
        assert_eq!(domains("foo.bar.com"), vec!["foo.bar.com", "foo.bar.com:*"]);
        assert_eq!(domains("*"), vec!["*"]);
    }

    #[test]
    fn segment_prefix_and_string_prefix_are_distinct() {
        use route_v3::route_match::PathSpecifier;

        let mut route = forward_route(vec![WeightedCluster {
            cluster: "default/s1/80".to_string(),
            weight: 1,
        }]);

        route.path = PathMatch::Prefix("/a".to_string());
        match route_match(&route).path_specifier.unwrap() {
            PathSpecifier::PathSeparatedPrefix(p) => assert_eq!(p, "/a"),
            other => panic!("expected path separated prefix, got {other:?}"),
        }

        route.path = PathMatch::Prefix("/a/".to_string());
        match route_match(&route).path_specifier.unwrap() {
            PathSpecifier::Prefix(p) => assert_eq!(p, "/a/"),
            other => panic!("expected prefix, got {other:?}"),
        }

        route.path = PathMatch::Exact("/x".to_string());
        match route_match(&route).path_specifier.unwrap() {
            PathSpecifier::Path(p) => assert_eq!(p, "/x"),
            other => panic!("expected exact path, got {other:?}"),
        }
    }

    #[test]
    fn single_cluster_forwards_directly() {
        let route = forward_route(vec![WeightedCluster {
            cluster: "default/s1/80".to_string(),
            weight: 1,
        }]);
        let message = envoy_route(&route, false);
        match message.action.unwrap() {
            route_v3::route::Action::Route(action) => match action.cluster_specifier.unwrap() {
                route_v3::route_action::ClusterSpecifier::Cluster(name) => {
                    assert_eq!(name, "default/s1/80")
                }
                other => panic!("expected cluster, got {other:?}"),
            },
            other => panic!("expected route action, got {other:?}"),
        }
    }

    #[test]
    fn weighted_clusters_carry_relative_shares() {
        let route = forward_route(vec![
            WeightedCluster {
                cluster: "default/a/80".to_string(),
                weight: 10,
            },
            WeightedCluster {
                cluster: "default/b/80".to_string(),
                weight: 90,
            },
        ]);
        let message = envoy_route(&route, false);
        match message.action.unwrap() {
            route_v3::route::Action::Route(action) => match action.cluster_specifier.unwrap() {
                route_v3::route_action::ClusterSpecifier::WeightedClusters(wc) => {
                    let weights: Vec<u32> = wc
                        .clusters
                        .iter()
                        .map(|c| c.weight.as_ref().unwrap().value)
                        .collect();
                    assert_eq!(weights, vec![10, 90]);
                    assert_eq!(weights.iter().sum::<u32>(), 100);
                }
                other => panic!("expected weighted clusters, got {other:?}"),
            },
            other => panic!("expected route action, got {other:?}"),
        }
    }

    #[test]
    fn insecure_twin_redirects_with_301() {
        let mut route = forward_route(vec![WeightedCluster {
            cluster: "default/s1/80".to_string(),
            weight: 1,
        }]);
        route.redirect_to_https = true;

        let message = envoy_route(&route, false);
        match message.action.unwrap() {
            route_v3::route::Action::Redirect(redirect) => {
                assert_eq!(
                    redirect.response_code,
                    route_v3::redirect_action::RedirectResponseCode::MovedPermanently as i32
                );
            }
            other => panic!("expected redirect, got {other:?}"),
        }

        // On the secure side the same route forwards.
        let message = envoy_route(&route, true);
        assert!(matches!(
            message.action.unwrap(),
            route_v3::route::Action::Route(_)
        ));
    }

    #[test]
    fn infinity_timeout_is_an_explicit_zero() {
        let mut route = forward_route(vec![WeightedCluster {
            cluster: "default/s1/80".to_string(),
            weight: 1,
        }]);
        route.timeouts.response = Timeout::Disabled;
        let message = envoy_route(&route, false);
        match message.action.unwrap() {
            route_v3::route::Action::Route(action) => {
                let timeout = action.timeout.unwrap();
                assert_eq!((timeout.seconds, timeout.nanos), (0, 0));
            }
            other => panic!("expected route action, got {other:?}"),
        }
    }

    #[test]
    fn header_matchers_are_emitted_in_sorted_order() {
        let mut route = forward_route(vec![WeightedCluster {
            cluster: "default/s1/80".to_string(),
            weight: 1,
        }]);
        route.headers = vec![
            HeaderMatch {
                name: "x-alpha".to_string(),
                kind: HeaderMatchKind::Exact("1".to_string()),
            },
            HeaderMatch {
                name: "x-beta".to_string(),
                kind: HeaderMatchKind::NotPresent,
            },
        ];
        let matchers = route_match(&route).headers;
        assert_eq!(matchers[0].name, "x-alpha");
        assert_eq!(matchers[1].name, "x-beta");
        assert!(matchers[1].invert_match);
    }
}
