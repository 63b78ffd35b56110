// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! CDS: one EDS-backed Envoy cluster per DAG cluster.

use envoy_types::pb::envoy::config::cluster::v3 as cluster_v3;
use envoy_types::pb::envoy::config::core::v3 as core_v3;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as tls_v3;
use envoy_types::pb::envoy::extensions::upstreams::http::v3 as http_v3;
use envoy_types::pb::envoy::r#type::matcher::v3 as matcher_v3;
use envoy_types::pb::google::protobuf::{Duration as PbDuration, UInt32Value};

use crate::cache::NamedResource;
use crate::dag::{Cluster, Dag, LbStrategy, UpstreamProtocol};

use super::{any_from, xds_config_source};

const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const TLS_TRANSPORT_SOCKET_NAME: &str = "envoy.transport_sockets.tls";

pub fn clusters(dag: &Dag) -> Vec<NamedResource> {
    dag.clusters.values().map(cluster_resource).collect()
}

fn cluster_resource(cluster: &Cluster) -> NamedResource {
    let mut message = cluster_v3::Cluster {
        name: cluster.name.clone(),
        connect_timeout: Some(PbDuration {
            seconds: 0,
            nanos: 250_000_000,
        }),
        lb_policy: lb_policy(cluster.lb_strategy) as i32,
        cluster_discovery_type: Some(cluster_v3::cluster::ClusterDiscoveryType::Type(
            cluster_v3::cluster::DiscoveryType::Eds as i32,
        )),
        eds_cluster_config: Some(cluster_v3::cluster::EdsClusterConfig {
            eds_config: Some(xds_config_source()),
            service_name: cluster.eds_name(),
        }),
        ..Default::default()
    };

    if let Some(breakers) = circuit_breakers(cluster) {
        message.circuit_breakers = Some(breakers);
    }

    if let Some(health_check) = &cluster.health_check {
        message.health_checks = vec![core_v3::HealthCheck {
            timeout: Some(pb_duration(health_check.timeout)),
            interval: Some(pb_duration(health_check.interval)),
            unhealthy_threshold: Some(UInt32Value {
                value: health_check.unhealthy_threshold,
            }),
            healthy_threshold: Some(UInt32Value {
                value: health_check.healthy_threshold,
            }),
            health_checker: Some(core_v3::health_check::HealthChecker::HttpHealthCheck(
                core_v3::health_check::HttpHealthCheck {
                    host: health_check.host.clone(),
                    path: health_check.path.clone(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }];
    }

    match cluster.protocol {
        Some(UpstreamProtocol::H2c) => {
            message
                .typed_extension_protocol_options
                .insert(
                    "envoy.extensions.upstreams.http.v3.HttpProtocolOptions".to_string(),
                    any_from(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &http2_protocol_options()),
                );
        }
        Some(UpstreamProtocol::H2) => {
            message
                .typed_extension_protocol_options
                .insert(
                    "envoy.extensions.upstreams.http.v3.HttpProtocolOptions".to_string(),
                    any_from(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &http2_protocol_options()),
                );
            message.transport_socket = Some(upstream_tls(cluster, &["h2"]));
        }
        Some(UpstreamProtocol::Tls) => {
            message.transport_socket = Some(upstream_tls(cluster, &[]));
        }
        None => {}
    }

    NamedResource {
        name: cluster.name.clone(),
        body: any_from(super::CLUSTER_TYPE_URL, &message),
    }
}

fn lb_policy(strategy: LbStrategy) -> cluster_v3::cluster::LbPolicy {
    use cluster_v3::cluster::LbPolicy;
    match strategy {
        LbStrategy::RoundRobin => LbPolicy::RoundRobin,
        LbStrategy::WeightedLeastRequest => LbPolicy::LeastRequest,
        LbStrategy::Random => LbPolicy::Random,
        // Cookie and RequestHash steer via route hash policies over a
        // consistent-hash ring.
        LbStrategy::RingHash | LbStrategy::Cookie | LbStrategy::RequestHash => LbPolicy::RingHash,
        LbStrategy::Maglev => LbPolicy::Maglev,
    }
}

fn circuit_breakers(cluster: &Cluster) -> Option<cluster_v3::CircuitBreakers> {
    let limits = &cluster.circuit_breakers;
    if limits.max_connections.is_none()
        && limits.max_pending_requests.is_none()
        && limits.max_requests.is_none()
        && limits.max_retries.is_none()
    {
        return None;
    }
    let wrap = |v: Option<u32>| v.map(|value| UInt32Value { value });
    Some(cluster_v3::CircuitBreakers {
        thresholds: vec![cluster_v3::circuit_breakers::Thresholds {
            max_connections: wrap(limits.max_connections),
            max_pending_requests: wrap(limits.max_pending_requests),
            max_requests: wrap(limits.max_requests),
            max_retries: wrap(limits.max_retries),
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn http2_protocol_options() -> http_v3::HttpProtocolOptions {
    use http_v3::http_protocol_options::explicit_http_config::ProtocolConfig;
    http_v3::HttpProtocolOptions {
        upstream_protocol_options: Some(
            http_v3::http_protocol_options::UpstreamProtocolOptions::ExplicitHttpConfig(
                http_v3::http_protocol_options::ExplicitHttpConfig {
                    protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                        core_v3::Http2ProtocolOptions::default(),
                    )),
                },
            ),
        ),
        ..Default::default()
    }
}

fn upstream_tls(cluster: &Cluster, alpn: &[&str]) -> core_v3::TransportSocket {
    let validation_context = cluster.upstream_validation.as_ref().map(|validation| {
        tls_v3::common_tls_context::ValidationContextType::ValidationContext(
            tls_v3::CertificateValidationContext {
                trusted_ca: Some(core_v3::DataSource {
                    specifier: Some(core_v3::data_source::Specifier::InlineBytes(
                        validation.ca.to_vec(),
                    )),
                    ..Default::default()
                }),
                match_typed_subject_alt_names: vec![tls_v3::SubjectAltNameMatcher {
                    san_type: tls_v3::subject_alt_name_matcher::SanType::Dns as i32,
                    matcher: Some(matcher_v3::StringMatcher {
                        match_pattern: Some(matcher_v3::string_matcher::MatchPattern::Exact(
                            validation.subject_name.clone(),
                        )),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    });

    let context = tls_v3::UpstreamTlsContext {
        common_tls_context: Some(tls_v3::CommonTlsContext {
            alpn_protocols: alpn.iter().map(|p| p.to_string()).collect(),
            validation_context_type: validation_context,
            ..Default::default()
        }),
        sni: cluster.sni.clone().unwrap_or_default(),
        ..Default::default()
    };

    core_v3::TransportSocket {
        name: TLS_TRANSPORT_SOCKET_NAME.to_string(),
        config_type: Some(core_v3::transport_socket::ConfigType::TypedConfig(
            any_from(UPSTREAM_TLS_CONTEXT_TYPE_URL, &context),
        )),
    }
}

fn pb_duration(duration: std::time::Duration) -> PbDuration {
    PbDuration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}
