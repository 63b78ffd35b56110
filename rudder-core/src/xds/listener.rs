// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! LDS: one Envoy listener per DAG listener. HTTPS listeners get one filter
//! chain per FQDN matched by SNI, with no catch-all chain — a client whose
//! SNI matches nothing is Envoy's 421 behaviour, not ours to route.

use envoy_types::pb::envoy::config::core::v3 as core_v3;
use envoy_types::pb::envoy::config::listener::v3 as listener_v3;
use envoy_types::pb::envoy::extensions::filters::http::local_ratelimit::v3 as ratelimit_v3;
use envoy_types::pb::envoy::extensions::filters::http::router::v3 as router_v3;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3 as tls_inspector_v3;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3 as hcm_v3;
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3 as tcp_proxy_v3;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as tls_v3;
use envoy_types::pb::google::protobuf::BoolValue;
use rudder_config::{HttpVersion, Parameters, TlsVersion};

use crate::cache::NamedResource;
use crate::dag::{
    Dag, Listener, ListenerProtocol, SecureVirtualHost, TcpProxy, WeightedCluster,
};

use super::{any_from, route, secret::sds_name, xds_config_source};

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const LOCAL_RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

pub fn listeners(parameters: &Parameters, dag: &Dag) -> Vec<NamedResource> {
    dag.listeners
        .iter()
        .map(|listener| listener_resource(parameters, listener))
        .collect()
}

fn listener_resource(parameters: &Parameters, listener: &Listener) -> NamedResource {
    let mut message = listener_v3::Listener {
        name: listener.name.clone(),
        address: Some(socket_address(&parameters.listen.address, listener.port)),
        ..Default::default()
    };

    match listener.protocol {
        ListenerProtocol::Http => {
            message.filter_chains = vec![listener_v3::FilterChain {
                filters: vec![hcm_filter(
                    &listener.name,
                    &route::http_route_config_name(listener),
                )],
                ..Default::default()
            }];
        }
        ListenerProtocol::Https | ListenerProtocol::TlsPassthrough => {
            message.listener_filters = vec![tls_inspector()];
            let mut chains = Vec::new();
            for secure in &listener.secure_hosts {
                chains.push(secure_chain(parameters, listener, secure));
            }
            for proxy in &listener.tcp_proxies {
                chains.push(passthrough_chain(proxy));
            }
            message.filter_chains = chains;
        }
        ListenerProtocol::Tcp => {
            message.filter_chains = listener
                .tcp_proxies
                .iter()
                .map(|proxy| listener_v3::FilterChain {
                    filters: vec![tcp_proxy_filter(&listener.name, proxy)],
                    ..Default::default()
                })
                .collect();
        }
    }

    NamedResource {
        name: listener.name.clone(),
        body: any_from(super::LISTENER_TYPE_URL, &message),
    }
}

fn secure_chain(
    parameters: &Parameters,
    listener: &Listener,
    secure: &SecureVirtualHost,
) -> listener_v3::FilterChain {
    let filter = match &secure.tcp_proxy {
        Some(proxy) => tcp_proxy_filter(&listener.name, proxy),
        None => hcm_filter(
            &listener.name,
            &route::secure_route_config_name(listener, &secure.host.fqdn),
        ),
    };

    listener_v3::FilterChain {
        filter_chain_match: Some(listener_v3::FilterChainMatch {
            server_names: vec![secure.host.fqdn.clone()],
            ..Default::default()
        }),
        transport_socket: Some(downstream_tls(parameters, secure)),
        filters: vec![filter],
        ..Default::default()
    }
}

fn passthrough_chain(proxy: &TcpProxy) -> listener_v3::FilterChain {
    listener_v3::FilterChain {
        filter_chain_match: Some(listener_v3::FilterChainMatch {
            server_names: proxy.sni.iter().cloned().collect(),
            transport_protocol: "tls".to_string(),
            ..Default::default()
        }),
        filters: vec![tcp_proxy_filter("passthrough", proxy)],
        ..Default::default()
    }
}

fn downstream_tls(
    parameters: &Parameters,
    secure: &SecureVirtualHost,
) -> core_v3::TransportSocket {
    let validation_context = secure.client_validation.as_ref().map(|validation| {
        tls_v3::common_tls_context::ValidationContextType::ValidationContext(
            tls_v3::CertificateValidationContext {
                trusted_ca: Some(core_v3::DataSource {
                    specifier: Some(core_v3::data_source::Specifier::InlineBytes(
                        validation.ca.to_vec(),
                    )),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    });

    let alpn = match parameters
        .default_http_versions
        .contains(&HttpVersion::Http2)
    {
        true => secure.alpn.clone(),
        false => vec!["http/1.1".to_string()],
    };

    let context = tls_v3::DownstreamTlsContext {
        common_tls_context: Some(tls_v3::CommonTlsContext {
            tls_params: Some(tls_v3::TlsParameters {
                tls_minimum_protocol_version: tls_protocol(secure.min_tls_version) as i32,
                tls_maximum_protocol_version: tls_protocol(secure.max_tls_version) as i32,
                cipher_suites: parameters.tls.cipher_suites.clone(),
                ..Default::default()
            }),
            tls_certificate_sds_secret_configs: vec![tls_v3::SdsSecretConfig {
                name: sds_name(&secure.secret),
                sds_config: Some(xds_config_source()),
            }],
            alpn_protocols: alpn,
            validation_context_type: validation_context,
            ..Default::default()
        }),
        require_client_certificate: secure
            .client_validation
            .as_ref()
            .map(|_| BoolValue { value: true }),
        ..Default::default()
    };

    core_v3::TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(core_v3::transport_socket::ConfigType::TypedConfig(
            any_from(DOWNSTREAM_TLS_CONTEXT_TYPE_URL, &context),
        )),
    }
}

fn tls_protocol(version: TlsVersion) -> tls_v3::tls_parameters::TlsProtocol {
    match version {
        TlsVersion::V1_2 => tls_v3::tls_parameters::TlsProtocol::TlSv12,
        TlsVersion::V1_3 => tls_v3::tls_parameters::TlsProtocol::TlSv13,
    }
}

fn hcm_filter(stat_prefix: &str, route_config_name: &str) -> listener_v3::Filter {
    let manager = hcm_v3::HttpConnectionManager {
        stat_prefix: stat_prefix.to_string(),
        codec_type: hcm_v3::http_connection_manager::CodecType::Auto as i32,
        route_specifier: Some(hcm_v3::http_connection_manager::RouteSpecifier::Rds(
            hcm_v3::Rds {
                config_source: Some(xds_config_source()),
                route_config_name: route_config_name.to_string(),
            },
        )),
        http_filters: vec![
            // Present so per-route rate limit overrides have a filter to
            // attach to; without a token bucket it passes everything.
            hcm_v3::HttpFilter {
                name: "envoy.filters.http.local_ratelimit".to_string(),
                config_type: Some(hcm_v3::http_filter::ConfigType::TypedConfig(any_from(
                    LOCAL_RATE_LIMIT_TYPE_URL,
                    &ratelimit_v3::LocalRateLimit {
                        stat_prefix: "http_local_rate_limiter".to_string(),
                        ..Default::default()
                    },
                ))),
                ..Default::default()
            },
            hcm_v3::HttpFilter {
                name: "envoy.filters.http.router".to_string(),
                config_type: Some(hcm_v3::http_filter::ConfigType::TypedConfig(any_from(
                    ROUTER_TYPE_URL,
                    &router_v3::Router::default(),
                ))),
                ..Default::default()
            },
        ],
        use_remote_address: Some(BoolValue { value: true }),
        normalize_path: Some(BoolValue { value: true }),
        merge_slashes: true,
        ..Default::default()
    };

    listener_v3::Filter {
        name: "envoy.filters.network.http_connection_manager".to_string(),
        config_type: Some(listener_v3::filter::ConfigType::TypedConfig(any_from(
            HCM_TYPE_URL,
            &manager,
        ))),
    }
}

fn tcp_proxy_filter(stat_prefix: &str, proxy: &TcpProxy) -> listener_v3::Filter {
    let cluster_specifier = match proxy.clusters.as_slice() {
        [single] => tcp_proxy_v3::tcp_proxy::ClusterSpecifier::Cluster(single.cluster.clone()),
        clusters => tcp_proxy_v3::tcp_proxy::ClusterSpecifier::WeightedClusters(
            tcp_proxy_v3::tcp_proxy::WeightedCluster {
                clusters: clusters
                    .iter()
                    .map(|wc: &WeightedCluster| {
                        tcp_proxy_v3::tcp_proxy::weighted_cluster::ClusterWeight {
                            name: wc.cluster.clone(),
                            weight: wc.weight,
                            ..Default::default()
                        }
                    })
                    .collect(),
            },
        ),
    };

    let message = tcp_proxy_v3::TcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(cluster_specifier),
        ..Default::default()
    };

    listener_v3::Filter {
        name: "envoy.filters.network.tcp_proxy".to_string(),
        config_type: Some(listener_v3::filter::ConfigType::TypedConfig(any_from(
            TCP_PROXY_TYPE_URL,
            &message,
        ))),
    }
}

fn tls_inspector() -> listener_v3::ListenerFilter {
    listener_v3::ListenerFilter {
        name: "envoy.filters.listener.tls_inspector".to_string(),
        config_type: Some(listener_v3::listener_filter::ConfigType::TypedConfig(
            any_from(
                TLS_INSPECTOR_TYPE_URL,
                &tls_inspector_v3::TlsInspector::default(),
            ),
        )),
        ..Default::default()
    }
}

fn socket_address(address: &str, port: u16) -> core_v3::Address {
    core_v3::Address {
        address: Some(core_v3::address::Address::SocketAddress(
            core_v3::SocketAddress {
                address: address.to_string(),
                port_specifier: Some(core_v3::socket_address::PortSpecifier::PortValue(
                    port as u32,
                )),
                ..Default::default()
            },
        )),
    }
}
