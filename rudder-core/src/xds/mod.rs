// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Translation from the DAG to Envoy's v3 xDS resource model. Each submodule
//! maps one resource collection; [`translate`] runs them all in one pass over
//! a built DAG.

pub mod cluster;
pub mod endpoint;
pub mod listener;
pub mod route;
pub mod secret;

use envoy_types::pb::envoy::config::core::v3 as core_v3;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::dag::Dag;
use rudder_config::Parameters;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// The cluster Envoy's bootstrap must define for reaching this control
/// plane; RDS/EDS/SDS config sources point at it.
pub const XDS_CLUSTER_NAME: &str = "rudder";

/// The resource collections served over xDS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceType {
    Cluster,
    Endpoint,
    Listener,
    Route,
    Secret,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Cluster,
        ResourceType::Endpoint,
        ResourceType::Listener,
        ResourceType::Route,
        ResourceType::Secret,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Cluster => CLUSTER_TYPE_URL,
            ResourceType::Endpoint => ENDPOINT_TYPE_URL,
            ResourceType::Listener => LISTENER_TYPE_URL,
            ResourceType::Route => ROUTE_TYPE_URL,
            ResourceType::Secret => SECRET_TYPE_URL,
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<ResourceType> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|rt| rt.type_url() == type_url)
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "cluster",
            ResourceType::Endpoint => "endpoint",
            ResourceType::Listener => "listener",
            ResourceType::Route => "route",
            ResourceType::Secret => "secret",
        }
    }
}

/// Packs a message into `Any` under the given type URL.
pub fn any_from<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

/// The gRPC config source pointing Envoy back at this control plane, used
/// for RDS, EDS and SDS references inside emitted resources.
pub fn xds_config_source() -> core_v3::ConfigSource {
    core_v3::ConfigSource {
        resource_api_version: core_v3::ApiVersion::V3 as i32,
        config_source_specifier: Some(
            core_v3::config_source::ConfigSourceSpecifier::ApiConfigSource(
                core_v3::ApiConfigSource {
                    api_type: core_v3::api_config_source::ApiType::Grpc as i32,
                    transport_api_version: core_v3::ApiVersion::V3 as i32,
                    grpc_services: vec![core_v3::GrpcService {
                        target_specifier: Some(
                            core_v3::grpc_service::TargetSpecifier::EnvoyGrpc(
                                core_v3::grpc_service::EnvoyGrpc {
                                    cluster_name: XDS_CLUSTER_NAME.to_string(),
                                    ..Default::default()
                                },
                            ),
                        ),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ),
        ),
        ..Default::default()
    }
}

/// The four DAG-derived tables produced by one translation pass. Endpoints
/// are deliberately absent: they rebuild on their own path.
pub struct DagResources {
    pub listeners: Vec<crate::cache::NamedResource>,
    pub routes: Vec<crate::cache::NamedResource>,
    pub clusters: Vec<crate::cache::NamedResource>,
    pub secrets: Vec<crate::cache::NamedResource>,
}

/// Translates a built DAG into LDS/RDS/CDS/SDS tables.
pub fn translate(parameters: &Parameters, dag: &Dag) -> DagResources {
    DagResources {
        listeners: listener::listeners(parameters, dag),
        routes: route::route_configurations(dag),
        clusters: cluster::clusters(dag),
        secrets: secret::secrets(dag),
    }
}

/// The translator as a DAG observer: one pass per build, installed into the
/// snapshot cache as a single atomic unit.
pub struct XdsTranslator {
    parameters: Parameters,
    cache: std::sync::Arc<crate::cache::SnapshotCache>,
}

impl XdsTranslator {
    pub fn new(
        parameters: Parameters,
        cache: std::sync::Arc<crate::cache::SnapshotCache>,
    ) -> Self {
        Self { parameters, cache }
    }
}

impl crate::observer::DagObserver for XdsTranslator {
    fn on_dag_built(&self, built: &crate::dag::BuiltDag) {
        let resources = translate(&self.parameters, &built.dag);
        self.cache.install_dag_tables(resources);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_urls_round_trip() {
        for rt in ResourceType::ALL {
            assert_eq!(ResourceType::from_type_url(rt.type_url()), Some(rt));
        }
        assert_eq!(
            ResourceType::from_type_url("type.googleapis.com/envoy.api.v2.Cluster"),
            None
        );
    }
}
