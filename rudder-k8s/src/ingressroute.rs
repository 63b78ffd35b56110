// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::httpproxy::{HealthCheckPolicy, UpstreamValidation};

/// The legacy delegation-based routing CRD. Kept for migration; annotations
/// and delegation are normalised into the same internal structures the
/// HTTPProxy path produces.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct IngressRoute {
    /// Populated before writing the object back; watches may omit it.
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub metadata: ObjectMeta,
    pub spec: Option<IngressRouteSpec>,
    pub status: Option<IngressRouteStatus>,
}

impl k8s_openapi::Resource for IngressRoute {
    const API_VERSION: &'static str = "rudder.io/v1beta1";
    const GROUP: &'static str = "rudder.io";
    const KIND: &'static str = "IngressRoute";
    const VERSION: &'static str = "v1beta1";
    const URL_PATH_SEGMENT: &'static str = "ingressroutes";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for IngressRoute {
    type Ty = ObjectMeta;
    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }
    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IngressRouteSpec {
    pub virtualhost: Option<RouteVirtualHost>,
    pub routes: Option<Vec<IngressRouteRule>>,
    pub tcpproxy: Option<IngressRouteTcpProxy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteVirtualHost {
    pub fqdn: String,
    pub tls: Option<RouteTls>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteTls {
    pub secret_name: Option<String>,
    pub minimum_protocol_version: Option<String>,
    pub passthrough: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IngressRouteRule {
    /// Path prefix. IngressRoute predates the condition system; prefix is the
    /// only match form.
    #[serde(rename = "match")]
    pub match_prefix: String,
    pub services: Option<Vec<RouteService>>,
    pub delegate: Option<Delegate>,
    pub permit_insecure: bool,
    pub enable_websockets: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteService {
    pub name: String,
    pub port: i32,
    pub weight: Option<u32>,
    /// Load balancing strategy for this service.
    pub strategy: Option<String>,
    pub health_check: Option<HealthCheckPolicy>,
    pub validation: Option<UpstreamValidation>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Delegate {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IngressRouteTcpProxy {
    pub services: Option<Vec<RouteService>>,
    pub delegate: Option<Delegate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IngressRouteStatus {
    pub current_status: Option<String>,
    pub description: Option<String>,
}
