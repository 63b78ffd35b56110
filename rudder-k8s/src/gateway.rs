// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The subset of the Gateway API consumed by the DAG builder: GatewayClass,
//! Gateway and the three route kinds. Fields the builder does not consult are
//! omitted; unknown fields are ignored at deserialisation.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GatewayClass {
    pub metadata: ObjectMeta,
    pub spec: Option<GatewayClassSpec>,
}

impl k8s_openapi::Resource for GatewayClass {
    const API_VERSION: &'static str = "gateway.networking.k8s.io/v1beta1";
    const GROUP: &'static str = GATEWAY_API_GROUP;
    const KIND: &'static str = "GatewayClass";
    const VERSION: &'static str = "v1beta1";
    const URL_PATH_SEGMENT: &'static str = "gatewayclasses";
    type Scope = k8s_openapi::ClusterResourceScope;
}

impl k8s_openapi::Metadata for GatewayClass {
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
pub struct GatewayClassSpec {
    pub controller_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Gateway {
    pub metadata: ObjectMeta,
    pub spec: Option<GatewaySpec>,
}

impl k8s_openapi::Resource for Gateway {
    const API_VERSION: &'static str = "gateway.networking.k8s.io/v1beta1";
    const GROUP: &'static str = GATEWAY_API_GROUP;
    const KIND: &'static str = "Gateway";
    const VERSION: &'static str = "v1beta1";
    const URL_PATH_SEGMENT: &'static str = "gateways";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for Gateway {
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
pub struct GatewaySpec {
    pub gateway_class_name: String,
    pub listeners: Vec<GatewayListener>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayListener {
    pub name: String,
    pub port: u16,
    /// "HTTP", "HTTPS", "TLS" or "TCP".
    pub protocol: String,
    pub hostname: Option<String>,
    pub tls: Option<GatewayTlsConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayTlsConfig {
    /// "Terminate" (default) or "Passthrough".
    pub mode: Option<String>,
    pub certificate_refs: Vec<SecretObjectReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretObjectReference {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ParentReference {
    pub name: String,
    pub namespace: Option<String>,
    pub section_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HttpRoute {
    pub metadata: ObjectMeta,
    pub spec: Option<HttpRouteSpec>,
}

impl k8s_openapi::Resource for HttpRoute {
    const API_VERSION: &'static str = "gateway.networking.k8s.io/v1beta1";
    const GROUP: &'static str = GATEWAY_API_GROUP;
    const KIND: &'static str = "HTTPRoute";
    const VERSION: &'static str = "v1beta1";
    const URL_PATH_SEGMENT: &'static str = "httproutes";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for HttpRoute {
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
pub struct HttpRouteSpec {
    pub parent_refs: Vec<ParentReference>,
    pub hostnames: Vec<String>,
    pub rules: Vec<HttpRouteRule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRouteRule {
    pub matches: Vec<HttpRouteMatch>,
    pub filters: Vec<HttpRouteFilter>,
    pub backend_refs: Vec<HttpBackendRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRouteMatch {
    pub path: Option<HttpPathMatch>,
    pub headers: Vec<HttpHeaderMatch>,
    pub query_params: Vec<HttpQueryParamMatch>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpPathMatch {
    /// "PathPrefix", "Exact" or "RegularExpression".
    #[serde(rename = "type")]
    pub match_type: Option<String>,
    pub value: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpHeaderMatch {
    #[serde(rename = "type")]
    pub match_type: Option<String>,
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpQueryParamMatch {
    #[serde(rename = "type")]
    pub match_type: Option<String>,
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRouteFilter {
    #[serde(rename = "type")]
    pub filter_type: String,
    pub request_header_modifier: Option<HttpHeaderModifier>,
    pub response_header_modifier: Option<HttpHeaderModifier>,
    pub url_rewrite: Option<HttpUrlRewrite>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpUrlRewrite {
    pub hostname: Option<String>,
    pub path: Option<HttpPathModifier>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpPathModifier {
    /// "ReplacePrefixMatch" or "ReplaceFullPath".
    #[serde(rename = "type")]
    pub modifier_type: Option<String>,
    pub replace_prefix_match: Option<String>,
    pub replace_full_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpHeaderModifier {
    pub set: Vec<HttpHeader>,
    pub add: Vec<HttpHeader>,
    pub remove: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpBackendRef {
    pub name: String,
    pub namespace: Option<String>,
    pub port: Option<i32>,
    pub weight: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TlsRoute {
    pub metadata: ObjectMeta,
    pub spec: Option<TlsRouteSpec>,
}

impl k8s_openapi::Resource for TlsRoute {
    const API_VERSION: &'static str = "gateway.networking.k8s.io/v1alpha2";
    const GROUP: &'static str = GATEWAY_API_GROUP;
    const KIND: &'static str = "TLSRoute";
    const VERSION: &'static str = "v1alpha2";
    const URL_PATH_SEGMENT: &'static str = "tlsroutes";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for TlsRoute {
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
pub struct TlsRouteSpec {
    pub parent_refs: Vec<ParentReference>,
    pub hostnames: Vec<String>,
    pub rules: Vec<BackendRule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TcpRoute {
    pub metadata: ObjectMeta,
    pub spec: Option<TcpRouteSpec>,
}

impl k8s_openapi::Resource for TcpRoute {
    const API_VERSION: &'static str = "gateway.networking.k8s.io/v1alpha2";
    const GROUP: &'static str = GATEWAY_API_GROUP;
    const KIND: &'static str = "TCPRoute";
    const VERSION: &'static str = "v1alpha2";
    const URL_PATH_SEGMENT: &'static str = "tcproutes";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for TcpRoute {
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
pub struct TcpRouteSpec {
    pub parent_refs: Vec<ParentReference>,
    pub rules: Vec<BackendRule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendRule {
    pub backend_refs: Vec<HttpBackendRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_gateway_with_https_listener() {
        let gateway: Gateway = serde_yaml::from_str(
            r#"
            metadata:
              name: edge
              namespace: infra
            spec:
              gatewayClassName: rudder
              listeners:
                - name: https
                  port: 443
                  protocol: HTTPS
                  hostname: "*.example.com"
                  tls:
                    certificateRefs:
                      - name: edge-cert
            "#,
        )
        .unwrap();

        let spec = gateway.spec.unwrap();
        assert_eq!(spec.gateway_class_name, "rudder");
        assert_eq!(spec.listeners[0].port, 443);
        assert_eq!(
            spec.listeners[0].tls.as_ref().unwrap().certificate_refs[0].name,
            "edge-cert"
        );
    }

    #[test]
    fn deserializes_httproute_matches() {
        let route: HttpRoute = serde_yaml::from_str(
            r#"
            metadata:
              name: app
              namespace: default
            spec:
              parentRefs:
                - name: edge
                  namespace: infra
              hostnames: ["app.example.com"]
              rules:
                - matches:
                    - path:
                        type: PathPrefix
                        value: /api
                  backendRefs:
                    - name: api
                      port: 8080
                      weight: 1
            "#,
        )
        .unwrap();

        let spec = route.spec.unwrap();
        assert_eq!(spec.hostnames, vec!["app.example.com"]);
        let rule = &spec.rules[0];
        assert_eq!(
            rule.matches[0].path.as_ref().unwrap().value.as_deref(),
            Some("/api")
        );
        assert_eq!(rule.backend_refs[0].port, Some(8080));
    }
}
