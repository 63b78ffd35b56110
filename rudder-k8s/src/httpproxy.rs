// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// HTTPProxy is the root routing CRD: a resource with a `virtualhost` block is
/// a root; others only exist as inclusion targets.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HttpProxy {
    /// Populated before writing the object back; watches may omit it.
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub metadata: ObjectMeta,
    pub spec: Option<HttpProxySpec>,
    pub status: Option<HttpProxyStatus>,
}

impl k8s_openapi::Resource for HttpProxy {
    const API_VERSION: &'static str = "rudder.io/v1";
    const GROUP: &'static str = "rudder.io";
    const KIND: &'static str = "HTTPProxy";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "httpproxies";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for HttpProxy {
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
pub struct HttpProxySpec {
    /// Present on roots only.
    pub virtualhost: Option<ProxyVirtualHost>,
    pub routes: Option<Vec<ProxyRoute>>,
    pub tcpproxy: Option<ProxyTcpProxy>,
    pub includes: Option<Vec<Include>>,
    /// Matched against the configured ingress class, like the annotation.
    pub ingress_class_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyVirtualHost {
    pub fqdn: String,
    pub tls: Option<ProxyTls>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyTls {
    /// `name` or `namespace/name` of a TLS secret. Cross-namespace references
    /// require a TLSCertificateDelegation.
    pub secret_name: Option<String>,
    /// "1.2" or "1.3".
    pub minimum_protocol_version: Option<String>,
    pub maximum_protocol_version: Option<String>,
    /// TLS termination is skipped and raw TLS is forwarded to the tcpproxy.
    pub passthrough: bool,
    pub client_validation: Option<DownstreamValidation>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DownstreamValidation {
    /// Secret (in the same namespace) holding the CA bundle clients must
    /// chain to.
    pub ca_secret: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Include {
    pub name: String,
    pub namespace: Option<String>,
    pub conditions: Option<Vec<MatchCondition>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchCondition {
    pub prefix: Option<String>,
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub header: Option<HeaderMatchCondition>,
    pub query_parameter: Option<QueryParameterMatchCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderMatchCondition {
    pub name: String,
    pub present: bool,
    pub notpresent: bool,
    pub contains: Option<String>,
    pub notcontains: Option<String>,
    pub exact: Option<String>,
    pub notexact: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryParameterMatchCondition {
    pub name: String,
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub contains: Option<String>,
    pub present: bool,
    pub ignore_case: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyRoute {
    pub conditions: Option<Vec<MatchCondition>>,
    pub services: Option<Vec<ProxyService>>,
    pub request_redirect_policy: Option<RedirectPolicy>,
    pub direct_response_policy: Option<DirectResponsePolicy>,
    pub permit_insecure: bool,
    pub enable_websockets: bool,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub retry_policy: Option<RetryPolicy>,
    pub health_check_policy: Option<HealthCheckPolicy>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    pub cors_policy: Option<CorsPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyService {
    pub name: String,
    pub port: i32,
    pub weight: Option<u32>,
    /// Upstream protocol override: "h2", "h2c" or "tls".
    pub protocol: Option<String>,
    /// Traffic is copied to this service instead of being load balanced to
    /// it.
    pub mirror: bool,
    pub validation: Option<UpstreamValidation>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamValidation {
    /// Secret holding the CA bundle presented upstream certs must chain to.
    pub ca_secret: String,
    /// Expected DNS subject name of the upstream certificate.
    pub subject_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectPolicy {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<i32>,
    pub status_code: Option<u32>,
    pub path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectResponsePolicy {
    pub status_code: u32,
    pub body: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutPolicy {
    /// Duration string; "infinity" disables the timeout.
    pub response: Option<String>,
    pub idle: Option<String>,
    pub idle_connection: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub count: Option<u32>,
    pub per_try_timeout: Option<String>,
    pub retry_on: Option<Vec<String>>,
    pub retriable_status_codes: Option<Vec<u32>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckPolicy {
    pub path: String,
    pub host: Option<String>,
    pub interval_seconds: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub unhealthy_threshold_count: Option<u32>,
    pub healthy_threshold_count: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerPolicy {
    /// One of RoundRobin, WeightedLeastRequest, Random, RingHash, Maglev,
    /// Cookie, RequestHash.
    pub strategy: Option<String>,
    pub request_hash_policies: Option<Vec<RequestHashPolicy>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestHashPolicy {
    pub header_hash_options: Option<HeaderHashOptions>,
    pub query_parameter_hash_options: Option<QueryParameterHashOptions>,
    pub hash_source_ip: bool,
    pub terminal: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderHashOptions {
    pub header_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryParameterHashOptions {
    pub parameter_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HeadersPolicy {
    pub set: Option<Vec<HeaderValue>>,
    pub add: Option<Vec<HeaderValue>>,
    pub remove: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitPolicy {
    pub local: Option<LocalRateLimitPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalRateLimitPolicy {
    pub requests: u32,
    /// "second", "minute" or "hour".
    pub unit: String,
    pub burst: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CorsPolicy {
    pub allow_origin: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub expose_headers: Option<Vec<String>>,
    pub max_age: Option<String>,
    pub allow_credentials: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyTcpProxy {
    pub services: Option<Vec<ProxyService>>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub health_check_policy: Option<HealthCheckPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpProxyStatus {
    pub current_status: Option<String>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_root() {
        let proxy: HttpProxy = serde_yaml::from_str(
            r#"
            apiVersion: rudder.io/v1
            kind: HTTPProxy
            metadata:
              name: site
              namespace: default
            spec:
              virtualhost:
                fqdn: foo.example.com
                tls:
                  secretName: site-cert
              routes:
                - conditions:
                    - prefix: /
                  services:
                    - name: s1
                      port: 80
            "#,
        )
        .unwrap();

        let spec = proxy.spec.unwrap();
        let vhost = spec.virtualhost.unwrap();
        assert_eq!(vhost.fqdn, "foo.example.com");
        assert_eq!(vhost.tls.unwrap().secret_name.as_deref(), Some("site-cert"));
        let routes = spec.routes.unwrap();
        assert_eq!(routes[0].conditions.as_ref().unwrap()[0].prefix.as_deref(), Some("/"));
        assert_eq!(routes[0].services.as_ref().unwrap()[0].port, 80);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let proxy: HttpProxy = serde_yaml::from_str(
            r#"
            metadata:
              name: site
            spec:
              virtualhost:
                fqdn: foo.example.com
                futureField: true
            "#,
        )
        .unwrap();
        assert!(proxy.spec.unwrap().virtualhost.is_some());
    }
}
