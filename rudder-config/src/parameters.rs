// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Operational configuration of a rudder instance.
///
/// None of these fields participate in the routing semantics computed from
/// cluster state; they select which resources this instance owns and how its
/// xDS endpoint is exposed. Reloading requires a restart.
///
/// NOTE: default values should make sense, so most operators should not need
/// to specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// The xDS listener and its optional server TLS material.
    #[serde(default)]
    pub xds: XdsParameters,

    /// Namespaces where root HTTPProxy / IngressRoute resources may live.
    /// `None` disables the restriction.
    #[serde(default)]
    pub root_namespaces: Option<Vec<String>>,

    /// Value matched against the `kubernetes.io/ingress.class` annotation and
    /// the `ingressClassName` field. When unset, resources without a class
    /// (or carrying the default class) are accepted.
    #[serde(default)]
    pub ingress_class: Option<String>,

    /// The Gateway API controller identifier this instance owns. Gateway
    /// translation is disabled when unset.
    #[serde(default)]
    pub gateway_controller_name: Option<String>,

    /// When false, the status writer behaves as a permanent leader and always
    /// writes.
    #[serde(default = "Parameters::default_leader_election_enabled")]
    pub leader_election_enabled: bool,

    /// Event coalescing windows for the rebuild driver.
    #[serde(default)]
    pub debounce: DebounceParameters,

    /// HTTP protocol versions advertised on HTTP listeners.
    #[serde(default = "Parameters::default_http_versions")]
    pub default_http_versions: Vec<HttpVersion>,

    /// TLS defaults applied to secure virtual hosts that do not override them.
    #[serde(default)]
    pub tls: TlsParameters,

    /// Ports the managed proxy listens on. A listener is only emitted for a
    /// port that at least one virtual host or TCP proxy references.
    #[serde(default)]
    pub listen: ListenParameters,
}

impl Parameters {
    pub fn default_leader_election_enabled() -> bool {
        true
    }

    pub fn default_http_versions() -> Vec<HttpVersion> {
        vec![HttpVersion::Http1, HttpVersion::Http2]
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            xds: XdsParameters::default(),
            root_namespaces: None,
            ingress_class: None,
            gateway_controller_name: None,
            leader_election_enabled: Parameters::default_leader_election_enabled(),
            debounce: DebounceParameters::default(),
            default_http_versions: Parameters::default_http_versions(),
            tls: TlsParameters::default(),
            listen: ListenParameters::default(),
        }
    }
}

/// Where the xDS gRPC server binds, and its optional TLS material.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct XdsParameters {
    /// host:port the discovery services listen on.
    #[serde(default = "XdsParameters::default_bind")]
    pub bind: String,

    /// Server certificate chain (PEM). TLS is disabled unless both `cert` and
    /// `key` are set.
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Server private key (PEM).
    #[serde(default)]
    pub key: Option<PathBuf>,

    /// CA bundle used to verify client (proxy) certificates. Optional even
    /// when serving TLS.
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

impl XdsParameters {
    pub fn default_bind() -> String {
        "127.0.0.1:8001".to_string()
    }
}

impl Default for XdsParameters {
    fn default() -> Self {
        Self {
            bind: XdsParameters::default_bind(),
            cert: None,
            key: None,
            ca: None,
        }
    }
}

/// Coalescing windows for the event-driven rebuild loop. Endpoint-only events
/// have a cheaper rebuild path and therefore a shorter window.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DebounceParameters {
    /// Quiet period after the first notification before a DAG rebuild.
    #[serde(default = "DebounceParameters::default_min_hold")]
    pub min_hold: Duration,

    /// Upper bound on how long continued notifications may delay a rebuild.
    #[serde(default = "DebounceParameters::default_max_hold")]
    pub max_hold: Duration,

    /// Quiet period for endpoint-only events.
    #[serde(default = "DebounceParameters::default_endpoint_min_hold")]
    pub endpoint_min_hold: Duration,

    /// Upper bound for endpoint-only events.
    #[serde(default = "DebounceParameters::default_endpoint_max_hold")]
    pub endpoint_max_hold: Duration,
}

impl DebounceParameters {
    pub fn default_min_hold() -> Duration {
        Duration::from_millis(100)
    }

    pub fn default_max_hold() -> Duration {
        Duration::from_millis(500)
    }

    pub fn default_endpoint_min_hold() -> Duration {
        Duration::from_millis(20)
    }

    pub fn default_endpoint_max_hold() -> Duration {
        Duration::from_millis(100)
    }
}

impl Default for DebounceParameters {
    fn default() -> Self {
        Self {
            min_hold: DebounceParameters::default_min_hold(),
            max_hold: DebounceParameters::default_max_hold(),
            endpoint_min_hold: DebounceParameters::default_endpoint_min_hold(),
            endpoint_max_hold: DebounceParameters::default_endpoint_max_hold(),
        }
    }
}

/// TLS defaults for secure virtual hosts.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsParameters {
    #[serde(default = "TlsParameters::default_min_protocol_version")]
    pub min_protocol_version: TlsVersion,

    #[serde(default = "TlsParameters::default_max_protocol_version")]
    pub max_protocol_version: TlsVersion,

    /// Cipher suites offered for TLS 1.2 connections, in Envoy's cipher
    /// string syntax. Empty means the proxy's own defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

impl TlsParameters {
    pub fn default_min_protocol_version() -> TlsVersion {
        TlsVersion::V1_2
    }

    pub fn default_max_protocol_version() -> TlsVersion {
        TlsVersion::V1_3
    }
}

impl Default for TlsParameters {
    fn default() -> Self {
        Self {
            min_protocol_version: TlsParameters::default_min_protocol_version(),
            max_protocol_version: TlsParameters::default_max_protocol_version(),
            cipher_suites: Vec::new(),
        }
    }
}

/// Data-plane listen ports for the implicit HTTP/HTTPS listeners. Gateway API
/// listeners carry their own ports and are not affected.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListenParameters {
    #[serde(default = "ListenParameters::default_address")]
    pub address: String,

    #[serde(default = "ListenParameters::default_http_port")]
    pub http_port: u16,

    #[serde(default = "ListenParameters::default_https_port")]
    pub https_port: u16,
}

impl ListenParameters {
    pub fn default_address() -> String {
        "0.0.0.0".to_string()
    }

    pub fn default_http_port() -> u16 {
        8080
    }

    pub fn default_https_port() -> u16 {
        8443
    }
}

impl Default for ListenParameters {
    fn default() -> Self {
        Self {
            address: ListenParameters::default_address(),
            http_port: ListenParameters::default_http_port(),
            https_port: ListenParameters::default_https_port(),
        }
    }
}

/// HTTP protocol versions advertisable on HTTP listeners.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum HttpVersion {
    #[serde(rename = "http/1.1")]
    Http1,
    #[serde(rename = "http/2")]
    Http2,
}

/// TLS protocol versions accepted on secure virtual hosts.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "1.3")]
    V1_3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let parameters = Parameters::default();
        assert_eq!(parameters.xds.bind, "127.0.0.1:8001");
        assert!(parameters.leader_election_enabled);
        assert!(parameters.debounce.min_hold <= parameters.debounce.max_hold);
        assert!(parameters.debounce.endpoint_min_hold < parameters.debounce.min_hold);
        assert_eq!(
            parameters.default_http_versions,
            vec![HttpVersion::Http1, HttpVersion::Http2]
        );
        assert_eq!(parameters.tls.min_protocol_version, TlsVersion::V1_2);
        assert_eq!(parameters.listen.http_port, 8080);
        assert_eq!(parameters.listen.https_port, 8443);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let parameters: Parameters = serde_yaml::from_str(
            r#"
            xds:
              bind: "0.0.0.0:9001"
            ingress_class: rudder
            "#,
        )
        .unwrap();
        assert_eq!(parameters.xds.bind, "0.0.0.0:9001");
        assert_eq!(parameters.ingress_class.as_deref(), Some("rudder"));
        assert_eq!(parameters.listen.https_port, 8443);
        assert!(parameters.root_namespaces.is_none());
    }
}
