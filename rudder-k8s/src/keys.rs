// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Every kind the resource store accepts. Anything else is dropped at the
/// watch boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Ingress,
    HttpProxy,
    IngressRoute,
    TlsCertificateDelegation,
    GatewayClass,
    Gateway,
    HttpRoute,
    TlsRoute,
    TcpRoute,
    Service,
    EndpointSlice,
    Secret,
    Namespace,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 13] = [
        ResourceKind::Ingress,
        ResourceKind::HttpProxy,
        ResourceKind::IngressRoute,
        ResourceKind::TlsCertificateDelegation,
        ResourceKind::GatewayClass,
        ResourceKind::Gateway,
        ResourceKind::HttpRoute,
        ResourceKind::TlsRoute,
        ResourceKind::TcpRoute,
        ResourceKind::Service,
        ResourceKind::EndpointSlice,
        ResourceKind::Secret,
        ResourceKind::Namespace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Ingress => "Ingress",
            ResourceKind::HttpProxy => "HTTPProxy",
            ResourceKind::IngressRoute => "IngressRoute",
            ResourceKind::TlsCertificateDelegation => "TLSCertificateDelegation",
            ResourceKind::GatewayClass => "GatewayClass",
            ResourceKind::Gateway => "Gateway",
            ResourceKind::HttpRoute => "HTTPRoute",
            ResourceKind::TlsRoute => "TLSRoute",
            ResourceKind::TcpRoute => "TCPRoute",
            ResourceKind::Service => "Service",
            ResourceKind::EndpointSlice => "EndpointSlice",
            ResourceKind::Secret => "Secret",
            ResourceKind::Namespace => "Namespace",
        }
    }

    pub fn parse(kind: &str) -> Option<ResourceKind> {
        ResourceKind::ALL.iter().copied().find(|k| k.as_str() == kind)
    }

    /// Endpoint-only kinds take the cheap rebuild path: they never trigger a
    /// full DAG build.
    pub fn is_endpoint_only(&self) -> bool {
        matches!(self, ResourceKind::EndpointSlice)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(namespace, name)` of a namespaced object.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the object described by `meta`. Cluster-scoped objects get the
    /// empty namespace.
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Resolves a possibly-relative `(namespace?, name)` reference against the
    /// namespace of the referring object.
    pub fn relative_to(namespace: Option<&str>, name: &str, from: &ObjectKey) -> Self {
        Self {
            namespace: namespace.unwrap_or(&from.namespace).to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `(kind, namespace, name)`: the store key, and the key of every computed
/// status.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub key: ObjectKey,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, key: ObjectKey) -> Self {
        Self { kind, key }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// Creation timestamp of `meta`, or the UNIX epoch when the API server has
/// not stamped the object (which sorts it oldest, matching its apparent age).
pub fn creation_timestamp(meta: &ObjectMeta) -> DateTime<Utc> {
    meta.creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::parse("ConfigMap"), None);
    }

    #[test]
    fn relative_reference_resolution() {
        let from = ObjectKey::new("default", "root");
        assert_eq!(
            ObjectKey::relative_to(None, "child", &from),
            ObjectKey::new("default", "child")
        );
        assert_eq!(
            ObjectKey::relative_to(Some("team-a"), "child", &from),
            ObjectKey::new("team-a", "child")
        );
    }

    #[test]
    fn display_forms() {
        let key = ResourceKey::new(ResourceKind::HttpProxy, ObjectKey::new("default", "site"));
        assert_eq!(key.to_string(), "HTTPProxy/default/site");
    }
}
