// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Grants other namespaces permission to reference TLS secrets that live in
/// this resource's namespace.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TlsCertificateDelegation {
    pub metadata: ObjectMeta,
    pub spec: Option<TlsCertificateDelegationSpec>,
}

impl k8s_openapi::Resource for TlsCertificateDelegation {
    const API_VERSION: &'static str = "rudder.io/v1";
    const GROUP: &'static str = "rudder.io";
    const KIND: &'static str = "TLSCertificateDelegation";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "tlscertificatedelegations";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for TlsCertificateDelegation {
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
pub struct TlsCertificateDelegationSpec {
    pub delegations: Vec<CertificateDelegation>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateDelegation {
    /// Name of a secret in the delegation's namespace.
    pub secret_name: String,
    /// Namespaces allowed to reference it. `"*"` means all.
    pub target_namespaces: Vec<String>,
}

impl CertificateDelegation {
    pub fn permits(&self, namespace: &str) -> bool {
        self.target_namespaces
            .iter()
            .any(|target| target == "*" || target == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_and_exact_targets() {
        let delegation = CertificateDelegation {
            secret_name: "wildcard-cert".to_string(),
            target_namespaces: vec!["team-a".to_string()],
        };
        assert!(delegation.permits("team-a"));
        assert!(!delegation.permits("team-b"));

        let open = CertificateDelegation {
            secret_name: "wildcard-cert".to_string(),
            target_namespaces: vec!["*".to_string()],
        };
        assert!(open.permits("anywhere"));
    }
}
