// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! SDS: serving certificates referenced by secure virtual hosts. CA bundles
//! are inlined where they are used and never served here.

use envoy_types::pb::envoy::config::core::v3 as core_v3;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as tls_v3;

use crate::cache::NamedResource;
use crate::dag::Dag;

use super::any_from;

/// SDS resource name for a secret: `namespace/name`.
pub fn sds_name(key: &rudder_k8s::ObjectKey) -> String {
    key.to_string()
}

pub fn secrets(dag: &Dag) -> Vec<NamedResource> {
    dag.secrets
        .values()
        .map(|secret| {
            let message = tls_v3::Secret {
                name: sds_name(&secret.key),
                r#type: Some(tls_v3::secret::Type::TlsCertificate(tls_v3::TlsCertificate {
                    certificate_chain: Some(inline(&secret.cert_chain)),
                    private_key: Some(inline(&secret.private_key)),
                    ..Default::default()
                })),
            };
            NamedResource {
                name: sds_name(&secret.key),
                body: any_from(super::SECRET_TYPE_URL, &message),
            }
        })
        .collect()
}

fn inline(data: &bytes::Bytes) -> core_v3::DataSource {
    core_v3::DataSource {
        specifier: Some(core_v3::data_source::Specifier::InlineBytes(data.to_vec())),
        ..Default::default()
    }
}
