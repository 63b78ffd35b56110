// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! EDS: ClusterLoadAssignments regrouped from EndpointSlices. This path runs
//! on endpoint-only store events and never touches the other tables.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3 as core_v3;
use envoy_types::pb::envoy::config::endpoint::v3 as endpoint_v3;

use crate::cache::NamedResource;
use crate::store::StoreView;

use super::any_from;

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Builds the full EDS table from the store view. Assignments are keyed the
/// way clusters reference them: `namespace/service` for unnamed ports,
/// `namespace/service/port-name` for named ones.
pub fn endpoints(view: &StoreView) -> Vec<NamedResource> {
    // key -> sorted set of (address, port)
    let mut assignments: BTreeMap<String, Vec<(String, u16)>> = BTreeMap::new();

    for slice in view.endpoint_slices() {
        let namespace = slice.metadata.namespace.clone().unwrap_or_default();
        let Some(service) = slice
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(SERVICE_NAME_LABEL))
        else {
            continue;
        };

        let ready_addresses: Vec<&String> = slice
            .endpoints
            .iter()
            .filter(|e| {
                e.conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(true)
            })
            .flat_map(|e| e.addresses.iter())
            .collect();

        for port in slice.ports.as_deref().unwrap_or_default() {
            let Some(port_number) = port.port.filter(|p| *p > 0 && *p <= u16::MAX as i32) else {
                continue;
            };
            let key = match port.name.as_deref().filter(|n| !n.is_empty()) {
                Some(name) => format!("{namespace}/{service}/{name}"),
                None => format!("{namespace}/{service}"),
            };
            let entry = assignments.entry(key).or_default();
            for address in &ready_addresses {
                entry.push(((*address).clone(), port_number as u16));
            }
        }
    }

    assignments
        .into_iter()
        .map(|(name, mut addresses)| {
            addresses.sort();
            addresses.dedup();
            assignment(name, addresses)
        })
        .collect()
}

fn assignment(name: String, addresses: Vec<(String, u16)>) -> NamedResource {
    let lb_endpoints = addresses
        .into_iter()
        .map(|(address, port)| endpoint_v3::LbEndpoint {
            health_status: core_v3::HealthStatus::Healthy as i32,
            host_identifier: Some(endpoint_v3::lb_endpoint::HostIdentifier::Endpoint(
                endpoint_v3::Endpoint {
                    address: Some(core_v3::Address {
                        address: Some(core_v3::address::Address::SocketAddress(
                            core_v3::SocketAddress {
                                address,
                                port_specifier: Some(
                                    core_v3::socket_address::PortSpecifier::PortValue(port as u32),
                                ),
                                ..Default::default()
                            },
                        )),
                    }),
                    ..Default::default()
                },
            )),
            ..Default::default()
        })
        .collect();

    let message = endpoint_v3::ClusterLoadAssignment {
        cluster_name: name.clone(),
        endpoints: vec![endpoint_v3::LocalityLbEndpoints {
            lb_endpoints,
            ..Default::default()
        }],
        ..Default::default()
    };

    NamedResource {
        name,
        body: any_from(super::ENDPOINT_TYPE_URL, &message),
    }
}
