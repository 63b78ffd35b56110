// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

/// Counter hooks maintained by the core. Exposition is the embedder's
/// responsibility; the core only bumps.
pub struct Metrics {
    /// Full DAG rebuilds completed.
    pub dag_builds: IntCounter,
    /// Endpoint-only rebuilds completed.
    pub endpoint_rebuilds: IntCounter,
    /// Store change notifications accepted, by kind.
    pub store_events: IntCounterVec,
    /// Snapshot installs that bumped a type's version, by type URL suffix.
    pub cache_updates: IntCounterVec,
    /// Discovery responses sent, by type URL suffix.
    pub xds_responses: IntCounterVec,
    /// NACKed discovery responses, by type URL suffix.
    pub xds_nacks: IntCounterVec,
    /// Currently open discovery streams.
    pub xds_streams: IntGauge,
    /// Status updates written to the API.
    pub status_writes: IntCounter,
    /// Status writes retried after a resource-version conflict.
    pub status_conflicts: IntCounter,
    /// Status maps dropped because this instance is not the leader.
    pub status_dropped_not_leader: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Metrics> {
        Arc::new(Metrics {
            dag_builds: register_int_counter_with_registry!(
                "rudder_dag_builds_total",
                "Full DAG rebuilds completed",
                registry
            )
            .unwrap(),
            endpoint_rebuilds: register_int_counter_with_registry!(
                "rudder_endpoint_rebuilds_total",
                "Endpoint-only rebuilds completed",
                registry
            )
            .unwrap(),
            store_events: register_int_counter_vec_with_registry!(
                "rudder_store_events_total",
                "Store change notifications accepted",
                &["kind"],
                registry
            )
            .unwrap(),
            cache_updates: register_int_counter_vec_with_registry!(
                "rudder_cache_updates_total",
                "Snapshot installs that bumped a type version",
                &["type"],
                registry
            )
            .unwrap(),
            xds_responses: register_int_counter_vec_with_registry!(
                "rudder_xds_responses_total",
                "Discovery responses sent",
                &["type"],
                registry
            )
            .unwrap(),
            xds_nacks: register_int_counter_vec_with_registry!(
                "rudder_xds_nacks_total",
                "NACKed discovery responses",
                &["type"],
                registry
            )
            .unwrap(),
            xds_streams: register_int_gauge_with_registry!(
                "rudder_xds_streams",
                "Currently open discovery streams",
                registry
            )
            .unwrap(),
            status_writes: register_int_counter_with_registry!(
                "rudder_status_writes_total",
                "Status updates written to the API",
                registry
            )
            .unwrap(),
            status_conflicts: register_int_counter_with_registry!(
                "rudder_status_conflicts_total",
                "Status writes retried after a resource-version conflict",
                registry
            )
            .unwrap(),
            status_dropped_not_leader: register_int_counter_with_registry!(
                "rudder_status_dropped_not_leader_total",
                "Status maps dropped while not leader",
                registry
            )
            .unwrap(),
        })
    }
}

/// Metrics backed by a throwaway registry.
#[cfg(test)]
pub(crate) fn test_metrics() -> Arc<Metrics> {
    Metrics::new(&Registry::new())
}
