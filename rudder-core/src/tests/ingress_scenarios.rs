// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use envoy_types::pb::envoy::config::cluster::v3 as cluster_v3;
use envoy_types::pb::envoy::config::listener::v3 as listener_v3;
use envoy_types::pb::envoy::config::route::v3 as route_v3;
use prost::Message;

use super::{basic_ingress, build_and_translate, service};
use crate::dag::{PathMatch, RouteAction};

/// The minimal Ingress scenario: one service, one host rule.
#[test]
fn minimal_ingress_programs_all_four_tables() {
    let (built, resources) = build_and_translate(vec![
        service("default", "s1", 80, 6502),
        basic_ingress("default", "basic", "foo.bar.com", "s1", 80),
    ]);

    // DAG shape: one HTTP listener, one vhost, one prefix route to one
    // cluster.
    let vhost = built
        .dag
        .virtual_host(8080, "foo.bar.com")
        .expect("vhost exists");
    assert_eq!(vhost.routes.len(), 1);
    assert_eq!(vhost.routes[0].path, PathMatch::Prefix("/".to_string()));
    match &vhost.routes[0].action {
        RouteAction::Forward(clusters) => {
            assert_eq!(clusters.len(), 1);
            assert_eq!(clusters[0].cluster, "default/s1/80");
        }
        other => panic!("expected forward, got {other:?}"),
    }

    // LDS: exactly one listener, on the HTTP port.
    assert_eq!(resources.listeners.len(), 1);
    let listener =
        listener_v3::Listener::decode(&resources.listeners[0].body.value[..]).unwrap();
    assert_eq!(listener.name, "ingress_http");

    // RDS: the vhost carries both domain forms and one route.
    assert_eq!(resources.routes.len(), 1);
    let config = route_v3::RouteConfiguration::decode(&resources.routes[0].body.value[..]).unwrap();
    assert_eq!(config.name, "ingress_http");
    assert_eq!(config.virtual_hosts.len(), 1);
    assert_eq!(
        config.virtual_hosts[0].domains,
        vec!["foo.bar.com", "foo.bar.com:*"]
    );
    assert_eq!(config.virtual_hosts[0].routes.len(), 1);

    // CDS: the one EDS cluster.
    assert_eq!(resources.clusters.len(), 1);
    let cluster = cluster_v3::Cluster::decode(&resources.clusters[0].body.value[..]).unwrap();
    assert_eq!(cluster.name, "default/s1/80");

    // SDS: nothing is secured.
    assert!(resources.secrets.is_empty());
}

#[test]
fn ingress_without_matching_class_is_ignored() {
    let ingress = {
        let mut ingress: k8s_openapi::api::networking::v1::Ingress = serde_yaml::from_str(
            r#"
            metadata:
              namespace: default
              name: other
              annotations:
                kubernetes.io/ingress.class: nginx
            spec:
              rules:
                - host: foo.bar.com
                  http:
                    paths:
                      - path: /
                        pathType: Prefix
                        backend:
                          service:
                            name: s1
                            port:
                              number: 80
            "#,
        )
        .unwrap();
        ingress.metadata.namespace = Some("default".to_string());
        crate::store::KnownObject::Ingress(std::sync::Arc::new(ingress))
    };

    let (built, resources) = build_and_translate(vec![service("default", "s1", 80, 6502), ingress]);
    assert!(built.dag.listeners.is_empty());
    assert!(resources.listeners.is_empty());
    assert!(built.statuses.is_empty());
}

#[test]
fn missing_service_still_programs_the_path_with_a_503() {
    let (built, _resources) = build_and_translate(vec![basic_ingress(
        "default",
        "basic",
        "foo.bar.com",
        "missing",
        80,
    )]);

    let vhost = built
        .dag
        .virtual_host(8080, "foo.bar.com")
        .expect("vhost exists");
    // The cluster is still emitted: with no endpoints behind it the proxy
    // answers 503 by itself.
    match &vhost.routes[0].action {
        RouteAction::Forward(clusters) => {
            assert_eq!(clusters[0].cluster, "default/missing/80");
        }
        other => panic!("expected forward, got {other:?}"),
    }
    assert!(built
        .dag
        .clusters
        .get("default/missing/80")
        .is_some_and(|c| !c.service_found));

    let status = built
        .statuses
        .values()
        .next()
        .expect("ingress has a status");
    assert_eq!(
        status.state,
        crate::dag::status::StatusState::PartiallyAccepted
    );
    assert!(status.description.contains("not found"));
}

#[test]
fn exact_path_type_is_preserved() {
    let ingress: k8s_openapi::api::networking::v1::Ingress = serde_yaml::from_str(
        r#"
        metadata:
          namespace: default
          name: exact
        spec:
          rules:
            - host: foo.bar.com
              http:
                paths:
                  - path: /health
                    pathType: Exact
                    backend:
                      service:
                        name: s1
                        port:
                          number: 80
        "#,
    )
    .unwrap();

    let (built, _) = build_and_translate(vec![
        service("default", "s1", 80, 6502),
        crate::store::KnownObject::Ingress(std::sync::Arc::new(ingress)),
    ]);

    let vhost = built.dag.virtual_host(8080, "foo.bar.com").unwrap();
    assert_eq!(vhost.routes[0].path, PathMatch::Exact("/health".to_string()));
}

#[test]
fn default_backend_catches_all_hosts() {
    let ingress: k8s_openapi::api::networking::v1::Ingress = serde_yaml::from_str(
        r#"
        metadata:
          namespace: default
          name: fallback
        spec:
          defaultBackend:
            service:
              name: s1
              port:
                number: 80
        "#,
    )
    .unwrap();

    let (built, resources) = build_and_translate(vec![
        service("default", "s1", 80, 6502),
        crate::store::KnownObject::Ingress(std::sync::Arc::new(ingress)),
    ]);

    let vhost = built.dag.virtual_host(8080, "*").expect("catch-all vhost");
    assert_eq!(vhost.routes.len(), 1);

    let config = envoy_types::pb::envoy::config::route::v3::RouteConfiguration::decode(
        &resources.routes[0].body.value[..],
    )
    .unwrap();
    assert_eq!(config.virtual_hosts[0].domains, vec!["*"]);
}
