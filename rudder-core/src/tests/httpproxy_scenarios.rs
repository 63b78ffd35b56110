// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use envoy_types::pb::envoy::config::route::v3 as route_v3;
use prost::Message;
use rudder_k8s::{ObjectKey, ResourceKey, ResourceKind};

use super::{build, build_and_translate, build_with, proxy, service, tls_secret};
use crate::context::Context;
use crate::dag::status::StatusState;
use crate::dag::RouteAction;

fn proxy_key(namespace: &str, name: &str) -> ResourceKey {
    ResourceKey::new(ResourceKind::HttpProxy, ObjectKey::new(namespace, name))
}

/// HTTPS root whose TLS secret does not exist: invalid, nothing programmed.
#[test]
fn missing_secret_leaves_no_secure_host() {
    let (built, resources) = build_and_translate(vec![
        service("default", "s1", 80, 6502),
        proxy(
            r#"
            metadata:
              namespace: default
              name: site
            spec:
              virtualhost:
                fqdn: foo.example.com
                tls:
                  secretName: missing
              routes:
                - services:
                    - name: s1
                      port: 80
            "#,
            100,
        ),
    ]);

    assert!(built.dag.secure_virtual_host(8443, "foo.example.com").is_none());
    assert!(
        !resources
            .listeners
            .iter()
            .any(|l| l.name == "ingress_https"),
        "HTTPS must not open without a serving certificate"
    );

    let status = &built.statuses[&proxy_key("default", "site")];
    assert_eq!(status.state, StatusState::Invalid);
    assert!(
        status.description.contains("secret") && status.description.contains("not found"),
        "reason must mention the missing secret: {}",
        status.description
    );
}

/// Delegation cycle a -> b -> c -> a: all three invalid, no virtual host.
#[test]
fn include_cycle_invalidates_every_participant() {
    let built = build(vec![
        service("default", "s1", 80, 6502),
        proxy(
            r#"
            metadata:
              namespace: default
              name: a
            spec:
              virtualhost:
                fqdn: cycle.example.com
              includes:
                - name: b
            "#,
            100,
        ),
        proxy(
            r#"
            metadata:
              namespace: default
              name: b
            spec:
              includes:
                - name: c
            "#,
            101,
        ),
        proxy(
            r#"
            metadata:
              namespace: default
              name: c
            spec:
              includes:
                - name: a
            "#,
            102,
        ),
    ]);

    for name in ["a", "b", "c"] {
        let status = &built.statuses[&proxy_key("default", name)];
        assert_eq!(status.state, StatusState::Invalid, "proxy {name}");
        assert!(
            status.description.contains("cycle"),
            "reason must mention the cycle: {}",
            status.description
        );
    }
    assert!(built.dag.virtual_host(8080, "cycle.example.com").is_none());
}

/// Weighted split 10/90 across two services.
#[test]
fn weighted_split_keeps_relative_shares() {
    let (built, resources) = build_and_translate(vec![
        service("default", "a", 80, 8080),
        service("default", "b", 80, 8080),
        proxy(
            r#"
            metadata:
              namespace: default
              name: split
            spec:
              virtualhost:
                fqdn: split.example.com
              routes:
                - services:
                    - name: a
                      port: 80
                      weight: 10
                    - name: b
                      port: 80
                      weight: 90
            "#,
            100,
        ),
    ]);

    assert!(built.dag.clusters.contains_key("default/a/80"));
    assert!(built.dag.clusters.contains_key("default/b/80"));

    let config = route_v3::RouteConfiguration::decode(&resources.routes[0].body.value[..]).unwrap();
    let route = &config.virtual_hosts[0].routes[0];
    match route.action.as_ref().unwrap() {
        route_v3::route::Action::Route(action) => match action.cluster_specifier.as_ref().unwrap()
        {
            route_v3::route_action::ClusterSpecifier::WeightedClusters(wc) => {
                let weights: Vec<u32> = wc
                    .clusters
                    .iter()
                    .map(|c| c.weight.as_ref().unwrap().value)
                    .collect();
                assert_eq!(weights.iter().sum::<u32>(), 100);
                assert_eq!(weights, vec![10, 90]);
            }
            other => panic!("expected weighted clusters, got {other:?}"),
        },
        other => panic!("expected route action, got {other:?}"),
    }
}

/// With one explicit weight, unset weights default to zero.
#[test]
fn unset_weights_default_to_zero_when_any_is_explicit() {
    let built = build(vec![
        service("default", "a", 80, 8080),
        service("default", "b", 80, 8080),
        proxy(
            r#"
            metadata:
              namespace: default
              name: split
            spec:
              virtualhost:
                fqdn: split.example.com
              routes:
                - services:
                    - name: a
                      port: 80
                      weight: 10
                    - name: b
                      port: 80
            "#,
            100,
        ),
    ]);

    let vhost = built.dag.virtual_host(8080, "split.example.com").unwrap();
    match &vhost.routes[0].action {
        RouteAction::Forward(clusters) => {
            assert_eq!(clusters[0].weight, 10);
            assert_eq!(clusters[1].weight, 0);
        }
        other => panic!("expected forward, got {other:?}"),
    }
}

/// All-zero explicit weights reject the action.
#[test]
fn all_zero_weights_are_rejected() {
    let built = build(vec![
        service("default", "a", 80, 8080),
        proxy(
            r#"
            metadata:
              namespace: default
              name: zero
            spec:
              virtualhost:
                fqdn: zero.example.com
              routes:
                - services:
                    - name: a
                      port: 80
                      weight: 0
            "#,
            100,
        ),
    ]);

    let status = &built.statuses[&proxy_key("default", "zero")];
    assert_eq!(status.state, StatusState::Invalid);
    assert!(status.description.contains("weight"));
}

/// FQDN conflict: the older root wins, the younger is conflicting and
/// contributes nothing.
#[test]
fn fqdn_conflict_resolves_to_the_oldest() {
    let (built, resources) = build_and_translate(vec![
        service("default", "old", 80, 8080),
        service("default", "new", 80, 8080),
        proxy(
            r#"
            metadata:
              namespace: default
              name: older
            spec:
              virtualhost:
                fqdn: shared.example.com
              routes:
                - services:
                    - name: old
                      port: 80
            "#,
            100,
        ),
        proxy(
            r#"
            metadata:
              namespace: default
              name: younger
            spec:
              virtualhost:
                fqdn: shared.example.com
              routes:
                - services:
                    - name: new
                      port: 80
            "#,
            101,
        ),
    ]);

    assert_eq!(
        built.statuses[&proxy_key("default", "older")].state,
        StatusState::Accepted
    );
    assert_eq!(
        built.statuses[&proxy_key("default", "younger")].state,
        StatusState::Conflicting
    );

    // RDS carries only the older root's route.
    let config = route_v3::RouteConfiguration::decode(&resources.routes[0].body.value[..]).unwrap();
    let routes = &config.virtual_hosts[0].routes;
    assert_eq!(routes.len(), 1);
    match routes[0].action.as_ref().unwrap() {
        route_v3::route::Action::Route(action) => {
            match action.cluster_specifier.as_ref().unwrap() {
                route_v3::route_action::ClusterSpecifier::Cluster(name) => {
                    assert_eq!(name, "default/old/80")
                }
                other => panic!("expected cluster, got {other:?}"),
            }
        }
        other => panic!("expected route action, got {other:?}"),
    }
}

/// Same-timestamp conflicts fall back to namespace/name order.
#[test]
fn fqdn_conflict_ties_break_on_name() {
    let built = build(vec![
        service("default", "s1", 80, 8080),
        proxy(
            r#"
            metadata:
              namespace: default
              name: bravo
            spec:
              virtualhost:
                fqdn: tie.example.com
              routes:
                - services: [{name: s1, port: 80}]
            "#,
            100,
        ),
        proxy(
            r#"
            metadata:
              namespace: default
              name: alpha
            spec:
              virtualhost:
                fqdn: tie.example.com
              routes:
                - services: [{name: s1, port: 80}]
            "#,
            100,
        ),
    ]);

    assert_eq!(
        built.statuses[&proxy_key("default", "alpha")].state,
        StatusState::Accepted
    );
    assert_eq!(
        built.statuses[&proxy_key("default", "bravo")].state,
        StatusState::Conflicting
    );
}

/// A non-root proxy no root includes is orphaned.
#[test]
fn unincluded_child_is_orphaned() {
    let built = build(vec![proxy(
        r#"
        metadata:
          namespace: default
          name: stray
        spec:
          routes:
            - services:
                - name: s1
                  port: 80
        "#,
        100,
    )]);

    let status = &built.statuses[&proxy_key("default", "stray")];
    assert_eq!(status.state, StatusState::Orphaned);
}

/// Includes compose conditions and may cross namespaces.
#[test]
fn includes_compose_prefix_conditions_across_namespaces() {
    let built = build(vec![
        service("team-a", "api", 80, 8080),
        proxy(
            r#"
            metadata:
              namespace: default
              name: root
            spec:
              virtualhost:
                fqdn: site.example.com
              includes:
                - name: api
                  namespace: team-a
                  conditions:
                    - prefix: /api
            "#,
            100,
        ),
        proxy(
            r#"
            metadata:
              namespace: team-a
              name: api
            spec:
              routes:
                - conditions:
                    - prefix: /v1
                  services:
                    - name: api
                      port: 80
            "#,
            101,
        ),
    ]);

    let vhost = built.dag.virtual_host(8080, "site.example.com").unwrap();
    assert_eq!(vhost.routes.len(), 1);
    assert_eq!(
        vhost.routes[0].path,
        crate::dag::PathMatch::Prefix("/api/v1".to_string())
    );
    // The child's cluster lives in the child's namespace.
    match &vhost.routes[0].action {
        RouteAction::Forward(clusters) => assert_eq!(clusters[0].cluster, "team-a/api/80"),
        other => panic!("expected forward, got {other:?}"),
    }
    assert_eq!(
        built.statuses[&proxy_key("team-a", "api")].state,
        StatusState::Accepted
    );
}

/// Root restriction: roots outside the allow-list are invalid.
#[test]
fn root_namespace_restriction_applies() {
    let context = {
        let mut parameters = rudder_config::Parameters::default();
        parameters.root_namespaces = Some(vec!["roots-only".to_string()]);
        Context::new_for_test_with(parameters)
    };

    let built = build_with(
        context,
        vec![
            service("default", "s1", 80, 8080),
            proxy(
                r#"
                metadata:
                  namespace: default
                  name: site
                spec:
                  virtualhost:
                    fqdn: site.example.com
                  routes:
                    - services: [{name: s1, port: 80}]
                "#,
                100,
            ),
        ],
    );

    let status = &built.statuses[&proxy_key("default", "site")];
    assert_eq!(status.state, StatusState::Invalid);
    assert!(status.description.contains("namespace"));
    assert!(built.dag.virtual_host(8080, "site.example.com").is_none());
}

/// Terminated TLS: secure host exists, HTTP side 301s, SDS serves the cert.
#[test]
fn tls_root_redirects_insecure_traffic() {
    let (built, resources) = build_and_translate(vec![
        service("default", "s1", 80, 8080),
        tls_secret("default", "site-cert"),
        proxy(
            r#"
            metadata:
              namespace: default
              name: site
            spec:
              virtualhost:
                fqdn: secure.example.com
                tls:
                  secretName: site-cert
              routes:
                - services: [{name: s1, port: 80}]
            "#,
            100,
        ),
    ]);

    assert!(built
        .dag
        .secure_virtual_host(8443, "secure.example.com")
        .is_some());
    let insecure = built.dag.virtual_host(8080, "secure.example.com").unwrap();
    assert!(insecure.routes[0].redirect_to_https);

    assert_eq!(resources.secrets.len(), 1);
    assert_eq!(resources.secrets[0].name, "default/site-cert");
    assert!(resources.listeners.iter().any(|l| l.name == "ingress_https"));
}

/// permitInsecure opts a route out of the 301.
#[test]
fn permit_insecure_serves_plain_http() {
    let built = build(vec![
        service("default", "s1", 80, 8080),
        tls_secret("default", "site-cert"),
        proxy(
            r#"
            metadata:
              namespace: default
              name: site
            spec:
              virtualhost:
                fqdn: secure.example.com
                tls:
                  secretName: site-cert
              routes:
                - permitInsecure: true
                  services: [{name: s1, port: 80}]
            "#,
            100,
        ),
    ]);

    let insecure = built.dag.virtual_host(8080, "secure.example.com").unwrap();
    assert!(!insecure.routes[0].redirect_to_https);
    match &insecure.routes[0].action {
        RouteAction::Forward(_) => {}
        other => panic!("expected forward, got {other:?}"),
    }
}

/// Cross-namespace secret references need a delegation.
#[test]
fn cross_namespace_secret_requires_delegation() {
    let undelegated = build(vec![
        service("default", "s1", 80, 8080),
        tls_secret("certs", "wildcard"),
        proxy(
            r#"
            metadata:
              namespace: default
              name: site
            spec:
              virtualhost:
                fqdn: site.example.com
                tls:
                  secretName: certs/wildcard
              routes:
                - services: [{name: s1, port: 80}]
            "#,
            100,
        ),
    ]);
    let status = &undelegated.statuses[&proxy_key("default", "site")];
    assert_eq!(status.state, StatusState::Invalid);
    assert!(status.description.contains("delegated"));

    let delegation: rudder_k8s::TlsCertificateDelegation = serde_yaml::from_str(
        r#"
        metadata:
          namespace: certs
          name: wildcard-delegation
        spec:
          delegations:
            - secretName: wildcard
              targetNamespaces: ["default"]
        "#,
    )
    .unwrap();

    let delegated = build(vec![
        service("default", "s1", 80, 8080),
        tls_secret("certs", "wildcard"),
        crate::store::KnownObject::TlsCertificateDelegation(std::sync::Arc::new(delegation)),
        proxy(
            r#"
            metadata:
              namespace: default
              name: site
            spec:
              virtualhost:
                fqdn: site.example.com
                tls:
                  secretName: certs/wildcard
              routes:
                - services: [{name: s1, port: 80}]
            "#,
            100,
        ),
    ]);
    assert_eq!(
        delegated.statuses[&proxy_key("default", "site")].state,
        StatusState::Accepted
    );
    assert!(delegated
        .dag
        .secure_virtual_host(8443, "site.example.com")
        .is_some());
}

/// TLS passthrough: SNI filter chain, at most one owner per SNI.
#[test]
fn passthrough_sni_is_unique_per_listener() {
    let built = build(vec![
        service("default", "tcp-old", 9000, 9000),
        service("default", "tcp-new", 9000, 9000),
        proxy(
            r#"
            metadata:
              namespace: default
              name: older
            spec:
              virtualhost:
                fqdn: tcp.example.com
                tls:
                  passthrough: true
              tcpproxy:
                services: [{name: tcp-old, port: 9000}]
            "#,
            100,
        ),
        proxy(
            r#"
            metadata:
              namespace: default
              name: younger
            spec:
              virtualhost:
                fqdn: tcp.example.com
                tls:
                  passthrough: true
              tcpproxy:
                services: [{name: tcp-new, port: 9000}]
            "#,
            101,
        ),
    ]);

    assert_eq!(
        built.statuses[&proxy_key("default", "younger")].state,
        StatusState::Conflicting
    );

    let listener = built.dag.listener(8443).expect("passthrough listener");
    assert_eq!(listener.tcp_proxies.len(), 1);
    assert_eq!(
        listener.tcp_proxies[0].owner,
        proxy_key("default", "older")
    );
    assert!(listener.tcp_proxies[0].passthrough);
}

/// Includes of roots are rejected.
#[test]
fn including_a_root_is_invalid() {
    let built = build(vec![
        service("default", "s1", 80, 8080),
        proxy(
            r#"
            metadata:
              namespace: default
              name: parent
            spec:
              virtualhost:
                fqdn: parent.example.com
              includes:
                - name: other-root
            "#,
            100,
        ),
        proxy(
            r#"
            metadata:
              namespace: default
              name: other-root
            spec:
              virtualhost:
                fqdn: other.example.com
              routes:
                - services: [{name: s1, port: 80}]
            "#,
            99,
        ),
    ]);

    let status = &built.statuses[&proxy_key("default", "parent")];
    assert_eq!(status.state, StatusState::Invalid);
    assert!(status.description.contains("root"));
}
