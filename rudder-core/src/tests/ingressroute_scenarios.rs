// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use rudder_k8s::{ObjectKey, ResourceKey, ResourceKind};

use super::{build, ingress_route, service};
use crate::dag::status::StatusState;
use crate::dag::{ListenerProtocol, PathMatch, RouteAction};

fn route_key(namespace: &str, name: &str) -> ResourceKey {
    ResourceKey::new(ResourceKind::IngressRoute, ObjectKey::new(namespace, name))
}

/// A root delegating a prefix subtree to a resource in another namespace.
#[test]
fn delegated_routes_join_the_root_virtual_host() {
    let built = build(vec![
        service("default", "home", 80, 8080),
        service("marketing", "blog", 80, 8080),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: root
            spec:
              virtualhost:
                fqdn: site.example.com
              routes:
                - match: /
                  services: [{name: home, port: 80}]
                - match: /blog
                  delegate:
                    name: blog
                    namespace: marketing
            "#,
            100,
        ),
        ingress_route(
            r#"
            metadata:
              namespace: marketing
              name: blog
            spec:
              routes:
                - match: /blog
                  services: [{name: blog, port: 80}]
            "#,
            101,
        ),
    ]);

    let vhost = built.dag.virtual_host(8080, "site.example.com").unwrap();
    assert_eq!(vhost.routes.len(), 2);
    assert_eq!(vhost.routes[0].path, PathMatch::Prefix("/blog".to_string()));
    // The delegated route's cluster lives in the child's namespace.
    match &vhost.routes[0].action {
        RouteAction::Forward(clusters) => assert_eq!(clusters[0].cluster, "marketing/blog/80"),
        other => panic!("expected forward, got {other:?}"),
    }
    assert_eq!(vhost.routes[0].owner, route_key("marketing", "blog"));

    assert_eq!(
        built.statuses[&route_key("default", "root")].state,
        StatusState::Accepted
    );
    assert_eq!(
        built.statuses[&route_key("marketing", "blog")].state,
        StatusState::Accepted
    );
}

/// Route delegation cycle a -> b -> c -> a: every participant invalid, no
/// virtual host.
#[test]
fn delegation_cycle_invalidates_every_participant() {
    let built = build(vec![
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: a
            spec:
              virtualhost:
                fqdn: cycle.example.com
              routes:
                - match: /
                  delegate: {name: b}
            "#,
            100,
        ),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: b
            spec:
              routes:
                - match: /
                  delegate: {name: c}
            "#,
            101,
        ),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: c
            spec:
              routes:
                - match: /
                  delegate: {name: a}
            "#,
            102,
        ),
    ]);

    for name in ["a", "b", "c"] {
        let status = &built.statuses[&route_key("default", name)];
        assert_eq!(status.state, StatusState::Invalid, "route {name}");
        assert!(
            status.description.contains("cycle"),
            "reason must mention the cycle: {}",
            status.description
        );
    }
    assert!(built.dag.virtual_host(8080, "cycle.example.com").is_none());
}

/// TCPProxy delegation cycle: the chain is walked through tcpproxy delegates
/// rather than routes, and every participant must still end up invalid —
/// including the intermediates that were marked as included before the cycle
/// was detected.
#[test]
fn tcpproxy_delegation_cycle_invalidates_every_participant() {
    let built = build(vec![
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: a
            spec:
              virtualhost:
                fqdn: tcp.example.com
                tls:
                  passthrough: true
              tcpproxy:
                delegate: {name: b}
            "#,
            100,
        ),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: b
            spec:
              tcpproxy:
                delegate: {name: c}
            "#,
            101,
        ),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: c
            spec:
              tcpproxy:
                delegate: {name: a}
            "#,
            102,
        ),
    ]);

    for name in ["a", "b", "c"] {
        let status = &built.statuses[&route_key("default", name)];
        assert_eq!(status.state, StatusState::Invalid, "route {name}");
        assert!(
            status.description.contains("cycle"),
            "reason must mention the cycle: {}",
            status.description
        );
    }
    assert!(built.dag.listener(8443).is_none());
}

/// TLS passthrough: SNI filter chain forwarding raw TCP.
#[test]
fn passthrough_tcpproxy_forwards_by_sni() {
    let built = build(vec![
        service("default", "tcp-backend", 9000, 9000),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: tcp
            spec:
              virtualhost:
                fqdn: tcp.example.com
                tls:
                  passthrough: true
              tcpproxy:
                services: [{name: tcp-backend, port: 9000}]
            "#,
            100,
        ),
    ]);

    let listener = built.dag.listener(8443).expect("passthrough listener");
    assert_eq!(listener.protocol, ListenerProtocol::TlsPassthrough);
    assert_eq!(listener.tcp_proxies.len(), 1);
    let proxy = &listener.tcp_proxies[0];
    assert_eq!(proxy.sni.as_deref(), Some("tcp.example.com"));
    assert!(proxy.passthrough);
    assert_eq!(proxy.clusters[0].cluster, "default/tcp-backend/9000");
    assert_eq!(proxy.owner, route_key("default", "tcp"));

    assert_eq!(
        built.statuses[&route_key("default", "tcp")].state,
        StatusState::Accepted
    );
}

/// A delegated tcpproxy resolves through the child but is owned by the root.
#[test]
fn delegated_tcpproxy_is_owned_by_the_root() {
    let built = build(vec![
        service("default", "tcp-backend", 9000, 9000),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: root
            spec:
              virtualhost:
                fqdn: tcp.example.com
                tls:
                  passthrough: true
              tcpproxy:
                delegate: {name: upstream}
            "#,
            100,
        ),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: upstream
            spec:
              tcpproxy:
                services: [{name: tcp-backend, port: 9000}]
            "#,
            101,
        ),
    ]);

    let listener = built.dag.listener(8443).expect("passthrough listener");
    assert_eq!(listener.tcp_proxies[0].owner, route_key("default", "root"));
    assert_eq!(
        listener.tcp_proxies[0].clusters[0].cluster,
        "default/tcp-backend/9000"
    );
    // The child was reached through delegation, so it is neither orphaned
    // nor invalid.
    assert_eq!(
        built.statuses[&route_key("default", "upstream")].state,
        StatusState::Accepted
    );
}

/// A delegated route must stay inside the handed-down prefix, on a path
/// segment boundary: "/ab" is outside "/a", "/a/b" is inside.
#[test]
fn delegated_route_outside_the_prefix_is_invalid() {
    let built = build(vec![
        service("default", "s1", 80, 8080),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: root
            spec:
              virtualhost:
                fqdn: site.example.com
              routes:
                - match: /a
                  delegate: {name: child}
            "#,
            100,
        ),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: child
            spec:
              routes:
                - match: /ab
                  services: [{name: s1, port: 80}]
            "#,
            101,
        ),
    ]);

    let status = &built.statuses[&route_key("default", "child")];
    assert_eq!(status.state, StatusState::Invalid);
    assert!(
        status.description.contains("outside the delegated prefix"),
        "unexpected reason: {}",
        status.description
    );
    assert!(built.dag.virtual_host(8080, "site.example.com").is_none());
}

#[test]
fn delegated_route_on_a_segment_boundary_is_accepted() {
    let built = build(vec![
        service("default", "s1", 80, 8080),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: root
            spec:
              virtualhost:
                fqdn: site.example.com
              routes:
                - match: /a
                  delegate: {name: child}
            "#,
            100,
        ),
        ingress_route(
            r#"
            metadata:
              namespace: default
              name: child
            spec:
              routes:
                - match: /a
                  services: [{name: s1, port: 80}]
                - match: /a/b
                  services: [{name: s1, port: 80}]
            "#,
            101,
        ),
    ]);

    let vhost = built.dag.virtual_host(8080, "site.example.com").unwrap();
    let paths: Vec<&str> = vhost.routes.iter().map(|r| r.path.value()).collect();
    assert_eq!(paths, vec!["/a/b", "/a"]);
    assert_eq!(
        built.statuses[&route_key("default", "child")].state,
        StatusState::Accepted
    );
}
