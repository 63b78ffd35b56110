// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenario tests: store contents in, DAG and xDS tables out.

mod determinism;
mod httpproxy_scenarios;
mod ingress_scenarios;
mod ingressroute_scenarios;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;

use crate::context::Context;
use crate::dag::{builder, BuiltDag};
use crate::store::{KnownObject, ResourceStore};
use crate::xds::{self, DagResources};
use rudder_k8s::{HttpProxy, IngressRoute};

/// A service with one numeric port.
pub(crate) fn service(namespace: &str, name: &str, port: i32, target_port: i32) -> KnownObject {
    KnownObject::Service(Arc::new(Service {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(target_port),
                ),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// An Ingress with a single host rule forwarding everything to one backend.
pub(crate) fn basic_ingress(
    namespace: &str,
    name: &str,
    host: &str,
    backend: &str,
    port: i32,
) -> KnownObject {
    let ingress: Ingress = serde_yaml::from_str(&format!(
        r#"
        metadata:
          namespace: {namespace}
          name: {name}
        spec:
          rules:
            - host: {host}
              http:
                paths:
                  - path: /
                    pathType: Prefix
                    backend:
                      service:
                        name: {backend}
                        port:
                          number: {port}
        "#
    ))
    .expect("fixture ingress parses");
    KnownObject::Ingress(Arc::new(ingress))
}

/// An HTTPProxy parsed from YAML with a pinned creation timestamp so claim
/// ordering in tests is explicit.
pub(crate) fn proxy(yaml: &str, created_at: i64) -> KnownObject {
    let mut proxy: HttpProxy = serde_yaml::from_str(yaml).expect("fixture proxy parses");
    proxy.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(created_at, 0).unwrap()));
    KnownObject::HttpProxy(Arc::new(proxy))
}

/// An IngressRoute parsed from YAML with a pinned creation timestamp.
pub(crate) fn ingress_route(yaml: &str, created_at: i64) -> KnownObject {
    let mut route: IngressRoute =
        serde_yaml::from_str(yaml).expect("fixture ingress route parses");
    route.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(created_at, 0).unwrap()));
    KnownObject::IngressRoute(Arc::new(route))
}

/// A valid `kubernetes.io/tls` secret. Pairs are memoized per key so the
/// same fixture yields byte-identical secrets across calls (the determinism
/// tests depend on that).
pub(crate) fn tls_secret(namespace: &str, name: &str) -> KnownObject {
    static PAIRS: std::sync::OnceLock<
        parking_lot::Mutex<std::collections::BTreeMap<String, (String, String)>>,
    > = std::sync::OnceLock::new();

    let mut pairs = PAIRS
        .get_or_init(|| parking_lot::Mutex::new(Default::default()))
        .lock();
    let (cert_pem, key_pem) = pairs
        .entry(format!("{namespace}/{name}"))
        .or_insert_with(|| {
            let pair =
                rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
            (pair.cert.pem(), pair.key_pair.serialize_pem())
        })
        .clone();

    let mut data = std::collections::BTreeMap::new();
    data.insert("tls.crt".to_string(), ByteString(cert_pem.into_bytes()));
    data.insert("tls.key".to_string(), ByteString(key_pem.into_bytes()));
    KnownObject::Secret(Arc::new(Secret {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }))
}

/// Builds a DAG from the given objects under default parameters.
pub(crate) fn build(objects: Vec<KnownObject>) -> BuiltDag {
    build_with(Context::new_for_test(), objects)
}

pub(crate) fn build_with(context: Arc<Context>, objects: Vec<KnownObject>) -> BuiltDag {
    let store = ResourceStore::new();
    for object in objects {
        store.upsert(object);
    }
    builder::build(&context, &store.snapshot())
}

/// Builds and translates in one step.
pub(crate) fn build_and_translate(objects: Vec<KnownObject>) -> (BuiltDag, DagResources) {
    let context = Context::new_for_test();
    let built = build_with(context.clone(), objects);
    let resources = xds::translate(&context.parameters, &built.dag);
    (built, resources)
}
