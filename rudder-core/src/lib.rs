// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The core of an ingress control plane for Envoy: watches Kubernetes routing
//! resources, compiles them into an immutable routing graph, translates the
//! graph into xDS resources, and serves them over the streaming discovery
//! protocol.
//!
//! Data flow: [`store::ResourceStore`] → [`event::EventHandler`] (debounce) →
//! [`builder_thread`] (single-writer DAG build) → [`observer`] fan-out →
//! [`xds`] translation → [`cache::SnapshotCache`] → [`server::XdsServer`]
//! streams. Statuses computed by the build are forwarded to the leadership
//! gated [`status_writer`].

mod annotations;
mod builder_thread;
mod cache;
mod context;
pub mod dag;
mod error;
mod event;
mod metrics;
mod node;
mod observer;
mod server;
mod status_writer;
mod store;
mod validation;
pub mod xds;

#[cfg(test)]
mod tests;

pub use builder_thread::{BuildDispatcher, BuildThreadHandle};
pub use cache::{NamedResource, SnapshotCache, TypeSnapshot};
pub use context::Context;
pub use error::{CoreError, CoreResult};
pub use event::EventHandler;
pub use metrics::Metrics;
pub use node::{Node, NodeHandle};
pub use observer::{DagObserver, ObserverSet, StatusForwarder};
pub use server::XdsServer;
pub use status_writer::{KubeStatusClient, StatusClient, StatusWriteError, StatusWriter};
pub use store::{KnownObject, ResourceStore, StoreEvent, StoreView};
pub use validation::{Timeout, ValidTlsSecret};
