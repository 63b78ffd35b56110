// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed model of the Kubernetes resources rudder watches.
//!
//! Built-in kinds (Ingress, Service, EndpointSlice, Secret, Namespace) come
//! from `k8s_openapi`; the routing CRDs and the Gateway API kinds are defined
//! here against the same `Resource`/`Metadata` machinery so every kind flows
//! through one code path.

mod delegation;
mod gateway;
mod httpproxy;
mod ingressroute;
mod keys;

pub use delegation::*;
pub use gateway::*;
pub use httpproxy::*;
pub use ingressroute::*;
pub use keys::*;
