// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The xDS streaming server: aggregated and per-type SotW streams over gRPC.
//! Each stream runs its own task driving the version/nonce state machine
//! against the snapshot cache; delta xDS is not offered.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};

use crate::cache::SnapshotCache;
use crate::context::Context;
use crate::xds::ResourceType;

const RESPONSES_CHANNEL_SIZE: usize = 16;

/// Shared handle behind every discovery service.
#[derive(Clone)]
pub struct XdsServer {
    context: Arc<Context>,
    cache: Arc<SnapshotCache>,
}

type ResponseStream = ReceiverStream<Result<DiscoveryResponse, Status>>;
type DeltaStream = futures::stream::Pending<Result<DeltaDiscoveryResponse, Status>>;

impl XdsServer {
    pub fn new(context: Arc<Context>, cache: Arc<SnapshotCache>) -> Self {
        Self { context, cache }
    }

    /// The six tonic services, all sharing this server.
    pub fn services(
        &self,
    ) -> (
        AggregatedDiscoveryServiceServer<XdsServer>,
        ClusterDiscoveryServiceServer<XdsServer>,
        EndpointDiscoveryServiceServer<XdsServer>,
        ListenerDiscoveryServiceServer<XdsServer>,
        RouteDiscoveryServiceServer<XdsServer>,
        SecretDiscoveryServiceServer<XdsServer>,
    ) {
        (
            AggregatedDiscoveryServiceServer::new(self.clone()),
            ClusterDiscoveryServiceServer::new(self.clone()),
            EndpointDiscoveryServiceServer::new(self.clone()),
            ListenerDiscoveryServiceServer::new(self.clone()),
            RouteDiscoveryServiceServer::new(self.clone()),
            SecretDiscoveryServiceServer::new(self.clone()),
        )
    }

    fn open_stream(
        &self,
        fixed_type: Option<ResourceType>,
        requests: Streaming<DiscoveryRequest>,
    ) -> Response<ResponseStream> {
        let rx = spawn_stream(
            self.context.clone(),
            self.cache.clone(),
            fixed_type,
            requests,
        );
        Response::new(ReceiverStream::new(rx))
    }
}

/// Spawns the per-stream task and hands back its response channel. Exposed at
/// stream granularity so tests can drive the state machine without a gRPC
/// transport.
pub(crate) fn spawn_stream<S>(
    context: Arc<Context>,
    cache: Arc<SnapshotCache>,
    fixed_type: Option<ResourceType>,
    requests: S,
) -> mpsc::Receiver<Result<DiscoveryResponse, Status>>
where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(RESPONSES_CHANNEL_SIZE);
    tokio::spawn(run_stream(context, cache, fixed_type, requests, tx));
    rx
}

/// Per-(stream, type) protocol state.
struct TypeState {
    /// Non-empty means the client subscribed to a subset by name.
    names: Vec<String>,
    /// Version of the last response sent; versions are strictly monotonic
    /// per stream and type.
    sent_version: u64,
    /// Nonce of the last response sent.
    nonce: String,
    /// A cache registration is outstanding.
    registered: bool,
}

impl TypeState {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            sent_version: 0,
            nonce: String::new(),
            registered: false,
        }
    }
}

async fn run_stream<S>(
    context: Arc<Context>,
    cache: Arc<SnapshotCache>,
    fixed_type: Option<ResourceType>,
    mut requests: S,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
) where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    context.metrics.xds_streams.inc();
    let _stream_guard = scopeguard(&context);

    let mut states: HashMap<ResourceType, TypeState> = HashMap::new();
    let mut nonce_counter: u64 = 0;
    let mut registrations: FuturesUnordered<
        futures::future::BoxFuture<'static, (ResourceType, Result<u64, oneshot::error::RecvError>)>,
    > = FuturesUnordered::new();

    loop {
        tokio::select! {
            request = requests.next() => {
                let request = match request {
                    None => {
                        debug!("discovery stream closed by client");
                        return;
                    }
                    Some(Err(status)) => {
                        debug!(%status, "discovery stream errored");
                        return;
                    }
                    Some(Ok(request)) => request,
                };

                let rt = match resolve_type(&request.type_url, fixed_type) {
                    Ok(rt) => rt,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                };

                let state = states.entry(rt).or_insert_with(TypeState::new);
                state.names = request.resource_names.clone();

                if !request.response_nonce.is_empty() && request.response_nonce == state.nonce {
                    if let Some(error) = &request.error_detail {
                        context
                            .metrics
                            .xds_nacks
                            .with_label_values(&[rt.label()])
                            .inc();
                        warn!(
                            r#type = rt.label(),
                            version = %request.version_info,
                            error = %error.message,
                            "configuration rejected by client"
                        );
                        // Retry is driven by the next cache bump; the client
                        // keeps its previous config meanwhile.
                    } else {
                        debug!(
                            r#type = rt.label(),
                            version = %request.version_info,
                            "configuration acknowledged"
                        );
                    }
                } else if !request.response_nonce.is_empty() {
                    // Response to a nonce we no longer care about.
                    debug!(r#type = rt.label(), nonce = %request.response_nonce, "stale nonce");
                    continue;
                }

                if !state.registered {
                    state.registered = true;
                    let receiver = cache.register(rt, state.sent_version);
                    registrations.push(async move { (rt, receiver.await) }.boxed());
                }
            }

            Some((rt, result)) = registrations.next(), if !registrations.is_empty() => {
                let mut ready = vec![(rt, result)];
                // Drain everything already fired so the send order below is
                // deterministic (clusters and endpoints ahead of listeners
                // and routes).
                while let Some(Some(next)) = registrations.next().now_or_never() {
                    ready.push(next);
                }
                ready.sort_by_key(|(rt, _)| *rt);

                for (rt, result) in ready {
                    let state = states.entry(rt).or_insert_with(TypeState::new);
                    state.registered = false;
                    if result.is_err() {
                        // Cache dropped: the process is shutting down.
                        return;
                    }
                    if !send_response(&context, &cache, &tx, rt, state, &mut nonce_counter).await {
                        return;
                    }
                    // Wait for the following bump; ACK/NACK handling above
                    // re-arms on client responses, this keeps streams alive
                    // for clients that stay silent after an ACK-less update.
                }
            }
        }
    }
}

/// Sends the current snapshot for `rt`. Returns false when the stream is
/// gone.
async fn send_response(
    context: &Context,
    cache: &SnapshotCache,
    tx: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
    rt: ResourceType,
    state: &mut TypeState,
    nonce_counter: &mut u64,
) -> bool {
    let (version, resources) = if state.names.is_empty() {
        let snapshot = cache.contents(rt);
        (
            snapshot.version,
            snapshot.resources.iter().map(|r| r.body.clone()).collect(),
        )
    } else {
        let (version, resources) = cache.query(rt, &state.names);
        (version, resources.into_iter().map(|r| r.body).collect())
    };

    // A second registration can fire for a version already streamed; never
    // send the same (or an older) version twice.
    if version <= state.sent_version {
        return true;
    }

    *nonce_counter += 1;
    let nonce = nonce_counter.to_string();
    let response = DiscoveryResponse {
        version_info: version.to_string(),
        resources,
        type_url: rt.type_url().to_string(),
        nonce: nonce.clone(),
        ..Default::default()
    };

    if tx.send(Ok(response)).await.is_err() {
        debug!(r#type = rt.label(), "client went away during send");
        return false;
    }

    context
        .metrics
        .xds_responses
        .with_label_values(&[rt.label()])
        .inc();
    info!(
        r#type = rt.label(),
        version,
        nonce = %nonce,
        "discovery response sent"
    );
    state.sent_version = version;
    state.nonce = nonce;
    true
}

/// Maps a request's type URL onto a served resource type. The v3 transport is
/// the only accepted major version.
fn resolve_type(type_url: &str, fixed_type: Option<ResourceType>) -> Result<ResourceType, Status> {
    if type_url.contains(".v2.") || type_url.starts_with("type.googleapis.com/envoy.api.v2") {
        return Err(Status::invalid_argument(format!(
            "type URL {type_url:?} is v2; only the v3 transport is served"
        )));
    }
    let rt = match ResourceType::from_type_url(type_url) {
        Some(rt) => rt,
        None => {
            return Err(Status::unimplemented(format!(
                "no resource type for type URL {type_url:?}"
            )))
        }
    };
    if let Some(fixed) = fixed_type {
        if rt != fixed {
            return Err(Status::invalid_argument(format!(
                "type URL {type_url:?} is not served by this stream"
            )));
        }
    }
    Ok(rt)
}

fn scopeguard(context: &Arc<Context>) -> impl Drop {
    struct Guard(Arc<Context>);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.metrics.xds_streams.dec();
        }
    }
    Guard(context.clone())
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for XdsServer {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.open_stream(None, request.into_inner()))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not served"))
    }
}

macro_rules! per_type_service {
    ($trait:ident, $rt:expr, $stream_method:ident, $stream_type:ident, $delta_method:ident, $delta_type:ident, $fetch_method:ident) => {
        #[tonic::async_trait]
        impl $trait for XdsServer {
            type $stream_type = ResponseStream;
            type $delta_type = DeltaStream;

            async fn $stream_method(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_type>, Status> {
                Ok(self.open_stream(Some($rt), request.into_inner()))
            }

            async fn $delta_method(
                &self,
                _request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_type>, Status> {
                Err(Status::unimplemented("delta xDS is not served"))
            }

            async fn $fetch_method(
                &self,
                _request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                Err(Status::unimplemented("fetch is not served; use the stream API"))
            }
        }
    };
}

per_type_service!(
    ClusterDiscoveryService,
    ResourceType::Cluster,
    stream_clusters,
    StreamClustersStream,
    delta_clusters,
    DeltaClustersStream,
    fetch_clusters
);
per_type_service!(
    EndpointDiscoveryService,
    ResourceType::Endpoint,
    stream_endpoints,
    StreamEndpointsStream,
    delta_endpoints,
    DeltaEndpointsStream,
    fetch_endpoints
);
per_type_service!(
    ListenerDiscoveryService,
    ResourceType::Listener,
    stream_listeners,
    StreamListenersStream,
    delta_listeners,
    DeltaListenersStream,
    fetch_listeners
);
per_type_service!(
    RouteDiscoveryService,
    ResourceType::Route,
    stream_routes,
    StreamRoutesStream,
    delta_routes,
    DeltaRoutesStream,
    fetch_routes
);
per_type_service!(
    SecretDiscoveryService,
    ResourceType::Secret,
    stream_secrets,
    StreamSecretsStream,
    delta_secrets,
    DeltaSecretsStream,
    fetch_secrets
);
