// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wires the components into a running instance: store → event handler →
//! build thread → observers → cache → gRPC server.

use std::sync::Arc;

use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use rudder_config::Parameters;

use crate::builder_thread::{self, BuildThreadHandle};
use crate::cache::SnapshotCache;
use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::event::EventHandler;
use crate::metrics::Metrics;
use crate::observer::{ObserverSet, StatusForwarder};
use crate::server::XdsServer;
use crate::status_writer::{StatusClient, StatusWriter};
use crate::store::ResourceStore;
use crate::xds::XdsTranslator;

pub struct Node;

/// A running instance. The embedder feeds [`Self::store`] from its watch
/// streams and flips `leadership` from its election; everything else runs
/// behind this handle.
pub struct NodeHandle {
    store: Arc<ResourceStore>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<CoreResult<()>>>,
    build_thread: Option<BuildThreadHandle>,
}

impl Node {
    /// Binds the xDS listener and starts every component. Bind failures and
    /// unreadable TLS material are fatal.
    pub async fn start(
        parameters: Parameters,
        registry: &Registry,
        leadership: watch::Receiver<bool>,
        status_client: Arc<dyn StatusClient>,
    ) -> CoreResult<NodeHandle> {
        let metrics = Metrics::new(registry);
        let context = Arc::new(Context::new(parameters.clone(), metrics));
        let shutdown = CancellationToken::new();

        let store = Arc::new(ResourceStore::new());
        let cache = Arc::new(SnapshotCache::new(context.metrics.clone()));

        // Observers run on the build thread in registration order: the
        // translator first so streams see new config before statuses are
        // written back.
        let (status_forwarder, status_rx) = StatusForwarder::new();
        let mut observers = ObserverSet::new();
        observers.register(Arc::new(XdsTranslator::new(
            parameters.clone(),
            cache.clone(),
        )));
        observers.register(Arc::new(status_forwarder));

        let (dispatcher, build_thread) = builder_thread::start(context.clone(), observers);

        let mut tasks = Vec::new();

        let event_handler = EventHandler::new(
            context.clone(),
            store.clone(),
            dispatcher,
            cache.clone(),
        );
        tasks.push(tokio::spawn(event_handler.run(shutdown.clone())));

        let status_writer =
            StatusWriter::new(context.clone(), status_client, leadership, status_rx);
        {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                status_writer.run(shutdown).await;
                Ok(())
            }));
        }

        let listener = TcpListener::bind(&parameters.xds.bind)
            .await
            .map_err(|e| {
                CoreError::Fatal(format!("cannot bind xDS listener {}: {e}", parameters.xds.bind))
            })?;
        info!(bind = %parameters.xds.bind, "xDS listener bound");

        let mut server_builder = Server::builder();
        if let (Some(cert), Some(key)) = (&parameters.xds.cert, &parameters.xds.key) {
            let cert = std::fs::read(cert)
                .map_err(|e| CoreError::Fatal(format!("cannot read xDS server cert: {e}")))?;
            let key = std::fs::read(key)
                .map_err(|e| CoreError::Fatal(format!("cannot read xDS server key: {e}")))?;
            let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
            if let Some(ca) = &parameters.xds.ca {
                let ca = std::fs::read(ca)
                    .map_err(|e| CoreError::Fatal(format!("cannot read xDS client CA: {e}")))?;
                tls = tls.client_ca_root(Certificate::from_pem(ca));
            }
            server_builder = server_builder.tls_config(tls)?;
        }

        let xds = XdsServer::new(context.clone(), cache.clone());
        let (ads, cds, eds, lds, rds, sds) = xds.services();
        let serve_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            server_builder
                .add_service(ads)
                .add_service(cds)
                .add_service(eds)
                .add_service(lds)
                .add_service(rds)
                .add_service(sds)
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    serve_shutdown.cancelled_owned(),
                )
                .await
                .map_err(CoreError::from)
        }));

        Ok(NodeHandle {
            store,
            shutdown,
            tasks,
            build_thread: Some(build_thread),
        })
    }
}

impl NodeHandle {
    /// The resource store this instance compiles from.
    pub fn store(&self) -> Arc<ResourceStore> {
        self.store.clone()
    }

    /// Cancels every task and waits for them. Returns the first error any
    /// task ended with; a clean shutdown returns `Ok`.
    pub async fn shutdown(mut self) -> CoreResult<()> {
        self.shutdown.cancel();
        let mut result = Ok(());
        for task in self.tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(_) => {
                    if result.is_ok() {
                        result = Err(CoreError::Shutdown);
                    }
                }
            }
        }
        if let Some(build_thread) = self.build_thread.take() {
            build_thread.stop();
        }
        result
    }
}
