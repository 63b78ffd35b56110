// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::context::Context;
use crate::dag::builder;
use crate::error::{CoreError, CoreResult};
use crate::observer::ObserverSet;
use crate::store::StoreView;

const BUILD_COMMANDS_CHANNEL_SIZE: usize = 32;

enum BuildCommand {
    Rebuild(StoreView, oneshot::Sender<u64>),
}

/// Owns the build thread. Dropping the strong sender (via [`Self::stop`])
/// ends the thread; weak senders held by dispatchers stop upgrading.
pub struct BuildThreadHandle {
    sender: mpsc::Sender<BuildCommand>,
    join_handle: thread::JoinHandle<()>,
}

impl BuildThreadHandle {
    pub fn stop(self) {
        drop(self.sender);
        self.join_handle.join().ok();
    }
}

/// Cheap handle for requesting rebuilds from async tasks.
#[derive(Clone)]
pub struct BuildDispatcher {
    sender: mpsc::WeakSender<BuildCommand>,
}

impl BuildDispatcher {
    /// Requests a rebuild from `view` and waits for it to finish. Returns
    /// the store generation the build covered.
    pub async fn rebuild(&self, view: StoreView) -> CoreResult<u64> {
        let (reply, receiver) = oneshot::channel();
        let Some(sender) = self.sender.upgrade() else {
            return Err(CoreError::Shutdown);
        };
        if let Err(e) = sender.send(BuildCommand::Rebuild(view, reply)).await {
            warn!("couldn't send command to build thread, probably shutting down: {e}");
            return Err(CoreError::Shutdown);
        }
        receiver.await.map_err(|_| CoreError::Shutdown)
    }
}

struct BuildThread {
    context: Arc<Context>,
    observers: ObserverSet,
    receiver: mpsc::Receiver<BuildCommand>,
}

impl BuildThread {
    fn run(mut self) {
        debug!("started DAG build thread");
        while let Some(command) = self.receiver.blocking_recv() {
            match command {
                BuildCommand::Rebuild(view, reply) => {
                    let built = builder::build(&self.context, &view);
                    self.context.metrics.dag_builds.inc();
                    debug!(
                        generation = built.generation,
                        listeners = built.dag.listeners.len(),
                        clusters = built.dag.clusters.len(),
                        "DAG rebuilt"
                    );
                    // Observers run on this thread; none of them may block
                    // on the build thread or the whole pipeline stalls.
                    self.observers.dispatch(&built);
                    reply.send(built.generation).ok();
                }
            }
        }
        debug!("DAG build thread stopped");
    }
}

/// Starts the dedicated single-writer build thread. All DAG builds happen
/// here, strictly sequentially; concurrency never enters a build.
pub fn start(context: Arc<Context>, observers: ObserverSet) -> (BuildDispatcher, BuildThreadHandle) {
    let (sender, receiver) = mpsc::channel(BUILD_COMMANDS_CHANNEL_SIZE);
    let thread = BuildThread {
        context,
        observers,
        receiver,
    };
    let join_handle = thread::Builder::new()
        .name("rudder-dag-builder".to_string())
        .spawn(move || thread.run())
        .expect("spawning the build thread cannot fail");
    let dispatcher = BuildDispatcher {
        sender: sender.downgrade(),
    };
    let handle = BuildThreadHandle {
        sender,
        join_handle,
    };
    (dispatcher, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ResourceStore;

    #[tokio::test]
    async fn rebuild_round_trips_through_the_thread() {
        let context = Context::new_for_test();
        let (dispatcher, handle) = start(context, ObserverSet::new());

        let store = ResourceStore::new();
        let generation = dispatcher.rebuild(store.snapshot()).await.unwrap();
        assert_eq!(generation, 0);

        handle.stop();
        assert!(matches!(
            dispatcher.rebuild(store.snapshot()).await,
            Err(CoreError::Shutdown)
        ));
    }
}
