// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::dag::status::StatusMap;
use crate::dag::BuiltDag;

/// Consumers of freshly built DAGs. Observers run synchronously on the build
/// thread, in registration order, and must not mutate the graph (they only
/// ever see it behind a shared reference).
pub trait DagObserver: Send + Sync {
    fn on_dag_built(&self, built: &BuiltDag);
}

#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn DagObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn DagObserver>) {
        self.observers.push(observer);
    }

    pub fn dispatch(&self, built: &BuiltDag) {
        for observer in &self.observers {
            observer.on_dag_built(built);
        }
    }
}

/// Forwards each build's status map to the status writer task. The channel is
/// unbounded: maps are small and the writer must never stall the build
/// thread.
pub struct StatusForwarder {
    tx: mpsc::UnboundedSender<StatusMap>,
}

impl StatusForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusMap>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DagObserver for StatusForwarder {
    fn on_dag_built(&self, built: &BuiltDag) {
        if self.tx.send(built.statuses.clone()).is_err() {
            warn!("status writer is gone; dropping status map");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use crate::dag::Dag;

    fn empty_built() -> BuiltDag {
        BuiltDag {
            dag: Arc::new(Dag::default()),
            statuses: StatusMap::new(),
            generation: 1,
        }
    }

    struct Recorder {
        order: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    }

    impl DagObserver for Recorder {
        fn on_dag_built(&self, _built: &BuiltDag) {
            self.order.lock().push(self.name);
        }
    }

    #[test]
    fn observers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut set = ObserverSet::new();
        set.register(Arc::new(Recorder {
            order: order.clone(),
            name: "first",
        }));
        set.register(Arc::new(Recorder {
            order: order.clone(),
            name: "second",
        }));

        set.dispatch(&empty_built());
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn status_forwarder_delivers_maps() {
        let (forwarder, mut rx) = StatusForwarder::new();
        forwarder.on_dag_built(&empty_built());
        assert!(rx.try_recv().is_ok());
    }
}
