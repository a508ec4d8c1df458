use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::debug;

type DeferredFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Tasks-after-response channel serviced by one worker task.
///
/// Bookkeeping scheduled here completes after the response has been written
/// to the client but is never dropped on the floor: the worker drains the
/// queue in program order for the life of the process.
#[derive(Clone)]
pub struct DeferredTasks {
    tx: mpsc::UnboundedSender<DeferredFuture>,
}

impl DeferredTasks {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeferredFuture>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
            }
            debug!(event = "deferred_worker_stopped");
        });
        Self { tx }
    }

    pub fn defer(&self, task: impl Future<Output = ()> + Send + 'static) {
        // Send only fails after the worker stopped, i.e. at shutdown.
        let _ = self.tx.send(Box::pin(task));
    }
}
