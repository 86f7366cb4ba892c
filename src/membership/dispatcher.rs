//! Event Dispatcher
//!
//! Feed events are queued on an unbounded channel and handled one at a time
//! by a dedicated task, so handler order does not depend on how the feed
//! delivers its callbacks.
//!
//! ```text
//! feed ──► dispatch() ──► queue ──► dispatcher task ──► Reconciler::handle
//! ```

use super::{FeedEvent, Reconciler};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

enum DispatchMessage {
    Event(FeedEvent),
    /// Resolves once every earlier event has been handled
    Flush { done: oneshot::Sender<()> },
}

pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<DispatchMessage>,
    task: JoinHandle<()>,
}

impl EventDispatcher {
    /// Spawn the dispatcher task
    pub fn spawn(reconciler: Arc<Reconciler>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut handled: u64 = 0;
            while let Some(msg) = rx.recv().await {
                match msg {
                    DispatchMessage::Event(event) => {
                        reconciler.handle(event).await;
                        handled += 1;
                    }
                    DispatchMessage::Flush { done } => {
                        let _ = done.send(());
                    }
                }
            }
            info!(handled, "event dispatcher stopped");
        });

        EventDispatcher { tx, task }
    }

    /// Queue an event. Returns false if the dispatcher has stopped.
    pub fn dispatch(&self, event: FeedEvent) -> bool {
        if self.tx.send(DispatchMessage::Event(event)).is_err() {
            debug!("event dispatcher stopped, dropping event");
            return false;
        }
        true
    }

    /// Wait until every event queued so far has been handled
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(DispatchMessage::Flush { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Drain the queue and stop the task
    pub async fn shutdown(self) {
        let EventDispatcher { tx, task } = self;
        drop(tx);
        let _ = task.await;
    }
}
