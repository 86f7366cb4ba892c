//! Membership feed abstraction
//!
//! Follows the boxed-future trait shape used by the admin layer.

use super::{FeedError, FeedEvent, Member, MemberSelector};
use futures::Stream;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Ordered stream of membership events
pub type FeedStream = Pin<Box<dyn Stream<Item = Result<FeedEvent, FeedError>> + Send>>;

pub type ListFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Member>, FeedError>> + Send + 'a>>;

pub trait MemberSource: Send + Sync + 'static {
    /// Start watching members matching `selector`. Emits one `Observed` per
    /// existing member, then `Synced`, then live events.
    fn watch(&self, selector: &MemberSelector) -> FeedStream;

    /// One-shot listing of members matching `selector`
    fn list<'a>(&'a self, selector: &'a MemberSelector) -> ListFuture<'a>;
}

/// Channel-backed feed for tests and simulations. Events pushed with `send`
/// are delivered to the (single) watcher in order.
pub struct ChannelSource {
    sender: Mutex<Option<mpsc::UnboundedSender<Result<FeedEvent, FeedError>>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<FeedEvent, FeedError>>>>,
    members: Mutex<Vec<Member>>,
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ChannelSource {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            members: Mutex::new(Vec::new()),
        }
    }

    /// Queue an event; returns false once the feed is closed
    pub fn send(&self, event: FeedEvent) -> bool {
        self.push(Ok(event))
    }

    pub fn fail(&self, error: FeedError) -> bool {
        self.push(Err(error))
    }

    fn push(&self, item: Result<FeedEvent, FeedError>) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// End the stream after already-queued events
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Members returned by `list`
    pub fn set_members(&self, members: Vec<Member>) {
        *self.members.lock() = members;
    }
}

impl MemberSource for ChannelSource {
    fn watch(&self, _selector: &MemberSelector) -> FeedStream {
        match self.receiver.lock().take() {
            Some(rx) => Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })),
            None => Box::pin(futures::stream::once(async { Err(FeedError::Closed) })),
        }
    }

    fn list<'a>(&'a self, _selector: &'a MemberSelector) -> ListFuture<'a> {
        Box::pin(async move { Ok(self.members.lock().clone()) })
    }
}
