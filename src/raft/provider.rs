//! Contracts to the node's external collaborators.
//!
//! The core never talks to a socket, a disk, or a scheduler directly: the
//! embedder hands in trait objects for message dispatch ([`RpcProvider`]),
//! cooperative suspension ([`AsyncProvider`]) and durable state
//! ([`Storage`]). The node tolerates arbitrary message loss; a dropped
//! exchange is reported as `None`, never as an error.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, CommandRequest, CommandResponse, VoteRequest,
    VoteResponse,
};
use crate::raft::state::PersistentState;
use crate::raft::NodeId;

/// Per-response continuation for vote collection. Returning `Some` is the
/// authoritative early termination: the provider must stop polling.
pub type VoteResponseHandler = Arc<dyn Fn(VoteResponse) -> Option<bool> + Send + Sync>;

/// Per-peer continuation for broadcast append responses. The provider
/// awaits the returned future so response processing stays cooperative.
pub type AppendResponseHandler =
    Arc<dyn Fn(NodeId, AppendEntriesResponse) -> BoxFuture<'static, ()> + Send + Sync>;

/// Condition polled by [`AsyncProvider::wait_until`]. Must be cheap and
/// must not call back into the node that is waiting.
pub type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

/// Callback receiving each committed command, in log order. Invoked inline
/// by the node while it holds its state lock; it must be total and must not
/// call back into the node.
pub type CommitHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Message-dispatch contract to the transport.
///
/// Broadcast operations take the explicit destination list (the cluster
/// minus the sender) and deliver responses to the supplied handler as they
/// arrive. Targeted operations return their response directly; `None`
/// models loss, which the node absorbs because timers drive every retry.
#[async_trait]
pub trait RpcProvider: Send + Sync {
    /// Broadcast a vote request, feeding each response to `on_response`
    /// until it returns `Some` or the peers are exhausted.
    async fn request_votes(
        &self,
        request: VoteRequest,
        peers: Vec<NodeId>,
        on_response: VoteResponseHandler,
    );

    /// Broadcast an append (heartbeat or replication), awaiting
    /// `on_response` for every response delivered.
    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
        peers: Vec<NodeId>,
        on_response: AppendResponseHandler,
    );

    /// Targeted replication retry against a single follower.
    async fn append_entries_to_follower(
        &self,
        request: AppendEntriesRequest,
        peer: NodeId,
    ) -> Option<AppendEntriesResponse>;

    /// Forward a client command to the given peer, synchronously from the
    /// caller's perspective.
    async fn forward_command(&self, request: CommandRequest, peer: NodeId)
        -> Option<CommandResponse>;
}

/// Cooperative-suspension contract to the scheduling runtime.
#[async_trait]
pub trait AsyncProvider: Send + Sync {
    /// Suspend the caller until `predicate()` returns true, letting other
    /// handlers run and mutate node state in the meantime. Returns `false`
    /// if the runtime cancelled the wait; the caller then answers with a
    /// failure response.
    async fn wait_until(&self, predicate: Predicate) -> bool;
}

/// Durable home of the persistent state.
///
/// `persist` must complete before any response acknowledging a term
/// advance, a vote grant, or a log change is sent; that ordering is a
/// correctness requirement, not an optimization knob.
pub trait Storage: Send + Sync {
    fn load(&self) -> Result<Option<PersistentState>>;
    fn persist(&self, state: &PersistentState) -> Result<()>;
}

/// [`AsyncProvider`] backed by the tokio timer: polls the predicate on a
/// fixed interval, optionally giving up after a deadline.
pub struct PollingScheduler {
    poll_interval: Duration,
    give_up_after: Option<Duration>,
}

impl PollingScheduler {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            give_up_after: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Cancel waits that outlive `limit`.
    pub fn with_give_up_after(mut self, limit: Duration) -> Self {
        self.give_up_after = Some(limit);
        self
    }
}

impl Default for PollingScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncProvider for PollingScheduler {
    async fn wait_until(&self, predicate: Predicate) -> bool {
        let started = Instant::now();
        loop {
            if predicate() {
                return true;
            }
            if let Some(limit) = self.give_up_after {
                if started.elapsed() >= limit {
                    return false;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// [`Storage`] that keeps the latest snapshot in memory. No durability;
/// meant for embedders that accept losing state on restart, and for tests.
#[derive(Default)]
pub struct MemoryStorage {
    snapshot: Mutex<Option<PersistentState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently persisted state, if any.
    pub fn snapshot(&self) -> Option<PersistentState> {
        self.snapshot.lock().unwrap().clone()
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Option<PersistentState>> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn persist(&self, state: &PersistentState) -> Result<()> {
        *self.snapshot.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn polling_scheduler_returns_once_predicate_holds() {
        let scheduler = PollingScheduler::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let done = scheduler
            .wait_until(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst) >= 3
            }))
            .await;
        assert!(done);
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn polling_scheduler_gives_up_after_limit() {
        let scheduler = PollingScheduler::new().with_give_up_after(Duration::from_millis(10));
        let done = scheduler.wait_until(Box::new(|| false)).await;
        assert!(!done);
    }

    #[test]
    fn memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        assert!(storage.load().unwrap().is_none());

        let mut state = PersistentState::new();
        state.advance_term(3).unwrap();
        storage.persist(&state).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.current_term(), 3);
    }
}
