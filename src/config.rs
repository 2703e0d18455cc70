use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::raft::provider::{AsyncProvider, MemoryStorage, RpcProvider, Storage};
use crate::raft::NodeId;

/// Fixed membership of the cluster, immutable for the lifetime of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    members: Vec<NodeId>,
}

impl Cluster {
    pub fn new(mut members: Vec<NodeId>) -> Self {
        members.sort_unstable();
        members.dedup();
        Self { members }
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Strict majority of the cluster.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Every member except `id`.
    pub fn peers(&self, id: NodeId) -> Vec<NodeId> {
        self.members.iter().copied().filter(|&m| m != id).collect()
    }
}

/// Node configuration: the provider contracts plus protocol timing.
///
/// Election timers get a random splay so peers desynchronize; the leader
/// tick runs at `update_interval` with no splay. `heartbeat_interval` is the
/// cadence at which the embedder is expected to drive [`update`].
///
/// [`update`]: crate::raft::RaftNode::update
#[derive(Clone)]
pub struct RaftConfig {
    pub rpc_provider: Arc<dyn RpcProvider>,
    pub async_provider: Arc<dyn AsyncProvider>,
    pub storage: Arc<dyn Storage>,
    pub election_timeout: Duration,
    pub election_splay: Duration,
    pub update_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl RaftConfig {
    pub fn new(rpc_provider: Arc<dyn RpcProvider>, async_provider: Arc<dyn AsyncProvider>) -> Self {
        Self {
            rpc_provider,
            async_provider,
            storage: Arc::new(MemoryStorage::new()),
            election_timeout: Duration::from_millis(150),
            election_splay: Duration::from_millis(150),
            update_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration, splay: Duration) -> Self {
        self.election_timeout = timeout;
        self.election_splay = splay;
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

impl fmt::Debug for RaftConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftConfig")
            .field("election_timeout", &self.election_timeout)
            .field("election_splay", &self.election_splay)
            .field("update_interval", &self.update_interval)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}
