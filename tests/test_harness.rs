//! Test harness for multi-node cluster tests.
//!
//! Wires real nodes together through an in-memory loopback transport with
//! per-node fault switches, so protocol flows run end-to-end without
//! sockets and with deterministic drive loops.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use raft_lite::config::{Cluster, RaftConfig};
use raft_lite::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, CommandRequest, CommandResponse, VoteRequest,
};
use raft_lite::raft::provider::{
    AppendResponseHandler, MemoryStorage, PollingScheduler, RpcProvider, VoteResponseHandler,
};
use raft_lite::raft::{NodeId, RaftNode, RaftRole};

/// Install a log subscriber driven by `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// In-memory transport that routes requests straight into peer nodes.
///
/// Nodes can be taken down (messages to and from them vanish) and a seeded
/// drop rate can lose any individual exchange. A node whose handler reports
/// a fatal error is halted, which is what the embedder contract demands.
pub struct LoopbackRpc {
    nodes: RwLock<HashMap<NodeId, RaftNode>>,
    down: Mutex<HashSet<NodeId>>,
    drop_rate: Mutex<f64>,
    rng: Mutex<StdRng>,
}

impl LoopbackRpc {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            down: Mutex::new(HashSet::new()),
            drop_rate: Mutex::new(0.0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    pub fn register(&self, node: RaftNode) {
        self.nodes.write().unwrap().insert(node.id(), node);
    }

    pub fn set_drop_rate(&self, rate: f64, seed: u64) {
        *self.drop_rate.lock().unwrap() = rate;
        *self.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
    }

    pub fn set_down(&self, id: NodeId) {
        self.down.lock().unwrap().insert(id);
    }

    pub fn set_up(&self, id: NodeId) {
        self.down.lock().unwrap().remove(&id);
    }

    pub fn is_down(&self, id: NodeId) -> bool {
        self.down.lock().unwrap().contains(&id)
    }

    fn node(&self, id: NodeId) -> Option<RaftNode> {
        self.nodes.read().unwrap().get(&id).cloned()
    }

    fn delivers(&self, from: NodeId, to: NodeId) -> bool {
        {
            let down = self.down.lock().unwrap();
            if down.contains(&from) || down.contains(&to) {
                return false;
            }
        }
        let rate = *self.drop_rate.lock().unwrap();
        rate == 0.0 || self.rng.lock().unwrap().gen::<f64>() >= rate
    }

    fn halt(&self, id: NodeId, error: impl std::fmt::Display) {
        eprintln!("node {id} halted on fatal error: {error}");
        self.set_down(id);
    }
}

#[async_trait]
impl RpcProvider for LoopbackRpc {
    async fn request_votes(
        &self,
        request: VoteRequest,
        peers: Vec<NodeId>,
        on_response: VoteResponseHandler,
    ) {
        for peer in peers {
            if !self.delivers(request.candidate_id, peer) {
                continue;
            }
            let Some(node) = self.node(peer) else {
                continue;
            };
            match node.handle_request_vote(&request) {
                Ok(response) => {
                    if on_response(response).is_some() {
                        break;
                    }
                }
                Err(error) => self.halt(peer, error),
            }
        }
    }

    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
        peers: Vec<NodeId>,
        on_response: AppendResponseHandler,
    ) {
        for peer in peers {
            if !self.delivers(request.leader_id, peer) {
                continue;
            }
            let Some(node) = self.node(peer) else {
                continue;
            };
            match node.handle_append_entries(&request) {
                Ok(response) => on_response(peer, response).await,
                Err(error) => self.halt(peer, error),
            }
        }
    }

    async fn append_entries_to_follower(
        &self,
        request: AppendEntriesRequest,
        peer: NodeId,
    ) -> Option<AppendEntriesResponse> {
        if !self.delivers(request.leader_id, peer) {
            return None;
        }
        let node = self.node(peer)?;
        match node.handle_append_entries(&request) {
            Ok(response) => Some(response),
            Err(error) => {
                self.halt(peer, error);
                None
            }
        }
    }

    async fn forward_command(
        &self,
        request: CommandRequest,
        peer: NodeId,
    ) -> Option<CommandResponse> {
        if self.is_down(peer) {
            return None;
        }
        let node = self.node(peer)?;
        node.handle_command(request).await.ok()
    }
}

/// A running multi-node cluster plus per-node observation points.
pub struct TestCluster {
    pub rpc: Arc<LoopbackRpc>,
    nodes: HashMap<NodeId, RaftNode>,
    applied: HashMap<NodeId, Arc<Mutex<Vec<Vec<u8>>>>>,
    storages: HashMap<NodeId, Arc<MemoryStorage>>,
    /// Drive cadence, taken from the nodes' heartbeat interval.
    pace: Duration,
}

impl TestCluster {
    /// Build a cluster with one entry per member. Give the node that should
    /// win the first election a short timeout and everyone else a long one
    /// to keep elections deterministic; use similar timeouts for chaos
    /// runs.
    pub fn new(timeouts: Vec<(NodeId, Duration)>) -> Self {
        init_tracing();
        let members: Vec<NodeId> = timeouts.iter().map(|&(id, _)| id).collect();
        let rpc = Arc::new(LoopbackRpc::new());
        let mut nodes = HashMap::new();
        let mut applied = HashMap::new();
        let mut storages = HashMap::new();
        let pace = Duration::from_millis(3);

        for (id, timeout) in timeouts {
            let storage = Arc::new(MemoryStorage::new());
            let log = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&log);
            let config = RaftConfig::new(
                rpc.clone(),
                Arc::new(PollingScheduler::new().with_give_up_after(Duration::from_secs(5))),
            )
            .with_storage(storage.clone())
            .with_election_timeout(timeout, Duration::ZERO)
            .with_update_interval(Duration::from_millis(5))
            .with_heartbeat_interval(pace);

            let node = RaftNode::new(
                id,
                config,
                Cluster::new(members.clone()),
                Arc::new(move |command: &[u8]| sink.lock().unwrap().push(command.to_vec())),
            )
            .expect("node construction");
            rpc.register(node.clone());
            nodes.insert(id, node);
            applied.insert(id, log);
            storages.insert(id, storage);
        }

        Self {
            rpc,
            nodes,
            applied,
            storages,
            pace,
        }
    }

    /// Three nodes where `eager` is the only one with a short timeout.
    pub fn three(eager: NodeId) -> Self {
        let timeouts = [1, 2, 3]
            .into_iter()
            .map(|id| {
                let timeout = if id == eager {
                    Duration::from_millis(20)
                } else {
                    Duration::from_secs(60)
                };
                (id, timeout)
            })
            .collect();
        Self::new(timeouts)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn node(&self, id: NodeId) -> RaftNode {
        self.nodes.get(&id).expect("unknown node").clone()
    }

    pub fn applied(&self, id: NodeId) -> Vec<Vec<u8>> {
        self.applied.get(&id).expect("unknown node").lock().unwrap().clone()
    }

    pub fn storage(&self, id: NodeId) -> Arc<MemoryStorage> {
        Arc::clone(self.storages.get(&id).expect("unknown node"))
    }

    pub fn partition(&self, id: NodeId) {
        self.rpc.set_down(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.rpc.set_up(id);
    }

    pub fn leaders(&self) -> Vec<NodeId> {
        self.ids()
            .into_iter()
            .filter(|&id| self.node(id).role() == RaftRole::Leader)
            .collect()
    }

    /// One update pass over the given nodes.
    pub async fn tick(&self, ids: &[NodeId]) {
        for &id in ids {
            self.node(id).update().await.expect("update");
        }
    }

    pub async fn tick_all(&self) {
        let ids = self.ids();
        self.tick(&ids).await;
    }

    /// Update the given nodes repeatedly with a pause between rounds.
    pub async fn drive(&self, ids: &[NodeId], rounds: usize, pause: Duration) {
        for _ in 0..rounds {
            self.tick(ids).await;
            tokio::time::sleep(pause).await;
        }
    }

    /// Let `id`'s election timer fire and keep updating it until it wins.
    pub async fn elect(&self, id: NodeId) {
        let node = self.node(id);
        for _ in 0..200 {
            node.update().await.expect("update");
            if node.role() == RaftRole::Leader {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("node {id} failed to win an election");
    }

    /// Submit a command to `target` while driving the whole cluster until
    /// the call settles.
    pub async fn submit(&self, target: NodeId, command: &[u8]) -> CommandResponse {
        let node = self.node(target);
        let request = CommandRequest {
            command: command.to_vec(),
        };
        let call = tokio::spawn(async move { node.handle_command(request).await });
        while !call.is_finished() {
            self.tick_all().await;
            tokio::time::sleep(self.pace).await;
        }
        call.await.expect("join").expect("handle_command")
    }
}

/// A node with no reachable peers, for direct handler tests. Returns the
/// node together with its storage so tests can inspect what got persisted.
pub fn standalone(id: NodeId, members: Vec<NodeId>) -> (RaftNode, Arc<MemoryStorage>) {
    standalone_with_timeout(id, members, Duration::from_secs(60))
}

/// Like [`standalone`], with control over the election timeout for tests
/// that want the node to campaign into the void.
pub fn standalone_with_timeout(
    id: NodeId,
    members: Vec<NodeId>,
    election_timeout: Duration,
) -> (RaftNode, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let config = RaftConfig::new(
        Arc::new(LoopbackRpc::new()),
        Arc::new(PollingScheduler::new().with_give_up_after(Duration::from_millis(100))),
    )
    .with_storage(storage.clone())
    .with_election_timeout(election_timeout, Duration::ZERO);
    let node = RaftNode::new(id, config, Cluster::new(members), Arc::new(|_: &[u8]| {}))
        .expect("node construction");
    (node, storage)
}
