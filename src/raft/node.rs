use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use futures::FutureExt;

use crate::config::{Cluster, RaftConfig};
use crate::error::{RaftError, Result};
use crate::raft::log::LogEntry;
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, CommandRequest, CommandResponse, VoteRequest,
    VoteResponse,
};
use crate::raft::provider::{
    AppendResponseHandler, CommitHandler, Predicate, VoteResponseHandler,
};
use crate::raft::state::{LeadershipState, PersistentState, RaftRole, VolatileState};
use crate::raft::timer::Timer;
use crate::raft::NodeId;

/// Read-only snapshot of a node for embedders and dashboards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub current_term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: Option<u64>,
    pub last_log_index: Option<u64>,
    pub last_log_term: Option<u64>,
}

/// Everything mutable, serialized behind one lock.
struct NodeCore {
    persistent: PersistentState,
    volatile: VolatileState,
    role: RaftRole,
    leadership: Option<LeadershipState>,
    election_timer: Timer,
}

struct NodeInner {
    id: NodeId,
    cluster: Cluster,
    config: RaftConfig,
    commit_handler: CommitHandler,
    core: RwLock<NodeCore>,
    updating: AtomicBool,
}

/// Per-election vote bookkeeping, shared with the response continuation.
struct VoteTally {
    granted: AtomicUsize,
    denied: AtomicUsize,
}

impl VoteTally {
    fn new() -> Self {
        Self {
            // The candidate votes for itself before polling anyone.
            granted: AtomicUsize::new(1),
            denied: AtomicUsize::new(0),
        }
    }

    fn add_granted(&self) -> usize {
        self.granted.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn add_denied(&self) -> usize {
        self.denied.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn granted(&self) -> usize {
        self.granted.load(Ordering::Acquire)
    }
}

/// A single Raft consensus node.
///
/// Clones are cheap handles onto the same node, which is how the RPC
/// response continuations and the embedder's server tasks share it. All
/// handlers and [`update`](Self::update) serialize their state access on
/// one internal lock and release it before suspending, so every critical
/// section observes a consistent snapshot.
#[derive(Clone)]
pub struct RaftNode {
    inner: Arc<NodeInner>,
}

impl RaftNode {
    /// Build a node in the follower role, restoring persistent state from
    /// the configured storage when present.
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        cluster: Cluster,
        commit_handler: CommitHandler,
    ) -> Result<Self> {
        let persistent = config.storage.load()?.unwrap_or_default();
        let election_timer = Timer::new(config.election_timeout, config.election_splay);
        let core = NodeCore {
            persistent,
            volatile: VolatileState::default(),
            role: RaftRole::Follower,
            leadership: None,
            election_timer,
        };
        Ok(Self {
            inner: Arc::new(NodeInner {
                id,
                cluster,
                config,
                commit_handler,
                core: RwLock::new(core),
                updating: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    pub fn role(&self) -> RaftRole {
        self.read(|core| core.role)
    }

    pub fn current_term(&self) -> u64 {
        self.read(|core| core.persistent.current_term())
    }

    pub fn commit_index(&self) -> Option<u64> {
        self.read(|core| core.volatile.commit_index)
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.read(|core| core.volatile.leader_id)
    }

    pub fn log_size(&self) -> u64 {
        self.read(|core| core.persistent.log.size())
    }

    /// Leader-side view of where a follower's replication stands. `None`
    /// when not leader or the peer is unknown.
    pub fn next_index_for(&self, peer: NodeId) -> Option<u64> {
        self.read(|core| {
            core.leadership
                .as_ref()
                .and_then(|leadership| leadership.followers.get(&peer))
                .map(|follower| follower.next_index)
        })
    }

    pub fn status(&self) -> NodeStatus {
        self.read(|core| {
            let last = core.persistent.log.last();
            NodeStatus {
                id: self.inner.id,
                role: core.role,
                current_term: core.persistent.current_term(),
                leader_id: core.volatile.leader_id,
                commit_index: core.volatile.commit_index,
                last_log_index: last.map(|e| e.index),
                last_log_term: last.map(|e| e.term),
            }
        })
    }

    fn read<T>(&self, f: impl FnOnce(&NodeCore) -> T) -> T {
        f(&self.inner.core.read().unwrap())
    }

    /// Periodic driver for role-specific behaviour: election timeouts for
    /// followers and candidates, the heartbeat tick and commit advancement
    /// for leaders. Not reentrant; a nested call while an update is in
    /// flight is a no-op.
    pub async fn update(&self) -> Result<()> {
        if self.inner.updating.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.update_inner().await;
        self.inner.updating.store(false, Ordering::Release);
        result
    }

    async fn update_inner(&self) -> Result<()> {
        enum Tick {
            Idle,
            Election,
            Heartbeat,
        }

        let tick = {
            let mut core = self.inner.core.write().unwrap();
            match core.role {
                RaftRole::Follower => {
                    if core.election_timer.timed_out() {
                        tracing::info!(
                            node_id = self.inner.id,
                            term = core.persistent.current_term(),
                            "election timeout, becoming candidate"
                        );
                        core.role = RaftRole::Candidate;
                        Tick::Election
                    } else {
                        Tick::Idle
                    }
                }
                RaftRole::Candidate => {
                    if core.election_timer.timed_out() {
                        Tick::Election
                    } else {
                        Tick::Idle
                    }
                }
                RaftRole::Leader => match core.leadership.as_mut() {
                    Some(leadership) if leadership.update_timer.timed_out() => {
                        leadership.update_timer.reset();
                        Tick::Heartbeat
                    }
                    _ => Tick::Idle,
                },
            }
        };

        match tick {
            Tick::Idle => Ok(()),
            Tick::Election => self.run_election().await,
            Tick::Heartbeat => {
                self.send_heartbeats().await;
                self.advance_commit_index();
                Ok(())
            }
        }
    }

    /// Start a new election: bump the term, vote for ourselves, poll the
    /// cluster, and take leadership if a quorum grants.
    async fn run_election(&self) -> Result<()> {
        let (term, request) = {
            let mut core = self.inner.core.write().unwrap();
            let term = core.persistent.current_term() + 1;
            core.persistent.advance_term(term)?;
            core.persistent.record_vote(self.inner.id)?;
            core.election_timer.reset();
            self.inner.config.storage.persist(&core.persistent)?;

            let last = core.persistent.log.last();
            let request = VoteRequest {
                term,
                candidate_id: self.inner.id,
                last_log_index: last.map(|e| e.index),
                last_log_term: last.map(|e| e.term),
            };
            (term, request)
        };
        tracing::info!(node_id = self.inner.id, term, "starting election");

        let quorum = self.inner.cluster.quorum();
        let tally = Arc::new(VoteTally::new());
        let on_response: VoteResponseHandler = {
            let node = self.clone();
            let tally = Arc::clone(&tally);
            Arc::new(move |response| node.collect_vote(term, &tally, response))
        };
        let peers = self.inner.cluster.peers(self.inner.id);
        self.inner
            .config
            .rpc_provider
            .request_votes(request, peers, on_response)
            .await;

        if tally.granted() < quorum {
            tracing::debug!(
                node_id = self.inner.id,
                term,
                granted = tally.granted(),
                needed = quorum,
                "election not won"
            );
            return Ok(());
        }

        let elected = {
            let mut core = self.inner.core.write().unwrap();
            // The term may have moved on while votes were in flight; a
            // stale win must not seize leadership.
            if core.role == RaftRole::Candidate && core.persistent.current_term() == term {
                self.establish_leadership(&mut core);
                true
            } else {
                false
            }
        };
        if elected {
            tracing::info!(
                node_id = self.inner.id,
                term,
                votes = tally.granted(),
                "became leader"
            );
            self.send_heartbeats().await;
        }
        Ok(())
    }

    /// Vote-response continuation. Returning `Some` stops collection.
    fn collect_vote(&self, issued_term: u64, tally: &VoteTally, response: VoteResponse) -> Option<bool> {
        let mut core = self.inner.core.write().unwrap();
        // A response for a previous election of ours says nothing.
        if core.persistent.current_term() != issued_term {
            return None;
        }
        if response.term > core.persistent.current_term() {
            if let Err(error) = self.step_down_if_new_term(&mut core, response.term) {
                tracing::error!(node_id = self.inner.id, error = %error, "failed to persist step-down");
            }
            return Some(false);
        }
        let quorum = self.inner.cluster.quorum();
        if response.vote_granted {
            if tally.add_granted() >= quorum {
                Some(true)
            } else {
                None
            }
        } else if tally.add_denied() >= quorum {
            Some(false)
        } else {
            None
        }
    }

    /// Fresh leadership bookkeeping: every peer starts at the end of our
    /// log and unacknowledged, and the heartbeat tick starts now.
    fn establish_leadership(&self, core: &mut NodeCore) {
        core.role = RaftRole::Leader;
        core.volatile.leader_id = Some(self.inner.id);
        let peers = self.inner.cluster.peers(self.inner.id);
        core.leadership = Some(LeadershipState::new(
            self.inner.config.update_interval,
            &peers,
            core.persistent.log.size(),
        ));
    }

    /// Broadcast an empty append anchored at our last entry. Followers that
    /// are behind fail the consistency check and get caught up by the
    /// per-peer rewind in [`append_entries_to_follower`](Self::append_entries_to_follower).
    async fn send_heartbeats(&self) {
        let request = {
            let core = self.inner.core.read().unwrap();
            if core.role != RaftRole::Leader {
                return;
            }
            let last = core.persistent.log.last();
            AppendEntriesRequest {
                term: core.persistent.current_term(),
                leader_id: self.inner.id,
                prev_log_index: last.map(|e| e.index),
                prev_log_term: last.map(|e| e.term),
                entries: Vec::new(),
                commit_index: core.volatile.commit_index,
            }
        };
        tracing::trace!(node_id = self.inner.id, term = request.term, "sending heartbeats");

        let on_response: AppendResponseHandler = {
            let node = self.clone();
            let request = request.clone();
            Arc::new(move |peer, response| {
                let node = node.clone();
                let request = request.clone();
                async move { node.append_entries_to_follower(peer, request, response).await }
                    .boxed()
            })
        };
        let peers = self.inner.cluster.peers(self.inner.id);
        self.inner
            .config
            .rpc_provider
            .append_entries(request, peers, on_response)
            .await;
    }

    /// Leader-side continuation for one follower's append response. On
    /// failure, retries with the anchor rewound one entry until the
    /// follower's log lines up; each retry ships everything past the new
    /// anchor.
    async fn append_entries_to_follower(
        &self,
        peer: NodeId,
        mut request: AppendEntriesRequest,
        mut response: AppendEntriesResponse,
    ) {
        loop {
            let retry = {
                let mut core = self.inner.core.write().unwrap();
                if response.term > core.persistent.current_term() {
                    if let Err(error) = self.step_down_if_new_term(&mut core, response.term) {
                        tracing::error!(node_id = self.inner.id, error = %error, "failed to persist step-down");
                    }
                    return;
                }
                if core.role != RaftRole::Leader {
                    return;
                }
                if response.success {
                    let next_index = request.prev_log_index.map_or(0, |p| p + 1)
                        + request.entries.len() as u64;
                    if let Some(leadership) = core.leadership.as_mut() {
                        if let Some(follower) = leadership.followers.get_mut(&peer) {
                            follower.next_index = next_index;
                            follower.succeeded = true;
                        }
                    }
                    tracing::debug!(
                        node_id = self.inner.id,
                        peer_id = peer,
                        next_index,
                        "append acknowledged"
                    );
                    return;
                }

                // Failure at our own term means a log mismatch, not a lost
                // election: rewind the anchor one entry and resend.
                let rewound = match request.prev_log_index {
                    Some(0) => None,
                    Some(position) => Some(position - 1),
                    // Already anchored at the log start; nothing further back.
                    None => return,
                };
                let from = rewound.map_or(0, |p| p + 1);
                AppendEntriesRequest {
                    term: core.persistent.current_term(),
                    leader_id: self.inner.id,
                    prev_log_index: rewound,
                    prev_log_term: rewound
                        .and_then(|p| core.persistent.log.get(p))
                        .map(|e| e.term),
                    entries: core.persistent.log.entries_from(from),
                    commit_index: core.volatile.commit_index,
                }
            };
            tracing::debug!(
                node_id = self.inner.id,
                peer_id = peer,
                prev_log_index = ?retry.prev_log_index,
                entries = retry.entries.len(),
                "rewinding replication"
            );
            request = retry;
            match self
                .inner
                .config
                .rpc_provider
                .append_entries_to_follower(request.clone(), peer)
                .await
            {
                Some(next) => response = next,
                None => return,
            }
        }
    }

    /// Move the leader's commit index to the highest position replicated on
    /// a quorum (this node's full log counts implicitly).
    fn advance_commit_index(&self) {
        let mut core = self.inner.core.write().unwrap();
        if core.role != RaftRole::Leader {
            return;
        }
        let Some(leadership) = core.leadership.as_ref() else {
            return;
        };

        let new_commit = if leadership.followers.is_empty() {
            // Single-node cluster: our own log is the quorum.
            core.persistent.log.size().checked_sub(1)
        } else {
            let mut matched: Vec<Option<u64>> = leadership
                .followers
                .values()
                .filter(|follower| follower.succeeded)
                .map(|follower| follower.next_index.checked_sub(1))
                .collect();
            let acks_needed = self.inner.cluster.quorum() - 1;
            if matched.len() < acks_needed {
                return;
            }
            matched.sort_unstable();
            if acks_needed == 0 {
                core.persistent.log.size().checked_sub(1)
            } else {
                matched[matched.len() - acks_needed]
            }
        };
        self.handle_commits(&mut core, new_commit);
    }

    /// Hand newly committed commands to the application, in log order,
    /// advancing the commit index one entry at a time. Never regresses.
    fn handle_commits(&self, core: &mut NodeCore, new_commit: Option<u64>) {
        if new_commit == core.volatile.commit_index {
            return;
        }
        let Some(target) = new_commit else {
            return;
        };
        let before = core.volatile.commit_index;
        let mut next = core.volatile.commit_index.map_or(0, |c| c + 1);
        while next <= target {
            let Some(command) = core.persistent.log.get(next).map(|e| e.command.clone()) else {
                break;
            };
            (self.inner.commit_handler)(&command);
            core.volatile.commit_index = Some(next);
            next += 1;
        }
        if core.volatile.commit_index != before {
            tracing::debug!(
                node_id = self.inner.id,
                commit_index = ?core.volatile.commit_index,
                "commit index advanced"
            );
        }
    }

    /// Observing a higher term demotes to follower, clears the vote, and
    /// forgets any leadership bookkeeping. No-op otherwise.
    fn step_down_if_new_term(&self, core: &mut NodeCore, term: u64) -> Result<bool> {
        if term <= core.persistent.current_term() {
            return Ok(false);
        }
        tracing::info!(
            node_id = self.inner.id,
            old_term = core.persistent.current_term(),
            new_term = term,
            role = %core.role,
            "stepping down"
        );
        core.persistent.advance_term(term)?;
        core.role = RaftRole::Follower;
        core.leadership = None;
        self.inner.config.storage.persist(&core.persistent)?;
        Ok(true)
    }

    /// Vote handler. The response always carries our current term; an `Err`
    /// is reserved for invariant violations and storage failure.
    pub fn handle_request_vote(&self, request: &VoteRequest) -> Result<VoteResponse> {
        let mut core = self.inner.core.write().unwrap();

        if request.term < core.persistent.current_term() {
            tracing::debug!(
                node_id = self.inner.id,
                candidate_id = request.candidate_id,
                term = request.term,
                current_term = core.persistent.current_term(),
                "rejecting vote request from stale term"
            );
            return Ok(VoteResponse {
                term: core.persistent.current_term(),
                vote_granted: false,
            });
        }
        if request.term > core.persistent.current_term() {
            // Whoever we thought led the old term is irrelevant now.
            core.volatile.leader_id = None;
            self.step_down_if_new_term(&mut core, request.term)?;
        }
        if core.role != RaftRole::Follower {
            return Ok(VoteResponse {
                term: core.persistent.current_term(),
                vote_granted: false,
            });
        }

        let grant = if core.persistent.voted_for() == Some(request.candidate_id) {
            true
        } else if core.persistent.voted_for().is_none() {
            match core.persistent.log.last() {
                None => true,
                Some(last) => {
                    // Reject a candidate whose log is strictly less
                    // up-to-date than ours. `None` sorts below every index.
                    let same_term_shorter = request.last_log_term == Some(last.term)
                        && request.last_log_index < Some(last.index);
                    let older_term = request.last_log_term < Some(last.term);
                    !(same_term_shorter || older_term)
                }
            }
        } else {
            false
        };

        if grant {
            core.persistent.record_vote(request.candidate_id)?;
            self.inner.config.storage.persist(&core.persistent)?;
            core.election_timer.reset();
            tracing::info!(
                node_id = self.inner.id,
                candidate_id = request.candidate_id,
                term = request.term,
                "vote granted"
            );
        }
        Ok(VoteResponse {
            term: core.persistent.current_term(),
            vote_granted: grant,
        })
    }

    /// Append handler: consistency check against the anchor entry, then
    /// truncate-and-append, then commit advancement from the leader's
    /// commit index. Refuses to touch committed entries.
    pub fn handle_append_entries(
        &self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut core = self.inner.core.write().unwrap();

        if request.term < core.persistent.current_term() {
            return Ok(AppendEntriesResponse {
                term: core.persistent.current_term(),
                success: false,
            });
        }
        self.step_down_if_new_term(&mut core, request.term)?;
        core.election_timer.reset();
        core.volatile.leader_id = Some(request.leader_id);

        // Anchor resolution: the highest position carrying exactly the
        // leader's previous entry. Absent anchor fields mean "from the
        // start of the log".
        let matched = match (request.prev_log_index, request.prev_log_term) {
            (Some(index), Some(term)) => match core.persistent.log.position_of(index, term) {
                Some(position) => Some(position),
                None => {
                    tracing::debug!(
                        node_id = self.inner.id,
                        leader_id = request.leader_id,
                        prev_log_index = index,
                        prev_log_term = term,
                        "append rejected, no entry matching anchor"
                    );
                    return Ok(AppendEntriesResponse {
                        term: core.persistent.current_term(),
                        success: false,
                    });
                }
            },
            _ => None,
        };

        if let Some(committed) = core.volatile.commit_index {
            if matched < Some(committed) {
                return Err(RaftError::CommittedTruncation {
                    kept: matched,
                    committed,
                });
            }
        }

        let retained = matched.map_or(0, |position| position + 1);
        let log_changed =
            retained != core.persistent.log.size() || !request.entries.is_empty();
        match matched {
            Some(position) => core.persistent.log.truncate_after(position),
            None => core.persistent.log.clear(),
        }
        core.persistent.log.extend(request.entries.clone());
        if log_changed {
            tracing::debug!(
                node_id = self.inner.id,
                leader_id = request.leader_id,
                appended = request.entries.len(),
                log_size = core.persistent.log.size(),
                "log updated from leader"
            );
            self.inner.config.storage.persist(&core.persistent)?;
        }

        // A leader reporting an older commit index is lagging knowledge,
        // not authority to un-commit; skip advancement in that case.
        if request.commit_index >= core.volatile.commit_index {
            self.handle_commits(&mut core, request.commit_index);
        }
        Ok(AppendEntriesResponse {
            term: core.persistent.current_term(),
            success: true,
        })
    }

    /// Client command entry point. Followers and candidates park until a
    /// leader is known; the leader appends the command and answers once the
    /// entry commits (or was overwritten by a newer leader, in which case
    /// the caller re-submits).
    pub async fn handle_command(&self, request: CommandRequest) -> Result<CommandResponse> {
        loop {
            match self.read(|core| core.role) {
                RaftRole::Follower => {
                    let leader_known: Predicate = {
                        let node = self.clone();
                        Box::new(move || {
                            let core = node.inner.core.read().unwrap();
                            core.role == RaftRole::Leader || core.volatile.leader_id.is_some()
                        })
                    };
                    if !self.inner.config.async_provider.wait_until(leader_known).await {
                        return Ok(CommandResponse { success: false });
                    }
                    let (role, leader_id) =
                        self.read(|core| (core.role, core.volatile.leader_id));
                    if role == RaftRole::Leader {
                        continue;
                    }
                    let Some(leader_id) = leader_id else {
                        continue;
                    };
                    tracing::debug!(
                        node_id = self.inner.id,
                        leader_id,
                        "forwarding command to leader"
                    );
                    let forwarded = self
                        .inner
                        .config
                        .rpc_provider
                        .forward_command(request.clone(), leader_id)
                        .await;
                    return Ok(forwarded.unwrap_or(CommandResponse { success: false }));
                }
                RaftRole::Candidate => {
                    let election_settled: Predicate = {
                        let node = self.clone();
                        Box::new(move || {
                            let core = node.inner.core.read().unwrap();
                            core.role != RaftRole::Candidate
                                && (core.role == RaftRole::Leader
                                    || core.volatile.leader_id.is_some())
                        })
                    };
                    if !self
                        .inner
                        .config
                        .async_provider
                        .wait_until(election_settled)
                        .await
                    {
                        return Ok(CommandResponse { success: false });
                    }
                }
                RaftRole::Leader => {
                    let appended = {
                        let mut core = self.inner.core.write().unwrap();
                        if core.role != RaftRole::Leader {
                            None
                        } else {
                            let index = core.persistent.log.last().map_or(0, |e| e.index + 1);
                            let entry = LogEntry::new(
                                core.persistent.current_term(),
                                index,
                                request.command.clone(),
                            );
                            core.persistent.log.append(entry.clone());
                            self.inner.config.storage.persist(&core.persistent)?;
                            Some(entry)
                        }
                    };
                    let Some(entry) = appended else {
                        continue;
                    };
                    tracing::debug!(
                        node_id = self.inner.id,
                        index = entry.index,
                        term = entry.term,
                        "command appended, awaiting quorum"
                    );

                    let settled: Predicate = {
                        let node = self.clone();
                        let entry = entry.clone();
                        Box::new(move || {
                            let core = node.inner.core.read().unwrap();
                            let committed = core.volatile.commit_index >= Some(entry.index);
                            let intact = core
                                .persistent
                                .log
                                .get(entry.index)
                                .map_or(false, |current| *current == entry);
                            committed || !intact
                        })
                    };
                    if !self.inner.config.async_provider.wait_until(settled).await {
                        return Ok(CommandResponse { success: false });
                    }

                    let success = self.read(|core| {
                        core.volatile.commit_index >= Some(entry.index)
                            && core
                                .persistent
                                .log
                                .get(entry.index)
                                .map_or(false, |current| *current == entry)
                    });
                    if !success {
                        tracing::warn!(
                            node_id = self.inner.id,
                            index = entry.index,
                            "entry overwritten before commit"
                        );
                    }
                    return Ok(CommandResponse { success });
                }
            }
        }
    }
}
