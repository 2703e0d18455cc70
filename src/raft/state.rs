use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::log::Log;
use crate::raft::timer::Timer;
use crate::raft::NodeId;

/// Raft node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// State that must survive restarts.
///
/// # Safety invariants
///
/// ## Term monotonicity
/// `current_term` never decreases. Moving to a new term clears `voted_for`,
/// so a vote can never leak across terms.
///
/// ## One vote per term
/// Within a term, `voted_for` is write-once. A conflicting second vote is a
/// fatal error, not a rejection: it means the state was corrupted or the
/// caller skipped the handler's guards.
///
/// ## Durability ordering
/// Every mutation of the term, the vote, or the log must reach the
/// [`Storage`] provider before the response acknowledging it is sent.
///
/// [`Storage`]: crate::raft::provider::Storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    current_term: u64,
    voted_for: Option<NodeId>,
    pub log: Log,
}

impl PersistentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Move to a strictly higher term, clearing the vote.
    pub fn advance_term(&mut self, term: u64) -> Result<()> {
        if term <= self.current_term {
            return Err(RaftError::TermRegression {
                current: self.current_term,
                requested: term,
            });
        }
        self.current_term = term;
        self.voted_for = None;
        Ok(())
    }

    /// Record a vote in the current term. Idempotent for the same
    /// candidate, fatal for a different one.
    pub fn record_vote(&mut self, candidate: NodeId) -> Result<()> {
        match self.voted_for {
            None => {
                self.voted_for = Some(candidate);
                Ok(())
            }
            Some(voted_for) if voted_for == candidate => Ok(()),
            Some(voted_for) => Err(RaftError::DoubleVote {
                term: self.current_term,
                voted_for,
                candidate,
            }),
        }
    }
}

/// Volatile per-node state, rebuilt from scratch after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolatileState {
    /// Highest log position known committed. Monotonic once set.
    pub commit_index: Option<u64>,
    /// The leader this node currently believes in, if any.
    pub leader_id: Option<NodeId>,
}

/// Leader-side replication bookkeeping for one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerState {
    /// Position of the next entry to send.
    pub next_index: u64,
    /// Whether this follower has acknowledged an append in this leadership.
    pub succeeded: bool,
}

/// Bookkeeping that exists only while this node is leader.
///
/// Created fresh on each leadership acquisition and dropped on every
/// step-down path; holding one while not leader is a bug.
#[derive(Debug)]
pub struct LeadershipState {
    pub update_timer: Timer,
    pub followers: HashMap<NodeId, FollowerState>,
}

impl LeadershipState {
    pub fn new(update_interval: Duration, peers: &[NodeId], log_size: u64) -> Self {
        let followers = peers
            .iter()
            .map(|&peer| {
                (
                    peer,
                    FollowerState {
                        next_index: log_size,
                        succeeded: false,
                    },
                )
            })
            .collect();
        Self {
            update_timer: Timer::new(update_interval, Duration::ZERO),
            followers,
        }
    }
}
