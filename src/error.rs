use thiserror::Error;

use crate::raft::NodeId;

/// Errors surfaced to the embedder.
///
/// Protocol rejections (a denied vote, a failed append) are ordinary
/// responses, not errors. An `Err` from a handler means the node detected an
/// unrecoverable invariant violation or its storage failed; the embedder
/// must halt the node rather than continue.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error(
        "append would truncate committed entries (keeping up to {kept:?}, committed through {committed})"
    )]
    CommittedTruncation { kept: Option<u64>, committed: u64 },

    #[error("persistent term cannot move from {current} to {requested}")]
    TermRegression { current: u64, requested: u64 },

    #[error("already voted for node {voted_for} in term {term}, cannot vote for node {candidate}")]
    DoubleVote {
        term: u64,
        voted_for: NodeId,
        candidate: NodeId,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
