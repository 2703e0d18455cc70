pub mod log;
pub mod message;
pub mod node;
pub mod provider;
pub mod state;
pub mod timer;

pub use log::{Log, LogEntry};
pub use node::{NodeStatus, RaftNode};
pub use state::{PersistentState, RaftRole, VolatileState};

/// Unique identifier of a cluster member.
pub type NodeId = u64;
