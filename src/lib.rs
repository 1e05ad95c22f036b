//! QuorumKV -- a minimal replicated key-value store demonstrating dynamic
//! quorum-based strong consistency and crash-fault tolerance across a fixed
//! set of storage replicas coordinated by a single entry-point process.

#[macro_use]
pub mod utils;

pub mod protocol;

pub mod coordinator;

pub mod replica;

pub mod client;

pub use crate::utils::{logger_init, KvError, ME};

pub use crate::protocol::{ApiReply, ApiRequest, NodeReply, NodeRequest, Version};

pub use crate::coordinator::{Coordinator, CoordinatorConfig, ReplicaId, ReplicaInfo};

pub use crate::replica::{Replica, ReplicaConfig};

pub use crate::client::KvClient;
