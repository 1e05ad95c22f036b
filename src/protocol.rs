//! Wire protocol message types and framing helpers.
//!
//! Two independent message sets share the same framing: client <-> coordinator
//! (`ApiRequest`/`ApiReply`) and coordinator <-> replica
//! (`NodeRequest`/`NodeReply`). A message is a `u64` big-endian length header
//! followed by that many bytes of MessagePack. Each RPC opens a fresh
//! connection, exchanges exactly one request and one reply, and closes; there
//! is no connection reuse or pipelining.

use std::fmt;
use std::net::SocketAddr;

use crate::utils::KvError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Per-key write version; monotonically increasing, starting at 1.
pub type Version = u64;

/// Request sent from a client to the coordinator.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Replicated write of a key-value pair.
    Put { key: String, value: String },

    /// Quorum read of a key.
    Get { key: String },

    /// Metrics counters snapshot query.
    Stats,
}

/// Reply from the coordinator back to a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Write acknowledged by a quorum of alive replicas.
    PutOk,

    /// Write reached fewer acknowledgments than the current quorum.
    PutQuorumNotMet,

    /// Read resolved to the highest-versioned value seen.
    Value {
        key: String,
        value: String,
        version: Version,
    },

    /// Fewer replicas responded to the read than the current quorum.
    GetQuorumNotMet,

    /// Quorum reached but no replica held a record for the key.
    NotFound,

    /// Metrics counters snapshot.
    Stats {
        total_writes: u64,
        total_reads: u64,
        failed_writes: u64,
        node_failures: u64,
    },

    /// Malformed or unrecognized request.
    Err { reason: String },
}

// Renders the documented legacy reply strings for terminal display.
impl fmt::Display for ApiReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiReply::PutOk => write!(f, "SUCCESS:WriteQuorumMet"),
            ApiReply::PutQuorumNotMet => write!(f, "FAILURE:WriteQuorumNotMet"),
            ApiReply::Value {
                key,
                value,
                version,
            } => write!(f, "VALUE:{}:{}:{}", key, value, version),
            ApiReply::GetQuorumNotMet => write!(f, "FAILURE:ReadQuorumNotMet"),
            ApiReply::NotFound => write!(f, "NULL"),
            ApiReply::Stats {
                total_writes,
                total_reads,
                failed_writes,
                node_failures,
            } => {
                writeln!(f, "----- SYSTEM METRICS -----")?;
                writeln!(f, "Total Writes: {}", total_writes)?;
                writeln!(f, "Total Reads: {}", total_reads)?;
                writeln!(f, "Failed Writes: {}", failed_writes)?;
                write!(f, "Node Failures Detected: {}", node_failures)
            }
            ApiReply::Err { reason } => write!(f, "ERROR:{}", reason),
        }
    }
}

/// Request sent from the coordinator (or a fault-injecting test client) to a
/// replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Replicate a versioned write.
    Put {
        key: String,
        value: String,
        version: Version,
    },

    /// Fetch the stored record of a key.
    Get { key: String },

    /// Liveness probe.
    Heartbeat,

    /// Push of a quorum-read value during recovery resync. Applied with the
    /// same version rule as `Put`.
    SyncData {
        key: String,
        value: String,
        version: Version,
    },

    /// Reserved for node-initiated sync; currently unused by the coordinator.
    SyncRequest,

    /// Fault injection: stop serving requests without terminating.
    Kill,

    /// Fault injection: resume serving requests.
    Revive,
}

/// Reply from a replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum NodeReply {
    /// Write or sync push accepted at the protocol level (the record may have
    /// been silently discarded as stale).
    Ack,

    /// Stored record of the requested key.
    Value {
        key: String,
        value: String,
        version: Version,
    },

    /// No record stored for the requested key.
    Null,

    /// Heartbeat response.
    Alive,

    /// Response to the reserved `SyncRequest`.
    SyncAck,

    /// Fault injection acknowledged.
    AckKill,
    AckRevive,

    /// Malformed or unrecognized request.
    Err { reason: String },
}

impl fmt::Display for NodeReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeReply::Ack => write!(f, "ACK"),
            NodeReply::Value {
                key,
                value,
                version,
            } => write!(f, "VALUE:{}:{}:{}", key, value, version),
            NodeReply::Null => write!(f, "NULL"),
            NodeReply::Alive => write!(f, "ALIVE"),
            NodeReply::SyncAck => write!(f, "SYNC_ACK"),
            NodeReply::AckKill => write!(f, "ACK_KILL"),
            NodeReply::AckRevive => write!(f, "ACK_REVIVE"),
            NodeReply::Err { reason } => write!(f, "ERROR:{}", reason),
        }
    }
}

/// Writes a message through the given TcpStream, length header first.
pub async fn send_msg<Msg>(
    conn: &mut TcpStream,
    msg: &Msg,
) -> Result<(), KvError>
where
    Msg: Serialize,
{
    let msg_bytes = encode_to_vec(msg)?;
    conn.write_u64(msg_bytes.len() as u64).await?;
    conn.write_all(&msg_bytes[..]).await?;
    Ok(())
}

/// Reads a message from the given TcpStream. A connection closed before a
/// complete message arrives surfaces as an `Err`, which fan-out callers treat
/// as a call failure rather than propagating to the client.
pub async fn recv_msg<Msg>(conn: &mut TcpStream) -> Result<Msg, KvError>
where
    Msg: DeserializeOwned,
{
    let msg_len = conn.read_u64().await?;
    let mut msg_buf: Vec<u8> = vec![0; msg_len as usize];
    conn.read_exact(&mut msg_buf[..]).await?;
    let msg = decode_from_slice(&msg_buf)?;
    Ok(msg)
}

/// Makes one bounded request-reply call to `addr` over a fresh connection.
/// The time limit covers connect, send, and receive together.
pub async fn call<Req, Rep>(
    addr: SocketAddr,
    req: &Req,
    timelimit: Duration,
) -> Result<Rep, KvError>
where
    Req: Serialize + Sync,
    Rep: DeserializeOwned,
{
    time::timeout(timelimit, async {
        let mut conn = TcpStream::connect(addr).await?;
        send_msg(&mut conn, req).await?;
        recv_msg(&mut conn).await
    })
    .await?
}
