//! Quorum engine: version issuance, replicated writes, quorum reads, and
//! recovery resynchronization.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::coordinator::liveness::{LivenessSnapshot, ReplicaId, ReplicaInfo};
use crate::protocol::{self, ApiReply, ApiRequest, NodeReply, NodeRequest, Version};

use futures::future::join_all;

use tokio::sync::watch;
use tokio::time::Duration;

/// Number of shards the version table is split into.
const VERSION_SHARDS: usize = 16;

/// Dynamic quorum size given the number of currently-alive replicas.
#[inline]
pub fn quorum_size(alive_count: usize) -> usize {
    (alive_count / 2) + 1
}

/// Authoritative per-key write version table. Sharded by key hash so that
/// concurrent writers to different keys do not serialize on one lock; writers
/// to the same key serialize on its shard, which is what makes issued versions
/// strictly increasing with no duplicates. Versions are never rolled back,
/// even if the write later fails quorum.
struct VersionTable {
    shards: Vec<Mutex<HashMap<String, Version>>>,
}

impl VersionTable {
    fn new() -> Self {
        VersionTable {
            shards: (0..VERSION_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % VERSION_SHARDS
    }

    /// Issues the next version for a key (1 for a first-ever write).
    fn next_version(&self, key: &str) -> Version {
        let mut shard = match self.shards[self.shard_of(key)].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let version = shard.entry(key.into()).or_insert(0);
        *version += 1;
        *version
    }

    /// All keys ever written through this coordinator, in sorted order.
    fn known_keys(&self) -> Vec<String> {
        let mut keys = vec![];
        for shard in &self.shards {
            let shard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            keys.extend(shard.keys().cloned());
        }
        keys.sort();
        keys
    }
}

/// Outcome of one quorum read, before mapping to a client reply.
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    /// Highest-versioned value among candidates (ties broken by lowest
    /// replica ID).
    Latest(String, Version),

    /// Quorum reached but no replica held a record.
    NotFound,

    /// Fewer replicas responded than the current quorum.
    QuorumNotMet,
}

/// Picks the winning read candidate: highest version, ties broken by lowest
/// replica ID so repeated reads of the same state agree.
fn pick_latest(
    candidates: &[(ReplicaId, String, Version)],
) -> Option<&(ReplicaId, String, Version)> {
    candidates
        .iter()
        .max_by(|a, b| a.2.cmp(&b.2).then(b.0.cmp(&a.0)))
}

/// Result of one resynchronization pass over a recovered replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncOutcome {
    pub replica: ReplicaId,
    pub keys_synced: usize,
    pub keys_failed: usize,
}

/// Quorum engine module.
pub struct QuorumEngine {
    /// Cluster membership, shared with the failure detector.
    replicas: Arc<Vec<ReplicaInfo>>,

    /// Per-key version table.
    versions: VersionTable,

    /// Subscriber side of the detector's liveness snapshot channel.
    rx_liveness: watch::Receiver<LivenessSnapshot>,

    /// Time limit on each individual replica call.
    call_timeout: Duration,

    /// Metrics counters.
    total_writes: AtomicU64,
    total_reads: AtomicU64,
    failed_writes: AtomicU64,

    /// Shared with the failure detector, which does the counting.
    node_failures: Arc<AtomicU64>,
}

impl QuorumEngine {
    pub fn new(
        replicas: Arc<Vec<ReplicaInfo>>,
        rx_liveness: watch::Receiver<LivenessSnapshot>,
        call_timeout: Duration,
        node_failures: Arc<AtomicU64>,
    ) -> Self {
        QuorumEngine {
            replicas,
            versions: VersionTable::new(),
            rx_liveness,
            call_timeout,
            total_writes: AtomicU64::new(0),
            total_reads: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            node_failures,
        }
    }

    /// Serves one client request to completion.
    pub async fn handle_request(&self, req: ApiRequest) -> ApiReply {
        match req {
            ApiRequest::Put { key, value } => {
                if key.is_empty() {
                    return ApiReply::Err {
                        reason: "EmptyKey".into(),
                    };
                }
                self.put(key, value).await
            }
            ApiRequest::Get { key } => {
                if key.is_empty() {
                    return ApiReply::Err {
                        reason: "EmptyKey".into(),
                    };
                }
                self.get(key).await
            }
            ApiRequest::Stats => self.stats(),
        }
    }

    /// Replicated write: issue a version, fan out to all currently-alive
    /// replicas concurrently, succeed iff a quorum of them acked.
    async fn put(&self, key: String, value: String) -> ApiReply {
        self.total_writes.fetch_add(1, Ordering::AcqRel);
        let version = self.versions.next_version(&key);
        let snapshot = self.rx_liveness.borrow().clone();
        let quorum = quorum_size(snapshot.alive_count() as usize);

        let calls = snapshot.alive_ids().map(|id| {
            let addr = self.replicas[id as usize].addr;
            let req = NodeRequest::Put {
                key: key.clone(),
                value: value.clone(),
                version,
            };
            async move {
                matches!(
                    protocol::call::<_, NodeReply>(addr, &req, self.call_timeout)
                        .await,
                    Ok(NodeReply::Ack)
                )
            }
        });
        let acks = join_all(calls).await.into_iter().filter(|ok| *ok).count();

        if acks >= quorum {
            pf_debug!("PUT '{}' v{}: {} acks >= quorum {}", key, version, acks, quorum);
            ApiReply::PutOk
        } else {
            self.failed_writes.fetch_add(1, Ordering::AcqRel);
            pf_warn!("PUT '{}' v{}: {} acks < quorum {}", key, version, acks, quorum);
            ApiReply::PutQuorumNotMet
        }
    }

    /// Quorum read serving a client `Get`.
    async fn get(&self, key: String) -> ApiReply {
        self.total_reads.fetch_add(1, Ordering::AcqRel);
        match self.quorum_read(&key).await {
            ReadOutcome::Latest(value, version) => ApiReply::Value {
                key,
                value,
                version,
            },
            ReadOutcome::NotFound => ApiReply::NotFound,
            ReadOutcome::QuorumNotMet => ApiReply::GetQuorumNotMet,
        }
    }

    /// Fans a `Get` out to all currently-alive replicas and aggregates. A
    /// `Null` reply counts toward the reached count but contributes no
    /// candidate value.
    async fn quorum_read(&self, key: &str) -> ReadOutcome {
        let snapshot = self.rx_liveness.borrow().clone();
        let quorum = quorum_size(snapshot.alive_count() as usize);

        let calls = snapshot.alive_ids().map(|id| {
            let addr = self.replicas[id as usize].addr;
            let req = NodeRequest::Get { key: key.into() };
            async move {
                match protocol::call::<_, NodeReply>(addr, &req, self.call_timeout)
                    .await
                {
                    Ok(NodeReply::Value { value, version, .. }) => {
                        Some(Some((id, value, version)))
                    }
                    Ok(NodeReply::Null) => Some(None),
                    _ => None,
                }
            }
        });
        let replies = join_all(calls).await;

        let reached = replies.iter().filter(|r| r.is_some()).count();
        if reached < quorum {
            return ReadOutcome::QuorumNotMet;
        }
        let candidates: Vec<_> = replies.into_iter().flatten().flatten().collect();
        match pick_latest(&candidates) {
            Some((_, value, version)) => {
                ReadOutcome::Latest(value.clone(), *version)
            }
            None => ReadOutcome::NotFound,
        }
    }

    /// Pushes the quorum-read latest value of every known key to a recovered
    /// replica. Keys whose quorum read or push fails are counted but not
    /// retried; the next recovery pass will cover them.
    pub async fn resync(&self, id: ReplicaId) -> ResyncOutcome {
        let addr = self.replicas[id as usize].addr;
        let mut outcome = ResyncOutcome {
            replica: id,
            keys_synced: 0,
            keys_failed: 0,
        };

        for key in self.versions.known_keys() {
            let (value, version) = match self.quorum_read(&key).await {
                ReadOutcome::Latest(value, version) => (value, version),
                _ => {
                    outcome.keys_failed += 1;
                    continue;
                }
            };
            let req = NodeRequest::SyncData {
                key: key.clone(),
                value,
                version,
            };
            match protocol::call::<_, NodeReply>(addr, &req, self.call_timeout)
                .await
            {
                Ok(NodeReply::Ack) => outcome.keys_synced += 1,
                _ => {
                    pf_warn!("resync push of '{}' to replica {} failed", key, id);
                    outcome.keys_failed += 1;
                }
            }
        }
        outcome
    }

    /// Metrics counters snapshot. Serving this does not itself count.
    fn stats(&self) -> ApiReply {
        ApiReply::Stats {
            total_writes: self.total_writes.load(Ordering::Acquire),
            total_reads: self.total_reads.load(Ordering::Acquire),
            failed_writes: self.failed_writes.load(Ordering::Acquire),
            node_failures: self.node_failures.load(Ordering::Acquire),
        }
    }
}
