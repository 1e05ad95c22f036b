//! Failure detector: periodic concurrent heartbeat probing of all replicas.
//!
//! Each probe round sends every replica a `Heartbeat` concurrently, bounded by
//! a per-call time limit, then publishes one consistent liveness snapshot
//! through a `watch` channel. A replica that comes back from DEAD is enqueued
//! for resynchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::coordinator::liveness::{LivenessSnapshot, ReplicaId, ReplicaInfo};
use crate::protocol::{self, NodeReply, NodeRequest};
use crate::utils::KvError;

use futures::future::join_all;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, MissedTickBehavior};

/// Failure detector module.
pub struct FailureDetector {
    /// Cluster membership, shared with the engine.
    replicas: Arc<Vec<ReplicaInfo>>,

    /// Interval between probe rounds.
    probe_interval: Duration,

    /// Time limit on each individual probe (connect + exchange).
    probe_timeout: Duration,

    /// Publisher side of the liveness snapshot channel.
    tx_liveness: watch::Sender<LivenessSnapshot>,

    /// Resync trigger channel to the coordinator's resync task.
    tx_resync: mpsc::UnboundedSender<ReplicaId>,

    /// ALIVE -> DEAD transition counter, shared with the metrics snapshot.
    node_failures: Arc<AtomicU64>,
}

impl FailureDetector {
    pub fn new(
        replicas: Arc<Vec<ReplicaInfo>>,
        probe_interval: Duration,
        probe_timeout: Duration,
        tx_liveness: watch::Sender<LivenessSnapshot>,
        tx_resync: mpsc::UnboundedSender<ReplicaId>,
        node_failures: Arc<AtomicU64>,
    ) -> Self {
        FailureDetector {
            replicas,
            probe_interval,
            probe_timeout,
            tx_liveness,
            tx_resync,
            node_failures,
        }
    }

    /// Probes all replicas concurrently; returns one aliveness flag per
    /// replica in ID order.
    async fn probe_round(&self) -> Vec<bool> {
        let probes = self.replicas.iter().map(|info| async {
            matches!(
                protocol::call::<_, NodeReply>(
                    info.addr,
                    &NodeRequest::Heartbeat,
                    self.probe_timeout,
                )
                .await,
                Ok(NodeReply::Alive)
            )
        });
        join_all(probes).await
    }

    /// Detector loop; runs until the termination signal fires.
    pub async fn run(
        self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), KvError> {
        let population = self.replicas.len() as u8;
        let mut snapshot = LivenessSnapshot::new_all_alive(population);
        let mut last_contact: Vec<Option<Instant>> =
            vec![None; population as usize];

        let mut interval = time::interval(self.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        pf_debug!(
            "failure detector started, probing {} replicas every {} ms",
            population,
            self.probe_interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let observed = self.probe_round().await;
                    let mut revived = vec![];
                    for (id, alive) in observed.into_iter().enumerate() {
                        let id = id as ReplicaId;
                        if alive {
                            last_contact[id as usize] = Some(Instant::now());
                        }
                        let was_alive = snapshot.is_alive(id);
                        if was_alive && !alive {
                            // a single missed probe flips the state
                            self.node_failures.fetch_add(1, Ordering::AcqRel);
                            pf_warn!(
                                "replica {} '{}' detected DEAD (last contact {})",
                                id,
                                self.replicas[id as usize].name,
                                match last_contact[id as usize] {
                                    Some(at) => format!(
                                        "{} ms ago",
                                        at.elapsed().as_millis()
                                    ),
                                    None => "never".into(),
                                }
                            );
                        } else if !was_alive && alive {
                            pf_info!(
                                "replica {} '{}' back ALIVE, queueing resync",
                                id,
                                self.replicas[id as usize].name
                            );
                            revived.push(id);
                        }
                        snapshot.set(id, alive);
                    }
                    // publish the round's snapshot before queueing resyncs
                    // so the resync pass quorum-reads against this round's
                    // view, not the previous one
                    self.tx_liveness.send_replace(snapshot.clone());
                    for id in revived {
                        self.tx_resync.send(id)?;
                    }
                },

                _ = rx_term.changed() => {
                    pf_warn!("failure detector caught termination signal");
                    return Ok(());
                }
            }
        }
    }
}
