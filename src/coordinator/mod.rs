//! Coordinator node: client-facing API server wiring together the quorum
//! engine, the failure detector, and the background resync task.

mod detector;
mod engine;
mod liveness;

pub use engine::{quorum_size, QuorumEngine, ResyncOutcome};
pub use liveness::{LivenessSnapshot, ReplicaId, ReplicaInfo};

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::protocol::{self, ApiReply, ApiRequest};
use crate::utils::KvError;

use detector::FailureDetector;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoordinatorConfig {
    /// Interval between failure detector probe rounds, in milliseconds.
    pub probe_interval_ms: u64,

    /// Time limit on each heartbeat probe, in milliseconds.
    pub probe_timeout_ms: u64,

    /// Time limit on each replica data call, in milliseconds.
    pub call_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            probe_interval_ms: 2000,
            probe_timeout_ms: 1000,
            call_timeout_ms: 1000,
        }
    }
}

/// Coordinator server node.
pub struct Coordinator {
    /// Listener for inbound client API connections.
    listener: TcpListener,

    /// Quorum engine, shared with connection tasks and the resync task.
    engine: Arc<QuorumEngine>,

    /// Failure detector, moved out when `run` spawns it.
    detector: Option<FailureDetector>,

    /// Receiver side of the detector's resync trigger channel.
    rx_resync: Option<mpsc::UnboundedReceiver<ReplicaId>>,
}

impl Coordinator {
    /// Builds the engine and detector and binds the API socket. `replicas`
    /// is the fixed cluster membership, indexed by replica ID.
    pub async fn new_and_setup(
        api_addr: SocketAddr,
        replicas: Vec<ReplicaInfo>,
        config_str: Option<&str>,
    ) -> Result<Self, KvError> {
        if replicas.is_empty() {
            return logged_err!("empty replica cluster membership");
        }
        if replicas.len() > ReplicaId::MAX as usize {
            return logged_err!("too many replicas: {}", replicas.len());
        }
        let config = parsed_config!(config_str => CoordinatorConfig;
                                    probe_interval_ms, probe_timeout_ms,
                                    call_timeout_ms)?;

        let replicas = Arc::new(replicas);
        let population = replicas.len() as u8;
        let (tx_liveness, rx_liveness) =
            watch::channel(LivenessSnapshot::new_all_alive(population));
        let (tx_resync, rx_resync) = mpsc::unbounded_channel();
        let node_failures = Arc::new(AtomicU64::new(0));

        let engine = Arc::new(QuorumEngine::new(
            replicas.clone(),
            rx_liveness,
            Duration::from_millis(config.call_timeout_ms),
            node_failures.clone(),
        ));
        let detector = FailureDetector::new(
            replicas,
            Duration::from_millis(config.probe_interval_ms),
            Duration::from_millis(config.probe_timeout_ms),
            tx_liveness,
            tx_resync,
            node_failures,
        );

        let listener = TcpListener::bind(api_addr).await?;
        Ok(Coordinator {
            listener,
            engine,
            detector: Some(detector),
            rx_resync: Some(rx_resync),
        })
    }

    /// Returns the actually bound API address.
    pub fn local_addr(&self) -> Result<SocketAddr, KvError> {
        Ok(self.listener.local_addr()?)
    }

    /// Resync task function: serves queued recoveries one at a time and
    /// reports each outcome.
    async fn resync_task(
        engine: Arc<QuorumEngine>,
        mut rx_resync: mpsc::UnboundedReceiver<ReplicaId>,
        tx_outcome: mpsc::UnboundedSender<ResyncOutcome>,
    ) {
        while let Some(id) = rx_resync.recv().await {
            let outcome = engine.resync(id).await;
            if tx_outcome.send(outcome).is_err() {
                break;
            }
        }
    }

    /// Main serving loop; runs until the termination signal fires.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), KvError> {
        pf_info!("serving API requests on '{}'", self.listener.local_addr()?);

        let detector = match self.detector.take() {
            Some(detector) => detector,
            None => return logged_err!("coordinator run() called twice"),
        };
        let rx_resync = match self.rx_resync.take() {
            Some(rx_resync) => rx_resync,
            None => return logged_err!("coordinator run() called twice"),
        };
        tokio::spawn(detector.run(rx_term.clone()));

        let (tx_outcome, mut rx_outcome) = mpsc::unbounded_channel();
        tokio::spawn(Self::resync_task(
            self.engine.clone(),
            rx_resync,
            tx_outcome,
        ));

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((conn, _addr)) => {
                            tokio::spawn(Self::conn_task(
                                conn,
                                self.engine.clone(),
                            ));
                        },
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                        }
                    }
                },

                outcome = rx_outcome.recv() => {
                    if let Some(outcome) = outcome {
                        pf_info!(
                            "resync of replica {} done: {} synced, {} failed",
                            outcome.replica,
                            outcome.keys_synced,
                            outcome.keys_failed
                        );
                    }
                },

                _ = rx_term.changed() => {
                    pf_warn!("coordinator caught termination signal");
                    return Ok(());
                }
            }
        }
    }

    /// Per-connection task: one request, one reply, close.
    async fn conn_task(mut conn: TcpStream, engine: Arc<QuorumEngine>) {
        let req: ApiRequest = match protocol::recv_msg(&mut conn).await {
            Ok(req) => req,
            Err(e) => {
                pf_debug!("error reading request: {}", e);
                return;
            }
        };
        let reply: ApiReply = engine.handle_request(req).await;
        if let Err(e) = protocol::send_msg(&mut conn, &reply).await {
            pf_debug!("error sending reply: {}", e);
        }
    }
}

#[cfg(test)]
mod coordinator_tests {
    use super::*;
    use crate::protocol::{call, NodeReply, NodeRequest};
    use crate::replica::Replica;
    use tokio::fs;
    use tokio::time;

    const CALL_TIMEOUT: Duration = Duration::from_millis(500);

    // fast timings so detector transitions settle within the test
    const TEST_CONFIG: &str = "probe_interval_ms = 100\n\
                               probe_timeout_ms = 200\n\
                               call_timeout_ms = 200";

    async fn start_replica(name: &str) -> Result<SocketAddr, KvError> {
        let wal_path =
            std::env::temp_dir().join(format!("quorumkv.{}.wal", name));
        if fs::try_exists(&wal_path).await? {
            fs::remove_file(&wal_path).await?;
        }
        let mut replica =
            Replica::new_and_setup(name, "127.0.0.1:0".parse()?, None).await?;
        let addr = replica.local_addr()?;
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            let _tx_term = tx_term;
            replica.run(rx_term).await
        });
        Ok(addr)
    }

    async fn start_cluster(
        prefix: &str,
    ) -> Result<(SocketAddr, Vec<SocketAddr>), KvError> {
        let mut replicas = vec![];
        let mut addrs = vec![];
        for suffix in ["a", "b", "c"] {
            let name = format!("test-{}-{}", prefix, suffix);
            let addr = start_replica(&name).await?;
            replicas.push(ReplicaInfo { name, addr });
            addrs.push(addr);
        }
        let mut coordinator = Coordinator::new_and_setup(
            "127.0.0.1:0".parse()?,
            replicas,
            Some(TEST_CONFIG),
        )
        .await?;
        let api_addr = coordinator.local_addr()?;
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            let _tx_term = tx_term;
            coordinator.run(rx_term).await
        });
        Ok((api_addr, addrs))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn write_then_read() -> Result<(), KvError> {
        let (api_addr, _) = start_cluster("e2e0").await?;

        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Put {
                key: "session:user001".into(),
                value: "{\"cart\": 3}".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, ApiReply::PutOk);

        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Get {
                key: "session:user001".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(
            reply,
            ApiReply::Value {
                key: "session:user001".into(),
                value: "{\"cart\": 3}".into(),
                version: 1,
            }
        );

        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Get {
                key: "nonexist".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, ApiReply::NotFound);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_key_rejected() -> Result<(), KvError> {
        let (api_addr, _) = start_cluster("e2e1").await?;
        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Put {
                key: "".into(),
                value: "v".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(
            reply,
            ApiReply::Err {
                reason: "EmptyKey".into()
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_dead_replica_still_serves() -> Result<(), KvError> {
        let (api_addr, replica_addrs) = start_cluster("e2e2").await?;

        let reply: NodeReply =
            call(replica_addrs[2], &NodeRequest::Kill, CALL_TIMEOUT).await?;
        assert_eq!(reply, NodeReply::AckKill);
        // let the detector flip it DEAD
        time::sleep(Duration::from_millis(600)).await;

        // quorum is now 2 of 2 alive replicas
        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Put {
                key: "k".into(),
                value: "v".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, ApiReply::PutOk);

        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Get { key: "k".into() },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(
            reply,
            ApiReply::Value {
                key: "k".into(),
                value: "v".into(),
                version: 1,
            }
        );

        let reply: ApiReply =
            call(api_addr, &ApiRequest::Stats, CALL_TIMEOUT).await?;
        match reply {
            ApiReply::Stats {
                total_writes,
                total_reads,
                failed_writes,
                node_failures,
            } => {
                assert_eq!(total_writes, 1);
                assert_eq!(total_reads, 1);
                assert_eq!(failed_writes, 0);
                assert_eq!(node_failures, 1);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_alive_replica_still_serves() -> Result<(), KvError> {
        let (api_addr, replica_addrs) = start_cluster("e2e4").await?;

        // kill two of three; quorum drops to 1 of 1 alive
        for addr in &replica_addrs[1..] {
            let reply: NodeReply =
                call(*addr, &NodeRequest::Kill, CALL_TIMEOUT).await?;
            assert_eq!(reply, NodeReply::AckKill);
        }
        time::sleep(Duration::from_millis(600)).await;

        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Put {
                key: "k".into(),
                value: "v".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, ApiReply::PutOk);

        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Get { key: "k".into() },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(
            reply,
            ApiReply::Value {
                key: "k".into(),
                value: "v".into(),
                version: 1,
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_dead_fails_quorum() -> Result<(), KvError> {
        let (api_addr, replica_addrs) = start_cluster("e2e5").await?;

        for addr in &replica_addrs {
            let reply: NodeReply =
                call(*addr, &NodeRequest::Kill, CALL_TIMEOUT).await?;
            assert_eq!(reply, NodeReply::AckKill);
        }

        // no replica can ack, so the write fails quorum whether or not the
        // detector has flipped them DEAD yet
        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Put {
                key: "k".into(),
                value: "v".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, ApiReply::PutQuorumNotMet);

        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Get { key: "k".into() },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, ApiReply::GetQuorumNotMet);

        let reply: ApiReply =
            call(api_addr, &ApiRequest::Stats, CALL_TIMEOUT).await?;
        match reply {
            ApiReply::Stats {
                total_writes,
                total_reads,
                failed_writes,
                ..
            } => {
                assert_eq!(total_writes, 1);
                assert_eq!(total_reads, 1);
                assert_eq!(failed_writes, 1);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn revived_replica_gets_resynced() -> Result<(), KvError> {
        let (api_addr, replica_addrs) = start_cluster("e2e3").await?;

        let reply: NodeReply =
            call(replica_addrs[1], &NodeRequest::Kill, CALL_TIMEOUT).await?;
        assert_eq!(reply, NodeReply::AckKill);
        time::sleep(Duration::from_millis(600)).await;

        // written while replica 1 is down
        let reply: ApiReply = call(
            api_addr,
            &ApiRequest::Put {
                key: "k".into(),
                value: "written-while-down".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, ApiReply::PutOk);

        let reply: NodeReply =
            call(replica_addrs[1], &NodeRequest::Revive, CALL_TIMEOUT).await?;
        assert_eq!(reply, NodeReply::AckRevive);
        // let the detector flip it ALIVE and the resync pass complete
        time::sleep(Duration::from_millis(800)).await;

        // the revived replica must now hold the key, checked directly
        let reply: NodeReply = call(
            replica_addrs[1],
            &NodeRequest::Get { key: "k".into() },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(
            reply,
            NodeReply::Value {
                key: "k".into(),
                value: "written-while-down".into(),
                version: 1,
            }
        );
        Ok(())
    }
}
