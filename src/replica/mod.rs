//! Storage replica node: versioned store, durable log, and serving loop.

mod loader;
mod store;
mod wal;

pub use store::{StoreCommand, StoreHub, StoreResult, VersionedRecord};
pub use wal::{WalEntry, WalLog};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::{self, NodeReply, NodeRequest};
use crate::utils::KvError;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReplicaConfig {
    /// Path to backing WAL file; empty means derive from the replica name.
    pub backer_path: String,

    /// Path to the seed dataset consulted on an empty first boot.
    pub seed_path: String,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            backer_path: "".into(),
            seed_path: "user_sessions.txt".into(),
        }
    }
}

/// Replica server node.
pub struct Replica {
    /// My replica name (e.g. "NodeA").
    name: String,

    /// Listener for inbound coordinator/probe connections.
    listener: TcpListener,

    /// Store applier handle, shared with connection tasks.
    store: Arc<StoreHub>,

    /// Serving flag for fault injection. While false, inbound requests other
    /// than fault-admin ones are dropped without a reply.
    serving: Arc<AtomicBool>,
}

impl Replica {
    /// Sets up the store (WAL replay + optional seeding) and binds the
    /// listening socket.
    pub async fn new_and_setup(
        name: &str,
        addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, KvError> {
        let config = parsed_config!(config_str => ReplicaConfig;
                                    backer_path, seed_path)?;

        let backer_path = if config.backer_path.is_empty() {
            std::env::temp_dir().join(format!("quorumkv.{}.wal", name))
        } else {
            PathBuf::from(&config.backer_path)
        };
        let seed_path = PathBuf::from(&config.seed_path);

        let store =
            Arc::new(StoreHub::new_and_setup(&backer_path, &seed_path).await?);
        let listener = TcpListener::bind(addr).await?;

        Ok(Replica {
            name: name.into(),
            listener,
            store,
            serving: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Returns the actually bound listening address.
    pub fn local_addr(&self) -> Result<SocketAddr, KvError> {
        Ok(self.listener.local_addr()?)
    }

    /// Main serving loop; runs until the termination signal fires.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), KvError> {
        pf_info!("listening on '{}'", self.listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((conn, _addr)) => {
                            tokio::spawn(Self::conn_task(
                                conn,
                                self.store.clone(),
                                self.serving.clone(),
                            ));
                        },
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                        }
                    }
                },

                _ = rx_term.changed() => {
                    pf_warn!("replica '{}' caught termination signal", self.name);
                    return Ok(());
                }
            }
        }
    }

    /// Per-connection task: one request, one reply, close. Returning without
    /// a reply (on a dropped request or persistence failure) surfaces to the
    /// caller as a call failure.
    async fn conn_task(
        mut conn: TcpStream,
        store: Arc<StoreHub>,
        serving: Arc<AtomicBool>,
    ) {
        let req: NodeRequest = match protocol::recv_msg(&mut conn).await {
            Ok(req) => req,
            Err(e) => {
                pf_debug!("error reading request: {}", e);
                return;
            }
        };

        // fault-admin commands are always served so a killed replica can be
        // revived remotely
        let reply = match req {
            NodeRequest::Kill => {
                serving.store(false, Ordering::SeqCst);
                pf_warn!("KILLED (stops serving requests)");
                NodeReply::AckKill
            }
            NodeRequest::Revive => {
                serving.store(true, Ordering::SeqCst);
                pf_warn!("REVIVED");
                NodeReply::AckRevive
            }
            _ if !serving.load(Ordering::SeqCst) => {
                return; // simulate a crash by dropping the connection
            }
            NodeRequest::Put {
                key,
                value,
                version,
            }
            | NodeRequest::SyncData {
                key,
                value,
                version,
            } => {
                match store
                    .submit_cmd(StoreCommand::Put {
                        key,
                        value,
                        version,
                    })
                    .await
                {
                    Ok(StoreResult::Put { .. }) => NodeReply::Ack,
                    Ok(result) => {
                        pf_error!("unexpected store result {:?}", result);
                        return;
                    }
                    Err(_) => return, // write not durable; do not ack
                }
            }
            NodeRequest::Get { key } => {
                match store
                    .submit_cmd(StoreCommand::Get { key: key.clone() })
                    .await
                {
                    Ok(StoreResult::Get {
                        record: Some(record),
                    }) => NodeReply::Value {
                        key,
                        value: record.value,
                        version: record.version,
                    },
                    Ok(StoreResult::Get { record: None }) => NodeReply::Null,
                    Ok(result) => {
                        pf_error!("unexpected store result {:?}", result);
                        return;
                    }
                    Err(e) => {
                        pf_error!("error fetching key '{}': {}", key, e);
                        return;
                    }
                }
            }
            NodeRequest::Heartbeat => NodeReply::Alive,
            NodeRequest::SyncRequest => NodeReply::SyncAck,
        };

        if let Err(e) = protocol::send_msg(&mut conn, &reply).await {
            pf_debug!("error sending reply: {}", e);
        }
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use crate::protocol::call;
    use tokio::fs;
    use tokio::time::Duration;

    const CALL_TIMEOUT: Duration = Duration::from_millis(500);

    async fn start_replica(name: &str) -> Result<SocketAddr, KvError> {
        let wal_path =
            std::env::temp_dir().join(format!("quorumkv.{}.wal", name));
        if fs::try_exists(&wal_path).await? {
            fs::remove_file(&wal_path).await?;
        }
        let mut replica =
            Replica::new_and_setup(name, "127.0.0.1:0".parse()?, None).await?;
        let addr = replica.local_addr()?;
        let (_tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            let _tx_term = _tx_term; // keep the replica running
            replica.run(rx_term).await
        });
        Ok(addr)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serve_put_get() -> Result<(), KvError> {
        let addr = start_replica("test-serve-0").await?;

        let reply: NodeReply = call(
            addr,
            &NodeRequest::Put {
                key: "k".into(),
                value: "v".into(),
                version: 1,
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, NodeReply::Ack);

        let reply: NodeReply =
            call(addr, &NodeRequest::Get { key: "k".into() }, CALL_TIMEOUT)
                .await?;
        assert_eq!(
            reply,
            NodeReply::Value {
                key: "k".into(),
                value: "v".into(),
                version: 1,
            }
        );

        let reply: NodeReply = call(
            addr,
            &NodeRequest::Get {
                key: "nonexist".into(),
            },
            CALL_TIMEOUT,
        )
        .await?;
        assert_eq!(reply, NodeReply::Null);

        let reply: NodeReply =
            call(addr, &NodeRequest::Heartbeat, CALL_TIMEOUT).await?;
        assert_eq!(reply, NodeReply::Alive);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_then_revive() -> Result<(), KvError> {
        let addr = start_replica("test-serve-1").await?;

        let reply: NodeReply =
            call(addr, &NodeRequest::Kill, CALL_TIMEOUT).await?;
        assert_eq!(reply, NodeReply::AckKill);

        // while killed, probes and reads get dropped without a reply
        let probed: Result<NodeReply, _> =
            call(addr, &NodeRequest::Heartbeat, CALL_TIMEOUT).await;
        assert!(probed.is_err());

        let reply: NodeReply =
            call(addr, &NodeRequest::Revive, CALL_TIMEOUT).await?;
        assert_eq!(reply, NodeReply::AckRevive);

        let reply: NodeReply =
            call(addr, &NodeRequest::Heartbeat, CALL_TIMEOUT).await?;
        assert_eq!(reply, NodeReply::Alive);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_sync_push_ignored() -> Result<(), KvError> {
        let addr = start_replica("test-serve-2").await?;

        for (version, value) in [(2, "v2"), (1, "v1")] {
            let reply: NodeReply = call(
                addr,
                &NodeRequest::SyncData {
                    key: "k".into(),
                    value: value.into(),
                    version,
                },
                CALL_TIMEOUT,
            )
            .await?;
            assert_eq!(reply, NodeReply::Ack);
        }

        let reply: NodeReply =
            call(addr, &NodeRequest::Get { key: "k".into() }, CALL_TIMEOUT)
                .await?;
        assert_eq!(
            reply,
            NodeReply::Value {
                key: "k".into(),
                value: "v2".into(),
                version: 2,
            }
        );
        Ok(())
    }
}
