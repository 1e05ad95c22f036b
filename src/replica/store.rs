//! Replica-local versioned key-value store actor.
//!
//! A single applier task owns the in-memory state and the WAL file; every
//! command flows through its channel, which both serializes log appends and
//! makes the per-key version rule race-free within one replica.

use std::collections::HashMap;
use std::path::Path;

use crate::protocol::Version;
use crate::replica::loader;
use crate::replica::wal::{WalEntry, WalLog};
use crate::utils::KvError;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A stored value stamped with its per-key write version.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub value: String,
    pub version: Version,
}

/// In-memory state: key -> versioned record.
pub(crate) type State = HashMap<String, VersionedRecord>;

/// Command to the store applier.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StoreCommand {
    /// Versioned write (replicate or sync push; both apply the same rule).
    Put {
        key: String,
        value: String,
        version: Version,
    },

    /// Fetch of a key's stored record.
    Get { key: String },
}

/// Result returned by the store applier.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StoreResult {
    /// `accepted` is false if the write was discarded as stale. Either way
    /// the protocol-level reply is an Ack.
    Put { accepted: bool },

    /// `Some(record)` if the key is stored, else `None`.
    Get { record: Option<VersionedRecord> },
}

/// Version-based conflict resolution rule: an incoming write wins iff its
/// version is strictly greater than the stored one (or no record exists).
pub(crate) fn outranks(state: &State, key: &str, version: Version) -> bool {
    match state.get(key) {
        Some(stored) => version > stored.version,
        None => true,
    }
}

/// Applies the conflict resolution rule, replacing the stored record if the
/// incoming write wins. Returns true iff the record was replaced.
pub(crate) fn apply_record(
    state: &mut State,
    key: &str,
    value: &str,
    version: Version,
) -> bool {
    if !outranks(state, key, version) {
        return false;
    }
    state.insert(
        key.into(),
        VersionedRecord {
            value: value.into(),
            version,
        },
    );
    true
}

/// Handle to the store applier task.
pub struct StoreHub {
    /// Sender side of the command channel.
    tx_cmd: mpsc::UnboundedSender<(StoreCommand, oneshot::Sender<StoreResult>)>,

    /// Join handle of the applier task.
    _applier_handle: JoinHandle<()>,
}

impl StoreHub {
    /// Replays the WAL at `wal_path` (entries applied under the same version
    /// rule as live writes, so out-of-order or duplicated lines cannot
    /// regress a key), seeds from `seed_path` if the store is still empty
    /// afterwards, then spawns the applier task.
    pub async fn new_and_setup(
        wal_path: &Path,
        seed_path: &Path,
    ) -> Result<Self, KvError> {
        let (wal, entries) = WalLog::open(wal_path).await?;

        let mut state = State::new();
        for entry in entries {
            apply_record(&mut state, &entry.key, &entry.value, entry.version);
        }

        if state.is_empty() {
            // one-time initial load; seed records are not re-persisted as
            // they are not accepted writes
            let seeded = loader::load_seed(seed_path).await?;
            let count = seeded.len();
            for (key, value) in seeded {
                apply_record(&mut state, &key, &value, 1);
            }
            if count > 0 {
                pf_info!("seeded {} records from '{}'", count, seed_path.display());
            }
        } else {
            pf_info!("restored {} records from disk", state.len());
        }

        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let applier_handle =
            tokio::spawn(Self::applier_task(state, wal, rx_cmd));

        Ok(StoreHub {
            tx_cmd,
            _applier_handle: applier_handle,
        })
    }

    /// Submits a command and waits for its result. Returns `Err` if the
    /// applier dropped the reply (e.g. on a persistence failure), in which
    /// case the caller should drop the connection without acknowledging.
    pub async fn submit_cmd(
        &self,
        cmd: StoreCommand,
    ) -> Result<StoreResult, KvError> {
        let (tx_result, rx_result) = oneshot::channel();
        self.tx_cmd.send((cmd, tx_result))?;
        Ok(rx_result.await?)
    }

    /// Applier task function: owns the state map and the WAL.
    async fn applier_task(
        mut state: State,
        mut wal: WalLog,
        mut rx_cmd: mpsc::UnboundedReceiver<(
            StoreCommand,
            oneshot::Sender<StoreResult>,
        )>,
    ) {
        pf_debug!("store applier task spawned");

        while let Some((cmd, tx_result)) = rx_cmd.recv().await {
            match cmd {
                StoreCommand::Put {
                    key,
                    value,
                    version,
                } => {
                    // log before applying in memory: an unlogged write must
                    // stay invisible so a later push of the same version is
                    // not discarded as stale
                    let accepted = outranks(&state, &key, version);
                    if accepted {
                        let entry = WalEntry {
                            key: key.clone(),
                            value: value.clone(),
                            version,
                        };
                        if let Err(e) = wal.append(&entry, true).await {
                            // dropping tx_result drops the connection, so
                            // the write is never acknowledged
                            pf_error!(
                                "disk write error for key '{}': {}",
                                key,
                                e
                            );
                            continue;
                        }
                        apply_record(&mut state, &key, &value, version);
                        pf_debug!("PUT '{}' v{} (updated)", key, version);
                    } else {
                        pf_debug!("PUT '{}' v{} (ignored, stale)", key, version);
                    }
                    let _ = tx_result.send(StoreResult::Put { accepted });
                }
                StoreCommand::Get { key } => {
                    let record = state.get(&key).cloned();
                    let _ = tx_result.send(StoreResult::Get { record });
                }
            }
        }

        pf_debug!("store applier task exited");
    }
}
