//! Replica identity and liveness snapshot types.

use std::net::SocketAddr;

/// Replica ID type; replicas are indexed by position in the cluster list.
pub type ReplicaId = u8;

/// Static information about one replica in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    /// Human-readable replica name (e.g. "NodeA").
    pub name: String,

    /// Address of the replica's serving socket.
    pub addr: SocketAddr,
}

/// One consistent view of replica liveness, published by the failure detector
/// after each probe round. All replicas start out assumed ALIVE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessSnapshot {
    /// Aliveness flag per replica ID.
    flags: Vec<bool>,
}

impl LivenessSnapshot {
    /// Creates a snapshot of given cluster size with all replicas ALIVE.
    pub fn new_all_alive(population: u8) -> Self {
        LivenessSnapshot {
            flags: vec![true; population as usize],
        }
    }

    /// Cluster size, alive or not.
    pub fn population(&self) -> u8 {
        self.flags.len() as u8
    }

    /// True if the given replica was ALIVE as of this snapshot.
    pub fn is_alive(&self, id: ReplicaId) -> bool {
        self.flags.get(id as usize).copied().unwrap_or(false)
    }

    /// Updates one replica's flag.
    pub fn set(&mut self, id: ReplicaId, alive: bool) {
        if let Some(flag) = self.flags.get_mut(id as usize) {
            *flag = alive;
        }
    }

    /// Number of replicas ALIVE in this snapshot.
    pub fn alive_count(&self) -> u8 {
        self.flags.iter().filter(|f| **f).count() as u8
    }

    /// IDs of ALIVE replicas in increasing order.
    pub fn alive_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(id, f)| if *f { Some(id as ReplicaId) } else { None })
    }
}

#[cfg(test)]
mod liveness_tests {
    use super::*;

    #[test]
    fn snapshot_flags() {
        let mut snap = LivenessSnapshot::new_all_alive(3);
        assert_eq!(snap.population(), 3);
        assert_eq!(snap.alive_count(), 3);
        snap.set(1, false);
        assert!(snap.is_alive(0));
        assert!(!snap.is_alive(1));
        assert_eq!(snap.alive_count(), 2);
        assert_eq!(snap.alive_ids().collect::<Vec<_>>(), vec![0, 2]);
        // out-of-range IDs are never alive
        assert!(!snap.is_alive(7));
    }
}
