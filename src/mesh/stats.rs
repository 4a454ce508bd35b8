//! Statistics for mesh messaging

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::identity::LocalIdentity;

/// Live counters shared by the discovery and messaging tasks
#[derive(Debug, Default)]
pub struct MeshStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    peers_discovered: AtomicU64,
    peers_evicted: AtomicU64,
    announcements_sent: AtomicU64,
    announcements_dropped: AtomicU64,
    handler_errors: AtomicU64,
}

impl MeshStats {
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_discovered(&self) {
        self.peers_discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peers_evicted(&self, count: usize) {
        self.peers_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_announcement_sent(&self) {
        self.announcements_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_announcement_dropped(&self) {
        self.announcements_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into a snapshot
    pub fn snapshot(&self, identity: &LocalIdentity, peer_count: usize) -> StatsSnapshot {
        StatsSnapshot {
            mesh_id: identity.mesh_id.clone(),
            agent_role: identity.agent_role.clone(),
            device_name: identity.device_name.clone(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            peers_discovered: self.peers_discovered.load(Ordering::Relaxed),
            peers_evicted: self.peers_evicted.load(Ordering::Relaxed),
            announcements_sent: self.announcements_sent.load(Ordering::Relaxed),
            announcements_dropped: self.announcements_dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            peer_count,
        }
    }
}

/// Point-in-time copy of the mesh counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub mesh_id: String,
    pub agent_role: String,
    pub device_name: String,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub peers_discovered: u64,
    pub peers_evicted: u64,
    pub announcements_sent: u64,
    pub announcements_dropped: u64,
    pub handler_errors: u64,
    pub peer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            mesh_id: "abcd1234".to_string(),
            agent_role: "tester".to_string(),
            device_name: "box".to_string(),
            hostname: "box.local".to_string(),
        }
    }

    #[test]
    fn test_mesh_stats_default() {
        let snapshot = MeshStats::default().snapshot(&identity(), 0);
        assert_eq!(snapshot.messages_sent, 0);
        assert_eq!(snapshot.messages_received, 0);
        assert_eq!(snapshot.peers_discovered, 0);
        assert_eq!(snapshot.peer_count, 0);
        assert_eq!(snapshot.mesh_id, "abcd1234");
    }

    #[test]
    fn test_mesh_stats_record() {
        let stats = MeshStats::default();
        stats.record_sent();
        stats.record_sent();
        stats.record_received();
        stats.record_dropped();
        stats.record_peer_discovered();
        stats.record_peers_evicted(3);

        let snapshot = stats.snapshot(&identity(), 2);
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.peers_discovered, 1);
        assert_eq!(snapshot.peers_evicted, 3);
        assert_eq!(snapshot.peer_count, 2);
    }
}
