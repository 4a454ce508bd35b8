//! Peer table
//!
//! In-memory directory of known mesh peers keyed by mesh identity. The
//! discovery listener is the only writer of new records; the reaper is the
//! only path that removes them. A record stays bound to the signing key it
//! was inserted with until it is removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;
use std::time::Duration;

use super::crypto::{PublicKeyBytes, VerifyingKeyBytes};

/// Unique identifier for a mesh peer
pub type PeerId = String;

/// Information about a mesh peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshPeer {
    /// Peer mesh identity
    pub id: PeerId,

    /// Peer hostname
    pub hostname: String,

    /// Peer IP address
    pub ip_address: IpAddr,

    /// Peer data port
    pub port: u16,

    /// Peer's X25519 public key
    pub public_key: PublicKeyBytes,

    /// Peer's Ed25519 verifying key
    pub signing_key: VerifyingKeyBytes,

    /// Peer's role
    pub agent_role: String,

    /// Device name
    pub device_name: String,

    /// Last seen timestamp
    pub last_seen: DateTime<Utc>,
}

impl MeshPeer {
    /// Create a new mesh peer, last seen now
    pub fn new(
        id: impl Into<PeerId>,
        hostname: impl Into<String>,
        ip_address: IpAddr,
        port: u16,
        public_key: PublicKeyBytes,
    ) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            ip_address,
            port,
            public_key,
            signing_key: [0u8; 32],
            agent_role: "unknown".to_string(),
            device_name: String::new(),
            last_seen: Utc::now(),
        }
    }

    /// Set the agent role
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = role.into();
        self
    }

    /// Set the device name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the signing key the peer announces with
    pub fn with_signing_key(mut self, key: VerifyingKeyBytes) -> Self {
        self.signing_key = key;
        self
    }

    /// Socket address of the peer's data listener
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }

    /// Check whether the peer has announced itself within `timeout` of `now`
    pub fn is_alive_at(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.last_seen);
        elapsed.to_std().unwrap_or(Duration::ZERO) <= timeout
    }

    /// Check if peer is still alive
    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.is_alive_at(timeout, Utc::now())
    }
}

/// Result of recording an announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First announcement from this identity
    Inserted,
    /// Known identity, fields refreshed in place
    Updated,
    /// Known identity under a different signing key; record left untouched
    SigningKeyMismatch,
}

#[derive(Debug)]
struct PeerSlot {
    peer: MeshPeer,
    order: u64,
}

#[derive(Debug, Default)]
struct PeerTableInner {
    peers: HashMap<PeerId, PeerSlot>,
    next_order: u64,
}

/// Thread-safe table of known peers
#[derive(Debug, Default)]
pub struct PeerTable {
    inner: RwLock<PeerTableInner>,
}

impl PeerTable {
    /// Create new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a peer. An existing record keeps its position and is
    /// overwritten in place, unless `peer` carries a different signing key.
    pub fn upsert(&self, peer: MeshPeer) -> Upsert {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(slot) = inner.peers.get_mut(&peer.id) {
            if slot.peer.signing_key != peer.signing_key {
                return Upsert::SigningKeyMismatch;
            }
            slot.peer = peer;
            return Upsert::Updated;
        }

        let order = inner.next_order;
        inner.next_order += 1;
        inner.peers.insert(peer.id.clone(), PeerSlot { peer, order });
        Upsert::Inserted
    }

    /// Get a peer by mesh identity
    pub fn get(&self, peer_id: &str) -> Option<MeshPeer> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.peers.get(peer_id).map(|slot| slot.peer.clone())
    }

    /// Snapshot of all peers, optionally filtered by exact role, in
    /// insertion order
    pub fn snapshot(&self, role: Option<&str>) -> Vec<MeshPeer> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        let mut slots: Vec<&PeerSlot> = inner
            .peers
            .values()
            .filter(|slot| role.map_or(true, |r| slot.peer.agent_role == r))
            .collect();
        slots.sort_by_key(|slot| slot.order);

        slots.into_iter().map(|slot| slot.peer.clone()).collect()
    }

    /// Remove every peer not seen within `timeout` of `now`, returning the
    /// evicted records
    pub fn evict_stale_at(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<MeshPeer> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let stale: Vec<PeerId> = inner
            .peers
            .values()
            .filter(|slot| !slot.peer.is_alive_at(timeout, now))
            .map(|slot| slot.peer.id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| inner.peers.remove(id))
            .map(|slot| slot.peer)
            .collect()
    }

    /// Remove every peer not seen within `timeout`
    pub fn evict_stale(&self, timeout: Duration) -> Vec<MeshPeer> {
        self.evict_stale_at(timeout, Utc::now())
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
