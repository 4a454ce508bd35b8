//! Mesh Peer Discovery Module
//!
//! Presence announcements are broadcast on the discovery port every
//! broadcast interval. Each announcement is the protocol magic followed by
//! a MessagePack map holding the encoded announcement body and an Ed25519
//! signature over exactly those bytes. The body carries the sender's
//! identity, both public keys and its data port. The listener upserts the
//! [`PeerTable`] from announcements and the reaper evicts peers that stop
//! announcing.
//!
//! A mesh identity is bound to the signing key it was first seen with. An
//! announcement for a known identity under a different signing key is
//! dropped until the old record has been reaped.
//!
//! # Tasks
//!
//! - **Broadcaster**: sends the local announcement on every tick
//! - **Listener**: validates incoming packets and refreshes peers
//! - **Reaper**: drops peers whose last announcement is older than the
//!   peer timeout
//!
//! Malformed or foreign packets are counted and discarded; none of these
//! tasks ever returns an error.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use super::config::MeshConfig;
use super::crypto::{verify_signature, KeyManager, PublicKeyBytes, SignatureBytes, VerifyingKeyBytes};
use super::error::{MeshError, MeshResult};
use super::identity::LocalIdentity;
use super::peers::{MeshPeer, PeerTable, Upsert};
use super::stats::MeshStats;

/// Prefix of every discovery announcement
pub const MESH_MAGIC: &[u8] = b"AGENTMESH_V1";

fn default_role() -> String {
    "unknown".to_string()
}

/// Presence announcement as carried on the discovery port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// Sender mesh identity
    pub mesh_id: String,

    /// Sender hostname
    pub hostname: String,

    /// Address the sender believes it is reachable on
    pub ip_address: IpAddr,

    /// Port of the sender's data listener
    pub data_port: u16,

    /// Sender's X25519 public key
    #[serde(with = "serde_bytes")]
    pub public_key: PublicKeyBytes,

    /// Sender's Ed25519 verifying key
    #[serde(with = "serde_bytes")]
    pub signing_key: VerifyingKeyBytes,

    /// Sender's role
    #[serde(default = "default_role")]
    pub agent_role: String,

    /// Sender's device name
    #[serde(default)]
    pub device_name: String,
}

/// Signed wrapper carried after the magic prefix
#[derive(Serialize, Deserialize)]
struct SignedAnnouncement {
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
    #[serde(with = "serde_bytes")]
    signature: SignatureBytes,
}

impl Announcement {
    /// Sign with `keys` and serialize to `MESH_MAGIC || msgpack(signed)`.
    /// `signing_key` must belong to `keys`.
    pub fn encode(&self, keys: &KeyManager) -> MeshResult<Vec<u8>> {
        if self.signing_key != keys.signing_key_bytes() {
            return Err(MeshError::InvalidPublicKey(
                "announcement names a different signing key".to_string(),
            ));
        }

        let body = rmp_serde::to_vec_named(self)?;
        let signed = SignedAnnouncement {
            signature: keys.sign(&body),
            body,
        };
        let encoded = rmp_serde::to_vec_named(&signed)?;

        let mut packet = Vec::with_capacity(MESH_MAGIC.len() + encoded.len());
        packet.extend_from_slice(MESH_MAGIC);
        packet.extend_from_slice(&encoded);
        Ok(packet)
    }

    /// Parse a discovery packet and check its signature against the
    /// signing key it carries
    pub fn decode(packet: &[u8]) -> MeshResult<Self> {
        let encoded = packet
            .strip_prefix(MESH_MAGIC)
            .ok_or_else(|| MeshError::Decode("missing protocol magic".to_string()))?;

        let signed: SignedAnnouncement = rmp_serde::from_slice(encoded)?;
        let announcement: Announcement = rmp_serde::from_slice(&signed.body)?;
        if announcement.mesh_id.is_empty() {
            return Err(MeshError::Decode("empty mesh id".to_string()));
        }

        verify_signature(&announcement.signing_key, &signed.body, &signed.signature)?;
        Ok(announcement)
    }

    /// Build a peer record. The address is taken from the datagram source,
    /// which is what the peer's replies will actually come from.
    pub fn into_peer(self, source: IpAddr) -> MeshPeer {
        let role = if self.agent_role.is_empty() {
            default_role()
        } else {
            self.agent_role
        };

        MeshPeer::new(
            self.mesh_id,
            self.hostname,
            source,
            self.data_port,
            self.public_key,
        )
        .with_role(role)
        .with_device_name(self.device_name)
        .with_signing_key(self.signing_key)
    }
}

/// Discovery service
pub struct Discovery {
    config: Arc<MeshConfig>,
    identity: Arc<LocalIdentity>,
    keys: Arc<KeyManager>,
    peers: Arc<PeerTable>,
    stats: Arc<MeshStats>,
}

impl Discovery {
    /// Create new discovery service
    pub fn new(
        config: Arc<MeshConfig>,
        identity: Arc<LocalIdentity>,
        keys: Arc<KeyManager>,
        peers: Arc<PeerTable>,
        stats: Arc<MeshStats>,
    ) -> Self {
        Self {
            config,
            identity,
            keys,
            peers,
            stats,
        }
    }

    /// The announcement this process sends, advertising `data_port`
    pub fn announcement(&self, ip_address: IpAddr, data_port: u16) -> Announcement {
        Announcement {
            mesh_id: self.identity.mesh_id.clone(),
            hostname: self.identity.hostname.clone(),
            ip_address,
            data_port,
            public_key: self.keys.public_key_bytes(),
            signing_key: self.keys.signing_key_bytes(),
            agent_role: self.identity.agent_role.clone(),
            device_name: self.identity.device_name.clone(),
        }
    }

    /// Sign `announcement` with the local key
    pub fn encode(&self, announcement: &Announcement) -> MeshResult<Vec<u8>> {
        announcement.encode(&self.keys)
    }

    /// Process one discovery datagram. Returns `None` when the packet was
    /// dropped or was our own announcement.
    pub fn handle_packet(&self, packet: &[u8], source: SocketAddr) -> Option<Upsert> {
        let announcement = match Announcement::decode(packet) {
            Ok(announcement) => announcement,
            Err(e) => {
                trace!("Dropping discovery packet from {}: {}", source, e);
                self.stats.record_announcement_dropped();
                return None;
            }
        };

        if announcement.mesh_id == self.identity.mesh_id {
            return None;
        }

        if announcement.ip_address != source.ip() {
            trace!(
                "Peer {} announced {} but sent from {}",
                announcement.mesh_id,
                announcement.ip_address,
                source.ip()
            );
        }

        let peer = announcement.into_peer(source.ip());
        let (id, role, addr) = (peer.id.clone(), peer.agent_role.clone(), peer.socket_addr());

        match self.peers.upsert(peer) {
            Upsert::Inserted => {
                self.stats.record_peer_discovered();
                info!("Discovered peer {} ({}) at {}", id, role, addr);
                Some(Upsert::Inserted)
            }
            Upsert::Updated => {
                trace!("Refreshed peer {}", id);
                Some(Upsert::Updated)
            }
            Upsert::SigningKeyMismatch => {
                warn!("Ignoring announcement for {} from {}: signing key changed", id, source);
                self.stats.record_announcement_dropped();
                None
            }
        }
    }

    /// Evict stale peers once
    pub fn reap(&self) -> Vec<MeshPeer> {
        let evicted = self.peers.evict_stale(self.config.peer_timeout());
        if !evicted.is_empty() {
            self.stats.record_peers_evicted(evicted.len());
            for peer in &evicted {
                info!("Peer {} ({}) timed out", peer.id, peer.agent_role);
            }
        }
        evicted
    }

    /// Send `packet` to `target` on every broadcast tick
    pub async fn run_broadcaster(self: Arc<Self>, socket: Arc<UdpSocket>, packet: Vec<u8>, target: SocketAddr) {
        let mut interval = tokio::time::interval(self.config.broadcast_interval());

        loop {
            interval.tick().await;

            match socket.send_to(&packet, target).await {
                Ok(_) => {
                    self.stats.record_announcement_sent();
                    trace!("Announced presence to {}", target);
                }
                Err(e) => warn!("Failed to send announcement to {}: {}", target, e),
            }
        }
    }

    /// Receive announcements until cancelled
    pub async fn run_listener(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; self.config.max_datagram_size];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    self.handle_packet(&buf[..len], source);
                }
                Err(e) => debug!("Discovery receive error: {}", e),
            }
        }
    }

    /// Evict stale peers on every reaper tick
    pub async fn run_reaper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.reaper_interval());
        interval.tick().await;

        loop {
            interval.tick().await;
            self.reap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn service(role: &str) -> (Discovery, Arc<PeerTable>, Arc<MeshStats>) {
        let config = Arc::new(MeshConfig::loopback(role));
        let identity = Arc::new(LocalIdentity::from_config(&config));
        let keys = Arc::new(KeyManager::generate().unwrap());
        let peers = Arc::new(PeerTable::new());
        let stats = Arc::new(MeshStats::default());

        let discovery = Discovery::new(config, identity, keys, peers.clone(), stats.clone());
        (discovery, peers, stats)
    }

    /// A remote node: its keys and the announcement it would send
    fn remote(id: &str, role: &str) -> (KeyManager, Announcement) {
        let keys = KeyManager::generate().unwrap();
        let announcement = Announcement {
            mesh_id: id.to_string(),
            hostname: "remote-host".to_string(),
            ip_address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            data_port: 45679,
            public_key: keys.public_key_bytes(),
            signing_key: keys.signing_key_bytes(),
            agent_role: role.to_string(),
            device_name: "remote-device".to_string(),
        };
        (keys, announcement)
    }

    fn remote_packet(id: &str, role: &str) -> Vec<u8> {
        let (keys, announcement) = remote(id, role);
        announcement.encode(&keys).unwrap()
    }

    fn source() -> SocketAddr {
        "192.168.1.20:45678".parse().unwrap()
    }

    #[test]
    fn test_announcement_roundtrip() {
        let (keys, announcement) = remote("peer0001", "researcher");
        let packet = announcement.encode(&keys).unwrap();

        assert!(packet.starts_with(MESH_MAGIC));
        let decoded = Announcement::decode(&packet).unwrap();
        assert_eq!(decoded, announcement);
        assert_eq!(decoded.encode(&keys).unwrap(), packet);
    }

    #[test]
    fn test_announcement_keys_encode_as_bin() {
        let (keys, announcement) = remote("peer0001", "researcher");
        let packet = announcement.encode(&keys).unwrap();

        // Raw key bytes only appear contiguously when encoded as msgpack bin
        let contains = |needle: &[u8]| packet.windows(needle.len()).any(|w| w == needle);
        assert!(contains(&announcement.public_key));
        assert!(contains(&announcement.signing_key));
    }

    #[test]
    fn test_encode_refuses_foreign_signing_key() {
        let (_, announcement) = remote("peer0001", "coder");
        let other = KeyManager::generate().unwrap();
        assert!(matches!(
            announcement.encode(&other),
            Err(MeshError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_foreign_packet_rejected() {
        assert!(Announcement::decode(b"M-SEARCH * HTTP/1.1\r\n").is_err());
        assert!(Announcement::decode(b"").is_err());

        let mut truncated = remote_packet("peer0001", "coder");
        truncated.truncate(MESH_MAGIC.len() + 4);
        assert!(Announcement::decode(&truncated).is_err());
    }

    #[test]
    fn test_tampered_announcement_rejected() {
        let (keys, announcement) = remote("peer0001", "coder");
        let mut packet = announcement.encode(&keys).unwrap();

        // Flip a byte inside the signed body; the port sits near the middle.
        let middle = packet.len() / 2;
        packet[middle] ^= 0x01;
        assert!(Announcement::decode(&packet).is_err());
    }

    #[test]
    fn test_forged_announcement_dropped() {
        let (discovery, peers, stats) = service("tester");
        let (bob_keys, bob) = remote("bob00001", "coder");
        discovery.handle_packet(&bob.encode(&bob_keys).unwrap(), source());

        // Attacker reuses bob's identity but only holds its own keys, and
        // keeps bob's signing key in the body so the record would match.
        let attacker = KeyManager::generate().unwrap();
        let mut forged = bob.clone();
        forged.public_key = attacker.public_key_bytes();
        forged.data_port = 9;
        let body = rmp_serde::to_vec_named(&forged).unwrap();
        let signed = SignedAnnouncement {
            signature: attacker.sign(&body),
            body,
        };
        let mut packet = MESH_MAGIC.to_vec();
        packet.extend_from_slice(&rmp_serde::to_vec_named(&signed).unwrap());

        assert_eq!(discovery.handle_packet(&packet, "192.168.1.66:45678".parse().unwrap()), None);

        let stored = peers.get("bob00001").unwrap();
        assert_eq!(stored.public_key, bob.public_key);
        assert_eq!(stored.port, 45679);
        assert_eq!(stored.ip_address, source().ip());
        assert_eq!(stats.snapshot(&discovery.identity, peers.len()).announcements_dropped, 1);
    }

    #[test]
    fn test_rekeyed_announcement_refused_until_reaped() {
        let (discovery, peers, stats) = service("tester");
        let (old_keys, old) = remote("bob00001", "coder");
        discovery.handle_packet(&old.encode(&old_keys).unwrap(), source());

        // Same identity, validly signed by a brand new key pair
        let (new_keys, mut rekeyed) = remote("bob00001", "coder");
        rekeyed.data_port = 9;
        let packet = rekeyed.encode(&new_keys).unwrap();

        assert_eq!(discovery.handle_packet(&packet, source()), None);
        assert_eq!(peers.get("bob00001").unwrap().public_key, old.public_key);
        assert_eq!(stats.snapshot(&discovery.identity, 1).announcements_dropped, 1);

        let timeout = discovery.config.peer_timeout();
        let mut stale = peers.get("bob00001").unwrap();
        stale.last_seen = chrono::Utc::now()
            - chrono::Duration::from_std(timeout).unwrap()
            - chrono::Duration::seconds(1);
        peers.upsert(stale);
        assert_eq!(discovery.reap().len(), 1);

        assert_eq!(discovery.handle_packet(&packet, source()), Some(Upsert::Inserted));
        let peer = peers.get("bob00001").unwrap();
        assert_eq!(peer.public_key, new_keys.public_key_bytes());
        assert_eq!(peer.signing_key, new_keys.signing_key_bytes());
        assert_eq!(peer.port, 9);
    }

    #[test]
    fn test_into_peer_uses_source_address() {
        let (_, announcement) = remote("peer0001", "");
        let signing_key = announcement.signing_key;
        let peer = announcement.into_peer(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));

        assert_eq!(peer.ip_address, IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));
        assert_eq!(peer.port, 45679);
        assert_eq!(peer.agent_role, "unknown");
        assert_eq!(peer.device_name, "remote-device");
        assert_eq!(peer.signing_key, signing_key);
    }

    #[test]
    fn test_handle_packet_inserts_then_updates() {
        let (discovery, peers, stats) = service("tester");
        let packet = remote_packet("peer0001", "coder");

        assert_eq!(discovery.handle_packet(&packet, source()), Some(Upsert::Inserted));
        assert_eq!(discovery.handle_packet(&packet, source()), Some(Upsert::Updated));

        assert_eq!(peers.len(), 1);
        let snapshot = stats.snapshot(&discovery.identity, peers.len());
        assert_eq!(snapshot.peers_discovered, 1);
    }

    #[test]
    fn test_role_change_overwrites_record() {
        let (discovery, peers, _stats) = service("tester");
        let (keys, mut announcement) = remote("peer0001", "coder");
        discovery.handle_packet(&announcement.encode(&keys).unwrap(), source());

        announcement.agent_role = "researcher".to_string();
        discovery.handle_packet(&announcement.encode(&keys).unwrap(), source());

        let peer = peers.get("peer0001").unwrap();
        assert_eq!(peer.agent_role, "researcher");
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_self_announcement_ignored() {
        let (discovery, peers, _stats) = service("tester");
        let own = discovery.announcement(IpAddr::V4(Ipv4Addr::LOCALHOST), 45679);

        assert_eq!(discovery.handle_packet(&discovery.encode(&own).unwrap(), source()), None);
        assert!(peers.is_empty());
    }

    #[test]
    fn test_noise_counted_not_fatal() {
        let (discovery, peers, stats) = service("tester");

        assert_eq!(discovery.handle_packet(b"garbage", source()), None);
        assert_eq!(discovery.handle_packet(MESH_MAGIC, source()), None);

        assert!(peers.is_empty());
        let snapshot = stats.snapshot(&discovery.identity, 0);
        assert_eq!(snapshot.announcements_dropped, 2);
    }

    #[test]
    fn test_reap_evicts_only_stale() {
        let (discovery, peers, stats) = service("tester");
        let timeout = discovery.config.peer_timeout();

        let (_, stale) = remote("stale001", "coder");
        let mut stale = stale.into_peer(source().ip());
        stale.last_seen = chrono::Utc::now()
            - chrono::Duration::from_std(timeout).unwrap()
            - chrono::Duration::seconds(1);
        peers.upsert(stale);
        discovery.handle_packet(&remote_packet("fresh001", "coder"), source());

        let evicted = discovery.reap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "stale001");
        assert!(peers.get("fresh001").is_some());
        assert_eq!(stats.snapshot(&discovery.identity, peers.len()).peers_evicted, 1);
    }
}
