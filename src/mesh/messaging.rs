//! Encrypted P2P Messaging for Private Mesh Network
//!
//! Every message is sealed individually for its recipient with
//! ChaCha20-Poly1305 under the pairwise X25519 secret. The envelope header
//! (sender, role, target, type, timestamp) travels in the clear but is bound
//! to the ciphertext as associated data, so relabelling a message breaks
//! authentication.
//!
//! # Receive path
//!
//! 1. Decode the MessagePack envelope
//! 2. Drop it if it is addressed to somebody else
//! 3. Resolve the sender's public key from the [`PeerTable`]
//! 4. Open the ciphertext and reject replays
//! 5. Dispatch to every matching handler in registration order
//!
//! Failures at any step are counted as dropped messages and never reach
//! handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use super::crypto::{generate_nonce, KeyManager, PublicKeyBytes, NONCE_SIZE};
use super::error::{MeshError, MeshResult};
use super::identity::LocalIdentity;
use super::peers::{MeshPeer, PeerId, PeerTable};
use super::stats::MeshStats;

/// Message type that matches every message
pub const WILDCARD: &str = "*";

/// Number of recent `(sender, nonce)` pairs remembered for replay checks
const REPLAY_WINDOW: usize = 4096;

/// A message in the mesh network
#[derive(Debug, Clone, PartialEq)]
pub struct MeshMessage {
    /// Source peer ID
    pub source_id: PeerId,

    /// Source agent role
    pub source_role: String,

    /// Target peer ID (None for broadcast)
    pub target_id: Option<PeerId>,

    /// Message type
    pub message_type: String,

    /// Plaintext payload
    pub payload: Vec<u8>,

    /// Message timestamp
    pub timestamp: DateTime<Utc>,

    /// Per-message AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
}

impl MeshMessage {
    /// Create a new mesh message with a fresh nonce
    pub fn new(
        source_id: PeerId,
        source_role: String,
        target_id: Option<PeerId>,
        message_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            source_id,
            source_role,
            target_id,
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
            nonce: generate_nonce(),
        }
    }

    /// Whether the message was sent to every peer
    pub fn is_broadcast(&self) -> bool {
        self.target_id.is_none()
    }
}

/// Wire form of a mesh message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source_id: PeerId,
    pub source_role: String,
    pub target_id: Option<PeerId>,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encrypt `message` for the holder of `peer_key`
    pub fn seal(message: &MeshMessage, keys: &KeyManager, peer_key: &PublicKeyBytes) -> MeshResult<Self> {
        let aad = header_aad(
            &message.source_id,
            &message.source_role,
            &message.target_id,
            &message.message_type,
            &message.timestamp,
        )?;
        let ciphertext = keys.encrypt_with_aad(peer_key, &message.nonce, &message.payload, &aad)?;

        Ok(Self {
            source_id: message.source_id.clone(),
            source_role: message.source_role.clone(),
            target_id: message.target_id.clone(),
            message_type: message.message_type.clone(),
            timestamp: message.timestamp,
            nonce: message.nonce,
            ciphertext,
        })
    }

    /// Decrypt with the sender's public key
    pub fn open(self, keys: &KeyManager, peer_key: &PublicKeyBytes) -> MeshResult<MeshMessage> {
        let aad = header_aad(
            &self.source_id,
            &self.source_role,
            &self.target_id,
            &self.message_type,
            &self.timestamp,
        )?;
        let payload = keys.decrypt_with_aad(peer_key, &self.nonce, &self.ciphertext, &aad)?;

        Ok(MeshMessage {
            source_id: self.source_id,
            source_role: self.source_role,
            target_id: self.target_id,
            message_type: self.message_type,
            payload,
            timestamp: self.timestamp,
            nonce: self.nonce,
        })
    }

    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(datagram: &[u8]) -> MeshResult<Self> {
        Ok(rmp_serde::from_slice(datagram)?)
    }
}

fn header_aad(
    source_id: &str,
    source_role: &str,
    target_id: &Option<PeerId>,
    message_type: &str,
    timestamp: &DateTime<Utc>,
) -> MeshResult<Vec<u8>> {
    Ok(rmp_serde::to_vec(&(
        source_id,
        source_role,
        target_id,
        message_type,
        timestamp.timestamp_millis(),
    ))?)
}

/// Messaging handler callback
pub type MessageHandler = Arc<dyn Fn(&MeshMessage, &MeshPeer) -> anyhow::Result<()> + Send + Sync>;

/// Ordered registry of message handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<(String, MessageHandler)>>,
}

/// Result of dispatching one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub invoked: usize,
    pub failed: usize,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `message_type`, or for everything with
    /// [`WILDCARD`]
    pub fn register<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(&MeshMessage, &MeshPeer) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let message_type = message_type.into();
        debug!("Registered handler for message type: {}", message_type);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((message_type, Arc::new(handler)));
    }

    /// Number of handlers registered under exactly `message_type`
    pub fn handler_count(&self, message_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(registered, _)| registered == message_type)
            .count()
    }

    /// Handlers that should see a message of `message_type`, in
    /// registration order
    pub fn matching(&self, message_type: &str) -> Vec<MessageHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(registered, _)| registered == message_type || registered == WILDCARD)
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    /// Invoke every matching handler. Errors and panics are logged and
    /// never stop the remaining handlers.
    pub fn dispatch(&self, message: &MeshMessage, peer: &MeshPeer) -> Dispatch {
        let mut outcome = Dispatch::default();

        for handler in self.matching(&message.message_type) {
            outcome.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(message, peer))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    warn!(
                        "Handler for '{}' from {} failed: {:#}",
                        message.message_type, peer.id, e
                    );
                }
                Err(_) => {
                    outcome.failed += 1;
                    warn!(
                        "Handler for '{}' from {} panicked",
                        message.message_type, peer.id
                    );
                }
            }
        }

        outcome
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("HandlerRegistry")
            .field("handlers", &handlers.len())
            .finish()
    }
}

/// Bounded memory of recently seen `(sender, nonce)` pairs
#[derive(Debug)]
struct ReplayWindow {
    seen: HashSet<(PeerId, [u8; NONCE_SIZE])>,
    order: VecDeque<(PeerId, [u8; NONCE_SIZE])>,
    capacity: usize,
}

impl ReplayWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if the pair was already seen
    fn insert(&mut self, source_id: &str, nonce: [u8; NONCE_SIZE]) -> bool {
        let key = (source_id.to_string(), nonce);
        if !self.seen.insert(key.clone()) {
            return false;
        }

        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Send and receive side of the data channel
pub struct Messenger {
    identity: Arc<LocalIdentity>,
    keys: Arc<KeyManager>,
    peers: Arc<PeerTable>,
    handlers: Arc<HandlerRegistry>,
    stats: Arc<MeshStats>,
    replay: Mutex<ReplayWindow>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    max_datagram_size: usize,
}

impl Messenger {
    pub fn new(
        identity: Arc<LocalIdentity>,
        keys: Arc<KeyManager>,
        peers: Arc<PeerTable>,
        handlers: Arc<HandlerRegistry>,
        stats: Arc<MeshStats>,
        max_datagram_size: usize,
    ) -> Self {
        Self {
            identity,
            keys,
            peers,
            handlers,
            stats,
            replay: Mutex::new(ReplayWindow::new(REPLAY_WINDOW)),
            socket: RwLock::new(None),
            max_datagram_size,
        }
    }

    /// Use `socket` for outbound traffic
    pub fn attach(&self, socket: Arc<UdpSocket>) {
        *self.socket.write().unwrap_or_else(|e| e.into_inner()) = Some(socket);
    }

    /// Release the outbound socket
    pub fn detach(&self) {
        self.socket.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Send a message to one peer. Returns false if the peer is unknown or
    /// the datagram could not be transmitted.
    pub async fn send_to_peer(&self, target_id: &str, message_type: &str, payload: &[u8]) -> bool {
        let Some(peer) = self.peers.get(target_id) else {
            debug!("Cannot send '{}' to unknown peer {}", message_type, target_id);
            return false;
        };

        let message = MeshMessage::new(
            self.identity.mesh_id.clone(),
            self.identity.agent_role.clone(),
            Some(peer.id.clone()),
            message_type,
            payload.to_vec(),
        );

        match self.transmit(&peer, &message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send '{}' to {}: {}", message_type, peer.id, e);
                false
            }
        }
    }

    /// Send a separately sealed copy to every known peer. Returns the
    /// number of peers reached.
    pub async fn broadcast(&self, message_type: &str, payload: &[u8]) -> usize {
        let peers = self.peers.snapshot(None);
        let mut reached = 0;

        for peer in &peers {
            let message = MeshMessage::new(
                self.identity.mesh_id.clone(),
                self.identity.agent_role.clone(),
                None,
                message_type,
                payload.to_vec(),
            );

            match self.transmit(peer, &message).await {
                Ok(()) => reached += 1,
                Err(e) => warn!("Broadcast '{}' to {} failed: {}", message_type, peer.id, e),
            }
        }

        debug!("Broadcast '{}' reached {}/{} peers", message_type, reached, peers.len());
        reached
    }

    async fn transmit(&self, peer: &MeshPeer, message: &MeshMessage) -> MeshResult<()> {
        let socket = self
            .socket()
            .ok_or_else(|| MeshError::Network("mesh protocol is not running".to_string()))?;

        let datagram = Envelope::seal(message, &self.keys, &peer.public_key)?.encode()?;
        if datagram.len() > self.max_datagram_size {
            return Err(MeshError::Encode(format!(
                "datagram of {} bytes exceeds {} byte limit",
                datagram.len(),
                self.max_datagram_size
            )));
        }

        socket.send_to(&datagram, peer.socket_addr()).await?;
        self.stats.record_sent();
        trace!(
            "Sent {} bytes of '{}' to peer {}",
            datagram.len(),
            message.message_type,
            peer.id
        );
        Ok(())
    }

    /// Decrypt and dispatch one data datagram. Returns the message if it
    /// was delivered to the handler registry.
    pub fn handle_datagram(&self, datagram: &[u8], source: SocketAddr) -> Option<MeshMessage> {
        match self.open(datagram) {
            Ok((message, peer)) => {
                self.stats.record_received();
                let outcome = self.handlers.dispatch(&message, &peer);
                for _ in 0..outcome.failed {
                    self.stats.record_handler_error();
                }
                trace!(
                    "Delivered '{}' from {} to {} handlers",
                    message.message_type,
                    peer.id,
                    outcome.invoked
                );
                Some(message)
            }
            Err(e) => {
                debug!("Dropping datagram from {}: {}", source, e);
                self.stats.record_dropped();
                None
            }
        }
    }

    fn open(&self, datagram: &[u8]) -> MeshResult<(MeshMessage, MeshPeer)> {
        let envelope = Envelope::decode(datagram)?;

        if let Some(target) = &envelope.target_id {
            if target != &self.identity.mesh_id {
                return Err(MeshError::Decode(format!("addressed to {}", target)));
            }
        }

        let peer = self.peers.get(&envelope.source_id).ok_or_else(|| {
            MeshError::Authentication(format!("unknown sender {}", envelope.source_id))
        })?;

        let message = envelope.open(&self.keys, &peer.public_key)?;

        let fresh = self
            .replay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(&message.source_id, message.nonce);
        if !fresh {
            return Err(MeshError::Authentication(format!(
                "replayed message from {}",
                message.source_id
            )));
        }

        Ok((message, peer))
    }

    /// Receive data datagrams until cancelled
    pub async fn run_listener(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; self.max_datagram_size];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    self.handle_datagram(&buf[..len], source);
                }
                Err(e) => debug!("Data receive error: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::config::MeshConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Node {
        identity: Arc<LocalIdentity>,
        keys: Arc<KeyManager>,
        peers: Arc<PeerTable>,
        handlers: Arc<HandlerRegistry>,
        stats: Arc<MeshStats>,
        messenger: Messenger,
    }

    fn node(id: &str, role: &str) -> Node {
        let config = MeshConfig::loopback(role).with_mesh_id(id);
        let identity = Arc::new(LocalIdentity::from_config(&config));
        let keys = Arc::new(KeyManager::generate().unwrap());
        let peers = Arc::new(PeerTable::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(MeshStats::default());
        let messenger = Messenger::new(
            identity.clone(),
            keys.clone(),
            peers.clone(),
            handlers.clone(),
            stats.clone(),
            config.max_datagram_size,
        );
        Node {
            identity,
            keys,
            peers,
            handlers,
            stats,
            messenger,
        }
    }

    fn as_peer(node: &Node) -> MeshPeer {
        MeshPeer::new(
            node.identity.mesh_id.clone(),
            "localhost",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            45679,
            node.keys.public_key_bytes(),
        )
        .with_role(node.identity.agent_role.clone())
    }

    fn source() -> SocketAddr {
        "127.0.0.1:45679".parse().unwrap()
    }

    fn sealed(from: &Node, to: &Node, target: Option<&str>, message_type: &str, payload: &[u8]) -> Vec<u8> {
        let message = MeshMessage::new(
            from.identity.mesh_id.clone(),
            from.identity.agent_role.clone(),
            target.map(str::to_string),
            message_type,
            payload.to_vec(),
        );
        Envelope::seal(&message, &from.keys, &to.keys.public_key_bytes())
            .unwrap()
            .encode()
            .unwrap()
    }

    #[test]
    fn test_mesh_message_creation() {
        let message = MeshMessage::new(
            "peer1".to_string(),
            "researcher".to_string(),
            Some("peer2".to_string()),
            "data",
            b"test payload".to_vec(),
        );

        assert_eq!(message.source_id, "peer1");
        assert_eq!(message.target_id.as_deref(), Some("peer2"));
        assert_eq!(message.message_type, "data");
        assert!(!message.is_broadcast());
    }

    #[test]
    fn test_messages_get_distinct_nonces() {
        let a = MeshMessage::new("p".into(), "r".into(), None, "t", vec![]);
        let b = MeshMessage::new("p".into(), "r".into(), None, "t", vec![]);
        assert!(a.is_broadcast());
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_envelope_seal_open() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");

        let message = MeshMessage::new(
            "alice001".to_string(),
            "researcher".to_string(),
            Some("bob00001".to_string()),
            "task",
            b"summarise the paper".to_vec(),
        );
        let envelope = Envelope::seal(&message, &alice.keys, &bob.keys.public_key_bytes()).unwrap();
        assert_ne!(envelope.ciphertext, message.payload);

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        let opened = decoded.open(&bob.keys, &alice.keys.public_key_bytes()).unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn test_envelope_ciphertext_encodes_as_bin() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");

        let message = MeshMessage::new("alice001".into(), "researcher".into(), None, "blob", vec![0xff; 4096]);
        let envelope = Envelope::seal(&message, &alice.keys, &bob.keys.public_key_bytes()).unwrap();
        let datagram = envelope.encode().unwrap();

        assert!(datagram.len() < message.payload.len() + 256, "datagram is {} bytes", datagram.len());
        assert!(datagram
            .windows(envelope.ciphertext.len())
            .any(|w| w == envelope.ciphertext.as_slice()));
    }

    #[test]
    fn test_relabelled_type_fails_authentication() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");

        let message = MeshMessage::new("alice001".into(), "researcher".into(), None, "chat", b"hi".to_vec());
        let mut envelope = Envelope::seal(&message, &alice.keys, &bob.keys.public_key_bytes()).unwrap();
        envelope.message_type = "admin".to_string();

        assert!(envelope.open(&bob.keys, &alice.keys.public_key_bytes()).is_err());
    }

    #[test]
    fn test_handler_registry_order_and_wildcard() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let calls = calls.clone();
            registry.register("test_type", move |_, _| {
                calls.lock().unwrap().push(label);
                Ok(())
            });
        }
        let wildcard_calls = calls.clone();
        registry.register(WILDCARD, move |_, _| {
            wildcard_calls.lock().unwrap().push("wildcard");
            Ok(())
        });

        assert_eq!(registry.handler_count("test_type"), 2);
        assert_eq!(registry.handler_count(WILDCARD), 1);
        assert_eq!(registry.matching("test_type").len(), 3);
        assert_eq!(registry.matching("other").len(), 1);

        let alice = node("alice001", "researcher");
        let message = MeshMessage::new("alice001".into(), "researcher".into(), None, "test_type", vec![]);
        let outcome = registry.dispatch(&message, &as_peer(&alice));

        assert_eq!(outcome, Dispatch { invoked: 3, failed: 0 });
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "wildcard"]);
    }

    #[test]
    fn test_handler_failures_are_contained() {
        let registry = HandlerRegistry::new();
        let after = Arc::new(AtomicUsize::new(0));

        registry.register("job", |_, _| anyhow::bail!("handler rejected job"));
        registry.register("job", |_, _| panic!("handler exploded"));
        let counter = after.clone();
        registry.register("job", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let alice = node("alice001", "researcher");
        let message = MeshMessage::new("alice001".into(), "researcher".into(), None, "job", vec![]);
        let outcome = registry.dispatch(&message, &as_peer(&alice));

        assert_eq!(outcome, Dispatch { invoked: 3, failed: 2 });
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_datagram_dispatches_to_matching_handler() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");
        bob.peers.upsert(as_peer(&alice));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        bob.handlers.register("task", move |message, peer| {
            sink.lock().unwrap().push((message.payload.clone(), peer.id.clone()));
            Ok(())
        });
        let unrelated = Arc::new(AtomicUsize::new(0));
        let unrelated_counter = unrelated.clone();
        bob.handlers.register("other", move |_, _| {
            unrelated_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let datagram = sealed(&alice, &bob, Some("bob00001"), "task", b"payload");
        let message = bob.messenger.handle_datagram(&datagram, source()).unwrap();

        assert_eq!(message.source_role, "researcher");
        assert_eq!(*received.lock().unwrap(), vec![(b"payload".to_vec(), "alice001".to_string())]);
        assert_eq!(unrelated.load(Ordering::SeqCst), 0);
        assert_eq!(bob.stats.snapshot(&bob.identity, 1).messages_received, 1);
    }

    #[test]
    fn test_unknown_sender_dropped() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");

        let datagram = sealed(&alice, &bob, None, "task", b"payload");
        assert!(bob.messenger.handle_datagram(&datagram, source()).is_none());

        let snapshot = bob.stats.snapshot(&bob.identity, 0);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.messages_received, 0);
    }

    #[test]
    fn test_misaddressed_and_garbage_dropped() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");
        bob.peers.upsert(as_peer(&alice));

        let misaddressed = sealed(&alice, &bob, Some("carol001"), "task", b"x");
        assert!(bob.messenger.handle_datagram(&misaddressed, source()).is_none());
        assert!(bob.messenger.handle_datagram(b"\x00\x01noise", source()).is_none());

        assert_eq!(bob.stats.snapshot(&bob.identity, 1).messages_dropped, 2);
    }

    #[test]
    fn test_forged_sender_key_dropped() {
        let alice = node("alice001", "researcher");
        let mallory = node("alice001", "researcher");
        let bob = node("bob00001", "coder");
        bob.peers.upsert(as_peer(&alice));

        let forged = sealed(&mallory, &bob, Some("bob00001"), "task", b"x");
        assert!(bob.messenger.handle_datagram(&forged, source()).is_none());
    }

    #[test]
    fn test_replayed_datagram_dropped() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");
        bob.peers.upsert(as_peer(&alice));

        let datagram = sealed(&alice, &bob, Some("bob00001"), "task", b"once");
        assert!(bob.messenger.handle_datagram(&datagram, source()).is_some());
        assert!(bob.messenger.handle_datagram(&datagram, source()).is_none());

        let snapshot = bob.stats.snapshot(&bob.identity, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.messages_dropped, 1);
    }

    #[test]
    fn test_replay_window_is_bounded() {
        let mut window = ReplayWindow::new(2);
        assert!(window.insert("a", [1u8; NONCE_SIZE]));
        assert!(!window.insert("a", [1u8; NONCE_SIZE]));
        assert!(window.insert("a", [2u8; NONCE_SIZE]));
        assert!(window.insert("a", [3u8; NONCE_SIZE]));

        assert_eq!(window.seen.len(), 2);
        assert!(window.insert("a", [1u8; NONCE_SIZE]));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_returns_false() {
        let alice = node("alice001", "researcher");
        assert!(!alice.messenger.send_to_peer("nonexistent", "data", b"x").await);
        assert_eq!(alice.stats.snapshot(&alice.identity, 0).messages_sent, 0);
    }

    #[tokio::test]
    async fn test_send_without_socket_returns_false() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");
        alice.peers.upsert(as_peer(&bob));

        assert!(!alice.messenger.send_to_peer("bob00001", "data", b"x").await);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers_reaches_nobody() {
        let alice = node("alice001", "researcher");
        alice.messenger.attach(Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()));
        assert_eq!(alice.messenger.broadcast("data", b"x").await, 0);
    }

    #[tokio::test]
    async fn test_send_over_loopback() {
        let alice = node("alice001", "researcher");
        let bob = node("bob00001", "coder");

        let alice_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let bob_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        alice.messenger.attach(alice_socket);

        let mut bob_peer = as_peer(&bob);
        bob_peer.port = bob_socket.local_addr().unwrap().port();
        alice.peers.upsert(bob_peer);
        bob.peers.upsert(as_peer(&alice));

        assert!(alice.messenger.send_to_peer("bob00001", "data", b"over the wire").await);

        let mut buf = vec![0u8; 2048];
        let (len, from) = bob_socket.recv_from(&mut buf).await.unwrap();
        let message = bob.messenger.handle_datagram(&buf[..len], from).unwrap();
        assert_eq!(message.payload, b"over the wire");
        assert_eq!(message.target_id.as_deref(), Some("bob00001"));
        assert_eq!(alice.stats.snapshot(&alice.identity, 1).messages_sent, 1);
    }
}
