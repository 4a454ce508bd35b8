//! Mesh protocol orchestrator
//!
//! [`MeshProtocol`] owns the key manager, the peer table and the handler
//! registry, and runs four tasks while started: discovery broadcaster,
//! discovery listener, peer reaper and data listener. Dropping a running
//! protocol aborts those tasks, which releases both sockets.
//!
//! ```text
//!   CREATED ──start()──▶ RUNNING ──stop()──▶ STOPPED
//!                           ▲                   │
//!                           └──────start()──────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::config::MeshConfig;
use super::crypto::{KeyManager, PublicKeyBytes};
use super::discovery::{Announcement, Discovery};
use super::error::{MeshError, MeshResult};
use super::identity::{local_ip, LocalIdentity};
use super::messaging::{HandlerRegistry, MeshMessage, Messenger};
use super::peers::{MeshPeer, PeerTable};
use super::stats::{MeshStats, StatsSnapshot};

/// Lifecycle state of a [`MeshProtocol`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Created,
    Running,
    Stopped,
}

struct Running {
    tasks: Vec<JoinHandle<()>>,
    discovery_addr: SocketAddr,
    data_addr: SocketAddr,
    announcement: Announcement,
    packet: Vec<u8>,
}

struct Lifecycle {
    state: ProtocolState,
    running: Option<Running>,
}

/// Private encrypted mesh endpoint for one agent process
pub struct MeshProtocol {
    config: Arc<MeshConfig>,
    identity: Arc<LocalIdentity>,
    keys: Arc<KeyManager>,
    peers: Arc<PeerTable>,
    handlers: Arc<HandlerRegistry>,
    stats: Arc<MeshStats>,
    discovery: Arc<Discovery>,
    messenger: Arc<Messenger>,
    lifecycle: Mutex<Lifecycle>,
}

impl MeshProtocol {
    /// Validate `config`, generate the key pair and mesh identity
    pub fn new(config: MeshConfig) -> MeshResult<Self> {
        config.validate().map_err(MeshError::InvalidConfig)?;

        let config = Arc::new(config);
        let identity = Arc::new(LocalIdentity::from_config(&config));
        let keys = Arc::new(KeyManager::generate()?);
        let peers = Arc::new(PeerTable::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(MeshStats::default());

        let discovery = Arc::new(Discovery::new(
            config.clone(),
            identity.clone(),
            keys.clone(),
            peers.clone(),
            stats.clone(),
        ));
        let messenger = Arc::new(Messenger::new(
            identity.clone(),
            keys.clone(),
            peers.clone(),
            handlers.clone(),
            stats.clone(),
            config.max_datagram_size,
        ));

        info!(
            "Created mesh protocol {} (role: {}, device: {})",
            identity.mesh_id, identity.agent_role, identity.device_name
        );

        Ok(Self {
            config,
            identity,
            keys,
            peers,
            handlers,
            stats,
            discovery,
            messenger,
            lifecycle: Mutex::new(Lifecycle {
                state: ProtocolState::Created,
                running: None,
            }),
        })
    }

    /// Get the mesh ID
    pub fn mesh_id(&self) -> &str {
        &self.identity.mesh_id
    }

    /// Get the agent role
    pub fn agent_role(&self) -> &str {
        &self.identity.agent_role
    }

    /// Get the local public key
    pub fn public_key(&self) -> PublicKeyBytes {
        self.keys.public_key_bytes()
    }

    /// Get the configuration this protocol was built with
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ProtocolState {
        self.lifecycle.lock().await.state
    }

    /// Bound discovery address, while running
    pub async fn discovery_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.running.as_ref().map(|r| r.discovery_addr)
    }

    /// Bound data address, while running
    pub async fn data_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.running.as_ref().map(|r| r.data_addr)
    }

    /// The announcement being broadcast, while running
    pub async fn local_announcement(&self) -> Option<Announcement> {
        self.lifecycle
            .lock()
            .await
            .running
            .as_ref()
            .map(|r| r.announcement.clone())
    }

    /// The signed discovery packet being broadcast, while running
    pub async fn local_announcement_packet(&self) -> Option<Vec<u8>> {
        self.lifecycle
            .lock()
            .await
            .running
            .as_ref()
            .map(|r| r.packet.clone())
    }

    /// Bind both sockets and launch the discovery broadcaster, discovery
    /// listener, reaper and data listener. Bind failures are returned and
    /// leave the protocol in its previous state.
    pub async fn start(&self) -> MeshResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == ProtocolState::Running {
            return Err(MeshError::AlreadyRunning);
        }

        let discovery_socket = bind(self.config.discovery_bind_addr()).await?;
        discovery_socket.set_broadcast(true)?;
        let data_socket = bind(self.config.data_bind_addr()).await?;

        let discovery_addr = discovery_socket.local_addr()?;
        let data_addr = data_socket.local_addr()?;

        let announce_ip = if data_addr.ip().is_unspecified() {
            local_ip()
        } else {
            data_addr.ip()
        };
        let announcement = self.discovery.announcement(announce_ip, data_addr.port());
        let packet = self.discovery.encode(&announcement)?;
        let target = SocketAddr::new(self.config.broadcast_address, broadcast_port(&self.config, discovery_addr));

        let discovery_socket = Arc::new(discovery_socket);
        let data_socket = Arc::new(data_socket);
        self.messenger.attach(data_socket.clone());

        let tasks = vec![
            tokio::spawn(self.discovery.clone().run_broadcaster(discovery_socket.clone(), packet.clone(), target)),
            tokio::spawn(self.discovery.clone().run_listener(discovery_socket)),
            tokio::spawn(self.discovery.clone().run_reaper()),
            tokio::spawn(self.messenger.clone().run_listener(data_socket)),
        ];

        lifecycle.state = ProtocolState::Running;
        lifecycle.running = Some(Running {
            tasks,
            discovery_addr,
            data_addr,
            announcement,
            packet,
        });

        info!(
            "Mesh {} running (discovery {}, data {}, announcing to {})",
            self.identity.mesh_id, discovery_addr, data_addr, target
        );
        Ok(())
    }

    /// Cancel every task and release both sockets. Stopping a protocol
    /// that is not running does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.running.take() else {
            debug!("Mesh {} is not running", self.identity.mesh_id);
            return;
        };

        self.messenger.detach();
        for task in &running.tasks {
            task.abort();
        }
        for task in running.tasks {
            let _ = task.await;
        }

        lifecycle.state = ProtocolState::Stopped;
        info!("Mesh {} stopped", self.identity.mesh_id);
    }

    /// Send an encrypted message to one peer. Returns false if the peer is
    /// unknown or the datagram could not be sent.
    pub async fn send_to_peer(&self, peer_id: &str, message_type: &str, payload: &[u8]) -> bool {
        self.messenger.send_to_peer(peer_id, message_type, payload).await
    }

    /// Send an individually encrypted copy to every known peer. Returns the
    /// number of peers reached.
    pub async fn broadcast(&self, message_type: &str, payload: &[u8]) -> usize {
        self.messenger.broadcast(message_type, payload).await
    }

    /// Snapshot of known peers, optionally filtered by exact role
    pub fn get_peers(&self, role: Option<&str>) -> Vec<MeshPeer> {
        self.peers.snapshot(role)
    }

    /// Look up one peer
    pub fn get_peer(&self, peer_id: &str) -> Option<MeshPeer> {
        self.peers.get(peer_id)
    }

    /// Register a handler for `message_type` (or [`WILDCARD`] for all)
    ///
    /// [`WILDCARD`]: super::messaging::WILDCARD
    pub fn on_message<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(&MeshMessage, &MeshPeer) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.register(message_type, handler);
    }

    /// Registered handlers
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Current counters
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.identity, self.peers.len())
    }
}

impl Drop for MeshProtocol {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().running.take() {
            self.messenger.detach();
            for task in running.tasks {
                task.abort();
            }
            debug!("Mesh {} dropped while running", self.identity.mesh_id);
        }
    }
}

impl std::fmt::Debug for MeshProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshProtocol")
            .field("identity", &self.identity)
            .field("keys", &self.keys)
            .field("peers", &self.peers.len())
            .finish()
    }
}

async fn bind(addr: SocketAddr) -> MeshResult<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| MeshError::Bind { addr, source })
}

/// Announcements go to the configured discovery port; with an ephemeral
/// port that is whatever we bound.
fn broadcast_port(config: &MeshConfig, bound: SocketAddr) -> u16 {
    if config.discovery_port == 0 {
        bound.port()
    } else {
        config.discovery_port
    }
}
