//! Mesh Configuration
//!
//! This module defines configuration for mesh operations including discovery,
//! messaging, and peer management settings. Timing values live here rather
//! than in the protocol so they can change without touching the wire format.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default UDP port for presence announcements
pub const MESH_DISCOVERY_PORT: u16 = 45678;

/// Default UDP port for encrypted data envelopes
pub const MESH_DATA_PORT: u16 = 45679;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Smallest receive buffer we accept
const MIN_DATAGRAM_SIZE: usize = 512;

/// Longest mesh identity we accept
pub const MAX_MESH_ID_LEN: usize = 8;

/// Mesh configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Agent role advertised to peers (e.g. "researcher", "coder")
    pub agent_role: String,

    /// Device name advertised to peers
    pub device_name: String,

    /// Mesh ID override (auto-generated if not provided)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_id: Option<String>,

    /// Local address both sockets bind to
    pub bind_address: IpAddr,

    /// Destination address for presence announcements
    pub broadcast_address: IpAddr,

    /// Discovery port (0 binds an ephemeral port)
    pub discovery_port: u16,

    /// Data port (0 binds an ephemeral port)
    pub data_port: u16,

    /// Seconds between presence announcements
    pub broadcast_interval_secs: u64,

    /// Seconds without an announcement before a peer is evicted
    pub peer_timeout_secs: u64,

    /// Seconds between reaper passes
    pub reaper_interval_secs: u64,

    /// Receive buffer size for both sockets
    pub max_datagram_size: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            agent_role: "unknown".to_string(),
            device_name: default_device_name(),
            mesh_id: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_port: MESH_DISCOVERY_PORT,
            data_port: MESH_DATA_PORT,
            broadcast_interval_secs: 5,
            peer_timeout_secs: 30,
            reaper_interval_secs: 5,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

fn default_device_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl MeshConfig {
    /// Create a new mesh configuration for the given agent role
    pub fn new(agent_role: impl Into<String>) -> Self {
        Self {
            agent_role: agent_role.into(),
            ..Self::default()
        }
    }

    /// Set the device name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the mesh ID
    pub fn with_mesh_id(mut self, id: impl Into<String>) -> Self {
        self.mesh_id = Some(id.into());
        self
    }

    /// Bind both sockets to ephemeral ports on loopback and announce to
    /// loopback only. Useful for tests and single-host experiments.
    pub fn loopback(agent_role: impl Into<String>) -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port: 0,
            data_port: 0,
            ..Self::new(agent_role)
        }
    }

    /// Address the discovery socket binds to
    pub fn discovery_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.discovery_port)
    }

    /// Address the data socket binds to
    pub fn data_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.data_port)
    }

    /// Get the broadcast interval
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    /// Get the peer timeout
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    /// Get the reaper tick
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Apply `AGENTMESH_*` environment variable overrides
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(role) = std::env::var("AGENTMESH_ROLE") {
            self.agent_role = role;
        }
        if let Ok(device) = std::env::var("AGENTMESH_DEVICE") {
            self.device_name = device;
        }
        if let Ok(port) = std::env::var("AGENTMESH_DISCOVERY_PORT") {
            if let Ok(port) = port.parse() {
                self.discovery_port = port;
            }
        }
        if let Ok(port) = std::env::var("AGENTMESH_DATA_PORT") {
            if let Ok(port) = port.parse() {
                self.data_port = port;
            }
        }
        if let Ok(addr) = std::env::var("AGENTMESH_BROADCAST_ADDRESS") {
            if let Ok(addr) = addr.parse() {
                self.broadcast_address = addr;
            }
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.agent_role.trim().is_empty() {
            return Err("agent_role cannot be empty".to_string());
        }

        if let Some(id) = &self.mesh_id {
            if id.is_empty() || id.len() > MAX_MESH_ID_LEN {
                return Err(format!(
                    "mesh_id must be 1 to {} characters",
                    MAX_MESH_ID_LEN
                ));
            }
        }

        if self.broadcast_interval_secs == 0 {
            return Err("broadcast_interval_secs must be greater than 0".to_string());
        }

        if self.reaper_interval_secs == 0 {
            return Err("reaper_interval_secs must be greater than 0".to_string());
        }

        if self.peer_timeout_secs <= self.broadcast_interval_secs {
            return Err(
                "peer_timeout_secs must be greater than broadcast_interval_secs".to_string(),
            );
        }

        if !(MIN_DATAGRAM_SIZE..=MAX_DATAGRAM_SIZE).contains(&self.max_datagram_size) {
            return Err(format!(
                "max_datagram_size must be between {} and {} bytes",
                MIN_DATAGRAM_SIZE, MAX_DATAGRAM_SIZE
            ));
        }

        Ok(())
    }
}
