//! Local mesh identity
//!
//! One per process, built once from [`MeshConfig`] and shared by handle
//! with the discovery and messaging subsystems.

use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

use super::config::{MeshConfig, MAX_MESH_ID_LEN};
use super::peers::PeerId;

/// Who this process is on the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Short unique mesh identity
    pub mesh_id: PeerId,

    /// Agent role advertised to peers
    pub agent_role: String,

    /// Device name advertised to peers
    pub device_name: String,

    /// Local hostname
    pub hostname: String,
}

impl LocalIdentity {
    /// Build the identity for a validated config
    pub fn from_config(config: &MeshConfig) -> Self {
        Self {
            mesh_id: config.mesh_id.clone().unwrap_or_else(generate_mesh_id),
            agent_role: config.agent_role.clone(),
            device_name: config.device_name.clone(),
            hostname: local_hostname(),
        }
    }
}

/// Generate a mesh ID
pub fn generate_mesh_id() -> PeerId {
    Uuid::new_v4().simple().to_string()[..MAX_MESH_ID_LEN].to_string()
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Best-effort outbound interface address. Connecting a UDP socket sends
/// nothing; it only asks the kernel which route it would use.
pub fn local_ip() -> IpAddr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_mesh_id_shape() {
        let id = generate_mesh_id();
        assert_eq!(id.len(), MAX_MESH_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_mesh_ids_differ() {
        assert_ne!(generate_mesh_id(), generate_mesh_id());
    }

    #[test]
    fn test_identity_honours_override() {
        let config = MeshConfig::new("coder")
            .with_mesh_id("fixed01")
            .with_device_name("rig");
        let identity = LocalIdentity::from_config(&config);

        assert_eq!(identity.mesh_id, "fixed01");
        assert_eq!(identity.agent_role, "coder");
        assert_eq!(identity.device_name, "rig");
        assert!(!identity.hostname.is_empty());
    }
}
