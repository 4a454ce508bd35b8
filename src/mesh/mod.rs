//! Private Mesh Protocol for Encrypted P2P Messaging
//!
//! This module lets agent processes on one broadcast domain find each other
//! and exchange authenticated, encrypted datagrams without a broker.
//!
//! # Architecture
//!
//! The mesh protocol uses:
//! - **X25519**: Per-peer key agreement, hashed with SHA-256
//! - **Ed25519**: Signed presence announcements
//! - **ChaCha20-Poly1305**: Authenticated encryption of every payload
//! - **MessagePack**: Self-describing wire records
//! - **UDP broadcast**: Presence announcements on the discovery port
//! - **UDP unicast**: Encrypted envelopes on the data port
//!
//! # Components
//!
//! - [`KeyManager`]: key pairs, secret cache, AEAD, signatures
//! - [`PeerTable`]: known peers with liveness timestamps
//! - [`Discovery`]: broadcaster, listener and reaper
//! - [`Messenger`]: send, broadcast, receive and dispatch
//! - [`MeshProtocol`]: lifecycle and public API
//!
//! Delivery is best effort. Nothing is retried; periodic re-announcement
//! is how peers recover from loss.
//!
//! # Example
//!
//! ```no_run
//! use agentmesh::mesh::{MeshConfig, MeshProtocol};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mesh = MeshProtocol::new(MeshConfig::new("researcher"))?;
//! mesh.on_message("task", |message, peer| {
//!     println!("{} sent {} bytes", peer.id, message.payload.len());
//!     Ok(())
//! });
//! mesh.start().await?;
//!
//! for coder in mesh.get_peers(Some("coder")) {
//!     mesh.send_to_peer(&coder.id, "task", b"review this").await;
//! }
//! let reached = mesh.broadcast("status", b"idle").await;
//! println!("status sent to {} peers", reached);
//!
//! mesh.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod messaging;
pub mod peers;
pub mod protocol;
pub mod stats;

pub use config::MeshConfig;
pub use crypto::KeyManager;
pub use discovery::{Announcement, Discovery, MESH_MAGIC};
pub use error::{MeshError, MeshResult};
pub use identity::LocalIdentity;
pub use messaging::{HandlerRegistry, MeshMessage, MessageHandler, Messenger, WILDCARD};
pub use peers::{MeshPeer, PeerId, PeerTable};
pub use protocol::{MeshProtocol, ProtocolState};
pub use stats::StatsSnapshot;
