//! Mesh Module Error Types
//!
//! This module defines all error types that can occur during mesh operations.
//! Most of them never reach the public API: transport noise and failed
//! decryption are logged and counted by the listeners instead.

use std::net::SocketAddr;

/// Error types for mesh operations
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Platform RNG could not produce key material
    #[error("Random number generator unavailable: {0}")]
    Rng(String),

    /// Peer public key is malformed or of low order
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// AEAD tag did not verify, or the envelope was malformed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Wire record could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Wire record could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Socket bind failure during start-up
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// `start()` called on a running protocol
    #[error("Mesh protocol is already running")]
    AlreadyRunning,
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Network(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for MeshError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        MeshError::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MeshError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        MeshError::Decode(err.to_string())
    }
}

/// Convenience alias used throughout the mesh module
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_mentions_address() {
        let addr: SocketAddr = "0.0.0.0:45678".parse().unwrap();
        let err = MeshError::Bind {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("0.0.0.0:45678"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_error_maps_to_network() {
        let err: MeshError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, MeshError::Network(_)));
    }
}
