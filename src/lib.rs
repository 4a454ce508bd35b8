//! AgentMesh Library
//!
//! This library provides a private, encrypted peer-to-peer mesh for agent
//! processes on a shared local network, including UDP discovery, X25519 key
//! agreement, authenticated messaging and typed message dispatch.

pub mod config;
pub mod logging;
pub mod mesh;
