//! # WebSocket Relay
//!
//! Browser-facing WebSocket listener that pairs every browser connection with
//! its own authenticated backend connection.
//!
//! ## Data Flow:
//! ```text
//! browser ──Float32 PCM──▶ framer ─▶ Opus encoder ──▶ backend
//! browser ◀──WAV/PCM────── playback ◀─ Opus decoder ◀── backend
//! browser ◀──────────── JSON control messages ──────────▶ backend
//! ```
//!
//! ## Key Components:
//! - **server**: accept loop, capacity check, session spawn and cleanup
//! - **session**: per-connection state machine and the two relay directions
//! - **backend**: outbound link with handshake headers and backoff reconnect
//! - **registry**: live sessions and the global session limit
//! - **messages**: control-message classification and proxy-originated messages

pub mod backend;
pub mod messages;
pub mod registry;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;

pub use backend::BackendHandshake;
pub use registry::{RegistrySummary, SessionRegistry};
pub use server::ProxyServer;
