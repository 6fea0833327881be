//! Editor transport for notebook kernels.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - `ChannelPeer` - Remote peer over a message channel
//! - `NotebookServer` - Dispatch of editor messages onto the notebook service

pub mod channel;
pub mod protocol;
pub mod server;

pub use channel::ChannelPeer;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::NotebookServer;
