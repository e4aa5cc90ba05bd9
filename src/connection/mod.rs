//! Connection Module - Duplex-Kanal zum Sprach-Endpoint
//!
//! Binär-Frames tragen Audio-Container in beide Richtungen, Text-Frames
//! tragen JSON Kontroll-Nachrichten vom Endpoint.

mod client;
mod messages;
pub mod state;
mod transport;

pub use client::{ConnectionError, ConnectionEvent, ConnectionManager, DecodeContext};
pub use messages::{ControlMessage, ProtocolError};
pub use state::{ChannelEvent, ConnectionState};
pub use transport::{ChannelHandle, Connector, WebSocketConnector};
