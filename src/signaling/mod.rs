//! Signaling channel: message catalog and WebSocket transport

pub mod protocol;
pub mod transport;

pub use protocol::{ClientMessage, IceCandidatePayload, ServerMessage};
pub use transport::{SignalingTransport, TransportEvent};
