//! Wire protocol for the tabshare relay.
//!
//! Envelopes are JSON objects tagged by a `type` field and are always encoded
//! on a single line, one envelope per WebSocket text frame.

mod codec;
mod messages;
mod types;

pub use codec::{ProtocolError, decode_client, decode_server, encode};
pub use messages::{ClientMessage, ServerMessage};
pub use types::{Annotation, Cluster, SharedTab, TabPayload, now_millis};
