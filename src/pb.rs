//! Wire messages carried inside the tunnel.
//!
//! The tunnel treats envelope payloads as opaque bytes; only the correlation
//! ID is inspected, to route replies to the waiter that registered for them.

use prost::Message;

use crate::errors::TunnelError;

/// Upper-layer message unit. `id` is the correlation ID tying a reply to the
/// request that caused it; `kind` and `data` belong to the upper layer.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

/// Announces an inbound block: the client-chosen block ID and how many
/// fragments the block was split into.
#[derive(Clone, PartialEq, Message)]
pub struct BlockHeader {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint32, tag = "2")]
    pub size: u32,
}

impl Envelope {
    pub fn decode_bytes(data: &[u8]) -> Result<Self, TunnelError> {
        Envelope::decode(data).map_err(|_| TunnelError::Decode)
    }
}

impl BlockHeader {
    pub fn decode_bytes(data: &[u8]) -> Result<Self, TunnelError> {
        BlockHeader::decode(data).map_err(|_| TunnelError::Decode)
    }
}
