/// Error kinds for the tunnel protocol handlers.
///
/// Every variant is recovered inside the message router: depending on the
/// message type a failure becomes a `"1"` status TXT string or an empty
/// answer. Nothing here ever reaches the wire as an error response, and no
/// attacker-supplied input is echoed back.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("malformed query")]
    MalformedQuery,
    #[error("unknown message tag")]
    UnknownTag,
    #[error("wrong field count for message tag")]
    ArityMismatch,
    #[error("payload decode failed")]
    Decode,
    #[error("crypto operation failed")]
    Crypto,
    #[error("unknown session")]
    UnknownSession,
    #[error("unknown block")]
    UnknownBlock,
    #[error("sequence number out of range")]
    InvalidSequence,
    #[error("invalid block range")]
    InvalidRange,
}
