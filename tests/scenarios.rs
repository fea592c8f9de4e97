//! End-to-end protocol scenarios, driven through the router the same way the
//! listener drives it, with the test acting as the implant side.

use std::sync::Arc;
use std::time::Duration;

use data_encoding::{BASE32_NOPAD, BASE64_NOPAD};
use prost::Message;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;

use warren::codec::MAX_TXT_STRING;
use warren::crypto::SessionKey;
use warren::errors::TunnelError;
use warren::pb::{BlockHeader, Envelope};
use warren::{listener, wire, Config, Tunnel};

fn test_config() -> Config {
    let mut config = Config::new("tunnel.example");
    config.rsa_bits = 1024;
    config
}

fn new_tunnel() -> Arc<Tunnel> {
    Tunnel::new(test_config()).unwrap()
}

fn b32(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data).to_ascii_lowercase()
}

/// Splits a long base32 field across 63-char DNS labels.
fn labels(field: &str) -> String {
    field
        .as_bytes()
        .chunks(63)
        .map(|chunk| std::str::from_utf8(chunk).unwrap())
        .collect::<Vec<_>>()
        .join(".")
}

fn parse_block_ref(reply: &str) -> (String, usize) {
    let (id, count) = reply.split_once('.').unwrap();
    (id.to_string(), count.parse().unwrap())
}

/// Retrieves a whole send block and reassembles it client-side.
fn fetch_block(tunnel: &Tunnel, block_id: &str, count: usize) -> Vec<u8> {
    let chunks = tunnel.handle_txt(&format!("_n.0.{}.{}._b", count, block_id));
    assert_eq!(chunks.len(), count);
    let mut pieces: Vec<(u32, Vec<u8>)> = chunks
        .iter()
        .map(|chunk| {
            assert!(chunk.starts_with('.'));
            assert!(chunk.len() <= MAX_TXT_STRING);
            let raw = BASE64_NOPAD.decode(chunk[1..].as_bytes()).unwrap();
            let (seq, payload) = raw.split_at(4);
            (u32::from_le_bytes(seq.try_into().unwrap()), payload.to_vec())
        })
        .collect();
    pieces.sort_by_key(|(seq, _)| *seq);
    pieces.into_iter().flat_map(|(_, payload)| payload).collect()
}

/// Full implant-side bootstrap: fetch the apex key via `_domainkey`, seal a
/// fresh symmetric key with it, open a session via `_si`.
fn handshake(tunnel: &Tunnel) -> (String, SessionKey) {
    let reply = tunnel.handle_txt("_ffff.implant01._domainkey");
    assert_eq!(reply.len(), 1);
    let (block_id, count) = parse_block_ref(&reply[0]);
    let pem = fetch_block(tunnel, &block_id, count);
    let public = RsaPublicKey::from_pkcs1_pem(std::str::from_utf8(&pem).unwrap()).unwrap();
    assert_eq!(
        tunnel.handle_txt(&format!("_n1.{}._cb", block_id)),
        vec!["1"]
    );

    let key_bytes: [u8; 32] = rand::random();
    let sealed = public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &key_bytes)
        .unwrap();
    let reply = tunnel.handle_txt(&format!("_n2.{}.implant01._si", labels(&b32(&sealed))));
    assert_eq!(reply.len(), 1);

    let key = SessionKey::from_bytes(&key_bytes).unwrap();
    let sealed_id = BASE64_NOPAD.decode(reply[0].as_bytes()).unwrap();
    let session_id = String::from_utf8(key.open(&sealed_id).unwrap()).unwrap();
    (session_id, key)
}

fn fragment_fields(key: &SessionKey, envelope: &Envelope, frag_bytes: usize) -> Vec<String> {
    let ciphertext = key.seal(&envelope.encode_to_vec()).unwrap();
    ciphertext
        .chunks(frag_bytes)
        .enumerate()
        .map(|(seq, window)| {
            let mut raw = (seq as u32).to_le_bytes().to_vec();
            raw.extend_from_slice(window);
            b32(&raw)
        })
        .collect()
}

fn announce(tunnel: &Tunnel, session_id: &str, key: &SessionKey, header_id: &str, size: u32) -> Vec<String> {
    let header = BlockHeader {
        id: header_id.to_string(),
        size,
    };
    let sealed = b32(&key.seal(&header.encode_to_vec()).unwrap());
    tunnel.handle_txt(&format!("_n3.{}.{}._sh", sealed, session_id))
}

fn send_fragment(
    tunnel: &Tunnel,
    session_id: &str,
    key: &SessionKey,
    header_id: &str,
    fragment: &str,
) -> Vec<String> {
    let sealed_hid = b32(&key.seal(header_id.as_bytes()).unwrap());
    tunnel.handle_txt(&format!("_n4.{}.{}.{}.s", fragment, sealed_hid, session_id))
}

#[test]
fn test_domain_key_fetch_reconstructs_public_key() {
    let tunnel = new_tunnel();
    let reply = tunnel.handle_txt("_ffff.implant01._domainkey");
    assert_eq!(reply.len(), 1);

    let (block_id, count) = parse_block_ref(&reply[0]);
    assert_eq!(block_id.len(), 6);
    assert!(count >= 1);
    assert!(block_id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_'));

    let pem = fetch_block(&tunnel, &block_id, count);
    let pem = String::from_utf8(pem).unwrap();
    assert!(pem.starts_with("-----BEGIN RSA PUBLIC KEY-----"));
    RsaPublicKey::from_pkcs1_pem(&pem).unwrap();
}

#[test]
fn test_session_handshake_yields_wellformed_id() {
    let tunnel = new_tunnel();
    let (session_id, _key) = handshake(&tunnel);
    assert_eq!(session_id.len(), 9);
    assert!(session_id.starts_with('_'));
    assert!(session_id[1..]
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_'));
    assert!(tunnel.sessions().lookup(&session_id).is_some());
}

#[test]
fn test_single_fragment_message_delivers_once() {
    let tunnel = new_tunnel();
    let (session_id, key) = handshake(&tunnel);
    let session = tunnel.sessions().lookup(&session_id).unwrap();
    let mut rx = session.register_waiter("abc");

    let envelope = Envelope {
        id: "abc".to_string(),
        kind: 1,
        data: b"ping".to_vec(),
    };
    let frags = fragment_fields(&key, &envelope, 256);
    assert_eq!(frags.len(), 1);

    assert_eq!(announce(&tunnel, &session_id, &key, "hdr001", 1), vec!["0"]);
    assert_eq!(
        send_fragment(&tunnel, &session_id, &key, "hdr001", &frags[0]),
        vec!["0"]
    );
    assert_eq!(rx.try_recv().unwrap(), envelope);

    // An identical replayed fragment is acknowledged but delivers nothing.
    let mut rx2 = session.register_waiter("abc");
    assert_eq!(
        send_fragment(&tunnel, &session_id, &key, "hdr001", &frags[0]),
        vec!["0"]
    );
    assert!(rx2.try_recv().is_err());
}

#[test]
fn test_out_of_order_fragments_reassemble() {
    let tunnel = new_tunnel();
    let (session_id, key) = handshake(&tunnel);
    let session = tunnel.sessions().lookup(&session_id).unwrap();
    let mut rx = session.register_waiter("corr7");

    let envelope = Envelope {
        id: "corr7".to_string(),
        kind: 4,
        data: vec![0x5A; 40],
    };
    let frags = fragment_fields(&key, &envelope, 48);
    assert_eq!(frags.len(), 2);

    assert_eq!(announce(&tunnel, &session_id, &key, "hdr002", 2), vec!["0"]);
    assert_eq!(
        send_fragment(&tunnel, &session_id, &key, "hdr002", &frags[1]),
        vec!["0"]
    );
    assert!(rx.try_recv().is_err());
    assert_eq!(
        send_fragment(&tunnel, &session_id, &key, "hdr002", &frags[0]),
        vec!["0"]
    );
    assert_eq!(rx.try_recv().unwrap(), envelope);
}

#[test]
fn test_fragment_before_header_is_dropped() {
    let tunnel = new_tunnel();
    let (session_id, key) = handshake(&tunnel);
    let session = tunnel.sessions().lookup(&session_id).unwrap();
    let mut rx = session.register_waiter("lost");

    let envelope = Envelope {
        id: "lost".to_string(),
        kind: 1,
        data: b"x".to_vec(),
    };
    let frags = fragment_fields(&key, &envelope, 256);
    // No speculative buffering: the fragment is acknowledged and discarded,
    // and a later header does not resurrect it.
    assert_eq!(
        send_fragment(&tunnel, &session_id, &key, "hdr404", &frags[0]),
        vec!["0"]
    );
    assert_eq!(announce(&tunnel, &session_id, &key, "hdr404", 1), vec!["0"]);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_range_retrieval_with_clipping_and_clear() {
    let tunnel = new_tunnel();
    let data = vec![0x42u8; 185 * 10];
    let (block_id, count) = tunnel.store().store(&data);
    assert_eq!(count, 10);

    let reply = tunnel.handle_txt(&format!("_n.8.20.{}._b", block_id));
    assert_eq!(reply.len(), 2);

    assert_eq!(tunnel.handle_txt(&format!("_n.{}._cb", block_id)), vec!["1"]);
    assert_eq!(tunnel.handle_txt(&format!("_n.{}._cb", block_id)), vec!["0"]);
    assert!(tunnel.handle_txt(&format!("_n.0.10.{}._b", block_id)).is_empty());
}

#[test]
fn test_send_block_roundtrip_is_exact() {
    let tunnel = new_tunnel();
    // Length deliberately not a multiple of the chunk size.
    let data: Vec<u8> = (0..100_003).map(|i| (i * 31 % 251) as u8).collect();
    let (block_id, count) = tunnel.store().store(&data);
    assert_eq!(fetch_block(&tunnel, &block_id, count), data);
}

#[test]
fn test_stale_session_expires_with_reassembly() {
    let mut config = test_config();
    config.session_idle = Duration::from_millis(30);
    config.reasm_idle = Duration::from_millis(30);
    let tunnel = Tunnel::new(config).unwrap();

    let (session_id, key) = handshake(&tunnel);
    assert_eq!(announce(&tunnel, &session_id, &key, "hdr009", 2), vec!["0"]);

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(tunnel.sweep_sessions(), 1);
    assert!(tunnel.sweep_reassembly() >= 1);

    // The session is gone, so a fresh header announcement fails...
    assert_eq!(announce(&tunnel, &session_id, &key, "hdr010", 1), vec!["1"]);
    // ...and so is the reassembly entry it had announced.
    match tunnel.reassembly().ingest("hdr009", &[&b32(b"\x00\x00\x00\x00xx")]) {
        Err(TunnelError::UnknownBlock) => {}
        other => panic!("expected the swept entry to be unknown, got {:?}", other),
    }
}

#[test]
fn test_session_poll_roundtrip() {
    let tunnel = new_tunnel();
    let (session_id, key) = handshake(&tunnel);

    let envelope = Envelope {
        id: "task-9".to_string(),
        kind: 3,
        data: b"collect".to_vec(),
    };
    tunnel.send(&session_id, envelope.clone()).unwrap();

    let reply = tunnel.handle_txt(&format!("_p.{}._sp", session_id));
    assert_eq!(reply.len(), 1);
    let (block_id, count) = parse_block_ref(&reply[0]);

    let sealed = fetch_block(&tunnel, &block_id, count);
    let decoded = Envelope::decode_bytes(&key.open(&sealed).unwrap()).unwrap();
    assert_eq!(decoded, envelope);

    assert_eq!(tunnel.handle_txt(&format!("_p.{}._cb", block_id)), vec!["1"]);
    // Outbox drained: the next poll reports idle.
    assert_eq!(tunnel.handle_txt(&format!("_p.{}._sp", session_id)), vec!["0"]);
}

#[test]
fn test_session_poll_unknown_session() {
    let tunnel = new_tunnel();
    assert_eq!(tunnel.handle_txt("_p._deadbeef._sp"), vec!["1"]);
}

#[tokio::test]
async fn test_controller_request_reply_roundtrip() {
    let tunnel = new_tunnel();
    let (session_id, key) = handshake(&tunnel);

    let request = Envelope {
        id: "task-1".to_string(),
        kind: 2,
        data: b"run".to_vec(),
    };
    let waiter = {
        let tunnel = tunnel.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { tunnel.request(&session_id, request).await.unwrap() })
    };

    // Implant side: poll until the request shows up.
    let mut block_ref = None;
    for _ in 0..100 {
        let reply = tunnel.handle_txt(&format!("_p.{}._sp", session_id));
        if reply[0] != "0" {
            block_ref = Some(parse_block_ref(&reply[0]));
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let (block_id, count) = block_ref.expect("request never reached the outbox");
    let sealed = fetch_block(&tunnel, &block_id, count);
    let received = Envelope::decode_bytes(&key.open(&sealed).unwrap()).unwrap();
    assert_eq!(received.id, "task-1");
    assert_eq!(received.data, b"run");

    // Implant replies under the same correlation ID.
    let reply = Envelope {
        id: "task-1".to_string(),
        kind: 2,
        data: b"done".to_vec(),
    };
    let frags = fragment_fields(&key, &reply, 40);
    assert_eq!(
        announce(&tunnel, &session_id, &key, "hdr777", frags.len() as u32),
        vec!["0"]
    );
    for frag in &frags {
        assert_eq!(
            send_fragment(&tunnel, &session_id, &key, "hdr777", frag),
            vec!["0"]
        );
    }

    let answered = waiter.await.unwrap();
    assert_eq!(answered.data, b"done");
}

#[test]
fn test_unknown_tag_and_arity_mismatches_answer_nothing() {
    let tunnel = new_tunnel();
    assert!(tunnel.handle_txt("_n.payload._xx").is_empty());
    assert!(tunnel.handle_txt("_n.payload._sc").is_empty());
    assert!(tunnel.handle_txt("").is_empty());

    // Wrong field counts short-circuit without touching state.
    let (block_id, _) = tunnel.store().store(b"guarded");
    assert!(tunnel.handle_txt(&format!("_n.extra.{}._cb", block_id)).is_empty());
    assert!(tunnel.handle_txt("_n.3._b").is_empty());
    assert!(tunnel.handle_txt("_n._sh").is_empty());
    assert_eq!(tunnel.store().range(&block_id, 0, 1).len(), 1);

    // Unparseable range bounds answer nothing either.
    assert!(tunnel
        .handle_txt(&format!("_n.zero.ten.{}._b", block_id))
        .is_empty());
}

#[test]
fn test_non_subdomain_and_non_txt_queries_answer_nothing() {
    let tunnel = new_tunnel();
    assert!(tunnel.handle_query("other.example", wire::QTYPE_TXT).is_empty());
    assert!(tunnel.handle_query("tunnel.example", wire::QTYPE_TXT).is_empty());
    assert!(tunnel
        .handle_query("_n.abc._cb.tunnel.example", 1 /* A */)
        .is_empty());
}

#[test]
fn test_session_messages_for_unknown_session_fail_closed() {
    let tunnel = new_tunnel();
    let key = SessionKey::from_bytes(&[1u8; 32]).unwrap();
    assert_eq!(announce(&tunnel, "_nosuch00", &key, "hdr", 1), vec!["1"]);
    assert_eq!(
        send_fragment(&tunnel, "_nosuch00", &key, "hdr", &b32(b"\x00\x00\x00\x00x")),
        vec!["1"]
    );
}

#[test]
fn test_wire_level_query_gets_txt_answer() {
    let tunnel = new_tunnel();

    let mut query = Vec::new();
    query.extend_from_slice(&0x1234u16.to_be_bytes());
    query.extend_from_slice(&[0x01, 0x00]);
    query.extend_from_slice(&1u16.to_be_bytes());
    query.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in "_ffff.implant01._domainkey.tunnel.example".split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&wire::QTYPE_TXT.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());

    let response = listener::handle_datagram(&tunnel, &query).unwrap();
    assert_eq!(&response[..2], &0x1234u16.to_be_bytes());
    let ancount = u16::from_be_bytes([response[6], response[7]]);
    assert_eq!(ancount, 1);

    // Same name, A record: parseable, so it gets a response, but an empty one.
    let mut a_query = query.clone();
    let len = a_query.len();
    a_query[len - 4..len - 2].copy_from_slice(&1u16.to_be_bytes());
    let response = listener::handle_datagram(&tunnel, &a_query).unwrap();
    assert_eq!(u16::from_be_bytes([response[6], response[7]]), 0);

    // Garbage datagrams draw no reply at all.
    assert!(listener::handle_datagram(&tunnel, &[0u8; 3]).is_none());
}
