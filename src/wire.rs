//! Minimal DNS packet codec for the listener.
//!
//! Parses the header and first question of an inbound UDP datagram and
//! builds authoritative responses whose only answer (if any) is a single TXT
//! record carrying the router's reply strings. TTL is pinned to 0 to
//! discourage intermediate caching.

use crate::codec::MAX_TXT_STRING;

pub const QTYPE_TXT: u16 = 16;
const QCLASS_IN: u16 = 1;

// QR | AA, RCODE 0.
const RESPONSE_FLAGS: u16 = 0x8400;

// Keep responses inside a conservative EDNS payload size; clients
// re-request any range this truncates.
const MAX_RDATA: usize = 3600;

#[derive(Debug)]
pub struct ParsedQuery {
    pub txid: u16,
    pub qname: String,
    pub qtype: u16,
    /// Raw question section bytes, echoed verbatim into the response.
    pub question: Vec<u8>,
}

/// Parses the first question of a DNS query. Returns `None` on anything
/// malformed; the listener stays silent for unparseable datagrams.
pub fn parse_query(packet: &[u8]) -> Option<ParsedQuery> {
    if packet.len() < 12 {
        return None;
    }
    let txid = u16::from_be_bytes([packet[0], packet[1]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut pos = 12;
    let mut labels: Vec<String> = Vec::new();
    loop {
        let len = *packet.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len > 63 {
            return None;
        }
        let label = packet.get(pos..pos + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += len;
    }
    let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
    let qclass = u16::from_be_bytes([*packet.get(pos + 2)?, *packet.get(pos + 3)?]);
    if qclass != QCLASS_IN {
        return None;
    }

    Some(ParsedQuery {
        txid,
        qname: labels.join("."),
        qtype,
        question: packet[12..pos + 4].to_vec(),
    })
}

/// Builds an authoritative response. An empty `answers` list produces an
/// empty answer section with RCODE 0 — never NXDOMAIN or SERVFAIL.
pub fn build_response(txid: u16, question: &[u8], answers: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + question.len());
    out.extend_from_slice(&txid.to_be_bytes());
    out.extend_from_slice(&RESPONSE_FLAGS.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    let ancount: u16 = if answers.is_empty() { 0 } else { 1 };
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    out.extend_from_slice(question);

    if !answers.is_empty() {
        out.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        out.extend_from_slice(&QTYPE_TXT.to_be_bytes());
        out.extend_from_slice(&QCLASS_IN.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // TTL 0

        let mut rdata = Vec::new();
        for answer in answers {
            let bytes = answer.as_bytes();
            if bytes.len() > MAX_TXT_STRING {
                log::warn!("dropping oversized TXT string ({} bytes)", bytes.len());
                continue;
            }
            if rdata.len() + 1 + bytes.len() > MAX_RDATA {
                log::debug!("answer truncated at {} bytes of rdata", rdata.len());
                break;
            }
            rdata.push(bytes.len() as u8);
            rdata.extend_from_slice(bytes);
        }
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }
    out
}
