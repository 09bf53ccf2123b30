//! Captive-portal catch-all DNS: answers every query with the gateway's
//! own AP address, so any client joined to the self-AP lands on the
//! provisioning page regardless of what hostname it asked for. The
//! pack's only DNS crate (a resolver) is a client, not a server, so this
//! stays a small hand-rolled UDP responder rather than reaching for a
//! mismatched dependency.

use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const MAX_DNS_PACKET: usize = 512;

/// Binds a UDP socket and answers every incoming query with a single A
/// record pointing at `answer_ip`. Runs until the socket errors out;
/// cancellation is by process exit on leaving AP mode, per the
/// concurrency model's captive-DNS entry.
pub async fn serve_catchall(bind_addr: SocketAddr, answer_ip: Ipv4Addr) -> std::io::Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    let mut buf = [0u8; MAX_DNS_PACKET];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        match build_response(&buf[..len], answer_ip) {
            Some(response) => {
                if let Err(e) = socket.send_to(&response, from).await {
                    warn!(?e, "failed to send captive dns response");
                }
            }
            None => debug!(%from, "dropping malformed captive dns query"),
        }
    }
}

/// Parses just enough of the query to echo back the id and question,
/// then appends one A record for `qtype == A`. Anything that doesn't
/// look like a well-formed single-question query is dropped.
fn build_response(query: &[u8], answer_ip: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < 12 {
        return None;
    }
    let id = &query[0..2];
    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if qdcount != 1 {
        return None;
    }

    // Walk the question name to its terminator. A real query never uses
    // a compression pointer in the question section itself.
    let mut pos = 12usize;
    loop {
        let len = *query.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + len;
        if pos > query.len() {
            return None;
        }
    }
    let question_end = pos + 4; // qtype + qclass
    if question_end > query.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([query[pos], query[pos + 1]]);
    let question = &query[12..question_end];

    let mut out = Vec::with_capacity(question_end + 16);
    out.extend_from_slice(id);
    out.extend_from_slice(&[0x81, 0x80]); // response, recursion available, no error
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // an/ns/ar counts, ancount patched below
    out.extend_from_slice(question);

    if qtype == 1 {
        // A record, name given via a compression pointer back to the question.
        out.extend_from_slice(&[0xC0, 0x0C]);
        out.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
        out.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
        out.extend_from_slice(&60u32.to_be_bytes()); // TTL
        out.extend_from_slice(&4u16.to_be_bytes()); // RDLENGTH
        out.extend_from_slice(&answer_ip.octets());
        out[6..8].copy_from_slice(&1u16.to_be_bytes()); // ancount = 1
    }
    // Non-A queries get an empty-answer response, still id-matched.
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut q = Vec::new();
        q.extend_from_slice(&[0x12, 0x34]); // id
        q.extend_from_slice(&[0x01, 0x00]); // standard query, recursion desired
        q.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        q.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        for label in name.split('.') {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&qtype.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes()); // class IN
        q
    }

    #[test]
    fn a_query_gets_an_answer_pointing_at_the_configured_ip() {
        let query = build_query("captive.example.com", 1);
        let response = build_response(&query, Ipv4Addr::new(192, 168, 4, 1)).unwrap();
        assert_eq!(&response[0..2], &[0x12, 0x34]);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1);
        assert_eq!(&response[response.len() - 4..], &[192, 168, 4, 1]);
    }

    #[test]
    fn malformed_query_is_rejected() {
        assert!(build_response(&[0u8; 4], Ipv4Addr::new(192, 168, 4, 1)).is_none());
    }

    #[test]
    fn multi_question_query_is_rejected() {
        let mut query = build_query("a.com", 1);
        query[5] = 2; // qdcount = 2, but only one question follows
        assert!(build_response(&query, Ipv4Addr::new(192, 168, 4, 1)).is_none());
    }

    #[test]
    fn non_a_query_still_gets_an_id_matched_empty_answer() {
        let query = build_query("example.com", 28); // AAAA
        let response = build_response(&query, Ipv4Addr::new(192, 168, 4, 1)).unwrap();
        assert_eq!(&response[0..2], &[0x12, 0x34]);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 0);
    }
}
