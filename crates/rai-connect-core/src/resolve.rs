//! Upstream name resolution. The hosts block points the official hosts at
//! loopback, so asking the OS resolver would route the proxy back onto
//! itself; queries go straight to a public resolver over UDP instead.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Standard recursive query: RD set.
const FLAGS_QUERY: u16 = 0x0100;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dns query for {0} timed out")]
    Timeout(String),
    #[error("no usable address for {0}")]
    NoRecords(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct CacheEntry {
    addr: Ipv4Addr,
    expires: Instant,
}

/// A-record resolver with a small positive cache.
pub struct Resolver {
    server: SocketAddr,
    cache: Mutex<HashMap<String, CacheEntry>>,
    next_id: AtomicU16,
}

impl Resolver {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            cache: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(1),
        }
    }

    pub async fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            if ip.is_loopback() {
                return Err(ResolveError::NoRecords(host.to_string()));
            }
            return Ok(ip);
        }

        let key = host.to_ascii_lowercase();
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.expires > Instant::now() {
                    return Ok(entry.addr);
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let query = build_query(id, &key);

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.send_to(&query, self.server).await?;

        let deadline = Instant::now() + QUERY_TIMEOUT;
        let mut buf = [0u8; 2048];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| ResolveError::Timeout(host.to_string()))?;
            let n = match tokio::time::timeout(remaining, socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(ResolveError::Timeout(host.to_string())),
            };

            match parse_a_response(&buf[..n], id) {
                // A stray datagram with the wrong id; keep waiting.
                ParseOutcome::WrongId => continue,
                ParseOutcome::NoAnswer => return Err(ResolveError::NoRecords(host.to_string())),
                ParseOutcome::Answer(addr) => {
                    tracing::debug!(host = %key, addr = %addr, "resolved upstream host");
                    self.cache.lock().unwrap().insert(
                        key,
                        CacheEntry {
                            addr,
                            expires: Instant::now() + CACHE_TTL,
                        },
                    );
                    return Ok(addr);
                }
            }
        }
    }
}

enum ParseOutcome {
    Answer(Ipv4Addr),
    NoAnswer,
    WrongId,
}

/// Build a single-question A query for `domain`.
fn build_query(id: u16, domain: &str) -> Vec<u8> {
    let mut query = Vec::with_capacity(32);

    // Header
    query.extend_from_slice(&id.to_be_bytes());
    query.extend_from_slice(&FLAGS_QUERY.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    query.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    query.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    query.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    // Question
    encode_domain_name(&mut query, domain);
    query.extend_from_slice(&TYPE_A.to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());

    query
}

fn encode_domain_name(out: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// Walk a response and pull out the first non-loopback A record.
fn parse_a_response(data: &[u8], expected_id: u16) -> ParseOutcome {
    if data.len() < 12 {
        return ParseOutcome::NoAnswer;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    if id != expected_id {
        return ParseOutcome::WrongId;
    }

    let flags = u16::from_be_bytes([data[2], data[3]]);
    let is_response = flags & 0x8000 != 0;
    let rcode = flags & 0x000F;
    if !is_response || rcode != 0 {
        return ParseOutcome::NoAnswer;
    }

    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

    let mut offset = 12;

    // Skip the echoed question section.
    for _ in 0..qdcount {
        offset = match skip_name(data, offset) {
            Some(o) => o + 4, // QTYPE + QCLASS
            None => return ParseOutcome::NoAnswer,
        };
    }

    for _ in 0..ancount {
        offset = match skip_name(data, offset) {
            Some(o) => o,
            None => return ParseOutcome::NoAnswer,
        };
        if offset + 10 > data.len() {
            return ParseOutcome::NoAnswer;
        }
        let rtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let rdlen = u16::from_be_bytes([data[offset + 8], data[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlen > data.len() {
            return ParseOutcome::NoAnswer;
        }

        if rtype == TYPE_A && rdlen == 4 {
            let addr = Ipv4Addr::new(
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            );
            // A loopback answer would recurse into our own listener.
            if !addr.is_loopback() {
                return ParseOutcome::Answer(addr);
            }
        }
        offset += rdlen;
    }

    ParseOutcome::NoAnswer
}

/// Advance past a (possibly compressed) name; returns the next offset.
fn skip_name(data: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *data.get(offset)? as usize;
        if len == 0 {
            return Some(offset + 1);
        }
        // Compression pointer: two bytes, ends the name.
        if len & 0xC0 == 0xC0 {
            return Some(offset + 2);
        }
        offset += 1 + len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_response(id: u16, domain: &str, answers: &[Ipv4Addr]) -> Vec<u8> {
        let mut resp = Vec::new();
        resp.extend_from_slice(&id.to_be_bytes());
        resp.extend_from_slice(&0x8180u16.to_be_bytes());
        resp.extend_from_slice(&1u16.to_be_bytes());
        resp.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());

        encode_domain_name(&mut resp, domain);
        resp.extend_from_slice(&TYPE_A.to_be_bytes());
        resp.extend_from_slice(&CLASS_IN.to_be_bytes());

        for addr in answers {
            resp.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
            resp.extend_from_slice(&TYPE_A.to_be_bytes());
            resp.extend_from_slice(&CLASS_IN.to_be_bytes());
            resp.extend_from_slice(&60u32.to_be_bytes());
            resp.extend_from_slice(&4u16.to_be_bytes());
            resp.extend_from_slice(&addr.octets());
        }
        resp
    }

    #[test]
    fn test_query_layout() {
        let query = build_query(0x1234, "c.ppy.sh");
        assert_eq!(&query[..2], &[0x12, 0x34]);
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        assert_eq!(&query[4..6], &[0x00, 0x01]);
        // "c" label, "ppy" label, "sh" label, root
        assert_eq!(&query[12..], b"\x01c\x03ppy\x02sh\x00\x00\x01\x00\x01");
    }

    #[test]
    fn test_parse_answer() {
        let resp = fake_response(7, "osu.ppy.sh", &[Ipv4Addr::new(198, 51, 100, 7)]);
        match parse_a_response(&resp, 7) {
            ParseOutcome::Answer(addr) => assert_eq!(addr, Ipv4Addr::new(198, 51, 100, 7)),
            _ => panic!("expected an answer"),
        }
    }

    #[test]
    fn test_wrong_id_is_ignored() {
        let resp = fake_response(7, "osu.ppy.sh", &[Ipv4Addr::new(198, 51, 100, 7)]);
        assert!(matches!(parse_a_response(&resp, 8), ParseOutcome::WrongId));
    }

    #[test]
    fn test_loopback_answers_are_skipped() {
        let resp = fake_response(
            9,
            "osu.ppy.sh",
            &[Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(198, 51, 100, 9)],
        );
        match parse_a_response(&resp, 9) {
            ParseOutcome::Answer(addr) => assert_eq!(addr, Ipv4Addr::new(198, 51, 100, 9)),
            _ => panic!("expected the non-loopback answer"),
        }
    }

    #[test]
    fn test_all_loopback_is_no_answer() {
        let resp = fake_response(9, "osu.ppy.sh", &[Ipv4Addr::new(127, 0, 0, 1)]);
        assert!(matches!(parse_a_response(&resp, 9), ParseOutcome::NoAnswer));
    }

    #[tokio::test]
    async fn test_literal_ip_short_circuits() {
        let resolver = Resolver::new(SocketAddr::from(([1, 1, 1, 1], 53)));
        let addr = resolver.resolve("203.0.113.5").await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(203, 0, 113, 5));
        assert!(resolver.resolve("127.0.0.1").await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_against_local_stub_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let id = u16::from_be_bytes([buf[0], buf[1]]);
            assert!(n > 12);
            let resp = fake_response(id, "osu.ppy.sh", &[Ipv4Addr::new(192, 0, 2, 44)]);
            server.send_to(&resp, peer).await.unwrap();
        });

        let resolver = Resolver::new(server_addr);
        let addr = resolver.resolve("osu.ppy.sh").await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(192, 0, 2, 44));

        // Second lookup is served from cache; the stub only answers once.
        let again = resolver.resolve("OSU.ppy.sh").await.unwrap();
        assert_eq!(again, addr);
    }
}
