//! Minimal HTTP/1.1 framing over raw byte streams. The router only needs
//! request heads, the dispatcher streams bodies through verbatim, and the
//! Bancho splicer takes the underlying stream back once the login exchange
//! is done - so messages are parsed at the byte level instead of through a
//! full client/server stack.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for one message head (and for any single chunk-size line).
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Headers that only concern the hop between the client and this proxy.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("message head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("malformed http message: {0}")]
    Malformed(&'static str),
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed request line + headers. Header names keep their original casing;
/// lookups are case-insensitive.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Framing of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// Delimited by connection close (responses only).
    Close,
}

impl BodyKind {
    /// Whether the connection can carry another message after this body.
    pub fn delimited(&self) -> bool {
        !matches!(self, BodyKind::Close)
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn body_kind(&self) -> Result<BodyKind, HttpError> {
        if let Some(te) = self.header("transfer-encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyKind::Chunked);
            }
            return Err(HttpError::Malformed("unsupported transfer encoding"));
        }
        match self.header("content-length") {
            Some(v) => {
                let n: u64 = v
                    .trim()
                    .parse()
                    .map_err(|_| HttpError::Malformed("bad content-length"))?;
                Ok(if n == 0 { BodyKind::Empty } else { BodyKind::Length(n) })
            }
            None => Ok(BodyKind::Empty),
        }
    }

    /// HTTP/1.1 keeps the connection open unless the client opts out;
    /// HTTP/1.0 is the other way around.
    pub fn wants_close(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => true,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
            _ => self.version == "HTTP/1.0",
        }
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn body_kind(&self, request_method: &str) -> Result<BodyKind, HttpError> {
        if request_method == "HEAD"
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyKind::Empty);
        }
        if let Some(te) = self.header("transfer-encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyKind::Chunked);
            }
            return Err(HttpError::Malformed("unsupported transfer encoding"));
        }
        match self.header("content-length") {
            Some(v) => {
                let n: u64 = v
                    .trim()
                    .parse()
                    .map_err(|_| HttpError::Malformed("bad content-length"))?;
                Ok(if n == 0 { BodyKind::Empty } else { BodyKind::Length(n) })
            }
            None => Ok(BodyKind::Close),
        }
    }

    pub fn wants_close(&self) -> bool {
        matches!(self.header("connection"), Some(v) if v.eq_ignore_ascii_case("close"))
    }
}

pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead, HttpError> {
    let text = std::str::from_utf8(raw).map_err(|_| HttpError::Malformed("non-utf8 head"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HttpError::Malformed("empty head"))?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or(HttpError::Malformed("missing method"))?;
    let target = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or(HttpError::Malformed("missing request target"))?;
    let version = parts.next().ok_or(HttpError::Malformed("missing version"))?;
    if !version.starts_with("HTTP/") {
        return Err(HttpError::Malformed("bad http version"));
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: parse_header_lines(lines)?,
    })
}

pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead, HttpError> {
    let text = std::str::from_utf8(raw).map_err(|_| HttpError::Malformed("non-utf8 head"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(HttpError::Malformed("empty head"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(HttpError::Malformed("missing version"))?;
    if !version.starts_with("HTTP/") {
        return Err(HttpError::Malformed("bad http version"));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(HttpError::Malformed("bad status code"))?;

    Ok(ResponseHead {
        status,
        headers: parse_header_lines(lines)?,
    })
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, HttpError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::Malformed("header without colon"))?;
        if name.is_empty() {
            return Err(HttpError::Malformed("empty header name"));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Serializes the outbound request head for `target_host`: the Host header
/// is rewritten, hop-by-hop headers are dropped, and chunked framing is
/// re-applied when the body is forwarded chunk-by-chunk.
pub fn build_forward_head(
    req: &RequestHead,
    target_host: &str,
    path_override: Option<&str>,
    body: BodyKind,
) -> Vec<u8> {
    let path = path_override.unwrap_or(&req.target);
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method, path).into_bytes();
    out.extend_from_slice(format!("Host: {}\r\n", target_host).as_bytes());

    for (name, value) in &req.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }

    if body == BodyKind::Chunked {
        out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Variant of [`build_forward_head`] for a fully buffered body: framing
/// headers are replaced with the exact Content-Length.
pub fn build_forward_head_buffered(
    req: &RequestHead,
    target_host: &str,
    body_len: usize,
) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method, req.target).into_bytes();
    out.extend_from_slice(format!("Host: {}\r\n", target_host).as_bytes());

    for (name, value) in &req.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || lower == "content-length" || HOP_BY_HOP_HEADERS.contains(&lower.as_str())
        {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }

    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body_len).as_bytes());
    out
}

/// Canned bodyless response.
pub fn simple_response(status: u16, reason: &str, close: bool) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: {}\r\n\r\n",
        status,
        reason,
        if close { "close" } else { "keep-alive" }
    )
    .into_bytes()
}

/// Canned `302 Found` pointing at the mirror.
pub fn redirect_response(location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
        location
    )
    .into_bytes()
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError::Malformed("bad chunk size"))?;
    let text = text.trim_end_matches(['\r', '\n']);
    let size_part = text.split(';').next().unwrap_or(text).trim();
    u64::from_str_radix(size_part, 16).map_err(|_| HttpError::Malformed("bad chunk size"))
}

/// A byte stream with a read-ahead buffer, so message heads can be peeled
/// off and the remaining bytes handed over intact (the Bancho splicer takes
/// the raw stream back after the login response head).
pub struct HttpStream<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Returns the raw stream plus any bytes read past the last message.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Whether the read-ahead buffer is empty (nothing pipelined).
    pub fn buffer_is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Reads one message head through the terminating blank line and returns
    /// its raw bytes. `Ok(None)` means the peer closed cleanly before
    /// starting another message.
    pub async fn read_head(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        let mut scanned = 0usize;
        loop {
            if let Some(end) = find_head_end(&self.buf, scanned) {
                let head: Vec<u8> = self.buf.drain(..end).collect();
                return Ok(Some(head));
            }
            scanned = self.buf.len().saturating_sub(3);

            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(HttpError::HeadTooLarge);
            }
            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(HttpError::UnexpectedEof)
                };
            }
        }
    }

    /// Reads one LF-terminated line, returned raw (used for chunk framing).
    async fn read_line(&mut self) -> Result<Vec<u8>, HttpError> {
        let mut scanned = 0usize;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=scanned + pos).collect();
                return Ok(line);
            }
            scanned = self.buf.len();

            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(HttpError::Malformed("oversized chunk-size line"));
            }
            if self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
        }
    }

    /// Copies exactly `n` bytes from this stream into `dst`.
    async fn copy_exact<W>(&mut self, dst: &mut W, mut n: u64) -> Result<(), HttpError>
    where
        W: AsyncWrite + Unpin,
    {
        while n > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
            let take = (self.buf.len() as u64).min(n) as usize;
            dst.write_all(&self.buf[..take]).await?;
            self.buf.drain(..take);
            n -= take as u64;
        }
        Ok(())
    }

    async fn copy_to_eof<W>(&mut self, dst: &mut W) -> Result<(), HttpError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            if !self.buf.is_empty() {
                dst.write_all(&self.buf).await?;
                self.buf.clear();
            }
            if self.fill().await? == 0 {
                return Ok(());
            }
        }
    }

    /// Streams one message body into `dst` according to its framing. Chunk
    /// framing is forwarded verbatim, so the receiver sees the exact bytes
    /// the sender produced.
    pub async fn copy_body<W>(&mut self, dst: &mut W, kind: BodyKind) -> Result<(), HttpError>
    where
        W: AsyncWrite + Unpin,
    {
        match kind {
            BodyKind::Empty => Ok(()),
            BodyKind::Length(n) => self.copy_exact(dst, n).await,
            BodyKind::Close => self.copy_to_eof(dst).await,
            BodyKind::Chunked => {
                loop {
                    let line = self.read_line().await?;
                    let size = parse_chunk_size(&line)?;
                    dst.write_all(&line).await?;
                    if size == 0 {
                        break;
                    }
                    // Chunk data plus its trailing CRLF.
                    self.copy_exact(dst, size + 2).await?;
                }
                // Trailer section through the terminating blank line.
                loop {
                    let line = self.read_line().await?;
                    dst.write_all(&line).await?;
                    if line.as_slice() == b"\r\n" || line.as_slice() == b"\n" {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    /// Buffers one message body fully, bounded by `cap`.
    pub async fn read_body(&mut self, kind: BodyKind, cap: usize) -> Result<Vec<u8>, HttpError> {
        match kind {
            BodyKind::Empty => Ok(Vec::new()),
            BodyKind::Length(n) => {
                if n > cap as u64 {
                    return Err(HttpError::Malformed("body exceeds buffer cap"));
                }
                let mut out = Vec::with_capacity(n as usize);
                while (out.len() as u64) < n {
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        return Err(HttpError::UnexpectedEof);
                    }
                    let take = ((n - out.len() as u64) as usize).min(self.buf.len());
                    out.extend(self.buf.drain(..take));
                }
                Ok(out)
            }
            BodyKind::Chunked => {
                let mut out = Vec::new();
                loop {
                    let line = self.read_line().await?;
                    let size = parse_chunk_size(&line)? as usize;
                    if size == 0 {
                        loop {
                            let l = self.read_line().await?;
                            if l.as_slice() == b"\r\n" || l.as_slice() == b"\n" {
                                break;
                            }
                        }
                        return Ok(out);
                    }
                    if out.len() + size > cap {
                        return Err(HttpError::Malformed("body exceeds buffer cap"));
                    }
                    let chunk = self.take_exact(size + 2).await?;
                    out.extend_from_slice(&chunk[..size]);
                }
            }
            BodyKind::Close => {
                let mut out = Vec::new();
                loop {
                    if !self.buf.is_empty() {
                        if out.len() + self.buf.len() > cap {
                            return Err(HttpError::Malformed("body exceeds buffer cap"));
                        }
                        out.append(&mut self.buf);
                    }
                    if self.fill().await? == 0 {
                        return Ok(out);
                    }
                }
            }
        }
    }

    async fn take_exact(&mut self, n: usize) -> Result<Vec<u8>, HttpError> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
        }
        Ok(self.buf.drain(..n).collect())
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}

/// Index just past the `\r\n\r\n` terminator, scanning from `from` (backed
/// off enough to catch a terminator split across fills).
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.saturating_sub(3);
    buf[start..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| start + pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with(bytes: &[u8]) -> HttpStream<tokio::io::DuplexStream> {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            tx.write_all(&bytes).await.unwrap();
            tx.shutdown().await.unwrap();
        });
        HttpStream::new(rx)
    }

    #[tokio::test]
    async fn test_read_and_parse_request_head() {
        let raw = b"GET /d/1234 HTTP/1.1\r\nHost: osu.ppy.sh\r\nUser-Agent: osu!\r\n\r\n";
        let mut stream = stream_with(raw);

        let head = stream.read_head().await.unwrap().unwrap();
        assert_eq!(head, raw);

        let req = parse_request_head(&head).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/d/1234");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("osu.ppy.sh"));
        assert_eq!(req.header("HOST"), Some("osu.ppy.sh"));
        assert!(!req.wants_close());
    }

    #[tokio::test]
    async fn test_head_split_across_tiny_reads() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let (mut tx, rx) = tokio::io::duplex(8);
        let bytes = raw.to_vec();
        tokio::spawn(async move {
            for b in bytes {
                tx.write_all(&[b]).await.unwrap();
                tx.flush().await.unwrap();
            }
        });

        let mut stream = HttpStream::new(rx);
        let head = stream.read_head().await.unwrap().unwrap();
        assert_eq!(head, raw);
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let mut stream = stream_with(b"");
        assert!(stream.read_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_head_is_an_error() {
        let mut stream = stream_with(b"GET / HTTP/1.1\r\nHost");
        assert!(matches!(
            stream.read_head().await,
            Err(HttpError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_pipelined_bytes_stay_buffered() {
        let mut stream = stream_with(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = stream.read_head().await.unwrap().unwrap();
        assert!(first.starts_with(b"GET /a"));
        let second = stream.read_head().await.unwrap().unwrap();
        assert!(second.starts_with(b"GET /b"));
    }

    #[tokio::test]
    async fn test_body_copy_with_content_length() {
        let mut stream = stream_with(b"hello worldEXTRA");
        let mut out = Vec::new();
        {
            let mut cursor = std::io::Cursor::new(&mut out);
            stream
                .copy_body(&mut cursor, BodyKind::Length(11))
                .await
                .unwrap();
        }
        assert_eq!(out, b"hello world");
        // The trailing bytes stay available for the next message.
        assert!(!stream.buffer_is_empty());
    }

    #[tokio::test]
    async fn test_chunked_body_forwarded_verbatim() {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut stream = stream_with(raw);
        let mut out = Vec::new();
        {
            let mut cursor = std::io::Cursor::new(&mut out);
            stream.copy_body(&mut cursor, BodyKind::Chunked).await.unwrap();
        }
        assert_eq!(out, raw);
    }

    #[tokio::test]
    async fn test_chunked_body_buffered_decodes_data() {
        let mut stream = stream_with(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        let body = stream.read_body(BodyKind::Chunked, 1024).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_read_body_respects_cap() {
        let mut stream = stream_with(b"0123456789");
        let err = stream.read_body(BodyKind::Length(10), 4).await;
        assert!(matches!(err, Err(HttpError::Malformed(_))));
    }

    #[test]
    fn test_parse_response_head() {
        let resp =
            parse_response_head(b"HTTP/1.1 302 Found\r\nLocation: https://x/d/1\r\n\r\n").unwrap();
        assert_eq!(resp.status, 302);
        assert_eq!(resp.header("location"), Some("https://x/d/1"));
        assert_eq!(resp.body_kind("GET").unwrap(), BodyKind::Close);
        assert_eq!(resp.body_kind("HEAD").unwrap(), BodyKind::Empty);
    }

    #[test]
    fn test_response_body_kinds() {
        let resp = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n").unwrap();
        assert_eq!(resp.body_kind("GET").unwrap(), BodyKind::Length(42));

        let resp =
            parse_response_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(resp.body_kind("GET").unwrap(), BodyKind::Chunked);

        let resp = parse_response_head(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(resp.body_kind("GET").unwrap(), BodyKind::Empty);
    }

    #[test]
    fn test_request_body_kinds() {
        let req = parse_request_head(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\n").unwrap();
        assert_eq!(req.body_kind().unwrap(), BodyKind::Length(3));

        let req = parse_request_head(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.body_kind().unwrap(), BodyKind::Empty);

        let req = parse_request_head(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(req.body_kind().unwrap(), BodyKind::Empty);
    }

    #[test]
    fn test_malformed_heads_rejected() {
        assert!(parse_request_head(b"\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET / FTP/1.1\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nbroken header\r\n\r\n").is_err());
    }

    #[test]
    fn test_forward_head_rewrites_host_and_strips_hop_by_hop() {
        let req = parse_request_head(
            b"GET /web/osu-search.php?q=a HTTP/1.1\r\n\
              Host: osu.ppy.sh\r\n\
              Connection: keep-alive\r\n\
              Keep-Alive: timeout=5\r\n\
              User-Agent: osu!\r\n\r\n",
        )
        .unwrap();

        let head = build_forward_head(&req, "api.rai.moe", Some("/v1/search?q=a"), BodyKind::Empty);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /v1/search?q=a HTTP/1.1\r\n"));
        assert!(text.contains("Host: api.rai.moe\r\n"));
        assert!(text.contains("User-Agent: osu!\r\n"));
        assert!(!text.to_ascii_lowercase().contains("connection:"));
        assert!(!text.to_ascii_lowercase().contains("keep-alive:"));
    }

    #[test]
    fn test_forward_head_reapplies_chunked_framing() {
        let req = parse_request_head(
            b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        let head = build_forward_head(&req, "b", None, BodyKind::Chunked);
        let text = String::from_utf8(head).unwrap();
        assert_eq!(text.matches("Transfer-Encoding").count(), 1);
    }

    #[test]
    fn test_buffered_forward_head_sets_exact_length() {
        let req = parse_request_head(
            b"POST / HTTP/1.1\r\nHost: c.ppy.sh\r\nContent-Length: 999\r\n\r\n",
        )
        .unwrap();
        let head = build_forward_head_buffered(&req, "c.ppy.sh", 12);
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Content-Length: 12\r\n"));
        assert_eq!(text.matches("Content-Length").count(), 1);
    }

    #[test]
    fn test_canned_responses() {
        let bytes = simple_response(421, "Misdirected Request", true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 421 Misdirected Request\r\n"));
        assert!(text.contains("Connection: close"));

        let bytes = redirect_response("https://direct.rai.moe/d/1234");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(text.contains("Location: https://direct.rai.moe/d/1234\r\n"));
    }

    #[test]
    fn test_chunk_size_line_parsing() {
        assert_eq!(parse_chunk_size(b"5\r\n").unwrap(), 5);
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"1A;ext=1\r\n").unwrap(), 26);
        assert!(parse_chunk_size(b"zz\r\n").is_err());
    }
}
