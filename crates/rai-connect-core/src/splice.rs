//! Bancho stream splicer: scans the server->client byte stream for
//! `UserPrivileges` packets and sets the supporter bit in place. Everything
//! else is forwarded byte-exact, whatever the TCP fragmentation looks like.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::counters::Counters;
use crate::packet::{PacketHeader, Privileges, USER_PRIVILEGES_ID};

/// Staging buffer for both relay directions. A slow consumer blocks the
/// producer; nothing is buffered beyond this.
pub const STAGING_BUF_SIZE: usize = 8 * 1024;

/// A `UserPrivileges` payload larger than this is malformed; inspection is
/// abandoned for the remainder of the connection.
const MAX_TARGET_PAYLOAD: u32 = 1024 * 1024;

#[derive(Debug)]
enum Phase {
    /// Accumulating the 7-byte packet header.
    Header,
    /// Accumulating the payload of a target packet.
    Payload,
    /// Forwarding `remaining` bytes of a non-target packet.
    PassThrough { remaining: u64 },
    /// Malformed target packet seen; raw copy until the connection ends.
    Abandoned,
}

/// Incremental packet scanner over the server->client direction.
///
/// Feed it arbitrary slices of the stream; it emits the same bytes with the
/// 4-byte payload of each eligible `UserPrivileges` packet OR-ed with the
/// supporter bit. Packet boundaries never have to align with the fed
/// slices; a 1-byte-at-a-time feed produces identical output.
#[derive(Debug)]
pub struct Splicer {
    inject: bool,
    phase: Phase,
    header: [u8; PacketHeader::SIZE],
    header_len: usize,
    payload: Vec<u8>,
}

impl Splicer {
    pub fn new(inject: bool) -> Self {
        Self {
            inject,
            phase: Phase::Header,
            header: [0u8; PacketHeader::SIZE],
            header_len: 0,
            payload: Vec::with_capacity(4),
        }
    }

    /// Consumes `input`, appends the (possibly rewritten) bytes to `out` and
    /// returns how many privilege masks were actually changed.
    pub fn feed(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> u64 {
        let mut injected = 0u64;

        while !input.is_empty() {
            match self.phase {
                Phase::Abandoned => {
                    out.extend_from_slice(input);
                    break;
                }
                Phase::Header => {
                    let take = (PacketHeader::SIZE - self.header_len).min(input.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&input[..take]);
                    self.header_len += take;
                    input = &input[take..];

                    if self.header_len == PacketHeader::SIZE {
                        self.header_len = 0;
                        self.dispatch_header(out);
                    }
                }
                Phase::Payload => {
                    let take = (4 - self.payload.len()).min(input.len());
                    self.payload.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    if self.payload.len() == 4 {
                        injected += self.emit_payload(out);
                        self.phase = Phase::Header;
                    }
                }
                Phase::PassThrough { ref mut remaining } => {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    out.extend_from_slice(&input[..take]);
                    *remaining -= take as u64;
                    input = &input[take..];

                    if *remaining == 0 {
                        self.phase = Phase::Header;
                    }
                }
            }
        }

        injected
    }

    fn dispatch_header(&mut self, out: &mut Vec<u8>) {
        let header = PacketHeader::parse(&self.header).expect("header accumulator is full");

        if header.packet_id == USER_PRIVILEGES_ID && header.length > MAX_TARGET_PAYLOAD {
            tracing::warn!(
                length = header.length,
                "oversized UserPrivileges payload, abandoning stream inspection"
            );
            out.extend_from_slice(&self.header);
            self.phase = Phase::Abandoned;
            return;
        }

        let target = self.inject
            && header.packet_id == USER_PRIVILEGES_ID
            && header.compression == 0
            && header.length == 4;

        if target {
            // Header is held back until the rewritten payload goes out.
            self.payload.clear();
            self.phase = Phase::Payload;
        } else {
            out.extend_from_slice(&self.header);
            self.phase = if header.length == 0 {
                Phase::Header
            } else {
                Phase::PassThrough {
                    remaining: u64::from(header.length),
                }
            };
        }
    }

    fn emit_payload(&mut self, out: &mut Vec<u8>) -> u64 {
        let mask = u32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        let new_mask = Privileges(mask).with_supporter().value();

        out.extend_from_slice(&self.header);
        out.extend_from_slice(&new_mask.to_le_bytes());

        if new_mask != mask {
            tracing::debug!(old = mask, new = new_mask, "supporter bit injected");
            1
        } else {
            0
        }
    }
}

/// Straight copy of one relay direction. Returns the number of bytes moved;
/// an idle gap of `idle_timeout` or EOF on the reader ends the direction.
pub async fn copy_plain<R, W>(reader: &mut R, writer: &mut W, idle_timeout: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; STAGING_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = match tokio::time::timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Ok(total),
        };
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

/// Inspected copy of the server->client direction: every chunk goes through
/// the splicer before it is written out.
pub async fn copy_spliced<R, W>(
    reader: &mut R,
    writer: &mut W,
    splicer: &mut Splicer,
    counters: &Counters,
    idle_timeout: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; STAGING_BUF_SIZE];
    let mut out = Vec::with_capacity(STAGING_BUF_SIZE);
    let mut total = 0u64;

    loop {
        let n = match tokio::time::timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Ok(total),
        };
        if n == 0 {
            return Ok(total);
        }

        out.clear();
        let injected = splicer.feed(&buf[..n], &mut out);
        counters.add_injected(injected);

        if !out.is_empty() {
            writer.write_all(&out).await?;
            writer.flush().await?;
            total += out.len() as u64;
        }
    }
}
