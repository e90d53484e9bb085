//! MySQL client/server protocol subset spoken on the data plane
//!
//! Packets are framed as a 3-byte little-endian payload length, a sequence
//! id and the payload. Payloads of 16 MiB or more are split into
//! `0xFFFFFF`-byte frames followed by a shorter (possibly empty) one.

pub mod handshake;
pub mod response;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RutaError, RutaResult};

/// Largest payload carried by a single frame
pub const MAX_FRAME_PAYLOAD: usize = 0xFF_FFFF;

/// Default cap on a reassembled client packet
pub const DEFAULT_MAX_PACKET: usize = 64 * 1024 * 1024;

pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_SSL: u32 = 0x0000_0800;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;

    /// What the proxy advertises in its greeting
    pub const SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
}

/// Command bytes understood by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    InitDb,
    Query,
    Ping,
    ResetConnection,
    Unsupported(u8),
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x0e => Command::Ping,
            0x1f => Command::ResetConnection,
            other => Command::Unsupported(other),
        }
    }
}

/// Reads whole logical packets from a client stream.
///
/// Bytes are buffered internally and only consumed once a complete packet
/// is available, so a pending read may be cancelled without losing data.
pub struct PacketReader<R> {
    reader: R,
    buf: BytesMut,
    max_packet: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_packet(reader, DEFAULT_MAX_PACKET)
    }

    pub fn with_max_packet(reader: R, max_packet: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            max_packet,
        }
    }

    /// Next packet as `(sequence id of its last frame, payload)`, or `None`
    /// when the client closed the connection between packets.
    pub async fn read_packet(&mut self) -> RutaResult<Option<(u8, Bytes)>> {
        loop {
            if let Some(packet) = take_packet(&mut self.buf, self.max_packet)? {
                return Ok(Some(packet));
            }
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RutaError::protocol("connection closed mid-packet"));
            }
        }
    }

    /// Resolve when the client disconnects.
    ///
    /// Anything the client sends meanwhile is kept for the next
    /// [`read_packet`](Self::read_packet).
    pub async fn wait_for_disconnect(&mut self) -> RutaResult<()> {
        loop {
            if self.buf.len() > self.max_packet + 4 {
                return Err(RutaError::protocol("client sent too much data while waiting"));
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Ok(());
            }
        }
    }
}

/// Split one logical packet off the front of `buf` if it is complete
fn take_packet(buf: &mut BytesMut, max_packet: usize) -> RutaResult<Option<(u8, Bytes)>> {
    // First pass: find the end of the packet without consuming anything
    let mut offset = 0;
    let mut total = 0;
    loop {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let len = frame_length(&buf[offset..offset + 3]);
        total += len;
        if total > max_packet {
            return Err(RutaError::protocol(format!(
                "packet of {} bytes exceeds the {} byte limit",
                total, max_packet
            )));
        }
        if buf.len() < offset + 4 + len {
            return Ok(None);
        }
        offset += 4 + len;
        if len < MAX_FRAME_PAYLOAD {
            break;
        }
    }

    let mut frames = buf.split_to(offset);
    let mut payload = BytesMut::with_capacity(total);
    let mut seq = 0;
    while frames.has_remaining() {
        let len = frame_length(&frames[..3]);
        seq = frames[3];
        frames.advance(4);
        payload.extend_from_slice(&frames[..len]);
        frames.advance(len);
    }
    Ok(Some((seq, payload.freeze())))
}

fn frame_length(header: &[u8]) -> usize {
    usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16
}

/// Buffers outgoing packets and tracks the sequence id
pub struct PacketWriter<W> {
    writer: W,
    buf: BytesMut,
    seq: u8,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(8 * 1024),
            seq: 0,
        }
    }

    /// Sequence id for the next frame
    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Frame `payload` into the output buffer
    pub fn write_packet(&mut self, payload: &[u8]) {
        let mut rest = payload;
        loop {
            let chunk = rest.len().min(MAX_FRAME_PAYLOAD);
            let len = chunk as u32;
            self.buf.put_uint_le(u64::from(len), 3);
            self.buf.put_u8(self.seq);
            self.buf.extend_from_slice(&rest[..chunk]);
            self.seq = self.seq.wrapping_add(1);
            rest = &rest[chunk..];
            if chunk < MAX_FRAME_PAYLOAD {
                break;
            }
        }
    }

    /// Send everything buffered so far
    pub async fn flush(&mut self) -> RutaResult<()> {
        if !self.buf.is_empty() {
            self.writer.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.writer.flush().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    match value {
        0..=250 => buf.put_u8(value as u8),
        251..=0xFFFF => {
            buf.put_u8(0xFC);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            buf.put_u8(0xFD);
            buf.put_uint_le(value, 3);
        }
        _ => {
            buf.put_u8(0xFE);
            buf.put_u64_le(value);
        }
    }
}

pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Cursor over a received payload
pub struct PayloadReader<'a> {
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn need(&self, n: usize) -> RutaResult<()> {
        if self.data.len() < n {
            return Err(RutaError::protocol("truncated packet"));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> RutaResult<u8> {
        self.need(1)?;
        Ok(self.data.get_u8())
    }

    pub fn u32_le(&mut self) -> RutaResult<u32> {
        self.need(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn bytes(&mut self, n: usize) -> RutaResult<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> RutaResult<()> {
        self.bytes(n).map(|_| ())
    }

    /// NUL-terminated string; the rest of the payload when no NUL follows
    pub fn null_str(&mut self) -> &'a [u8] {
        match self.data.iter().position(|b| *b == 0) {
            Some(end) => {
                let (head, tail) = self.data.split_at(end);
                self.data = &tail[1..];
                head
            }
            None => {
                let all = self.data;
                self.data = &[];
                all
            }
        }
    }

    pub fn lenenc_int(&mut self) -> RutaResult<u64> {
        match self.u8()? {
            0xFC => {
                self.need(2)?;
                Ok(u64::from(self.data.get_u16_le()))
            }
            0xFD => {
                self.need(3)?;
                Ok(self.data.get_uint_le(3))
            }
            0xFE => {
                self.need(8)?;
                Ok(self.data.get_u64_le())
            }
            0xFB | 0xFF => Err(RutaError::protocol("invalid length-encoded integer")),
            small => Ok(u64::from(small)),
        }
    }

    pub fn lenenc_bytes(&mut self) -> RutaResult<&'a [u8]> {
        let len = self.lenenc_int()?;
        let len = usize::try_from(len).map_err(|_| RutaError::protocol("length overflow"))?;
        self.bytes(len)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let all = self.data;
        self.data = &[];
        all
    }
}
