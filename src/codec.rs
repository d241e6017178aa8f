//! HMQ v2.1 wire codec
//!
//! Frame layout — fixed 8-byte header, then variable sections:
//!
//! ```text
//! [0]    type (u8)
//! [1]    ttl (u8; 0xFF on control frames)
//! [2]    flags
//! [3]    message id length (u8)
//! [4]    source length (u8)
//! [5]    target length (u8)
//! [6..8] content-type (u16 big-endian)
//! — id bytes, source bytes, target bytes
//! — if HAS_HEADERS: count (u8), each { nameLen u8, name, valueLen u16 BE, value }
//! — if HAS_CONTENT: length (u32 BE), content
//! ```
//!
//! `PING` is exactly `89 FF 00 00 00 00 00 00`, `PONG` is
//! `8A FF 00 00 00 00 00 00`. The handshake is the 8 ASCII bytes
//! `HMQP/2.1` sent by the client and echoed by the server.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HmqError, Result};
use crate::message::{Message, MessageType};

/// Protocol magic exchanged during the handshake
pub const HANDSHAKE_MAGIC: &[u8; 8] = b"HMQP/2.1";

/// Keep-alive probe frame
pub const PING: [u8; 8] = [0x89, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Keep-alive reply frame
pub const PONG: [u8; 8] = [0x8A, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Maximum content size: 16 MiB
pub const MAX_CONTENT_SIZE: u32 = 16 * 1024 * 1024;

const HEADER_SIZE: usize = 8;

mod flags {
    pub const FIRST_ACQUIRER: u8 = 0x01;
    pub const HIGH_PRIORITY: u8 = 0x02;
    pub const WAIT_RESPONSE: u8 = 0x04;
    pub const PENDING_ACK: u8 = 0x08;
    pub const HAS_HEADERS: u8 = 0x10;
    pub const HAS_CONTENT: u8 = 0x20;
}

/// Well-known content-type codes for `Server` frames
///
/// Values at or above 1000 are application-defined queue ids.
pub mod content_types {
    pub const HELLO: u16 = 101;
    pub const ACCEPTED: u16 = 202;
    pub const FAILED: u16 = 400;
    pub const JOIN: u16 = 601;
    pub const LEAVE: u16 = 602;
    pub const CREATE_QUEUE: u16 = 610;
    pub const REMOVE_QUEUE: u16 = 611;
    pub const INSTANCE_LIST: u16 = 620;
    pub const CLIENT_LIST: u16 = 621;
}

/// Encode a message into its wire form
pub fn encode(message: &Message) -> Result<Bytes> {
    let id = message.id.as_bytes();
    let source = message.source.as_bytes();
    let target = message.target.as_bytes();
    check_section("message id", id.len(), u8::MAX as usize)?;
    check_section("source", source.len(), u8::MAX as usize)?;
    check_section("target", target.len(), u8::MAX as usize)?;
    check_section("header count", message.headers.len(), u8::MAX as usize)?;
    if message.content.len() > MAX_CONTENT_SIZE as usize {
        return Err(HmqError::Frame(format!(
            "Content too large: {} bytes (max {})",
            message.content.len(),
            MAX_CONTENT_SIZE
        )));
    }

    let mut flag_bits = 0u8;
    if message.first_acquirer_only {
        flag_bits |= flags::FIRST_ACQUIRER;
    }
    if message.high_priority {
        flag_bits |= flags::HIGH_PRIORITY;
    }
    if message.wait_response {
        flag_bits |= flags::WAIT_RESPONSE;
    }
    if message.pending_acknowledge {
        flag_bits |= flags::PENDING_ACK;
    }
    if !message.headers.is_empty() {
        flag_bits |= flags::HAS_HEADERS;
    }
    if !message.content.is_empty() {
        flag_bits |= flags::HAS_CONTENT;
    }

    let mut buf = BytesMut::with_capacity(
        HEADER_SIZE + id.len() + source.len() + target.len() + message.content.len() + 64,
    );
    buf.extend_from_slice(&[
        message.kind as u8,
        message.ttl as u8,
        flag_bits,
        id.len() as u8,
        source.len() as u8,
        target.len() as u8,
    ]);
    buf.extend_from_slice(&message.content_type.to_be_bytes());
    buf.extend_from_slice(id);
    buf.extend_from_slice(source);
    buf.extend_from_slice(target);

    if !message.headers.is_empty() {
        buf.extend_from_slice(&[message.headers.len() as u8]);
        for (name, value) in &message.headers {
            check_section("header name", name.len(), u8::MAX as usize)?;
            check_section("header value", value.len(), u16::MAX as usize)?;
            buf.extend_from_slice(&[name.len() as u8]);
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
    }
    if !message.content.is_empty() {
        buf.extend_from_slice(&(message.content.len() as u32).to_be_bytes());
        buf.extend_from_slice(&message.content);
    }

    Ok(buf.freeze())
}

/// Decode a message from bytes.
/// Returns the message and the number of bytes consumed, or None if incomplete.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let kind = MessageType::try_from(buf[0])?;
    let ttl = buf[1] as i8;
    let flag_bits = buf[2];
    let id_len = buf[3] as usize;
    let source_len = buf[4] as usize;
    let target_len = buf[5] as usize;
    let content_type = u16::from_be_bytes([buf[6], buf[7]]);

    let mut cursor = Cursor::new(buf, HEADER_SIZE);
    let id = match cursor.take_str(id_len)? {
        Some(s) => s,
        None => return Ok(None),
    };
    let source = match cursor.take_str(source_len)? {
        Some(s) => s,
        None => return Ok(None),
    };
    let target = match cursor.take_str(target_len)? {
        Some(s) => s,
        None => return Ok(None),
    };

    let mut headers = Vec::new();
    if flag_bits & flags::HAS_HEADERS != 0 {
        let count = match cursor.take_u8() {
            Some(c) => c as usize,
            None => return Ok(None),
        };
        for _ in 0..count {
            let name_len = match cursor.take_u8() {
                Some(l) => l as usize,
                None => return Ok(None),
            };
            let name = match cursor.take_str(name_len)? {
                Some(s) => s,
                None => return Ok(None),
            };
            let value_len = match cursor.take_u16() {
                Some(l) => l as usize,
                None => return Ok(None),
            };
            let value = match cursor.take_str(value_len)? {
                Some(s) => s,
                None => return Ok(None),
            };
            headers.push((name, value));
        }
    }

    let mut content = Bytes::new();
    if flag_bits & flags::HAS_CONTENT != 0 {
        let content_len = match cursor.take_u32() {
            Some(l) => l,
            None => return Ok(None),
        };
        if content_len > MAX_CONTENT_SIZE {
            return Err(HmqError::Frame(format!(
                "Content too large: {} bytes (max {})",
                content_len, MAX_CONTENT_SIZE
            )));
        }
        content = match cursor.take_bytes(content_len as usize) {
            Some(b) => Bytes::copy_from_slice(b),
            None => return Ok(None),
        };
    }

    let message = Message {
        kind,
        id,
        source,
        target,
        content_type,
        ttl,
        first_acquirer_only: flag_bits & flags::FIRST_ACQUIRER != 0,
        high_priority: flag_bits & flags::HIGH_PRIORITY != 0,
        wait_response: flag_bits & flags::WAIT_RESPONSE != 0,
        pending_acknowledge: flag_bits & flags::PENDING_ACK != 0,
        headers,
        content,
    };
    Ok(Some((message, cursor.position())))
}

fn check_section(what: &str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(HmqError::Frame(format!(
            "{} too long: {} bytes (max {})",
            what, len, max
        )));
    }
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() < self.pos + len {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    fn take_str(&mut self, len: usize) -> Result<Option<String>> {
        match self.take_bytes(len) {
            Some(bytes) => {
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| HmqError::Frame("Invalid UTF-8 in frame section".to_string()))?;
                Ok(Some(s.to_string()))
            }
            None => Ok(None),
        }
    }

    fn take_u8(&mut self) -> Option<u8> {
        self.take_bytes(1).map(|b| b[0])
    }

    fn take_u16(&mut self) -> Option<u16> {
        self.take_bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Option<u32> {
        self.take_bytes(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Buffered frame reader over any async byte stream
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Read the 8-byte handshake magic
    pub async fn read_handshake(&mut self) -> Result<[u8; 8]> {
        while self.buffer.len() < 8 {
            let n = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| HmqError::Io(e.to_string()))?;
            if n == 0 {
                return Err(HmqError::Closed);
            }
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&self.buffer.split_to(8));
        Ok(magic)
    }

    /// Read the next frame.
    /// Returns None on clean end-of-stream.
    pub async fn read_frame(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some((message, consumed)) = decode(&self.buffer)? {
                let _ = self.buffer.split_to(consumed);
                return Ok(Some(message));
            }
            let n = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| HmqError::Io(e.to_string()))?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(HmqError::Protocol(
                    "Connection closed mid-frame".to_string(),
                ));
            }
        }
    }
}

/// Frame writer over any async byte stream
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write raw bytes (handshake magic, ping/pong)
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| HmqError::Io(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| HmqError::Io(e.to_string()))
    }

    /// Encode and write a frame
    pub async fn write_frame(&mut self, message: &Message) -> Result<()> {
        let bytes = encode(message)?;
        self.write_bytes(&bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut message = Message::queue("orders", 1001);
        message.set_id("m1");
        message.set_source("producer-1");
        message.high_priority = true;
        message.pending_acknowledge = true;
        message.set_string_content("Hello, World!");
        message.with_header("Trace", "abc123")
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = sample_message();
        let encoded = encode(&original).unwrap();
        let (decoded, consumed) = decode(&encoded).unwrap().unwrap();

        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.kind, MessageType::QueueMessage);
        assert_eq!(decoded.id, "m1");
        assert_eq!(decoded.source, "producer-1");
        assert_eq!(decoded.target, "orders");
        assert_eq!(decoded.content_type, 1001);
        assert_eq!(decoded.ttl, crate::message::DEFAULT_TTL);
        assert!(decoded.high_priority);
        assert!(decoded.pending_acknowledge);
        assert!(!decoded.wait_response);
        assert_eq!(decoded.header("Trace"), Some("abc123"));
        assert_eq!(decoded.content_string(), "Hello, World!");
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&sample_message()).unwrap();
        assert!(decode(&encoded[..4]).unwrap().is_none());
        assert!(decode(&encoded[..HEADER_SIZE]).unwrap().is_none());
        assert!(decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_decode_unknown_type() {
        let buf = [0xFFu8, 0xFF, 0, 0, 0, 0, 0, 0];
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_ping_pong_are_valid_frames() {
        let (ping, consumed) = decode(&PING).unwrap().unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(ping.kind, MessageType::Ping);
        assert_eq!(ping.ttl, -1);
        assert!(ping.content.is_empty());
        assert!(ping.headers.is_empty());

        let (pong, _) = decode(&PONG).unwrap().unwrap();
        assert_eq!(pong.kind, MessageType::Pong);

        // Ping encodes back to its literal wire form
        assert_eq!(encode(&ping).unwrap().to_vec(), PING.to_vec());
    }

    #[test]
    fn test_minimal_frame_is_eight_bytes() {
        let mut message = Message::new(MessageType::Terminate);
        message.ttl = -1;
        let encoded = encode(&message).unwrap();
        assert_eq!(encoded.len(), 8);
    }

    #[test]
    fn test_section_limits() {
        let mut message = Message::queue("q", 1);
        message.set_id("x".repeat(256));
        assert!(encode(&message).is_err());

        let long_value = Message::queue("q", 1).with_header("h", "v".repeat(70_000));
        assert!(encode(&long_value).is_err());
    }

    #[test]
    fn test_decode_two_frames_from_one_buffer() {
        let first = encode(&sample_message()).unwrap();
        let second = encode(&Message::queue("other", 7)).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        let (a, consumed_a) = decode(&buf).unwrap().unwrap();
        assert_eq!(a.target, "orders");
        let (b, consumed_b) = decode(&buf[consumed_a..]).unwrap().unwrap();
        assert_eq!(b.target, "other");
        assert_eq!(consumed_a + consumed_b, buf.len());
    }

    #[tokio::test]
    async fn test_frame_reader_writer_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = FrameWriter::new(client_write);
        let mut reader = FrameReader::new(server_read);

        writer.write_bytes(HANDSHAKE_MAGIC).await.unwrap();
        writer.write_frame(&sample_message()).await.unwrap();
        writer.write_bytes(&PING).await.unwrap();

        let magic = reader.read_handshake().await.unwrap();
        assert_eq!(&magic, HANDSHAKE_MAGIC);

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.target, "orders");

        let ping = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(ping.kind, MessageType::Ping);
    }

    #[tokio::test]
    async fn test_frame_reader_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        let (server_read, _w) = tokio::io::split(server);
        drop(client);

        let mut reader = FrameReader::new(server_read);
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
