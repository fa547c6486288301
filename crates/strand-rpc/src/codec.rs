use strand_net::Buffer;
use strand_net::http::HttpConnectionPtr;
use thiserror::Error;
use tracing::error;

use crate::{CompressKind, RpcMessage};

/// Wire frame:
///
/// ```text
/// +---------+----------+------------------------+
/// | len:i32 | csum:i32 |  schema-encoded body   |
/// +---------+----------+------------------------+
/// ```
///
/// Both integers big-endian; `len` counts everything after itself,
/// `csum` is Adler-32 over the body bytes.
const HEADER_LEN: usize = 4;
const CHECKSUM_LEN: usize = 4;
const MIN_MESSAGE_LEN: i32 = CHECKSUM_LEN as i32;
const MAX_MESSAGE_LEN: i32 = 64 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid message length {0}")]
    InvalidLength(i32),
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("parse fail")]
    ParseFail,
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
    #[error("serialize fail: {0}")]
    SerializeFail(String),
}

pub type RpcMessageCallback = Box<dyn Fn(&HttpConnectionPtr, RpcMessage) + Send + Sync>;

/// Encodes/decodes RPC frames riding the HTTP body stream. Decode
/// failures that question the stream itself (length, checksum, parse)
/// fail the connection; they never reach the message callback.
pub struct RpcCodec {
    message_cb: RpcMessageCallback,
}

impl RpcCodec {
    pub fn new(message_cb: RpcMessageCallback) -> Self {
        Self { message_cb }
    }

    /// Frames `message` into `buffer` (which must be fresh: the length
    /// prefix covers everything readable). Compresses the payload field
    /// first when asked to.
    pub fn serialize_to_buffer(message: &mut RpcMessage, buffer: &mut Buffer) -> Result<(), CodecError> {
        debug_assert_eq!(buffer.readable_bytes(), 0, "codec wants a fresh buffer");

        match message.compress {
            Some(CompressKind::Snappy) => {
                if let Some(payload) = payload_mut(message) {
                    *payload = snap::raw::Encoder::new()
                        .compress_vec(payload)
                        .map_err(|err| CodecError::SerializeFail(err.to_string()))?;
                }
            }
            _ => message.compress = None,
        }

        let body = bitcode::serialize(message)
            .map_err(|err| CodecError::SerializeFail(err.to_string()))?;
        if body.len() + CHECKSUM_LEN > MAX_MESSAGE_LEN as usize {
            return Err(CodecError::TooLarge(body.len()));
        }

        let checksum = adler2::adler32_slice(&body) as i32;
        buffer.append(&body);
        buffer.prepend_i32(checksum);
        buffer.prepend_i32(buffer.readable_bytes() as i32);
        Ok(())
    }

    /// Drains every complete frame out of `buffer`, delivering each to
    /// the message callback. A malformed stream closes the connection
    /// with a bad-request reason.
    pub fn parse_from_buffer(&self, conn: &HttpConnectionPtr, buffer: &mut Buffer) {
        while buffer.readable_bytes() >= HEADER_LEN {
            let len = buffer.peek_i32();
            if len < MIN_MESSAGE_LEN || len > MAX_MESSAGE_LEN {
                error!(len, peer = %conn.peer_addr(), "bad frame length");
                conn.on_error(400, CodecError::InvalidLength(len).to_string());
                return;
            }
            if buffer.readable_bytes() < HEADER_LEN + len as usize {
                break;
            }
            match Self::parse_frame(buffer) {
                Ok(message) => (self.message_cb)(conn, message),
                Err(err) => {
                    error!(%err, peer = %conn.peer_addr(), "bad frame");
                    conn.on_error(400, err.to_string());
                    return;
                }
            }
        }
    }

    /// Decodes exactly one frame that is known to be fully buffered;
    /// the streaming entry point above does the length gating.
    pub fn parse_frame(buffer: &mut Buffer) -> Result<RpcMessage, CodecError> {
        let len = buffer.read_i32() as usize;
        let expected = buffer.read_i32();
        let body_len = len - CHECKSUM_LEN;

        let body = &buffer.peek()[..body_len];
        if adler2::adler32_slice(body) as i32 != expected {
            return Err(CodecError::InvalidChecksum);
        }
        let mut message: RpcMessage =
            bitcode::deserialize(body).map_err(|_| CodecError::ParseFail)?;
        buffer.consume(body_len);

        if message.compress == Some(CompressKind::Snappy) {
            if let Some(payload) = payload_mut(&mut message) {
                *payload = snap::raw::Decoder::new()
                    .decompress_vec(payload)
                    .map_err(|_| CodecError::ParseFail)?;
            }
        }
        Ok(message)
    }
}

/// The one payload field a message carries: request bytes when present,
/// response bytes otherwise.
fn payload_mut(message: &mut RpcMessage) -> Option<&mut Vec<u8>> {
    match message.request.as_mut() {
        Some(request) => Some(request),
        None => message.response.as_mut(),
    }
}
