//! Request/response frames and the streaming frame decoder.
//!
//! Wire format (all integers big-endian):
//! ```text
//! Request : ┌─────┬───────┬────────┬─────────────┬────────┐
//!           │ cmd │ subfn │ len u16│ payload     │ crc32  │
//!           └─────┴───────┴────────┴─────────────┴────────┘
//! Response: ┌──────────┬───────┬──────┬────────┬─────────┬───────┐
//!           │ cmd|0x80 │ subfn │ code │ len u16│ payload │ crc32 │
//!           └──────────┴───────┴──────┴────────┴─────────┴───────┘
//! ```
//!
//! The CRC covers every byte before it.  The decoder accumulates bytes
//! and yields complete frames; a single `Link::recv` may return part of
//! a header, part of a payload, or several frames back to back.

use crate::error::ProtocolError;

use super::commands::{CommandId, RESPONSE_FLAG, ResponseCode};

pub const REQUEST_HEADER_SIZE: usize = 4;
pub const RESPONSE_HEADER_SIZE: usize = 5;
pub const CRC_SIZE: usize = 4;

fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

fn check_crc(frame: &[u8]) -> Result<(), ProtocolError> {
    let (body, trailer) = frame.split_at(frame.len() - CRC_SIZE);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32(body) == expected {
        Ok(())
    } else {
        Err(ProtocolError::BadCrc)
    }
}

fn payload_len(payload: &[u8]) -> Result<u16, ProtocolError> {
    u16::try_from(payload.len()).map_err(|_| ProtocolError::MalformedRequest("payload exceeds 65535 bytes"))
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub subfn: u8,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(command: CommandId, subfn: u8, payload: Vec<u8>) -> Self {
        Self {
            command: command as u8,
            subfn,
            payload,
        }
    }

    /// Total encoded size.
    pub fn size(&self) -> usize {
        REQUEST_HEADER_SIZE + self.payload.len() + CRC_SIZE
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = payload_len(&self.payload)?;
        let mut out = Vec::with_capacity(self.size());
        out.push(self.command);
        out.push(self.subfn);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&crc32(&out).to_be_bytes());
        Ok(out)
    }

    pub fn from_bytes(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < REQUEST_HEADER_SIZE + CRC_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        if frame.len() != REQUEST_HEADER_SIZE + len + CRC_SIZE {
            return Err(ProtocolError::Truncated);
        }
        check_crc(frame)?;
        Ok(Self {
            command: frame[0],
            subfn: frame[1],
            payload: frame[REQUEST_HEADER_SIZE..REQUEST_HEADER_SIZE + len].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Request command id, without the response flag.
    pub command: u8,
    pub subfn: u8,
    pub code: ResponseCode,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn new(command: u8, subfn: u8, code: ResponseCode, payload: Vec<u8>) -> Self {
        Self {
            command: command & !RESPONSE_FLAG,
            subfn,
            code,
            payload,
        }
    }

    /// An empty response to `request` carrying a failure code.
    pub fn failure(request: &Request, code: ResponseCode) -> Self {
        Self::new(request.command, request.subfn, code, Vec::new())
    }

    /// True when this response answers `request`.
    pub fn answers(&self, request: &Request) -> bool {
        self.command == request.command && self.subfn == request.subfn
    }

    pub fn size(&self) -> usize {
        RESPONSE_HEADER_SIZE + self.payload.len() + CRC_SIZE
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = payload_len(&self.payload)?;
        let mut out = Vec::with_capacity(self.size());
        out.push(self.command | RESPONSE_FLAG);
        out.push(self.subfn);
        out.push(self.code as u8);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&crc32(&out).to_be_bytes());
        Ok(out)
    }

    pub fn from_bytes(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < RESPONSE_HEADER_SIZE + CRC_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let len = u16::from_be_bytes([frame[3], frame[4]]) as usize;
        if frame.len() != RESPONSE_HEADER_SIZE + len + CRC_SIZE {
            return Err(ProtocolError::Truncated);
        }
        check_crc(frame)?;
        if frame[0] & RESPONSE_FLAG == 0 {
            return Err(ProtocolError::MalformedResponse("missing response flag"));
        }
        let code = ResponseCode::try_from(frame[2])?;
        if code != ResponseCode::Ok && len != 0 {
            return Err(ProtocolError::MalformedResponse("payload on failure response"));
        }
        Ok(Self::new(
            frame[0],
            frame[1],
            code,
            frame[RESPONSE_HEADER_SIZE..RESPONSE_HEADER_SIZE + len].to_vec(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Streaming decoder
// ---------------------------------------------------------------------------

/// Which side of the link the decoder listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

impl FrameKind {
    fn header_size(self) -> usize {
        match self {
            Self::Request => REQUEST_HEADER_SIZE,
            Self::Response => RESPONSE_HEADER_SIZE,
        }
    }
}

enum DecoderState {
    /// Waiting for a full header.
    ReadingHeader,
    /// Header parsed, waiting for `total` bytes.
    ReadingFrame { total: usize },
}

/// Streaming frame splitter.  Frames are returned whole (header, payload
/// and CRC) for `Request::from_bytes` / `Response::from_bytes`.
pub struct FrameDecoder {
    kind: FrameKind,
    max_payload: usize,
    state: DecoderState,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(kind: FrameKind, max_payload: usize) -> Self {
        Self {
            kind,
            max_payload,
            state: DecoderState::ReadingHeader,
            buf: Vec::new(),
        }
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if any.
    ///
    /// A header announcing more than `max_payload` bytes is reported once
    /// and skipped one byte at a time until a plausible header appears.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, ProtocolError>> {
        let header = self.kind.header_size();
        loop {
            match self.state {
                DecoderState::ReadingHeader => {
                    if self.buf.len() < header {
                        return None;
                    }
                    let len = u16::from_be_bytes([self.buf[header - 2], self.buf[header - 1]]) as usize;
                    if len > self.max_payload {
                        self.buf.remove(0);
                        return Some(Err(match self.kind {
                            FrameKind::Request => ProtocolError::MalformedRequest("frame too long"),
                            FrameKind::Response => ProtocolError::MalformedResponse("frame too long"),
                        }));
                    }
                    self.state = DecoderState::ReadingFrame {
                        total: header + len + CRC_SIZE,
                    };
                }
                DecoderState::ReadingFrame { total } => {
                    if self.buf.len() < total {
                        return None;
                    }
                    self.state = DecoderState::ReadingHeader;
                    return Some(Ok(self.buf.drain(..total).collect()));
                }
            }
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop partial data (after a link reset or a timeout).
    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingHeader;
        self.buf.clear();
    }
}
