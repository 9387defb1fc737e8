//! Wire protocol for RTC
//!
//! Every message travels as one self-delimiting frame, all integers big-endian:
//!
//! ```text
//! [length:u32][kind:u8][correlation:u32][payload:bytes][checksum:u32]
//! ```
//!
//! `length` counts every byte after the length field itself. `checksum` is a
//! CRC-32 over kind, correlation and payload. The payload is the JSON body of
//! the message; the correlation id lives only in the header.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::commands::{Ack, AckCode, Command, CommandParams};
use crate::error::{RtcError, RtcResult};
use crate::telemetry::{Heartbeat, TelemetryFrame};
use crate::types::{CorrelationId, Timestamp};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Smallest legal frame body: kind, correlation and checksum
pub const MIN_FRAME_BODY: usize = 1 + 4 + 4;

/// Largest legal frame body
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame kind identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Command,
    Ack,
    Telemetry,
    Heartbeat,
}

impl FrameKind {
    pub fn to_u8(&self) -> u8 {
        match self {
            FrameKind::Command => 0x01,
            FrameKind::Ack => 0x02,
            FrameKind::Telemetry => 0x03,
            FrameKind::Heartbeat => 0x04,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameKind::Command),
            0x02 => Some(FrameKind::Ack),
            0x03 => Some(FrameKind::Telemetry),
            0x04 => Some(FrameKind::Heartbeat),
            _ => None,
        }
    }
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Ack(Ack),
    Telemetry(TelemetryFrame),
    Heartbeat(Heartbeat),
}

#[derive(Serialize, Deserialize)]
struct CommandBody {
    params: CommandParams,
    issued_at: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct AckBody {
    code: AckCode,
}

impl Message {
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::Command(_) => FrameKind::Command,
            Message::Ack(_) => FrameKind::Ack,
            Message::Telemetry(_) => FrameKind::Telemetry,
            Message::Heartbeat(_) => FrameKind::Heartbeat,
        }
    }

    pub fn correlation(&self) -> CorrelationId {
        match self {
            Message::Command(cmd) => cmd.correlation,
            Message::Ack(ack) => ack.correlation,
            Message::Telemetry(_) | Message::Heartbeat(_) => CorrelationId::NONE,
        }
    }

    fn payload_bytes(&self) -> RtcResult<Vec<u8>> {
        let bytes = match self {
            Message::Command(cmd) => {
                cmd.params.validate()?;
                serde_json::to_vec(&CommandBody {
                    params: cmd.params.clone(),
                    issued_at: cmd.issued_at,
                })?
            }
            Message::Ack(ack) => serde_json::to_vec(&AckBody { code: ack.code })?,
            Message::Telemetry(frame) => {
                if !frame.position.is_finite() {
                    return Err(RtcError::InvalidParameter(format!(
                        "telemetry position {}",
                        frame.position
                    )));
                }
                serde_json::to_vec(frame)?
            }
            Message::Heartbeat(heartbeat) => serde_json::to_vec(heartbeat)?,
        };
        Ok(bytes)
    }

    fn from_parts(kind: FrameKind, correlation: CorrelationId, payload: &[u8]) -> RtcResult<Self> {
        let parse_error = |e: serde_json::Error| {
            RtcError::malformed(format!("bad {:?} payload: {}", kind, e))
        };

        let message = match kind {
            FrameKind::Command => {
                let body: CommandBody = serde_json::from_slice(payload).map_err(parse_error)?;
                Message::Command(Command {
                    correlation,
                    params: body.params,
                    issued_at: body.issued_at,
                })
            }
            FrameKind::Ack => {
                let body: AckBody = serde_json::from_slice(payload).map_err(parse_error)?;
                Message::Ack(Ack::new(correlation, body.code))
            }
            FrameKind::Telemetry => {
                Message::Telemetry(serde_json::from_slice(payload).map_err(parse_error)?)
            }
            FrameKind::Heartbeat => {
                Message::Heartbeat(serde_json::from_slice(payload).map_err(parse_error)?)
            }
        };

        let stamped = match &message {
            Message::Command(cmd) => Some(cmd.issued_at),
            Message::Telemetry(frame) => Some(frame.captured_at),
            Message::Heartbeat(heartbeat) => Some(heartbeat.sent_at),
            Message::Ack(_) => None,
        };
        if let Some(timestamp) = stamped.filter(|t| !t.is_valid()) {
            return Err(RtcError::malformed(format!(
                "{:?} timestamp has {} nanoseconds",
                kind, timestamp.nanoseconds
            )));
        }
        Ok(message)
    }
}

/// Encode a message into one complete frame
pub fn encode(message: &Message) -> RtcResult<Vec<u8>> {
    let payload = message.payload_bytes()?;
    let body_len = MIN_FRAME_BODY + payload.len();
    if body_len > MAX_FRAME_SIZE {
        return Err(RtcError::FrameTooLarge(body_len));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    frame.write_u32::<BigEndian>(body_len as u32)?;
    frame.write_u8(message.kind().to_u8())?;
    frame.write_u32::<BigEndian>(message.correlation().0)?;
    frame.extend_from_slice(&payload);

    let checksum = crc32fast::hash(&frame[LENGTH_PREFIX_SIZE..]);
    frame.write_u32::<BigEndian>(checksum)?;
    Ok(frame)
}

/// Decode at most one frame from the front of `buf`
///
/// Returns the message and the number of bytes it occupied, or `None` if the
/// buffer does not yet hold a complete frame.
pub fn decode(buf: &[u8]) -> RtcResult<Option<(Message, usize)>> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let body_len = BigEndian::read_u32(&buf[..LENGTH_PREFIX_SIZE]) as usize;
    if !(MIN_FRAME_BODY..=MAX_FRAME_SIZE).contains(&body_len) {
        return Err(RtcError::malformed(format!("length prefix {} out of range", body_len)));
    }

    let total = LENGTH_PREFIX_SIZE + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    let checked = &buf[LENGTH_PREFIX_SIZE..total - 4];
    let expected = BigEndian::read_u32(&buf[total - 4..total]);
    let actual = crc32fast::hash(checked);
    if expected != actual {
        return Err(RtcError::malformed(format!(
            "checksum mismatch: frame says {:08x}, computed {:08x}",
            expected, actual
        )));
    }

    let kind = FrameKind::from_u8(checked[0])
        .ok_or_else(|| RtcError::malformed(format!("unknown frame kind {:#04x}", checked[0])))?;
    let correlation = CorrelationId(BigEndian::read_u32(&checked[1..5]));
    let message = Message::from_parts(kind, correlation, &checked[5..])?;

    Ok(Some((message, total)))
}

/// Reassembles frames from a byte stream delivered in arbitrary pieces
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete message, if any
    ///
    /// After a `MalformedFrame` error the stream cannot be trusted; the
    /// decoder must be discarded along with the connection.
    pub fn next_message(&mut self) -> RtcResult<Option<Message>> {
        match decode(&self.buffer)? {
            Some((message, used)) => {
                self.buffer.drain(..used);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Number of bytes held waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
