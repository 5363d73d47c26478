//! Wire codec for the instrument's framed command protocol.
//!
//! Every command is a single frame:
//!
//! ```text
//! ┌──────────┬──────────┬────────────┬─────────────────────┬──────────┐
//! │ Marker   │ Length   │ Subcommand │ Payload             │ Marker   │
//! │ (1B)     │ (1B)     │ (1B)       │ (Length - 1 bytes)  │ (1B)     │
//! └──────────┴──────────┴────────────┴─────────────────────┴──────────┘
//! ```
//!
//! `Length` counts the subcommand plus the payload. Multi-byte numeric fields
//! are big-endian. The device answers every command with zero or more reply
//! frames of the same shape, followed by an acknowledgement frame
//! `0x18 0x01 <status> 0x18`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::errors::{DriverError, Result};

/// Opening/closing byte of an acknowledgement frame.
pub const ACK_MARKER: u8 = 0x18;

/// Opening byte of measurement frames (and of start/stop commands).
pub const FRAME_MARKER: u8 = 0xB4;

/// Smallest complete frame: marker, length, one byte, marker.
pub const MIN_FRAME_LEN: usize = 4;

/// Command class, carried as the frame's opening and closing marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum CommandMarker {
    SetParameter = 0xB0,
    GetParameter = 0xB1,
    SetOutputConfig = 0xB2,
    GetOutputConfig = 0xB3,
    Measurement = 0xB4,
}

impl CommandMarker {
    /// Whether `byte` opens a frame the host knows how to read back.
    pub fn is_frame_start(byte: u8) -> bool {
        matches!(byte, 0xB0..=0xB4 | ACK_MARKER)
    }
}

/// A typed command field and its wire width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field {
    U8(u8),
    U16(u16),
    F32(f32),
    F64(f64),
}

impl Field {
    pub fn width(&self) -> usize {
        match self {
            Field::U8(_) => 1,
            Field::U16(_) => 2,
            Field::F32(_) => 4,
            Field::F64(_) => 8,
        }
    }

    fn put(&self, dst: &mut BytesMut) {
        match *self {
            Field::U8(v) => dst.put_u8(v),
            Field::U16(v) => dst.put_u16(v),
            Field::F32(v) => dst.put_f32(v),
            Field::F64(v) => dst.put_f64(v),
        }
    }
}

/// One encoded command, ready to be written to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    marker: u8,
    subcommand: u8,
    payload: Bytes,
}

impl CommandFrame {
    pub fn marker(&self) -> u8 {
        self.marker
    }

    pub fn subcommand(&self) -> u8 {
        self.subcommand
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Value of the length byte: subcommand plus payload.
    pub fn length(&self) -> u8 {
        // `encode` refuses payloads that would overflow this.
        (self.payload.len() + 1) as u8
    }

    /// Wire form: `marker length subcommand payload.. marker`.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.payload.len() + MIN_FRAME_LEN);
        dst.put_u8(self.marker);
        dst.put_u8(self.length());
        dst.put_u8(self.subcommand);
        dst.put_slice(&self.payload);
        dst.put_u8(self.marker);
        dst.freeze()
    }
}

/// Encode a command frame from its marker, subcommand and ordered fields.
pub fn encode(marker: CommandMarker, subcommand: u8, fields: &[Field]) -> Result<CommandFrame> {
    let len: usize = fields.iter().map(Field::width).sum();
    if len + 1 > u8::MAX as usize {
        return Err(DriverError::FrameTooLong { len });
    }
    let mut payload = BytesMut::with_capacity(len);
    for field in fields {
        field.put(&mut payload);
    }
    Ok(CommandFrame {
        marker: marker.into(),
        subcommand,
        payload: payload.freeze(),
    })
}

/// Status byte carried by an acknowledgement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AckStatus {
    SyntaxError = 0x01,
    Timeout = 0x02,
    WakeUp = 0x04,
    ValidSocket = 0x11,
    NotExecuted = 0x81,
    Unrecognized = 0x82,
    Executed = 0x83,
    SystemReady = 0x84,
    // Older firmware tables list data holdup as 140.
    #[num_enum(alternatives = [140])]
    DataHoldup = 0x92,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl AckStatus {
    pub fn code(self) -> u8 {
        self.into()
    }

    pub fn message(self) -> &'static str {
        match self {
            AckStatus::SyntaxError => "Frame-Not-Acknowledge: Incorrect syntax",
            AckStatus::Timeout => "Timeout: Communication-timeout (less data than expected)",
            AckStatus::WakeUp => "Wake-Up Message: System boot ready",
            AckStatus::ValidSocket => "TCP-Socket: Valid TCP client-socket connection",
            AckStatus::NotExecuted => "Not-Acknowledge: Command has not been executed",
            AckStatus::Unrecognized => "Not-Acknowledge: Command could not be recognized",
            AckStatus::Executed => "Command-Acknowledge: Command has been executed successfully",
            AckStatus::SystemReady => {
                "System-Ready Message: System is operational and ready to receive data"
            }
            AckStatus::DataHoldup => {
                "Data holdup: Measurement data could not be sent via the master interface"
            }
            AckStatus::Unknown(_) => "Unknown status code",
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X} {}", self.code(), self.message())
    }
}

/// Result of a single command, as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Success,
    Failure(AckStatus),
}

impl AckOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AckOutcome::Success)
    }
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckOutcome::Success => f.write_str("ok"),
            AckOutcome::Failure(status) => write!(f, "{status}"),
        }
    }
}

/// Decode the outcome of a command from the tail of its reply.
///
/// The status byte sits just before the closing ack marker, so this accepts
/// either a bare ack frame or reply frames followed by the ack.
pub fn decode_ack(bytes: &[u8]) -> Result<AckOutcome> {
    if bytes.len() < MIN_FRAME_LEN || bytes[bytes.len() - 1] != ACK_MARKER {
        return Err(DriverError::MalformedAck {
            bytes: bytes.to_vec(),
        });
    }
    let status = AckStatus::from_primitive(bytes[bytes.len() - 2]);
    Ok(match status {
        AckStatus::Executed => AckOutcome::Success,
        other => AckOutcome::Failure(other),
    })
}

/// A complete marker-delimited frame as received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Bytes,
}

impl RawFrame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Assemble `marker len kind body.. marker`, deriving the length byte.
    ///
    /// Bodies longer than 254 bytes cannot be expressed and are truncated.
    pub fn from_parts(marker: u8, kind: u8, body: &[u8]) -> Self {
        let body = &body[..body.len().min(u8::MAX as usize - 1)];
        let mut dst = BytesMut::with_capacity(body.len() + MIN_FRAME_LEN);
        dst.put_u8(marker);
        dst.put_u8(body.len() as u8 + 1);
        dst.put_u8(kind);
        dst.put_slice(body);
        dst.put_u8(marker);
        Self::new(dst.freeze())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn marker(&self) -> u8 {
        self.bytes.first().copied().unwrap_or_default()
    }

    pub fn length_field(&self) -> u8 {
        self.bytes.get(1).copied().unwrap_or(0)
    }

    /// First byte after the length: the frame type for measurement frames,
    /// the echoed subcommand for replies.
    pub fn kind(&self) -> Option<u8> {
        self.bytes.get(2).copied()
    }

    /// Bytes between the kind byte and the closing byte.
    pub fn body(&self) -> &[u8] {
        if self.bytes.len() < MIN_FRAME_LEN {
            return &[];
        }
        &self.bytes[3..self.bytes.len() - 1]
    }

    pub fn terminator(&self) -> u8 {
        self.bytes.last().copied().unwrap_or_default()
    }

    pub fn is_ack(&self) -> bool {
        self.marker() == ACK_MARKER
    }

    /// Status of an acknowledgement frame.
    pub fn ack_outcome(&self) -> Result<AckOutcome> {
        decode_ack(&self.bytes)
    }
}

/// Decode one reply frame from the front of `src`.
///
/// Bytes that cannot start a frame are discarded. Returns `None` if the
/// buffer doesn't hold a complete frame yet; on success the frame's bytes
/// are consumed.
pub fn decode_reply_frame(src: &mut BytesMut) -> Option<RawFrame> {
    let start = src.iter().position(|&b| CommandMarker::is_frame_start(b));
    match start {
        Some(skip) => src.advance(skip),
        None => {
            src.clear();
            return None;
        }
    }
    if src.len() < 2 {
        return None; // Need more data
    }
    let total = src[1] as usize + 3;
    if src.len() < total {
        return None; // Need more data
    }
    Some(RawFrame::new(src.split_to(total).freeze()))
}
