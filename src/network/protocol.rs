//! Fixed-size binary frames exchanged with the scanner hardware.
//!
//! Every message is exactly [`FRAME_SIZE`] bytes:
//!
//! ```text
//! ┌────────┬──────────┬──────────┬─────┬──────────────┐
//! │ Opcode │ Field 0  │ Field 1  │ ... │ zero padding │
//! │ 1 byte │ u32 BE   │ u32 BE   │     │              │
//! └────────┴──────────┴──────────┴─────┴──────────────┘
//! ```
//!
//! Capture responses (`0xBB`, `0xBA`) are followed by `payload_len` raw bytes
//! outside the frame. Angles travel as unsigned centidegrees.

use crate::error::{AppResult, ScanError};
use crate::hardware::capabilities::CaptureParams;
use crate::hardware::DeviceRole;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of every frame on the wire.
pub const FRAME_SIZE: usize = 33;

/// Number of `u32` fields that fit behind the opcode byte.
pub const MAX_FIELDS: usize = (FRAME_SIZE - 1) / 4;

const CENTIDEGREES_PER_DEGREE: f64 = 100.0;

/// Operation codes understood by either device role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Orchestrator → positioner: move to angle.
    MoveTo = 0x0A,
    /// Orchestrator → positioner: report the current angle.
    RequestStatus = 0x0F,
    /// Positioner → orchestrator: move complete.
    MoveDone = 0xAA,
    /// Positioner → orchestrator: unsolicited or requested status.
    PositionStatus = 0xAF,
    /// Orchestrator → capture: take an image.
    Capture = 0x1B,
    /// Capture → orchestrator: image taken, optional raw payload follows.
    CaptureDone = 0xBB,
    /// Capture → orchestrator: diagnostic capture, optional payload follows.
    TestCapture = 0xBA,
}

impl Opcode {
    /// Maps a wire byte to a known opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0A => Some(Opcode::MoveTo),
            0x0F => Some(Opcode::RequestStatus),
            0xAA => Some(Opcode::MoveDone),
            0xAF => Some(Opcode::PositionStatus),
            0x1B => Some(Opcode::Capture),
            0xBB => Some(Opcode::CaptureDone),
            0xBA => Some(Opcode::TestCapture),
            _ => None,
        }
    }

    /// Number of `u32` fields carried by frames with this opcode.
    pub fn field_count(self) -> usize {
        match self {
            Opcode::RequestStatus => 0,
            // The status frame keeps the token slot (always 0) so the angle sits
            // at the same offset as in MoveDone.
            Opcode::MoveTo | Opcode::MoveDone | Opcode::PositionStatus => 2,
            Opcode::Capture => 4,
            Opcode::CaptureDone | Opcode::TestCapture => 5,
        }
    }

    /// Device role whose link speaks this opcode.
    pub fn role(self) -> DeviceRole {
        match self {
            Opcode::MoveTo
            | Opcode::RequestStatus
            | Opcode::MoveDone
            | Opcode::PositionStatus => DeviceRole::Positioner,
            Opcode::Capture | Opcode::CaptureDone | Opcode::TestCapture => DeviceRole::Capture,
        }
    }
}

/// A decoded frame: opcode plus its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw opcode byte.
    pub opcode: u8,
    /// Field values in wire order.
    pub fields: Vec<u32>,
}

impl Frame {
    /// Creates a frame for a known opcode.
    pub fn new(opcode: Opcode, fields: Vec<u32>) -> Self {
        Self {
            opcode: opcode as u8,
            fields,
        }
    }

    /// Returns the opcode if it is part of the protocol.
    pub fn kind(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }

    /// Field at `index`, or 0 when the frame carries fewer fields.
    pub fn field(&self, index: usize) -> u32 {
        self.fields.get(index).copied().unwrap_or(0)
    }

    /// Serializes this frame into its fixed-size wire form.
    pub fn encode(&self) -> AppResult<[u8; FRAME_SIZE]> {
        encode(self.opcode, &self.fields)
    }
}

/// Serializes an opcode and big-endian fields into one zero-padded frame.
///
/// Fails with [`ScanError::FrameTooLarge`] if the values do not fit.
pub fn encode(opcode: u8, values: &[u32]) -> AppResult<[u8; FRAME_SIZE]> {
    let needed = 1 + values.len() * 4;
    if needed > FRAME_SIZE {
        return Err(ScanError::FrameTooLarge {
            bytes: needed,
            max: FRAME_SIZE,
        });
    }

    let mut buf = [0u8; FRAME_SIZE];
    buf[0] = opcode;
    for (i, value) in values.iter().enumerate() {
        let start = 1 + i * 4;
        buf[start..start + 4].copy_from_slice(&value.to_be_bytes());
    }
    Ok(buf)
}

/// Parses one frame. Only the first [`FRAME_SIZE`] bytes are inspected.
///
/// The number of fields returned is the opcode's [`Opcode::field_count`].
pub fn decode(bytes: &[u8]) -> AppResult<Frame> {
    if bytes.len() < FRAME_SIZE {
        return Err(ScanError::FrameTruncated(bytes.len()));
    }

    let opcode = Opcode::from_u8(bytes[0]).ok_or(ScanError::UnknownOpcode(bytes[0]))?;
    let fields = (0..opcode.field_count())
        .map(|i| {
            let start = 1 + i * 4;
            u32::from_be_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ])
        })
        .collect();

    Ok(Frame {
        opcode: bytes[0],
        fields,
    })
}

/// Converts degrees to wire centidegrees, rounding to the nearest unit.
pub fn angle_to_wire(angle: f64) -> AppResult<u32> {
    let scaled = (angle * CENTIDEGREES_PER_DEGREE).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > f64::from(u32::MAX) {
        return Err(ScanError::InvalidAngle(angle));
    }
    Ok(scaled as u32)
}

/// Converts wire centidegrees back to degrees.
pub fn angle_from_wire(value: u32) -> f64 {
    f64::from(value) / CENTIDEGREES_PER_DEGREE
}

/// Correlation id echoed back by the device in its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(pub u32);

impl Token {
    /// Upper bound of randomly generated tokens (24 bits, as the device firmware expects).
    pub const MAX: u32 = 0x00FF_FFFF;

    /// Draws a random token from `1..=Token::MAX`.
    pub fn random() -> Self {
        Token(rand::thread_rng().gen_range(1..=Self::MAX))
    }

    /// Draws a random token guaranteed to differ from `previous`.
    pub fn fresh(previous: Option<Token>) -> Self {
        loop {
            let token = Self::random();
            if Some(token) != previous {
                return token;
            }
        }
    }

    /// Raw wire value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#08x}", self.0)
    }
}

/// Messages of the positioner protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionerMessage {
    /// Move to `angle` degrees.
    MoveTo {
        /// Correlation token.
        token: Token,
        /// Target angle in degrees.
        angle: f64,
    },
    /// Ask the device to report its current angle.
    RequestStatus,
    /// Move finished at `angle` degrees.
    MoveDone {
        /// Token of the move request.
        token: Token,
        /// Reached angle in degrees.
        angle: f64,
    },
    /// Current angle report.
    Status {
        /// Current angle in degrees.
        angle: f64,
    },
}

impl PositionerMessage {
    /// Builds the wire frame for this message.
    pub fn to_frame(&self) -> AppResult<Frame> {
        let frame = match self {
            PositionerMessage::MoveTo { token, angle } => {
                Frame::new(Opcode::MoveTo, vec![token.value(), angle_to_wire(*angle)?])
            }
            PositionerMessage::RequestStatus => Frame::new(Opcode::RequestStatus, Vec::new()),
            PositionerMessage::MoveDone { token, angle } => {
                Frame::new(Opcode::MoveDone, vec![token.value(), angle_to_wire(*angle)?])
            }
            PositionerMessage::Status { angle } => {
                Frame::new(Opcode::PositionStatus, vec![0, angle_to_wire(*angle)?])
            }
        };
        Ok(frame)
    }

    /// Interprets a decoded frame; `None` for opcodes of the other role.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.kind()? {
            Opcode::MoveTo => Some(PositionerMessage::MoveTo {
                token: Token(frame.field(0)),
                angle: angle_from_wire(frame.field(1)),
            }),
            Opcode::RequestStatus => Some(PositionerMessage::RequestStatus),
            Opcode::MoveDone => Some(PositionerMessage::MoveDone {
                token: Token(frame.field(0)),
                angle: angle_from_wire(frame.field(1)),
            }),
            Opcode::PositionStatus => Some(PositionerMessage::Status {
                angle: angle_from_wire(frame.field(1)),
            }),
            _ => None,
        }
    }

    /// Encodes straight to wire bytes.
    pub fn encode(&self) -> AppResult<Bytes> {
        Ok(Bytes::copy_from_slice(&self.to_frame()?.encode()?))
    }
}

/// Messages of the capture protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMessage {
    /// Take an image with the given timings.
    Capture {
        /// Correlation token.
        token: Token,
        /// Shutter, exposure and focus timings.
        params: CaptureParams,
    },
    /// Image taken; `payload_len` raw bytes follow the frame.
    CaptureDone {
        /// Token of the capture request.
        token: Token,
        /// Bytes between horizontally adjacent pixels.
        stride_pixel: u32,
        /// Bytes per image row.
        stride_row: u32,
        /// Sensor identifier reported by the device.
        sensor: u32,
        /// Length of the raw payload following the frame.
        payload_len: u32,
    },
    /// Diagnostic capture; `payload_len` bytes follow the frame.
    TestCapture {
        /// Token echoed by the device.
        token: Token,
        /// Length of the payload following the frame.
        payload_len: u32,
    },
}

impl CaptureMessage {
    /// Builds the wire frame for this message.
    pub fn to_frame(&self) -> Frame {
        match self {
            CaptureMessage::Capture { token, params } => Frame::new(
                Opcode::Capture,
                vec![
                    token.value(),
                    params.shutter_ms,
                    params.exposure_ms,
                    params.focus_ms,
                ],
            ),
            CaptureMessage::CaptureDone {
                token,
                stride_pixel,
                stride_row,
                sensor,
                payload_len,
            } => Frame::new(
                Opcode::CaptureDone,
                vec![token.value(), *stride_pixel, *stride_row, *sensor, *payload_len],
            ),
            CaptureMessage::TestCapture { token, payload_len } => Frame::new(
                Opcode::TestCapture,
                vec![token.value(), 0, 0, 0, *payload_len],
            ),
        }
    }

    /// Interprets a decoded frame; `None` for opcodes of the other role.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.kind()? {
            Opcode::Capture => Some(CaptureMessage::Capture {
                token: Token(frame.field(0)),
                params: CaptureParams {
                    shutter_ms: frame.field(1),
                    exposure_ms: frame.field(2),
                    focus_ms: frame.field(3),
                },
            }),
            Opcode::CaptureDone => Some(CaptureMessage::CaptureDone {
                token: Token(frame.field(0)),
                stride_pixel: frame.field(1),
                stride_row: frame.field(2),
                sensor: frame.field(3),
                payload_len: frame.field(4),
            }),
            Opcode::TestCapture => Some(CaptureMessage::TestCapture {
                token: Token(frame.field(0)),
                payload_len: frame.field(4),
            }),
            _ => None,
        }
    }

    /// Length of the raw payload that follows this message on the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            CaptureMessage::CaptureDone { payload_len, .. }
            | CaptureMessage::TestCapture { payload_len, .. } => *payload_len as usize,
            CaptureMessage::Capture { .. } => 0,
        }
    }

    /// Encodes straight to wire bytes (frame only, without payload).
    pub fn encode(&self) -> AppResult<Bytes> {
        Ok(Bytes::copy_from_slice(&self.to_frame().encode()?))
    }
}
