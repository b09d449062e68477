//! Binary wire protocol for the per-step handshake.
//!
//! Every frame is a fixed 10-byte header followed by a fixed-layout payload.
//! All integers and floats are little endian.
//!
//! ```text
//! offset  size  field
//! 0       2     magic  b"SQ"
//! 2       1     version (>= 1)
//! 3       1     class   0 = command, 1 = response, 2 = data
//! 4       1     kind    see MessageKind
//! 5       1     flags   reserved, written as 0
//! 6       4     payload length
//! 10      n     payload
//! ```
//!
//! Decoders read the fields they know and ignore trailing payload bytes, so a
//! newer peer can append optional fields. An unknown kind is always an error.

use crate::error::DecodeError;
use crate::measurement::{ChannelSummary, Quantity, SamplePoint};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame magic.
pub const MAGIC: [u8; 2] = *b"SQ";
/// Version written by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;
/// Size of the fixed header.
pub const HEADER_LEN: usize = 10;
/// Largest payload accepted by the decoder.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const STEP_FLAG_RETRY: u8 = 0b01;
const STEP_FLAG_WANT_RAW: u8 = 0b10;
const RAW_SAMPLE_LEN: usize = 16;
const RAW_PREFIX_LEN: usize = 8;
/// Most samples a single RAW frame can carry within [`MAX_PAYLOAD`].
pub const MAX_RAW_SAMPLES: usize = (MAX_PAYLOAD - RAW_PREFIX_LEN) / RAW_SAMPLE_LEN;

/// Frame class byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageClass {
    /// Controller instructions.
    Command = 0,
    /// Readiness and acknowledgements.
    Response = 1,
    /// Measurement payloads.
    Data = 2,
}

impl MessageClass {
    /// Decode a header byte, `None` if unassigned.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageClass::Command),
            1 => Some(MessageClass::Response),
            2 => Some(MessageClass::Data),
            _ => None,
        }
    }
}

/// Frame kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Analyzer is idle and can take a step.
    Ready = 1,
    /// Next setpoint.
    Step = 2,
    /// Prepare to acquire.
    Arm = 3,
    /// Acquisition start time and window.
    Trig = 4,
    /// Step summary.
    Fin = 5,
    /// Raw samples of a step.
    Raw = 6,
    /// Acknowledges another message.
    Ack = 7,
}

impl MessageKind {
    /// Decode a header byte, `None` if unassigned.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::Ready),
            2 => Some(MessageKind::Step),
            3 => Some(MessageKind::Arm),
            4 => Some(MessageKind::Trig),
            5 => Some(MessageKind::Fin),
            6 => Some(MessageKind::Raw),
            7 => Some(MessageKind::Ack),
            _ => None,
        }
    }

    /// The class every frame of this kind must carry.
    pub fn class(self) -> MessageClass {
        match self {
            MessageKind::Step | MessageKind::Arm | MessageKind::Trig => MessageClass::Command,
            MessageKind::Ready | MessageKind::Ack => MessageClass::Response,
            MessageKind::Fin | MessageKind::Raw => MessageClass::Data,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version.
    pub version: u8,
    /// Message class.
    pub class: MessageClass,
    /// Message kind.
    pub kind: MessageKind,
    /// Reserved, zero.
    pub flags: u8,
    /// Payload bytes following the header.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parse and validate the first [`HEADER_LEN`] bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        need(data, HEADER_LEN)?;
        let mut buf = data;
        let magic = [buf.get_u8(), buf.get_u8()];
        if magic != MAGIC {
            return Err(DecodeError::BadMagic(u16::from_be_bytes(magic)));
        }
        let version = buf.get_u8();
        if version == 0 {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let class_byte = buf.get_u8();
        let kind_byte = buf.get_u8();
        let flags = buf.get_u8();
        let payload_len = buf.get_u32_le();

        let kind = MessageKind::from_u8(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;
        let class = MessageClass::from_u8(class_byte)
            .filter(|class| *class == kind.class())
            .ok_or(DecodeError::ClassMismatch {
                kind: kind_byte,
                class: class_byte,
            })?;
        if payload_len as usize > MAX_PAYLOAD {
            return Err(DecodeError::PayloadTooLarge(payload_len as usize));
        }

        Ok(Self {
            version,
            class,
            kind,
            flags,
            payload_len,
        })
    }

    fn encode(kind: MessageKind, payload_len: usize, out: &mut BytesMut) {
        debug_assert!(payload_len <= MAX_PAYLOAD);
        out.put_slice(&MAGIC);
        out.put_u8(PROTOCOL_VERSION);
        out.put_u8(kind.class() as u8);
        out.put_u8(kind as u8);
        out.put_u8(0);
        out.put_u32_le(payload_len as u32);
    }

    /// Header plus payload size in bytes.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// STEP payload: the next setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCommand {
    /// Zero-based step index.
    pub step_index: u32,
    /// Setpoint in volts.
    pub voltage: f64,
    /// The step is part of a rerun pass.
    pub retry: bool,
    /// The controller wants the analyzer's raw samples after FIN.
    pub want_raw: bool,
}

/// TRIG payload. Both instants are in the sender's clock; only their
/// difference means anything to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerCommand {
    /// Sender clock when TRIG left.
    pub sent_at_ms: u64,
    /// Sender clock at which acquisition starts.
    pub start_at_ms: u64,
    /// Acquisition window length.
    pub window_ms: u32,
}

impl TriggerCommand {
    /// Lead time from send to start, zero if the start is already past.
    pub fn lead_ms(&self) -> u64 {
        self.start_at_ms.saturating_sub(self.sent_at_ms)
    }
}

/// FIN payload: the analyzer's summary for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinReport {
    /// Intensity channel summary.
    pub summary: ChannelSummary,
    /// The analyzer's own verdict on its channel.
    pub valid: bool,
}

/// One raw sample carried by a RAW message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Milliseconds since the sender's clock origin.
    pub timestamp_ms: u64,
    /// Measured value.
    pub value: f64,
}

impl From<&SamplePoint> for RawSample {
    fn from(point: &SamplePoint) -> Self {
        Self {
            timestamp_ms: point.timestamp_ms,
            value: point.value,
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Analyzer is ready for the next step.
    Ready,
    /// Move to a setpoint.
    Step(StepCommand),
    /// Prepare acquisition.
    Arm,
    /// Start acquisition at a scheduled time.
    Trig(TriggerCommand),
    /// Analyzer summary.
    Fin(FinReport),
    /// Analyzer samples for one step.
    Raw {
        /// Step the samples belong to.
        step_index: u32,
        /// Samples in acquisition order.
        samples: Vec<RawSample>,
    },
    /// Acknowledgement.
    Ack {
        /// Kind being acknowledged.
        of: MessageKind,
        /// Step the acknowledged message belonged to.
        step_index: u32,
    },
}

impl Message {
    /// Kind byte this message encodes to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ready => MessageKind::Ready,
            Message::Step(_) => MessageKind::Step,
            Message::Arm => MessageKind::Arm,
            Message::Trig(_) => MessageKind::Trig,
            Message::Fin(_) => MessageKind::Fin,
            Message::Raw { .. } => MessageKind::Raw,
            Message::Ack { .. } => MessageKind::Ack,
        }
    }

    /// Shorthand for an acknowledgement of `of` at `step_index`.
    pub fn ack(of: MessageKind, step_index: u32) -> Self {
        Message::Ack { of, step_index }
    }

    /// RAW frame for `points`, keeping at most [`MAX_RAW_SAMPLES`] in
    /// acquisition order. Also returns how many points were left out.
    pub fn raw(step_index: u32, points: &[SamplePoint]) -> (Self, usize) {
        raw_capped(step_index, points, MAX_RAW_SAMPLES)
    }

    /// Encode header and payload into one frame.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Message::Ready | Message::Arm => {}
            Message::Step(step) => {
                payload.put_u32_le(step.step_index);
                payload.put_f64_le(step.voltage);
                let mut flags = 0;
                if step.retry {
                    flags |= STEP_FLAG_RETRY;
                }
                if step.want_raw {
                    flags |= STEP_FLAG_WANT_RAW;
                }
                payload.put_u8(flags);
            }
            Message::Trig(trig) => {
                payload.put_u64_le(trig.sent_at_ms);
                payload.put_u64_le(trig.start_at_ms);
                payload.put_u32_le(trig.window_ms);
            }
            Message::Fin(fin) => {
                let summary = &fin.summary;
                payload.put_u32_le(summary.step_index);
                payload.put_u8(summary.quantity as u8);
                payload.put_f64_le(summary.mean);
                payload.put_f64_le(summary.stddev);
                payload.put_u32_le(summary.n_samples);
                payload.put_u8(u8::from(fin.valid));
            }
            Message::Raw {
                step_index,
                samples,
            } => {
                // Hand-built messages may exceed one frame; the tail is not sent.
                let samples = &samples[..samples.len().min(MAX_RAW_SAMPLES)];
                payload.reserve(RAW_PREFIX_LEN + samples.len() * RAW_SAMPLE_LEN);
                payload.put_u32_le(*step_index);
                payload.put_u32_le(samples.len() as u32);
                for sample in samples {
                    payload.put_u64_le(sample.timestamp_ms);
                    payload.put_f64_le(sample.value);
                }
            }
            Message::Ack { of, step_index } => {
                payload.put_u8(*of as u8);
                payload.put_u32_le(*step_index);
            }
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        FrameHeader::encode(self.kind(), payload.len(), &mut frame);
        frame.put_slice(&payload);
        frame.freeze()
    }

    /// Decode a payload whose header has already been validated.
    pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = payload;
        let message = match header.kind {
            MessageKind::Ready => Message::Ready,
            MessageKind::Arm => Message::Arm,
            MessageKind::Step => {
                need(buf, 13)?;
                let step_index = buf.get_u32_le();
                let voltage = buf.get_f64_le();
                let flags = buf.get_u8();
                Message::Step(StepCommand {
                    step_index,
                    voltage,
                    retry: flags & STEP_FLAG_RETRY != 0,
                    want_raw: flags & STEP_FLAG_WANT_RAW != 0,
                })
            }
            MessageKind::Trig => {
                need(buf, 20)?;
                Message::Trig(TriggerCommand {
                    sent_at_ms: buf.get_u64_le(),
                    start_at_ms: buf.get_u64_le(),
                    window_ms: buf.get_u32_le(),
                })
            }
            MessageKind::Fin => {
                need(buf, 26)?;
                let step_index = buf.get_u32_le();
                let quantity = Quantity::from_u8(buf.get_u8())
                    .ok_or(DecodeError::InvalidField("quantity"))?;
                let mean = buf.get_f64_le();
                let stddev = buf.get_f64_le();
                let n_samples = buf.get_u32_le();
                let valid = buf.get_u8() != 0;
                Message::Fin(FinReport {
                    summary: ChannelSummary {
                        step_index,
                        quantity,
                        mean,
                        stddev,
                        n_samples,
                    },
                    valid,
                })
            }
            MessageKind::Raw => {
                need(buf, 8)?;
                let step_index = buf.get_u32_le();
                let count = buf.get_u32_le() as usize;
                let body = count.saturating_mul(RAW_SAMPLE_LEN);
                if buf.remaining() < body {
                    return Err(DecodeError::Truncated {
                        need: 8 + body,
                        have: payload.len(),
                    });
                }
                let samples = (0..count)
                    .map(|_| RawSample {
                        timestamp_ms: buf.get_u64_le(),
                        value: buf.get_f64_le(),
                    })
                    .collect();
                Message::Raw {
                    step_index,
                    samples,
                }
            }
            MessageKind::Ack => {
                need(buf, 5)?;
                let of_byte = buf.get_u8();
                let of = MessageKind::from_u8(of_byte).ok_or(DecodeError::UnknownKind(of_byte))?;
                Message::Ack {
                    of,
                    step_index: buf.get_u32_le(),
                }
            }
        };
        Ok(message)
    }

    /// Try to decode one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete, otherwise the
    /// message and the number of bytes it occupied.
    pub fn decode_frame(data: &[u8]) -> Result<Option<(Self, usize)>, DecodeError> {
        if data.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = FrameHeader::decode(data)?;
        let frame_len = header.frame_len();
        if data.len() < frame_len {
            return Ok(None);
        }
        let message = Self::decode_payload(&header, &data[HEADER_LEN..frame_len])?;
        Ok(Some((message, frame_len)))
    }
}

fn need(buf: &[u8], need: usize) -> Result<(), DecodeError> {
    if buf.len() < need {
        return Err(DecodeError::Truncated {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

fn raw_capped(step_index: u32, points: &[SamplePoint], limit: usize) -> (Message, usize) {
    let kept = points.len().min(limit);
    let message = Message::Raw {
        step_index,
        samples: points[..kept].iter().map(RawSample::from).collect(),
    };
    (message, points.len() - kept)
}
