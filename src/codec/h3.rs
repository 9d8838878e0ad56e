//! Framed-variant codec: varint-framed messages, shared by the framed
//! and H3 wire variants.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::codec::{CodecError, CodecEvent, MessageCodec};
use crate::compress::split_field_section;
use crate::consts::*;
use crate::types::{Message, WireVariant};
use crate::varint::{decode_varint, encode_varint};

/// A generic frame: varint type, varint length, payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: u64, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    pub fn with_varint_payload(frame_type: u64, value: u64) -> Self {
        let mut payload = BytesMut::new();
        encode_varint(&mut payload, value);
        Self::new(frame_type, payload.freeze())
    }

    pub fn settings(settings: &[(u64, u64)]) -> Self {
        let mut payload = BytesMut::new();
        for &(id, value) in settings {
            encode_varint(&mut payload, id);
            encode_varint(&mut payload, value);
        }
        Self::new(FRAME_SETTINGS, payload.freeze())
    }

    pub fn goaway(stream_id: u64) -> Self {
        Self::with_varint_payload(FRAME_GOAWAY, stream_id)
    }

    pub fn serialize(&self, out: &mut BytesMut) {
        encode_varint(out, self.frame_type);
        encode_varint(out, self.payload.len() as u64);
        out.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.serialize(&mut out);
        out.freeze()
    }

    /// Parse one frame from the front of `buf`. `None` means more bytes
    /// are needed.
    pub fn parse(buf: &[u8]) -> Option<(Frame, usize)> {
        let (frame_type, t_consumed) = decode_varint(buf)?;
        let (len, l_consumed) = decode_varint(&buf[t_consumed..])?;
        let header_len = t_consumed + l_consumed;
        if buf.len() < header_len + len as usize {
            return None;
        }
        let payload = Bytes::copy_from_slice(&buf[header_len..header_len + len as usize]);
        Some((Frame { frame_type, payload }, header_len + len as usize))
    }

    /// Decode a settings payload into id/value pairs.
    pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u64, u64)>, CodecError> {
        let mut settings = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let (id, consumed) = decode_varint(&payload[offset..])
                .ok_or_else(|| CodecError::BadMessage("truncated setting id".to_string()))?;
            offset += consumed;
            let (value, consumed) = decode_varint(&payload[offset..])
                .ok_or_else(|| CodecError::BadMessage("truncated setting value".to_string()))?;
            offset += consumed;
            settings.push((id, value));
        }
        Ok(settings)
    }

    /// Decode a single-varint payload (GOAWAY, MAX_PUSH_ID, CANCEL_PUSH).
    pub fn parse_varint_payload(payload: &[u8]) -> Result<u64, CodecError> {
        let (value, _) = decode_varint(payload)
            .ok_or_else(|| CodecError::BadMessage("truncated varint payload".to_string()))?;
        Ok(value)
    }
}

pub struct FramedCodec {
    variant: WireVariant,
    buf: BytesMut,
    started: bool,
    expected_body: Option<u64>,
    body_received: u64,
}

impl FramedCodec {
    pub fn new(variant: WireVariant) -> Self {
        debug_assert!(variant.uses_control_stream());
        Self {
            variant,
            buf: BytesMut::new(),
            started: false,
            expected_body: None,
            body_received: 0,
        }
    }
}

impl MessageCodec for FramedCodec {
    fn variant(&self) -> WireVariant {
        self.variant
    }

    fn on_ingress(
        &mut self,
        data: &[u8],
        eom: bool,
        out: &mut Vec<CodecEvent>,
    ) -> Result<(), CodecError> {
        self.buf.extend_from_slice(data);

        while let Some((frame, consumed)) = Frame::parse(&self.buf) {
            let _ = self.buf.split_to(consumed);
            match frame.frame_type {
                FRAME_HEADERS => {
                    if !self.started {
                        self.started = true;
                        out.push(CodecEvent::MessageBegin);
                    }
                    let section = split_field_section(&frame.payload)
                        .map_err(|e| CodecError::BadMessage(e.to_string()))?;
                    out.push(CodecEvent::EncodedHeaders(section));
                }
                FRAME_DATA => {
                    if !self.started {
                        return Err(CodecError::BadMessage(
                            "DATA before HEADERS".to_string(),
                        ));
                    }
                    self.body_received += frame.payload.len() as u64;
                    out.push(CodecEvent::ChunkHeader(frame.payload.len() as u64));
                    out.push(CodecEvent::Body(frame.payload));
                    out.push(CodecEvent::ChunkComplete);
                }
                FRAME_SETTINGS | FRAME_GOAWAY | FRAME_MAX_PUSH_ID | FRAME_CANCEL_PUSH
                | FRAME_PUSH_PROMISE => {
                    // Control-stream-only frames, or a push promise from
                    // the side that may not push.
                    return Err(CodecError::UnexpectedFrame(frame.frame_type));
                }
                other => {
                    // Unknown frame types are ignored per the framed
                    // variants' extension rules.
                    trace!(frame_type = other, "ignoring unknown frame");
                }
            }
        }

        if eom {
            if !self.buf.is_empty() {
                return Err(CodecError::BadMessage(
                    "stream ended mid-frame".to_string(),
                ));
            }
            if let Some(expected) = self.expected_body {
                if expected != self.body_received {
                    return Err(CodecError::BodyLengthMismatch {
                        expected,
                        got: self.body_received,
                    });
                }
            }
            out.push(CodecEvent::MessageComplete);
        }
        Ok(())
    }

    fn set_expected_body_length(&mut self, len: u64) {
        self.expected_body = Some(len);
    }

    fn generate_header(&mut self, _msg: &Message, encoded: Option<Bytes>) -> Bytes {
        let block = encoded.unwrap_or_default();
        Frame::new(FRAME_HEADERS, block).to_bytes()
    }

    fn generate_chunk_header(&mut self, len: u64) -> Bytes {
        let mut out = BytesMut::new();
        encode_varint(&mut out, FRAME_DATA);
        encode_varint(&mut out, len);
        out.freeze()
    }

    fn generate_chunk_terminator(&mut self) -> Bytes {
        Bytes::new()
    }

    fn generate_eom(&mut self) -> Bytes {
        // The transport fin terminates the message on framed variants.
        Bytes::new()
    }
}
