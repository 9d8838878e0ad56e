//! Legacy variant codec: HTTP/1.1 text framing over a single stream.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{CodecError, CodecEvent, MessageCodec};
use crate::types::{Header, Message, WireVariant};

const CRLF: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParseState {
    /// Waiting for a request line.
    Idle,
    Headers,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    ChunkTrailer,
}

pub struct H1Codec {
    buf: BytesMut,
    state: ParseState,
    /// Message head accumulated while in `Headers`.
    pending: Option<Message>,
    expected_body: Option<u64>,
    body_received: u64,
    /// Egress side picked chunked framing (no declared length).
    egress_chunked: bool,
}

impl H1Codec {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: ParseState::Idle,
            pending: None,
            expected_body: None,
            body_received: 0,
            egress_chunked: false,
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.windows(2).position(|w| w == b"\r\n")?;
        let line = self.buf.split_to(pos + 2);
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    fn parse_request_line(line: &str) -> Result<Message, CodecError> {
        let mut parts = line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| CodecError::BadMessage("empty request line".to_string()))?;
        let path = parts
            .next()
            .ok_or_else(|| CodecError::BadMessage("request line missing target".to_string()))?;
        let version = parts
            .next()
            .ok_or_else(|| CodecError::BadMessage("request line missing version".to_string()))?;
        if !version.starts_with("HTTP/1.") {
            return Err(CodecError::BadMessage(format!(
                "unsupported version {}",
                version
            )));
        }
        Ok(Message::request(method, path))
    }

    fn parse_header_line(line: &str) -> Result<Header, CodecError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::BadMessage(format!("malformed header: {}", line)))?;
        if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
            return Err(CodecError::BadMessage(format!("malformed header name: {}", name)));
        }
        Ok(Header::new(name.to_ascii_lowercase(), value.trim()))
    }

    fn headers_done(&mut self, msg: &Message, out: &mut Vec<CodecEvent>) {
        let is_chunked = msg
            .headers
            .iter()
            .any(|h| h.name == "transfer-encoding" && h.value.eq_ignore_ascii_case("chunked"));
        if is_chunked {
            self.state = ParseState::ChunkSize;
        } else {
            let len = msg.content_length().unwrap_or(0);
            self.expected_body = Some(len);
            if len == 0 {
                self.message_complete(out);
            } else {
                self.state = ParseState::Body { remaining: len };
            }
        }
    }

    fn message_complete(&mut self, out: &mut Vec<CodecEvent>) {
        out.push(CodecEvent::MessageComplete);
        self.state = ParseState::Idle;
        self.expected_body = None;
        self.body_received = 0;
    }
}

impl Default for H1Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec for H1Codec {
    fn variant(&self) -> WireVariant {
        WireVariant::Legacy
    }

    fn on_ingress(
        &mut self,
        data: &[u8],
        eom: bool,
        out: &mut Vec<CodecEvent>,
    ) -> Result<(), CodecError> {
        self.buf.extend_from_slice(data);

        loop {
            match self.state {
                ParseState::Idle => {
                    let line = match self.take_line() {
                        Some(l) if l.is_empty() => continue,
                        Some(l) => l,
                        None => break,
                    };
                    let msg = Self::parse_request_line(&line)?;
                    out.push(CodecEvent::MessageBegin);
                    self.pending = Some(msg);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line = match self.take_line() {
                        Some(l) => l,
                        None => break,
                    };
                    if line.is_empty() {
                        let msg = match self.pending.take() {
                            Some(m) => m,
                            None => {
                                return Err(CodecError::BadMessage(
                                    "headers without request line".to_string(),
                                ))
                            }
                        };
                        out.push(CodecEvent::HeadersComplete(msg.clone()));
                        self.headers_done(&msg, out);
                    } else {
                        match self.pending.as_mut() {
                            Some(msg) => msg.headers.push(Self::parse_header_line(&line)?),
                            None => {
                                return Err(CodecError::BadMessage(
                                    "headers without request line".to_string(),
                                ))
                            }
                        }
                    }
                }
                ParseState::Body { remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = (self.buf.len() as u64).min(remaining);
                    let chunk = self.buf.split_to(take as usize).freeze();
                    self.body_received += take;
                    out.push(CodecEvent::Body(chunk));
                    if remaining == take {
                        self.message_complete(out);
                    } else {
                        self.state = ParseState::Body {
                            remaining: remaining - take,
                        };
                    }
                }
                ParseState::ChunkSize => {
                    let line = match self.take_line() {
                        Some(l) => l,
                        None => break,
                    };
                    let size = u64::from_str_radix(line.trim(), 16).map_err(|_| {
                        CodecError::BadMessage(format!("bad chunk size: {}", line))
                    })?;
                    if size == 0 {
                        self.state = ParseState::ChunkTrailer;
                    } else {
                        out.push(CodecEvent::ChunkHeader(size));
                        self.state = ParseState::ChunkData { remaining: size };
                    }
                }
                ParseState::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = (self.buf.len() as u64).min(remaining);
                    let chunk = self.buf.split_to(take as usize).freeze();
                    self.body_received += take;
                    out.push(CodecEvent::Body(chunk));
                    if remaining == take {
                        out.push(CodecEvent::ChunkComplete);
                        self.state = ParseState::ChunkDataEnd;
                    } else {
                        self.state = ParseState::ChunkData {
                            remaining: remaining - take,
                        };
                    }
                }
                ParseState::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    let _ = self.buf.split_to(2);
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let line = match self.take_line() {
                        Some(l) => l,
                        None => break,
                    };
                    if line.is_empty() {
                        self.message_complete(out);
                    }
                    // Trailer fields are tolerated and dropped.
                }
            }
        }

        if eom {
            match self.state {
                ParseState::Idle => {}
                ParseState::Body { .. } => {
                    let expected = self.expected_body.unwrap_or(0);
                    return Err(CodecError::BodyLengthMismatch {
                        expected,
                        got: self.body_received,
                    });
                }
                _ => {
                    return Err(CodecError::BadMessage(
                        "stream ended mid-message".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn set_expected_body_length(&mut self, len: u64) {
        self.expected_body = Some(len);
    }

    fn generate_header(&mut self, msg: &Message, _encoded: Option<Bytes>) -> Bytes {
        let mut out = BytesMut::new();
        let status = msg.status.unwrap_or(200);
        out.put_slice(format!("HTTP/1.1 {} {}{}", status, reason(status), CRLF).as_bytes());
        for header in &msg.headers {
            out.put_slice(format!("{}: {}{}", header.name, header.value, CRLF).as_bytes());
        }
        self.egress_chunked = msg.content_length().is_none();
        if self.egress_chunked {
            out.put_slice(format!("transfer-encoding: chunked{}", CRLF).as_bytes());
        }
        out.put_slice(CRLF.as_bytes());
        out.freeze()
    }

    fn generate_chunk_header(&mut self, len: u64) -> Bytes {
        if self.egress_chunked {
            Bytes::from(format!("{:x}{}", len, CRLF))
        } else {
            Bytes::new()
        }
    }

    fn generate_chunk_terminator(&mut self) -> Bytes {
        if self.egress_chunked {
            Bytes::from_static(b"\r\n")
        } else {
            Bytes::new()
        }
    }

    fn generate_eom(&mut self) -> Bytes {
        if self.egress_chunked {
            Bytes::from_static(b"0\r\n\r\n")
        } else {
            Bytes::new()
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}
