// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! WebSocket framing for SIP over WebSocket (RFC 6455, RFC 7118).
//!
//! Covers the HTTP upgrade in both roles and the frame codec: FIN/RSV bits,
//! opcodes, 7/16/64-bit payload lengths and client masking. Each WebSocket
//! message carries exactly one SIP message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::TransportError;

/// Subprotocol negotiated for SIP (RFC 7118 §4.1).
pub const SIP_SUBPROTOCOL: &str = "sip";

/// Upper bound on an HTTP upgrade head.
pub const MAX_HANDSHAKE_LEN: usize = 8 * 1024;

const FIN: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Which end of the connection we are. Clients mask, servers do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRole {
    Client,
    Server,
}

impl WsRole {
    fn outbound_mask(self) -> Option<[u8; 4]> {
        match self {
            WsRole::Client => Some(rand::random()),
            WsRole::Server => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A decoded, unmasked frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// A complete message surfaced by [`WsDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// Text or binary data, reassembled from fragments.
    Data(Bytes),
    Ping(Bytes),
    Pong,
    Close(Option<u16>),
}

/// Encodes one frame. `mask` must be `Some` for client-originated frames.
pub fn encode_frame(opcode: Opcode, fin: bool, payload: &[u8], mask: Option<[u8; 4]>) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 14);
    out.put_u8((if fin { FIN } else { 0 }) | opcode.bits());

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let len = payload.len();
    if len < 126 {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            out.put_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.put_slice(payload),
    }
    out.freeze()
}

/// Encodes a SIP message as a single data frame for the given role.
///
/// Valid UTF-8 goes out as a text frame, anything else as binary.
pub fn encode_message(role: WsRole, payload: &[u8]) -> Bytes {
    let opcode = if std::str::from_utf8(payload).is_ok() {
        Opcode::Text
    } else {
        Opcode::Binary
    };
    encode_frame(opcode, true, payload, role.outbound_mask())
}

/// Encodes a control frame (pong or close) for the given role.
pub fn encode_control(role: WsRole, opcode: Opcode, payload: &[u8]) -> Bytes {
    let payload = &payload[..payload.len().min(MAX_CONTROL_PAYLOAD)];
    encode_frame(opcode, true, payload, role.outbound_mask())
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when the frame is incomplete.
/// `expect_masked` enforces the masking direction of the peer's role.
pub fn decode_frame(
    buf: &mut BytesMut,
    expect_masked: bool,
    max_len: usize,
) -> Result<Option<Frame>, TransportError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];

    if b0 & RSV_MASK != 0 {
        return Err(TransportError::FrameDecode("reserved bits set".into()));
    }
    let fin = b0 & FIN != 0;
    let opcode = Opcode::from_bits(b0 & OPCODE_MASK)
        .ok_or_else(|| TransportError::FrameDecode(format!("unknown opcode {:#x}", b0 & OPCODE_MASK)))?;
    let masked = b1 & MASK_BIT != 0;
    if masked != expect_masked {
        return Err(TransportError::FrameDecode(if expect_masked {
            "client frame is not masked".into()
        } else {
            "server frame is masked".into()
        }));
    }

    let (len, mut offset) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(TransportError::FrameDecode("64-bit length has MSB set".into()));
            }
            (len, 10)
        }
        short => (short as u64, 2),
    };

    if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD as u64) {
        return Err(TransportError::FrameDecode(
            "control frame fragmented or longer than 125 bytes".into(),
        ));
    }
    if len > max_len as u64 {
        return Err(TransportError::MessageTooLarge {
            len: len as usize,
            max: max_len,
        });
    }
    let len = len as usize;

    let key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + len {
        return Ok(None);
    }

    buf.advance(offset);
    let mut payload = buf.split_to(len);
    if let Some(key) = key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

/// Incremental message decoder; reassembles fragmented data messages.
#[derive(Debug)]
pub struct WsDecoder {
    role: WsRole,
    max_len: usize,
    partial: Option<BytesMut>,
}

impl WsDecoder {
    pub fn new(role: WsRole, max_len: usize) -> Self {
        Self {
            role,
            max_len,
            partial: None,
        }
    }

    /// Decodes the next complete message from `buf`, if any.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<WsMessage>, TransportError> {
        // Servers receive masked frames.
        let expect_masked = self.role == WsRole::Server;
        loop {
            let frame = match decode_frame(buf, expect_masked, self.max_len)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            match frame.opcode {
                Opcode::Ping => return Ok(Some(WsMessage::Ping(frame.payload))),
                Opcode::Pong => return Ok(Some(WsMessage::Pong)),
                Opcode::Close => {
                    let code = (frame.payload.len() >= 2)
                        .then(|| u16::from_be_bytes([frame.payload[0], frame.payload[1]]));
                    return Ok(Some(WsMessage::Close(code)));
                }
                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        return Err(TransportError::FrameDecode(
                            "new data frame inside fragmented message".into(),
                        ));
                    }
                    if frame.fin {
                        return Ok(Some(WsMessage::Data(frame.payload)));
                    }
                    self.partial = Some(BytesMut::from(&frame.payload[..]));
                }
                Opcode::Continuation => {
                    let partial = self.partial.as_mut().ok_or_else(|| {
                        TransportError::FrameDecode("continuation without a started message".into())
                    })?;
                    if partial.len() + frame.payload.len() > self.max_len {
                        return Err(TransportError::MessageTooLarge {
                            len: partial.len() + frame.payload.len(),
                            max: self.max_len,
                        });
                    }
                    partial.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let message = self.partial.take().map(BytesMut::freeze).unwrap_or_default();
                        return Ok(Some(WsMessage::Data(message)));
                    }
                }
            }
        }
    }
}

/// Fields of a client upgrade request the server needs to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub protocols: Vec<String>,
}

/// Length of the HTTP head including its blank line, once complete.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parses and validates a client upgrade head (everything up to CRLFCRLF).
pub fn parse_upgrade_request(head: &[u8]) -> Result<UpgradeRequest, TransportError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TransportError::Handshake("upgrade request is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = (parts.next(), parts.next(), parts.next());
    if method != Some("GET") {
        return Err(TransportError::Handshake("expected GET request line".into()));
    }
    if version != Some("HTTP/1.1") {
        return Err(TransportError::Handshake("expected HTTP/1.1".into()));
    }

    let mut upgrade = false;
    let mut connection = false;
    let mut version_ok = false;
    let mut key = None;
    let mut protocols = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(TransportError::Handshake("malformed header line".into()));
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            connection = has_token(value, "upgrade");
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_owned());
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            version_ok = value == "13";
        } else if name.eq_ignore_ascii_case("sec-websocket-protocol") {
            protocols.extend(value.split(',').map(|p| p.trim().to_ascii_lowercase()));
        }
    }

    if !upgrade || !connection {
        return Err(TransportError::Handshake("missing websocket upgrade headers".into()));
    }
    if !version_ok {
        return Err(TransportError::Handshake("unsupported Sec-WebSocket-Version".into()));
    }
    let key = key.ok_or_else(|| TransportError::Handshake("missing Sec-WebSocket-Key".into()))?;
    if !protocols.iter().any(|p| p == SIP_SUBPROTOCOL) {
        return Err(TransportError::Handshake("client did not offer the sip subprotocol".into()));
    }

    Ok(UpgradeRequest {
        path: path.unwrap_or("/").to_owned(),
        key,
        protocols,
    })
}

/// Builds the `101 Switching Protocols` reply for an accepted upgrade.
pub fn upgrade_response(request: &UpgradeRequest) -> Bytes {
    let accept = derive_accept_key(request.key.as_bytes());
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Protocol: {}\r\n\r\n",
        accept, SIP_SUBPROTOCOL
    ))
}

/// Builds a client upgrade request. Returns the request and the key to verify.
pub fn upgrade_request(host: &str, path: &str) -> (Bytes, String) {
    let key = tokio_tungstenite::tungstenite::handshake::client::generate_key();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {}\r\n\r\n",
        path, host, key, SIP_SUBPROTOCOL
    );
    (Bytes::from(request), key)
}

/// Validates the server's reply to our upgrade request.
pub fn verify_upgrade_response(head: &[u8], key: &str) -> Result<(), TransportError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TransportError::Handshake("upgrade response is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let status = lines.next().unwrap_or_default();
    if status.split_whitespace().nth(1) != Some("101") {
        return Err(TransportError::Handshake(format!(
            "server refused upgrade: {}",
            status
        )));
    }
    let expected = derive_accept_key(key.as_bytes());
    let accepted = lines.filter_map(|l| l.split_once(':')).any(|(name, value)| {
        name.trim().eq_ignore_ascii_case("sec-websocket-accept") && value.trim() == expected
    });
    if !accepted {
        return Err(TransportError::Handshake("bad Sec-WebSocket-Accept".into()));
    }
    Ok(())
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 20;

    fn upgrade_head() -> &'static [u8] {
        b"GET /sip HTTP/1.1\r\n\
          Host: edge.example.com\r\n\
          Upgrade: websocket\r\n\
          Connection: keep-alive, Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\
          Sec-WebSocket-Protocol: sip\r\n\r\n"
    }

    #[test]
    fn accept_key_matches_rfc6455_sample() {
        let request = parse_upgrade_request(upgrade_head()).unwrap();
        assert_eq!(request.path, "/sip");
        let response = upgrade_response(&request);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: sip\r\n"));
    }

    #[test]
    fn rejects_non_get_and_missing_headers() {
        let post = b"POST / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        assert!(matches!(parse_upgrade_request(post), Err(TransportError::Handshake(_))));

        let no_key = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                       Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: sip\r\n\r\n";
        assert!(matches!(parse_upgrade_request(no_key), Err(TransportError::Handshake(_))));

        let no_sip = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                       Sec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 13\r\n\r\n";
        assert!(matches!(parse_upgrade_request(no_sip), Err(TransportError::Handshake(_))));
    }

    #[test]
    fn client_request_verifies_against_server_reply() {
        let (request, key) = upgrade_request("edge.example.com", "/");
        let head = &request[..head_len(&request).unwrap()];
        let parsed = parse_upgrade_request(head).unwrap();
        assert_eq!(parsed.key, key);
        let reply = upgrade_response(&parsed);
        verify_upgrade_response(&reply, &key).unwrap();
        assert!(verify_upgrade_response(&reply, "other-key").is_err());
        assert!(verify_upgrade_response(b"HTTP/1.1 400 Bad Request\r\n\r\n", &key).is_err());
    }

    #[test]
    fn masked_text_frame_decodes_to_original_payload() {
        let payload = b"OPTIONS sip:edge.example.com SIP/2.0\r\n\r\n";
        let mut buf = BytesMut::from(&encode_message(WsRole::Client, payload)[..]);
        assert_eq!(buf[1] & MASK_BIT, MASK_BIT);
        let mut decoder = WsDecoder::new(WsRole::Server, MAX);
        let message = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message, WsMessage::Data(Bytes::from_static(payload)));
        assert!(buf.is_empty());
    }

    #[test]
    fn lengths_use_all_three_encodings() {
        for len in [0usize, 125, 126, 65_535, 65_536, 200_000] {
            let payload = vec![b'x'; len];
            let frame = encode_frame(Opcode::Binary, true, &payload, Some([1, 2, 3, 4]));
            let expected_header = match len {
                0..=125 => 2,
                126..=65_535 => 4,
                _ => 10,
            } + 4;
            assert_eq!(frame.len(), expected_header + len);
            let mut buf = BytesMut::from(&frame[..]);
            let decoded = decode_frame(&mut buf, true, MAX).unwrap().unwrap();
            assert_eq!(decoded.payload.len(), len);
            assert!(decoded.payload.iter().all(|b| *b == b'x'));
        }
    }

    #[test]
    fn incomplete_frame_waits_for_more_bytes() {
        let frame = encode_message(WsRole::Client, b"REGISTER sip:a SIP/2.0\r\n\r\n");
        let mut buf = BytesMut::from(&frame[..frame.len() - 3]);
        let mut decoder = WsDecoder::new(WsRole::Server, MAX);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), frame.len() - 3);
        buf.extend_from_slice(&frame[frame.len() - 3..]);
        assert!(matches!(decoder.decode(&mut buf).unwrap(), Some(WsMessage::Data(_))));
    }

    #[test]
    fn reassembles_fragments() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(Opcode::Text, false, b"INVITE ", Some([9, 9, 9, 9])));
        buf.extend_from_slice(&encode_frame(Opcode::Ping, true, b"hb", Some([1, 1, 1, 1])));
        buf.extend_from_slice(&encode_frame(Opcode::Continuation, false, b"sip:b ", Some([7, 0, 7, 0])));
        buf.extend_from_slice(&encode_frame(Opcode::Continuation, true, b"SIP/2.0", Some([0, 0, 0, 1])));
        let mut decoder = WsDecoder::new(WsRole::Server, MAX);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(WsMessage::Ping(Bytes::from_static(b"hb")))
        );
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(WsMessage::Data(Bytes::from_static(b"INVITE sip:b SIP/2.0")))
        );
    }

    #[test]
    fn server_rejects_unmasked_and_client_rejects_masked() {
        let unmasked = encode_message(WsRole::Server, b"x");
        let mut buf = BytesMut::from(&unmasked[..]);
        assert!(WsDecoder::new(WsRole::Server, MAX).decode(&mut buf).is_err());

        let masked = encode_message(WsRole::Client, b"x");
        let mut buf = BytesMut::from(&masked[..]);
        assert!(WsDecoder::new(WsRole::Client, MAX).decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_reserved_bits_and_oversized_control() {
        let mut frame = BytesMut::from(&encode_message(WsRole::Client, b"x")[..]);
        frame[0] |= 0x40;
        assert!(decode_frame(&mut frame, true, MAX).is_err());

        let big_ping = encode_frame(Opcode::Ping, true, &[0u8; 126], Some([0; 4]));
        let mut buf = BytesMut::from(&big_ping[..]);
        assert!(decode_frame(&mut buf, true, MAX).is_err());
    }

    #[test]
    fn close_frame_carries_status() {
        let frame = encode_control(WsRole::Client, Opcode::Close, &1000u16.to_be_bytes());
        let mut buf = BytesMut::from(&frame[..]);
        let mut decoder = WsDecoder::new(WsRole::Server, MAX);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(WsMessage::Close(Some(1000))));
    }
}
