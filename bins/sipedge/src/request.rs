// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Just enough SIP to admit requests and answer them statelessly.

use bytes::Bytes;
use sip_congestion::{AdmissionRequest, ResponseFactory};

const USER_AGENT: &str = "sipedge/0.1";

/// Start line and dialog-identifying headers of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub vias: Vec<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub call_id: Option<String>,
    pub cseq: Option<String>,
}

impl RequestHead {
    /// Parses the head of a framed request. Responses and garbage yield `None`.
    pub fn peek(message: &[u8]) -> Option<Self> {
        let end = head_end(message);
        let head = std::str::from_utf8(&message[..end]).ok()?;
        let mut lines = head.split("\r\n");

        let mut start = lines.next()?.splitn(3, ' ');
        let method = start.next()?;
        let uri = start.next()?;
        if !start.next()?.starts_with("SIP/2.0") || method.is_empty() || method.starts_with("SIP/") {
            return None;
        }

        let mut request = Self {
            method: method.to_owned(),
            uri: uri.to_owned(),
            vias: Vec::new(),
            from: None,
            to: None,
            call_id: None,
            cseq: None,
        };
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_owned();
            match name.trim().to_ascii_lowercase().as_str() {
                "via" | "v" => request.vias.push(value),
                "from" | "f" => request.from = Some(value),
                "to" | "t" => request.to = Some(value),
                "call-id" | "i" => request.call_id = Some(value),
                "cseq" => request.cseq = Some(value),
                _ => {}
            }
        }
        Some(request)
    }

    fn to_tag(&self) -> Option<&str> {
        let to = self.to.as_deref()?;
        // Params after the closing '>' when the URI is bracketed.
        let params = match to.rfind('>') {
            Some(idx) => &to[idx + 1..],
            None => to,
        };
        params
            .split(';')
            .skip(1)
            .filter_map(|p| p.split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("tag"))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    }
}

fn head_end(message: &[u8]) -> usize {
    message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(message.len())
}

impl AdmissionRequest for RequestHead {
    fn method(&self) -> &str {
        &self.method
    }

    fn has_to_tag(&self) -> bool {
        self.to_tag().is_some()
    }
}

/// Builds responses from the request head without keeping state.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatelessResponses;

impl ResponseFactory<RequestHead> for StatelessResponses {
    fn create_error_response(&self, request: &RequestHead, status: u16) -> Bytes {
        build_response(request, status)
    }
}

/// RFC 3261 §8.2.6 response: Via, From, To, Call-ID and CSeq copied over.
pub fn build_response(request: &RequestHead, status: u16) -> Bytes {
    let mut out = format!("SIP/2.0 {} {}\r\n", status, reason_phrase(status));
    for via in &request.vias {
        out.push_str(&format!("Via: {}\r\n", via));
    }
    if let Some(from) = &request.from {
        out.push_str(&format!("From: {}\r\n", from));
    }
    if let Some(to) = &request.to {
        out.push_str(&format!("To: {}\r\n", to));
    }
    if let Some(call_id) = &request.call_id {
        out.push_str(&format!("Call-ID: {}\r\n", call_id));
    }
    if let Some(cseq) = &request.cseq {
        out.push_str(&format!("CSeq: {}\r\n", cseq));
    }
    out.push_str(&format!("Server: {}\r\nContent-Length: 0\r\n\r\n", USER_AGENT));
    Bytes::from(out)
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        480 => "Temporarily Unavailable",
        486 => "Busy Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bK776asdhds\r\n\
v: SIP/2.0/TCP 10.0.0.2:5060;branch=z9hG4bK1\r\n\
From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
To: Bob <sip:bob@example.com>\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 314159 INVITE\r\n\
Content-Length: 0\r\n\r\n";

    #[test]
    fn peeks_request_headers() {
        let head = RequestHead::peek(INVITE).unwrap();
        assert_eq!(head.method, "INVITE");
        assert_eq!(head.uri, "sip:bob@example.com");
        assert_eq!(head.vias.len(), 2);
        assert_eq!(head.call_id.as_deref(), Some("a84b4c76e66710"));
        assert!(!head.has_to_tag());
    }

    #[test]
    fn responses_are_not_requests() {
        assert!(RequestHead::peek(b"SIP/2.0 200 OK\r\n\r\n").is_none());
        assert!(RequestHead::peek(b"hello").is_none());
    }

    #[test]
    fn detects_to_tag_in_compact_form() {
        let msg = b"BYE sip:a SIP/2.0\r\nt: <sip:bob@example.com;transport=tcp>;tag=abc\r\n\r\n";
        assert!(RequestHead::peek(msg).unwrap().has_to_tag());

        // A tag inside the URI is not a header parameter.
        let msg = b"INVITE sip:a SIP/2.0\r\nTo: <sip:bob@example.com;tag=x>\r\n\r\n";
        assert!(!RequestHead::peek(msg).unwrap().has_to_tag());
    }

    #[test]
    fn response_copies_dialog_headers() {
        let head = RequestHead::peek(INVITE).unwrap();
        let response = StatelessResponses.create_error_response(&head, 503);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("SIP/2.0 503 Service Unavailable\r\n"));
        assert_eq!(text.matches("Via: ").count(), 2);
        assert!(text.contains("CSeq: 314159 INVITE\r\n"));
        assert!(text.contains("To: Bob <sip:bob@example.com>\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }
}
