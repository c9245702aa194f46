// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Message delimiting for plain stream channels.

use bytes::{Buf, Bytes, BytesMut};

use crate::TransportError;

/// Pong answering a double-CRLF keep-alive ping (RFC 5626 §4.4.1).
pub(crate) const KEEPALIVE_PONG: &[u8] = b"\r\n";

/// Output of one drain pass over a stream buffer.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub messages: Vec<Bytes>,
    pub pings: usize,
}

/// Splits buffered TCP/TLS data into complete SIP messages using Content-Length or CRLFCRLF.
///
/// Leading CR/LF bytes between messages are keep-alives and are skipped; every
/// double-CRLF among them counts as a ping. A buffer that grows past `max_len`
/// without producing a message is an error.
pub(crate) fn drain_sip_frames(buf: &mut BytesMut, max_len: usize) -> Result<Drained, TransportError> {
    let mut drained = Drained::default();
    loop {
        let crlf = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
        if crlf > 0 {
            drained.pings += memchr::memmem::find_iter(&buf[..crlf], b"\r\n\r\n").count();
            buf.advance(crlf);
        }
        if buf.is_empty() {
            break;
        }

        let head_end = match memchr::memmem::find(buf.as_ref(), b"\r\n\r\n") {
            Some(pos) => pos,
            None => {
                if buf.len() > max_len {
                    return Err(TransportError::MessageTooLarge {
                        len: buf.len(),
                        max: max_len,
                    });
                }
                break;
            }
        };

        let content_length = parse_content_length(&buf[..head_end])?.unwrap_or(0);
        let needed = match (head_end + 4).checked_add(content_length) {
            Some(needed) if needed <= max_len => needed,
            Some(needed) => {
                return Err(TransportError::MessageTooLarge {
                    len: needed,
                    max: max_len,
                })
            }
            None => {
                return Err(TransportError::MessageTooLarge {
                    len: usize::MAX,
                    max: max_len,
                })
            }
        };
        if buf.len() < needed {
            break;
        }

        drained.messages.push(buf.split_to(needed).freeze());
    }
    Ok(drained)
}

/// Reads Content-Length (or its compact form `l`) from a header block.
///
/// A missing header is `None`; a value that is not a decimal length is an
/// error since the message boundary cannot be found.
fn parse_content_length(headers: &[u8]) -> Result<Option<usize>, TransportError> {
    let text = String::from_utf8_lossy(headers);
    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if !name.eq_ignore_ascii_case("content-length") && !name.eq_ignore_ascii_case("l") {
            continue;
        }
        let value = value.trim();
        // `parse` alone would accept a leading '+'.
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TransportError::Framing(format!("invalid Content-Length {:?}", value)));
        }
        return value
            .parse()
            .map(Some)
            .map_err(|_| TransportError::Framing(format!("Content-Length {} out of range", value)));
    }
    Ok(None)
}
