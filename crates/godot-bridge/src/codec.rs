//! Frame decoding for both channels
//!
//! The debug adapter speaks `Content-Length` framing over a byte stream:
//!
//! ```text
//! Content-Length: 47\r\n
//! \r\n
//! {"seq":1,"type":"request","command":"initialize"}
//! ```
//!
//! The editor socket delivers one JSON document per WebSocket message, so it
//! only needs parsing. Neither path ever fails: malformed input is logged and
//! skipped.

use serde_json::Value;
use tracing::warn;

/// Header block terminator
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Unterminated header blocks past this size are compacted (8KB)
pub const MAX_HEADER_LEN: usize = 8 * 1024;

/// Sanity limit on a declared body length (64MB)
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Incremental decoder for `Content-Length` framed JSON
#[derive(Debug, Default)]
pub struct ContentLengthDecoder {
    buffer: Vec<u8>,
}

impl ContentLengthDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet consumed by a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `bytes` and return every JSON document that is now complete
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(bytes);

        let mut documents = Vec::new();
        while let Some(body) = self.next_body() {
            match serde_json::from_slice(&body) {
                Ok(value) => documents.push(value),
                Err(e) => warn!(
                    "Dropping malformed frame body ({} bytes): {}",
                    body.len(),
                    e
                ),
            }
        }
        documents
    }

    /// Extract the next complete body, discarding unusable headers on the way
    fn next_body(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(header_len) = find(&self.buffer, HEADER_END) else {
                if self.buffer.len() > MAX_HEADER_LEN {
                    let compacted = compact_header(&self.buffer);
                    warn!(
                        "Discarding {} bytes without a header terminator",
                        self.buffer.len().saturating_sub(compacted.len())
                    );
                    self.buffer = compacted;
                }
                return None;
            };

            let body_start = header_len + HEADER_END.len();
            let length = parse_content_length(&self.buffer[..header_len]);

            let Some(length) = length.filter(|len| *len <= MAX_BODY_LEN) else {
                warn!(
                    "Discarding header without a usable Content-Length: {:?}",
                    String::from_utf8_lossy(&self.buffer[..header_len])
                );
                self.buffer.drain(..body_start);
                continue;
            };

            if self.buffer.len() < body_start + length {
                return None;
            }

            let body = self.buffer[body_start..body_start + length].to_vec();
            self.buffer.drain(..body_start + length);
            return Some(body);
        }
    }
}

/// Find the `Content-Length` value in a header block
fn parse_content_length(header: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(header).ok()?;
    text.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

/// Shrink an unterminated header block without changing how it will parse.
///
/// Complete lines collapse to the Content-Length they declare, or to one
/// placeholder line. The partial last line is kept unless it is overlong,
/// in which case it is junk; a trailing `\r` survives so a terminator split
/// across reads is still found.
fn compact_header(buffer: &[u8]) -> Vec<u8> {
    let (lines, tail) = match rfind(buffer, b"\r\n") {
        Some(pos) => (Some(&buffer[..pos]), &buffer[pos + 2..]),
        None => (None, buffer),
    };

    let mut compacted = Vec::new();
    if let Some(lines) = lines {
        match parse_content_length(lines) {
            Some(length) => {
                compacted.extend_from_slice(format!("Content-Length: {}\r\n", length).as_bytes())
            }
            // Invalid UTF-8 anywhere spoils the whole block
            None if std::str::from_utf8(lines).is_err() => {
                compacted.extend_from_slice(b"\xff\r\n")
            }
            None => compacted.extend_from_slice(b"\0\r\n"),
        }
    }

    if tail.len() <= MAX_HEADER_LEN {
        compacted.extend_from_slice(tail);
    } else {
        let invalid = std::str::from_utf8(tail).is_err_and(|e| e.error_len().is_some());
        compacted.push(if invalid { 0xff } else { 0 });
        if tail.last() == Some(&b'\r') {
            compacted.push(b'\r');
        }
    }
    compacted
}

/// Frame a JSON body with its `Content-Length` header
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Parse one self-delimited message; malformed text yields `None`
pub fn decode_message(text: &str) -> Option<Value> {
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            let preview: String = text.chars().take(200).collect();
            warn!("Dropping malformed message: {} ({})", e, preview);
            None
        }
    }
}
