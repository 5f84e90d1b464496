// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Best-effort framing of decrypted tunnel traffic.
//!
//! Client bytes are collected until the first `\r\n\r\n`; that prefix is the
//! request head. Origin bytes are collected as the response. Nothing here
//! understands pipelining, and chunked bodies are only unwrapped after the
//! fact when the whole response was seen.

use crate::reconstruct::{header_value, reason_phrase, render_raw_response, stored_body};
use crate::record::{RecordPatch, RecordResponse};
use bytes::{Bytes, BytesMut};
use tracing::debug;

/// Bytes kept per direction. Traffic past this is relayed but not captured.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 100;

#[derive(Debug, Default)]
pub struct Reassembler {
    head: BytesMut,
    head_complete: bool,
    client_rest: BytesMut,
    origin: BytesMut,
    truncated: bool,
}

/// What the reassembler saw once the tunnel closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedExchange {
    pub request_head: Bytes,
    pub head_complete: bool,
    /// Client bytes after the head: request body or further requests.
    pub request_rest: Bytes,
    pub response: Bytes,
    pub truncated: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_client(&mut self, chunk: &[u8]) {
        if self.head_complete {
            self.keep(Direction::ClientRest, chunk);
            return;
        }

        // The terminator may straddle the previous chunk.
        let search_from = self.head.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        self.keep(Direction::Head, chunk);
        if let Some(pos) = find(&self.head[search_from..], HEAD_TERMINATOR) {
            let end = search_from + pos + HEAD_TERMINATOR.len();
            let rest = self.head.split_off(end);
            self.head_complete = true;
            debug!(head_len = end, "request head complete");
            self.keep(Direction::ClientRest, &rest);
        }
    }

    pub fn push_origin(&mut self, chunk: &[u8]) {
        self.keep(Direction::Origin, chunk);
    }

    pub fn is_head_complete(&self) -> bool {
        self.head_complete
    }

    pub fn finish(self) -> CapturedExchange {
        CapturedExchange {
            request_head: self.head.freeze(),
            head_complete: self.head_complete,
            request_rest: self.client_rest.freeze(),
            response: self.origin.freeze(),
            truncated: self.truncated,
        }
    }

    fn keep(&mut self, dir: Direction, chunk: &[u8]) {
        let buf = match dir {
            Direction::Head => &mut self.head,
            Direction::ClientRest => &mut self.client_rest,
            Direction::Origin => &mut self.origin,
        };
        let take = chunk.len().min(MAX_CAPTURE_BYTES.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            self.truncated = true;
        }
    }
}

enum Direction {
    Head,
    ClientRest,
    Origin,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl CapturedExchange {
    /// Converts the capture into a record update.
    ///
    /// `raw_request` is set whenever any client bytes were seen. A response is
    /// only attached when the origin bytes start with a complete status line
    /// and header block.
    pub fn into_patch(self) -> RecordPatch {
        let raw_request = if self.request_head.is_empty() {
            None
        } else {
            let mut raw = String::from_utf8_lossy(&self.request_head).into_owned();
            raw.push_str(&String::from_utf8_lossy(&self.request_rest));
            Some(raw)
        };
        RecordPatch {
            raw_request,
            response: parse_response(&self.response),
        }
    }
}

/// Parses an HTTP/1.x response from raw bytes, decoding its body when possible.
pub fn parse_response(data: &[u8]) -> Option<RecordResponse> {
    if data.is_empty() {
        return None;
    }
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_buf);
    let head_len = match parsed.parse(data) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            debug!(len = data.len(), "response head incomplete, not attaching");
            return None;
        }
        Err(e) => {
            debug!(error = %e, "origin bytes are not an HTTP/1.x response");
            return None;
        }
    };

    let status = parsed.code?;
    let reason = match parsed.reason {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => reason_phrase(status).to_string(),
    };
    let version = match parsed.version {
        Some(0) => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    let mut body = &data[head_len..];
    if let Some(len) = header_value(&headers, "content-length").and_then(|v| v.trim().parse::<usize>().ok()) {
        body = &body[..body.len().min(len)];
    }
    let is_chunked = header_value(&headers, "transfer-encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let unchunked = if is_chunked {
        dechunk(body).unwrap_or_else(|| Bytes::copy_from_slice(body))
    } else {
        Bytes::copy_from_slice(body)
    };
    let decoded = stored_body(&headers, &unchunked);

    let raw = render_raw_response(
        version,
        status,
        &reason,
        &headers,
        decoded.as_deref().unwrap_or_default(),
    );
    Some(RecordResponse {
        status,
        status_text: reason,
        headers,
        body: decoded,
        raw,
    })
}

// Unwraps a complete chunked body. Incomplete or malformed input yields None.
fn dechunk(mut data: &[u8]) -> Option<Bytes> {
    let mut out = BytesMut::new();
    loop {
        let (offset, size) = match httparse::parse_chunk_size(data) {
            Ok(httparse::Status::Complete(v)) => v,
            _ => return None,
        };
        let size = usize::try_from(size).ok()?;
        data = &data[offset..];
        if size == 0 {
            return Some(out.freeze());
        }
        if data.len() < size + 2 {
            return None;
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}
