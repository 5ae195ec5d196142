//! Reconstruction of an HTTP response from the backend's stdout stream.
//!
//! # Responsibilities
//! - Find the header/body boundary (`\n\n` or `\r\n\r\n`), which may span
//!   stdout record boundaries
//! - Parse `name: value` header lines; a `status` header sets the HTTP
//!   status (default 200 when unparseable)
//! - Strip `accept-encoding` (the bridge does no transparent re-compression)
//! - Emit headers exactly once, then pass body bytes through in order

use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};

/// Locate the first header/body break. Returns (start, end) byte offsets of
/// the separator, scanning byte-for-byte so a break split across chunks is
/// still found once the bytes are contiguous.
pub fn find_header_break(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data.len() >= i + 2 && data[i] == b'\n' && data[i + 1] == b'\n' {
            return Some((i, i + 2));
        }
        if data.len() >= i + 4 && &data[i..i + 4] == b"\r\n\r\n" {
            return Some((i, i + 4));
        }
    }
    None
}

/// Parsed response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledHead {
    pub status: StatusCode,
    /// Header names lowercased; insertion order preserved.
    pub headers: Vec<(String, String)>,
}

/// Per-request stdout accumulator.
///
/// Buffers until the header break is found, then streams everything after
/// it. `push` returns the head (at most once) and any body bytes ready to
/// forward.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    pending: BytesMut,
    head_emitted: bool,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head_emitted(&self) -> bool {
        self.head_emitted
    }

    /// Discard buffered state so the request can be replayed from scratch.
    /// Only valid before the head has been emitted.
    pub fn reset(&mut self) {
        debug_assert!(!self.head_emitted);
        self.pending.clear();
    }

    /// Feed one stdout chunk.
    pub fn push(&mut self, chunk: Bytes) -> (Option<AssembledHead>, Option<Bytes>) {
        if self.head_emitted {
            let body = if chunk.is_empty() { None } else { Some(chunk) };
            return (None, body);
        }

        self.pending.extend_from_slice(&chunk);
        let Some((start, end)) = find_header_break(&self.pending) else {
            // Still waiting for all headers to arrive.
            return (None, None);
        };

        let buffered = self.pending.split().freeze();
        let head = parse_head(&buffered[..start]);
        self.head_emitted = true;

        let remainder = buffered.slice(end..);
        let body = if remainder.is_empty() {
            None
        } else {
            Some(remainder)
        };
        (Some(head), body)
    }
}

fn parse_head(section: &[u8]) -> AssembledHead {
    let text = String::from_utf8_lossy(section);
    let mut status = None;
    let mut headers = Vec::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.to_lowercase();
        let value = value.trim_start();

        if name == "status" {
            let parsed = value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok());
            status = Some(parsed.unwrap_or(StatusCode::OK));
        } else if name == "accept-encoding" {
            // Dropped: the bridge does not re-compress.
        } else {
            headers.push((name, value.to_string()));
        }
    }

    AssembledHead {
        status: status.unwrap_or(StatusCode::OK),
        headers,
    }
}
