//! Stream Transport Codec
//!
//! Frames `data: <json>` records over a byte stream that may be split at
//! arbitrary points, including inside a UTF-8 sequence or inside a record.
//!
//! A record ends at a blank line (`\n\n`) or at a single `\n` that is
//! immediately followed by the next `data:` prefix; both conventions show up
//! in the wild. The unterminated tail stays buffered until more bytes arrive
//! or the stream ends.

use crate::error::Result;
use crate::stream::event::StreamEvent;
use tracing::warn;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Splits raw bytes into record payloads (the text after `data:`).
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: String,
    /// Bytes of an incomplete UTF-8 sequence carried to the next push.
    pending: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the payloads of every record it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let decoded = take_valid_utf8(&mut self.pending);
        self.buffer.push_str(&decoded);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut payloads = Vec::new();
        while let Some((end, next)) = find_boundary(&self.buffer) {
            let segment: String = self.buffer[..end].to_string();
            self.buffer.drain(..next);
            if let Some(payload) = segment_payload(&segment) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush whatever is left once the source is exhausted.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.buffer.push_str(&rest);
        }
        let remaining = std::mem::take(&mut self.buffer);
        let remaining = remaining.replace("\r\n", "\n");
        if remaining.trim().is_empty() {
            return Vec::new();
        }
        // A stream may end without the final blank line, possibly still
        // holding several single-newline separated records.
        let mut payloads = Vec::new();
        let mut rest = remaining.as_str();
        loop {
            match find_boundary_eager(rest) {
                Some((end, next)) => {
                    if let Some(payload) = segment_payload(&rest[..end]) {
                        payloads.push(payload);
                    }
                    rest = &rest[next..];
                }
                None => {
                    if let Some(payload) = segment_payload(rest) {
                        payloads.push(payload);
                    }
                    break;
                }
            }
        }
        payloads
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }
}

/// Outcome of decoding one record.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Event(StreamEvent),
    /// The literal `[DONE]` payload.
    Done,
}

/// Decodes typed [`StreamEvent`]s on top of [`FrameSplitter`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    splitter: FrameSplitter,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        let payloads = self.splitter.push(chunk);
        self.decode_all(payloads)
    }

    pub fn finish(&mut self) -> Vec<DecodedFrame> {
        let payloads = self.splitter.finish();
        self.decode_all(payloads)
    }

    /// Number of malformed records dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode_all(&mut self, payloads: Vec<String>) -> Vec<DecodedFrame> {
        let mut frames = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match decode_payload(&payload) {
                Some(frame) => frames.push(frame),
                None => self.skipped += 1,
            }
        }
        frames
    }
}

/// Parse a single payload; malformed records are logged and dropped.
pub fn decode_payload(payload: &str) -> Option<DecodedFrame> {
    if payload == DONE_SENTINEL {
        return Some(DecodedFrame::Done);
    }
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => Some(DecodedFrame::Event(event)),
        Err(e) => {
            let preview: String = payload.chars().take(120).collect();
            warn!("Skipping malformed stream record ({}): {}", e, preview);
            None
        }
    }
}

/// Frame one event for the wire.
pub fn encode_event(event: &StreamEvent) -> Result<String> {
    Ok(format!("{} {}\n\n", DATA_PREFIX, serde_json::to_string(event)?))
}

pub fn encode_done() -> String {
    format!("{} {}\n\n", DATA_PREFIX, DONE_SENTINEL)
}

/// Locate the first record boundary that can be decided with the bytes at
/// hand. Returns `(segment_end, next_segment_start)`.
fn find_boundary(buffer: &str) -> Option<(usize, usize)> {
    let bytes = buffer.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = buffer[search_from..].find('\n') {
        let i = search_from + offset;
        let rest = &buffer[i + 1..];
        if rest.is_empty() {
            return None;
        }
        if bytes[i + 1] == b'\n' {
            return Some((i, i + 2));
        }
        if rest.starts_with(DATA_PREFIX) {
            return Some((i, i + 1));
        }
        if DATA_PREFIX.starts_with(rest) {
            // Could still turn into `data:`; wait for more bytes.
            return None;
        }
        search_from = i + 1;
    }
    None
}

/// Boundary search for the final flush, where no more bytes will come.
fn find_boundary_eager(buffer: &str) -> Option<(usize, usize)> {
    let bytes = buffer.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = buffer[search_from..].find('\n') {
        let i = search_from + offset;
        if i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
            return Some((i, i + 2));
        }
        if buffer[i + 1..].starts_with(DATA_PREFIX) {
            return Some((i, i + 1));
        }
        search_from = i + 1;
    }
    None
}

/// Extract the payload from one record. Lines carrying `data:` are joined;
/// SSE comments and other fields are ignored. A record with no `data:` line
/// at all is taken verbatim so newline-delimited JSON also decodes.
fn segment_payload(segment: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    let mut saw_field = false;
    for line in segment.lines() {
        if let Some(value) = line.strip_prefix(DATA_PREFIX) {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if line.starts_with(':')
            || line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
        {
            saw_field = true;
        }
    }

    let payload = if data_lines.is_empty() {
        if saw_field {
            return None;
        }
        segment.trim().to_string()
    } else {
        data_lines.join("\n").trim().to_string()
    };

    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// Drain the longest valid UTF-8 prefix from `pending`, leaving a trailing
/// incomplete sequence in place. Invalid bytes are replaced, not fatal.
fn take_valid_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending.as_slice()) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_stream() -> String {
        let events = vec![
            StreamEvent::ConnectionInit {
                session_id: Some("s-1".to_string()),
            },
            StreamEvent::step("planning"),
            StreamEvent::thinking("分析问题"),
            StreamEvent::ToolInput {
                tool_name: "execute_sql".to_string(),
                args: json!({"sql": "SELECT SUM(total_amount) FROM orders"}),
            },
            StreamEvent::content("总收入是 42"),
            StreamEvent::chart(json!({"xAxis": {"type": "category"}})),
        ];
        let mut wire = String::new();
        for event in &events {
            wire.push_str(&encode_event(event).unwrap());
        }
        wire.push_str(&encode_done());
        wire
    }

    fn decode_in_fragments(wire: &[u8], sizes: &[usize]) -> Vec<DecodedFrame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < wire.len() {
            let size = sizes[i % sizes.len()].max(1);
            let end = (offset + size).min(wire.len());
            frames.extend(decoder.push(&wire[offset..end]));
            offset = end;
            i += 1;
        }
        frames.extend(decoder.finish());
        frames
    }

    #[test]
    fn test_fragmentation_does_not_change_events() {
        let wire = sample_stream();
        let whole = decode_in_fragments(wire.as_bytes(), &[wire.len()]);
        assert_eq!(whole.len(), 7);
        assert_eq!(whole.last(), Some(&DecodedFrame::Done));

        for sizes in [&[1usize][..], &[2][..], &[3, 7][..], &[5, 1, 11][..], &[13][..], &[64][..]] {
            let split = decode_in_fragments(wire.as_bytes(), sizes);
            assert_eq!(split, whole, "fragment sizes {:?}", sizes);
        }
    }

    #[test]
    fn test_single_newline_before_next_prefix() {
        let wire = "data: {\"type\":\"content\",\"delta\":\"a\"}\ndata: {\"type\":\"content\",\"delta\":\"b\"}\n";
        let frames = decode_in_fragments(wire.as_bytes(), &[4]);
        assert_eq!(
            frames,
            vec![
                DecodedFrame::Event(StreamEvent::content("a")),
                DecodedFrame::Event(StreamEvent::content("b")),
            ]
        );
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let wire = "data: {\"type\":\"content\",\"delta\":\"a\"}\n\ndata: {not json\n\ndata: {\"type\":\"content\",\"delta\":\"b\"}\n\n";
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.push(wire.as_bytes());
        frames.extend(decoder.finish());
        assert_eq!(frames.len(), 2);
        assert_eq!(decoder.skipped(), 1);
        assert_eq!(frames[1], DecodedFrame::Event(StreamEvent::content("b")));
    }

    #[test]
    fn test_trailing_record_flushed_on_finish() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: {\"type\":\"processing_step\",\"step\":\"x\"}");
        assert!(frames.is_empty());
        assert_eq!(
            decoder.finish(),
            vec![DecodedFrame::Event(StreamEvent::step("x"))]
        );
    }

    #[test]
    fn test_crlf_and_comments() {
        let wire = ": keepalive\r\n\r\nevent: message\r\ndata: [DONE]\r\n\r\n";
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(wire.as_bytes());
        assert_eq!(frames, vec![DecodedFrame::Done]);
    }

    #[test]
    fn test_split_utf8_sequence() {
        let wire = encode_event(&StreamEvent::content("销售部")).unwrap();
        let bytes = wire.as_bytes();
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for b in bytes {
            frames.extend(decoder.push(std::slice::from_ref(b)));
        }
        assert_eq!(frames, vec![DecodedFrame::Event(StreamEvent::content("销售部"))]);
    }
}
