//! Server-sent-event reassembly for streamed chat completions.

use serde_json::Value;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};

use crate::CancelToken;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    /// `data: [DONE]` was received. Nothing follows it.
    Done,
}

/// Incremental frame parser. Bytes can be pushed with arbitrary boundaries,
/// including in the middle of a frame or of a multi-byte character.
#[derive(Debug, Default)]
pub struct SseReassembler {
    undecoded: Vec<u8>,
    buffer: String,
    done: bool,
}

impl SseReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound chunk and return the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        if self.done {
            return Vec::new();
        }
        self.undecoded.extend_from_slice(chunk);
        self.decode_available();

        let mut events = Vec::new();
        while let Some((end, next)) = find_frame_boundary(&self.buffer) {
            let segment = self.buffer[..end].to_string();
            self.buffer.drain(..next);
            self.process_segment(&segment, &mut events);
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Flush whatever is left once the underlying stream hits EOF.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        if !self.undecoded.is_empty() {
            self.buffer.push_str(&String::from_utf8_lossy(&self.undecoded));
            self.undecoded.clear();
        }
        let rest = std::mem::take(&mut self.buffer);
        self.process_segment(&rest, &mut events);
        events
    }

    fn decode_available(&mut self) {
        loop {
            match std::str::from_utf8(&self.undecoded) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.undecoded.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.buffer.push_str(&String::from_utf8_lossy(&self.undecoded[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.undecoded.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete trailing sequence; wait for more bytes.
                            self.undecoded.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn process_segment(&mut self, segment: &str, events: &mut Vec<SseEvent>) {
        for line in segment.lines() {
            let trimmed = line.trim();
            let Some(payload) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                self.done = true;
                events.push(SseEvent::Done);
                return;
            }
            if let Some(delta) = parse_delta(payload) {
                events.push(SseEvent::Delta(delta));
            }
        }
    }
}

/// `choices[0].delta.content`, if present and non-empty. Malformed JSON
/// yields `None`.
fn parse_delta(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let content = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|content| content.as_str())?;
    if content.is_empty() {
        return None;
    }
    Some(content.to_string())
}

/// Locate the first blank-line separator (`\n\n`, optionally with `\r`
/// before either newline). Returns the end of the segment and the start of
/// the remainder.
fn find_frame_boundary(buffer: &str) -> Option<(usize, usize)> {
    let bytes = buffer.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let mut j = i + 1;
        if bytes.get(j) == Some(&b'\r') {
            j += 1;
        }
        if bytes.get(j) == Some(&b'\n') {
            let end = if i > 0 && bytes[i - 1] == b'\r' { i - 1 } else { i };
            return Some((end, j + 1));
        }
    }
    None
}

/// Lazy delta sequence over a byte stream.
///
/// Blocks only while waiting on the reader. Once the token is cancelled the
/// reader is dropped and no further deltas are produced.
pub struct DeltaStream<R: Read> {
    reader: Option<R>,
    reassembler: SseReassembler,
    queue: VecDeque<String>,
    cancel: CancelToken,
    finished: bool,
    cancelled: bool,
}

impl<R: Read> DeltaStream<R> {
    pub fn new(reader: R, cancel: CancelToken) -> Self {
        Self {
            reader: Some(reader),
            reassembler: SseReassembler::new(),
            queue: VecDeque::new(),
            cancel,
            finished: false,
            cancelled: false,
        }
    }

    /// True when the stream ended because of `[DONE]` or EOF rather than
    /// cancellation or an error.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True when the token stopped the stream before it was fully drained.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn enqueue(&mut self, events: Vec<SseEvent>) {
        for event in events {
            match event {
                SseEvent::Delta(text) => self.queue.push_back(text),
                SseEvent::Done => {
                    self.finished = true;
                    self.reader = None;
                }
            }
        }
    }
}

impl<R: Read> Iterator for DeltaStream<R> {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            if self.cancel.is_cancelled() {
                if self.reader.is_some() || !self.queue.is_empty() {
                    self.cancelled = true;
                }
                self.reader = None;
                self.queue.clear();
                return None;
            }
            if let Some(delta) = self.queue.pop_front() {
                return Some(Ok(delta));
            }
            let reader = self.reader.as_mut()?;
            match reader.read(&mut chunk) {
                Ok(0) => {
                    let events = self.reassembler.finish();
                    self.finished = true;
                    self.reader = None;
                    self.enqueue(events);
                }
                Ok(n) => {
                    let events = self.reassembler.push(&chunk[..n]);
                    self.enqueue(events);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.reader = None;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    const SAMPLE: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"X\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"Y\"}}]}\n\ndata: [DONE]\n\n";

    fn feed_in_pieces(body: &[u8], cuts: &[usize]) -> Vec<SseEvent> {
        let mut reassembler = SseReassembler::new();
        let mut events = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            let cut = cut.min(body.len()).max(start);
            events.extend(reassembler.push(&body[start..cut]));
            start = cut;
        }
        events.extend(reassembler.push(&body[start..]));
        events.extend(reassembler.finish());
        events
    }

    proptest! {
        #[test]
        fn chunk_boundaries_do_not_change_deltas(
            mut cuts in prop::collection::vec(0usize..SAMPLE.len(), 0..12)
        ) {
            cuts.sort_unstable();
            let events = feed_in_pieces(SAMPLE.as_bytes(), &cuts);
            prop_assert_eq!(
                events,
                vec![
                    SseEvent::Delta("X".to_string()),
                    SseEvent::Delta("Y".to_string()),
                    SseEvent::Done,
                ]
            );
        }
    }

    #[test]
    fn split_mid_frame_yields_after_separator() {
        let mut reassembler = SseReassembler::new();
        assert!(reassembler.push(b"data: {\"choices\":[{\"delta\":{\"con").is_empty());
        assert!(reassembler.push(b"tent\":\"hi\"}}]}\n").is_empty());
        assert_eq!(
            reassembler.push(b"\n"),
            vec![SseEvent::Delta("hi".to_string())]
        );
    }

    #[test]
    fn malformed_json_is_skipped() {
        let body = "data: {not json}\n\n: keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n";
        let events = feed_in_pieces(body.as_bytes(), &[]);
        assert_eq!(events, vec![SseEvent::Delta("ok".to_string())]);
    }

    #[test]
    fn carriage_returns_are_tolerated() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n";
        let events = feed_in_pieces(body.as_bytes(), &[]);
        assert_eq!(
            events,
            vec![SseEvent::Delta("a".to_string()), SseEvent::Done]
        );
    }

    #[test]
    fn nothing_after_done_is_emitted() {
        let body = "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n";
        let events = feed_in_pieces(body.as_bytes(), &[]);
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n\n".as_bytes();
        let split = body.iter().position(|&b| b == 0xC3).expect("lead byte") + 1;
        let events = feed_in_pieces(body, &[split]);
        assert_eq!(events, vec![SseEvent::Delta("é".to_string())]);
    }

    #[test]
    fn trailing_frame_without_separator_is_flushed_at_eof() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}";
        let stream = DeltaStream::new(Cursor::new(body.as_bytes().to_vec()), CancelToken::new());
        let deltas: Vec<String> = stream.map(|d| d.expect("delta")).collect();
        assert_eq!(deltas, vec!["tail".to_string()]);
    }

    /// Hands out a fixed script of chunks, one per read call.
    struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let Some(chunk) = self.chunks.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    #[test]
    fn cancellation_stops_the_stream() {
        let frame = |text: &str| {
            format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
                .into_bytes()
        };
        let reader = ScriptedReader {
            chunks: VecDeque::from(vec![frame("a"), frame("b"), frame("c")]),
        };
        let cancel = CancelToken::new();
        let mut stream = DeltaStream::new(reader, cancel.clone());
        assert_eq!(stream.next().map(|r| r.expect("delta")), Some("a".to_string()));
        cancel.cancel();
        assert!(stream.next().is_none());
        assert!(!stream.is_finished());
        assert!(stream.is_cancelled());
    }

    #[test]
    fn delta_stream_reports_finished_after_done() {
        let mut stream =
            DeltaStream::new(Cursor::new(SAMPLE.as_bytes().to_vec()), CancelToken::new());
        let deltas: Vec<String> = stream.by_ref().map(|d| d.expect("delta")).collect();
        assert_eq!(deltas, vec!["X".to_string(), "Y".to_string()]);
        assert!(stream.is_finished());
    }
}
