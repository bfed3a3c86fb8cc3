//! Incremental decoder for chunked chat-completion event streams.
//!
//! The response body arrives as byte chunks whose boundaries have nothing to
//! do with the `data: {...}` records inside it: a chunk may end in the middle
//! of a UTF-8 character, a line or a JSON record. [`StreamDecoder`] keeps the
//! partial state between chunks and hands back complete deltas in order.
//! [`DeltaStream`] wraps any byte stream into a stream of those deltas.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

/// Prefix of event-stream data lines.
const DATA_PREFIX: &str = "data: ";
/// Terminal sentinel payload.
const DONE_SENTINEL: &str = "[DONE]";

/// Outcome of parsing one `data:` payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordParse {
    /// The record carries a text fragment.
    Delta(String),
    /// A well-formed record without text (role header, finish reason, ...).
    NoDelta,
    /// The `[DONE]` sentinel.
    Terminal,
    /// The payload is not (yet) valid JSON.
    Incomplete,
}

#[derive(Deserialize)]
struct ChunkRecord {
    #[serde(default)]
    choices: Option<Vec<Option<ChunkChoice>>>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse one payload (the text after `data: `, already trimmed).
#[must_use]
pub fn parse_record(payload: &str) -> RecordParse {
    if payload == DONE_SENTINEL {
        return RecordParse::Terminal;
    }

    let Ok(record) = serde_json::from_str::<ChunkRecord>(payload) else {
        return RecordParse::Incomplete;
    };

    record
        .choices
        .and_then(|choices| choices.into_iter().next().flatten())
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .map_or(RecordParse::NoDelta, RecordParse::Delta)
}

/// Per-request decode state.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    utf8_tail: Vec<u8>,
    pending: String,
    content: String,
    retry_line: Option<String>,
    terminated: bool,
}

impl StreamDecoder {
    /// Create a decoder for a new response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk and return the deltas it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.terminated {
            return Vec::new();
        }

        let text = self.decode_utf8(chunk);
        self.pending.push_str(&text);
        self.drain_lines(false)
    }

    /// Signal end of input and flush whatever is still buffered.
    pub fn finish(&mut self) -> Vec<String> {
        if self.terminated {
            return Vec::new();
        }

        if !self.utf8_tail.is_empty() {
            self.utf8_tail.clear();
            self.pending.push(char::REPLACEMENT_CHARACTER);
        }

        let mut deltas = self.drain_lines(true);
        if !self.terminated && !self.pending.is_empty() {
            let last = std::mem::take(&mut self.pending);
            if let LineOutcome::Emit(delta) = self.handle_line(last, true) {
                deltas.push(delta);
            }
        }
        self.pending.clear();
        deltas
    }

    /// Full assistant text decoded so far.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Consume the decoder and return the accumulated text.
    #[must_use]
    pub fn into_content(self) -> String {
        self.content
    }

    /// Whether the terminal sentinel was seen.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Stateful UTF-8 decoding: an incomplete trailing sequence is held back
    /// for the next chunk, invalid bytes become U+FFFD.
    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                    }
                }
            }
        }
        out
    }

    fn drain_lines(&mut self, final_flush: bool) -> Vec<String> {
        let mut deltas = Vec::new();

        while let Some(pos) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=pos).collect();
            line.pop();

            match self.handle_line(line, final_flush) {
                LineOutcome::Emit(delta) => deltas.push(delta),
                LineOutcome::Continue => {}
                LineOutcome::Stop => break,
            }
        }

        deltas
    }

    fn handle_line(&mut self, mut line: String, final_flush: bool) -> LineOutcome {
        if line.ends_with('\r') {
            line.pop();
        }
        if line.is_empty() || line.starts_with(':') {
            return LineOutcome::Continue;
        }
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return LineOutcome::Continue;
        };

        match parse_record(payload.trim()) {
            RecordParse::Terminal => {
                self.terminated = true;
                self.pending.clear();
                self.retry_line = None;
                LineOutcome::Stop
            }
            RecordParse::Delta(delta) => {
                self.retry_line = None;
                if delta.is_empty() {
                    return LineOutcome::Continue;
                }
                self.content.push_str(&delta);
                LineOutcome::Emit(delta)
            }
            RecordParse::NoDelta => {
                self.retry_line = None;
                LineOutcome::Continue
            }
            RecordParse::Incomplete => {
                if final_flush || self.retry_line.as_deref() == Some(line.as_str()) {
                    debug!("dropping malformed stream record: {line}");
                    self.retry_line = None;
                    return LineOutcome::Continue;
                }
                // Wait for the next chunk before giving up on this record.
                self.pending.insert(0, '\n');
                self.pending.insert_str(0, &line);
                self.retry_line = Some(line);
                LineOutcome::Stop
            }
        }
    }
}

enum LineOutcome {
    Emit(String),
    Continue,
    Stop,
}

/// Lazily decoded stream of deltas over a byte stream.
///
/// Transport errors are yielded as-is and end the stream.
pub struct DeltaStream<S> {
    body: S,
    decoder: StreamDecoder,
    ready: VecDeque<String>,
    ended: bool,
}

impl<S> DeltaStream<S> {
    /// Wrap a response body.
    pub fn new(body: S) -> Self {
        Self {
            body,
            decoder: StreamDecoder::new(),
            ready: VecDeque::new(),
            ended: false,
        }
    }

    /// Full assistant text decoded so far.
    pub fn content(&self) -> &str {
        self.decoder.content()
    }
}

impl<S, B, E> Stream for DeltaStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<String, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(delta) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(delta)));
            }
            if this.ended {
                return Poll::Ready(None);
            }

            match this.body.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.ready.extend(this.decoder.push(chunk.as_ref()));
                }
                Poll::Ready(Some(Err(err))) => {
                    this.ended = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.ended = true;
                    this.ready.extend(this.decoder.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    const STREAM: &str = concat!(
        ": keep-alive\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Bonjour\"}}]}\r\n\r\n",
        "event: ping\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" à toi \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"🙂\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":null},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    fn expected() -> Vec<String> {
        vec!["Bonjour".to_string(), " à toi ".to_string(), "🙂".to_string()]
    }

    fn decode(chunks: &[&[u8]]) -> (Vec<String>, String) {
        let mut decoder = StreamDecoder::new();
        let mut deltas = Vec::new();
        for chunk in chunks {
            deltas.extend(decoder.push(chunk));
        }
        deltas.extend(decoder.finish());
        (deltas, decoder.into_content())
    }

    #[test]
    fn test_parse_record_variants() {
        assert_eq!(parse_record("[DONE]"), RecordParse::Terminal);
        assert_eq!(
            parse_record(r#"{"choices":[{"delta":{"content":"hi"}}]}"#),
            RecordParse::Delta("hi".to_string())
        );
        assert_eq!(parse_record(r#"{"choices":[{"delta":{}}]}"#), RecordParse::NoDelta);
        assert_eq!(parse_record(r#"{"choices":[null]}"#), RecordParse::NoDelta);
        assert_eq!(parse_record(r#"{"choices":null}"#), RecordParse::NoDelta);
        assert_eq!(parse_record(r#"{"choices":[]}"#), RecordParse::NoDelta);
        assert_eq!(parse_record(r#"{"id":"x"}"#), RecordParse::NoDelta);
        assert_eq!(parse_record(r#"{"choices":[{"delta":{"con"#), RecordParse::Incomplete);
    }

    #[test]
    fn test_single_chunk() {
        let (deltas, content) = decode(&[STREAM.as_bytes()]);
        assert_eq!(deltas, expected());
        assert_eq!(content, "Bonjour à toi 🙂");
    }

    #[test]
    fn test_every_two_way_split_is_equivalent() {
        let bytes = STREAM.as_bytes();
        for offset in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(offset);
            let (deltas, content) = decode(&[head, tail]);
            assert_eq!(deltas, expected(), "split at byte {offset}");
            assert_eq!(content, "Bonjour à toi 🙂", "split at byte {offset}");
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let chunks: Vec<&[u8]> = STREAM.as_bytes().chunks(1).collect();
        let (deltas, _) = decode(&chunks);
        assert_eq!(deltas, expected());
    }

    #[test]
    fn test_record_split_at_json_boundary() {
        let first = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\ndata: {\"choices\":[{\"delta\":";
        let second = "{\"content\":\"llo\"}}]}\n\ndata: [DONE]\n\n";

        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(first.as_bytes()), vec!["He".to_string()]);
        assert_eq!(decoder.push(second.as_bytes()), vec!["llo".to_string()]);
        assert!(decoder.is_terminated());
        assert_eq!(decoder.content(), "Hello");
    }

    #[test]
    fn test_malformed_complete_line_is_dropped_after_more_bytes() {
        let mut decoder = StreamDecoder::new();
        let first = "data: {broken\ndata: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n";
        assert!(decoder.push(first.as_bytes()).is_empty());

        let second = "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n";
        assert_eq!(
            decoder.push(second.as_bytes()),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(decoder.content(), "ab");
    }

    #[test]
    fn test_malformed_line_at_end_is_dropped() {
        let (deltas, content) = decode(&[
            &b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n"[..],
            &b"data: {truncated\n"[..],
        ]);
        assert_eq!(deltas, vec!["ok".to_string()]);
        assert_eq!(content, "ok");
    }

    #[test]
    fn test_final_line_without_newline_is_flushed() {
        let (deltas, _) = decode(&[&b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}"[..]]);
        assert_eq!(deltas, vec!["tail".to_string()]);
    }

    #[test]
    fn test_nothing_after_done_is_emitted() {
        let (deltas, content) = decode(&[
            &b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\ndata: [DONE]\n"[..],
            &b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n"[..],
        ]);
        assert_eq!(deltas, vec!["x".to_string()]);
        assert_eq!(content, "x");
    }

    #[test]
    fn test_invalid_utf8_becomes_replacement() {
        let mut decoder = StreamDecoder::new();
        let mut chunk = b"data: {\"choices\":[{\"delta\":{\"content\":\"a".to_vec();
        chunk.push(0xFF);
        chunk.extend_from_slice(b"b\"}}]}\n");
        assert_eq!(decoder.push(&chunk), vec!["a\u{FFFD}b".to_string()]);
    }

    #[tokio::test]
    async fn test_delta_stream_over_chunked_body() {
        let bytes = STREAM.as_bytes().to_vec();
        let chunks: Vec<Result<Vec<u8>, Infallible>> =
            bytes.chunks(7).map(|c| Ok(c.to_vec())).collect();
        let mut stream = DeltaStream::new(futures::stream::iter(chunks));

        let mut deltas = Vec::new();
        while let Some(delta) = stream.next().await {
            deltas.push(delta.unwrap());
        }
        assert_eq!(deltas, expected());
        assert_eq!(stream.content(), "Bonjour à toi 🙂");
    }

    #[tokio::test]
    async fn test_delta_stream_surfaces_transport_error() {
        let chunks: Vec<Result<&'static [u8], &'static str>> = vec![
            Ok(&b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n"[..]),
            Err("reset"),
        ];
        let mut stream = DeltaStream::new(futures::stream::iter(chunks));

        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        assert_eq!(stream.next().await, Some(Err("reset")));
        assert_eq!(stream.next().await, None);
    }
}
