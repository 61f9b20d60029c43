use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use snafu::ResultExt;

use super::provider::{LineStream, MalformedChunkSnafu, ProviderResult, StreamIdleSnafu};

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_MARKER: &str = "[DONE]";

/// One interpreted line of an event-stream body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Comments, blank keep-alives, or chunks that carry no content.
    Skip,
    Delta(String),
    Done,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

pub fn parse_event_line(line: &str) -> ProviderResult<SseEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(SseEvent::Skip);
    };

    let payload = payload.trim();
    if payload == DONE_MARKER {
        return Ok(SseEvent::Done);
    }

    let chunk: ChatCompletionChunk =
        serde_json::from_str(payload).context(MalformedChunkSnafu {
            stage: "parse-event-line",
            payload: payload.to_string(),
        })?;

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty());

    Ok(content.map_or(SseEvent::Skip, SseEvent::Delta))
}

/// Splits raw body bytes into text lines, carrying partial lines across reads.
///
/// Splitting happens on the byte level, so a multi-byte character cut by a read
/// boundary is completed by the next read before it is decoded.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        // The buffer never holds a newline between calls, so only new bytes are scanned.
        let mut cursor = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[cursor..].iter().position(|byte| *byte == b'\n') {
            let end = cursor + offset;
            let line = &self.buffer[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            cursor = start;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Flushes an unterminated trailing line once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

struct LineState {
    bytes: BoxStream<'static, ProviderResult<Bytes>>,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    idle_timeout: Option<Duration>,
    finished: bool,
}

impl LineState {
    async fn next_read(&mut self) -> ProviderResult<Option<Bytes>> {
        let next = match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.bytes.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return StreamIdleSnafu {
                        stage: "read-line-stream",
                        idle_secs: limit.as_secs(),
                    }
                    .fail();
                }
            },
            None => self.bytes.next().await,
        };
        next.transpose()
    }
}

/// Turns a body byte stream into a pull-based stream of text lines.
///
/// Reads happen only when the consumer polls. A read error or idle timeout is
/// yielded once and then the stream ends.
pub fn decode_lines<S>(bytes: S, idle_timeout: Option<Duration>) -> LineStream
where
    S: Stream<Item = ProviderResult<Bytes>> + Send + 'static,
{
    let state = LineState {
        bytes: bytes.boxed(),
        decoder: LineDecoder::new(),
        pending: VecDeque::new(),
        idle_timeout,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((Ok(line), state));
            }
            if state.finished {
                return None;
            }

            match state.next_read().await {
                Ok(Some(chunk)) => {
                    let lines = state.decoder.push(&chunk);
                    state.pending.extend(lines);
                }
                Ok(None) => {
                    state.finished = true;
                    if let Some(rest) = state.decoder.finish() {
                        state.pending.push_back(rest);
                    }
                }
                Err(error) => {
                    state.finished = true;
                    tracing::debug!(error = %error, "line stream terminated by read failure");
                    return Some((Err(error), state));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;

    #[test]
    fn data_lines_yield_delta_content() {
        let event = parse_event_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(event, SseEvent::Delta("Hel".into()));
    }

    #[test]
    fn done_marker_and_non_data_lines() {
        assert_eq!(parse_event_line("data: [DONE]").unwrap(), SseEvent::Done);
        assert_eq!(parse_event_line("data: [DONE]\r").unwrap(), SseEvent::Done);
        assert_eq!(parse_event_line("").unwrap(), SseEvent::Skip);
        assert_eq!(parse_event_line(": keep-alive").unwrap(), SseEvent::Skip);
        assert_eq!(parse_event_line("event: message").unwrap(), SseEvent::Skip);
    }

    #[test]
    fn chunks_without_content_are_skipped() {
        for line in [
            r#"data: {"choices":[]}"#,
            r#"data: {"choices":[{"delta":{}}]}"#,
            r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"data: {"id":"x"}"#,
        ] {
            assert_eq!(parse_event_line(line).unwrap(), SseEvent::Skip, "{line}");
        }
    }

    #[test]
    fn malformed_payload_reports_chunk_error() {
        let error = parse_event_line("data: {not json").unwrap_err();
        assert!(error.is_malformed_chunk());
        assert!(matches!(
            error,
            ProviderError::MalformedChunk { ref payload, .. } if payload == "{not json"
        ));
    }

    #[test]
    fn decoder_carries_partial_lines_and_split_characters() {
        let mut decoder = LineDecoder::new();
        let text = "data: héllo\ndata: wörld\n".as_bytes();
        // Cut inside the two-byte 'é'.
        let split = text.iter().position(|byte| *byte == 0xC3).unwrap() + 1;

        assert!(decoder.push(&text[..split]).is_empty());
        assert_eq!(decoder.pending_len(), split);

        let lines = decoder.push(&text[split..]);
        assert_eq!(lines, vec!["data: héllo".to_string(), "data: wörld".to_string()]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_assembles_long_line_fed_byte_by_byte() {
        let mut decoder = LineDecoder::new();
        let payload = format!("data: {}", "x".repeat(4096));
        for (index, byte) in payload.bytes().enumerate() {
            assert!(decoder.push(&[byte]).is_empty());
            assert_eq!(decoder.pending_len(), index + 1);
        }

        let lines = decoder.push(b"\r\nnext\n");
        assert_eq!(lines, vec![payload, "next".to_string()]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn decoder_strips_carriage_returns_and_flushes_tail() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.push(b"a\r\n\r\nb"), vec!["a".to_string(), String::new()]);
        assert_eq!(decoder.finish().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn decode_lines_reassembles_across_reads() {
        let reads = vec![
            Ok(Bytes::from_static(b"data: one\nda")),
            Ok(Bytes::from_static(b"ta: two\n")),
            Ok(Bytes::from_static(b"tail")),
        ];
        let lines = decode_lines(stream::iter(reads), None)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<ProviderResult<Vec<_>>>()
            .unwrap();

        assert_eq!(lines, vec!["data: one", "data: two", "tail"]);
    }

    #[tokio::test]
    async fn decode_lines_reports_idle_timeout_once() {
        let reads = stream::iter(vec![Ok(Bytes::from_static(b"data: first\n"))])
            .chain(stream::pending());
        let mut lines = decode_lines(reads, Some(Duration::from_millis(20)));

        assert_eq!(lines.next().await.unwrap().unwrap(), "data: first");
        let error = lines.next().await.unwrap().unwrap_err();
        assert!(matches!(error, ProviderError::StreamIdle { .. }));
        assert!(lines.next().await.is_none());
    }
}
