//! Stream reframing shared by the dialect translators.
//!
//! Engines emit either SSE (`data: …\n\n` frames) or NDJSON (one JSON value
//! per line).  Every translator is the same loop: split the upstream byte
//! stream into frames with [`FrameSource`], rewrite each frame, and emit it
//! through one of three sink framings (OpenAI SSE passthrough, Ollama
//! NDJSON, Anthropic SSE).  [`FrameSource`] yields a frame as soon as its
//! delimiter arrives — never waiting for the next one — so each frame
//! reaches the client before the engine produces the next.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Upstream byte framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events: frames separated by a blank line.
    Sse,
    /// Newline-delimited JSON: one frame per line.
    Ndjson,
}

/// Splits a fallible byte stream into frames.
pub struct FrameSource<S> {
    stream: S,
    framing: Framing,
    buf: BytesMut,
    done: bool,
}

impl<S> FrameSource<S> {
    pub fn new(stream: S, framing: Framing) -> Self {
        Self {
            stream,
            framing,
            buf: BytesMut::new(),
            done: false,
        }
    }

    /// Pop one complete frame off the buffer, excluding its delimiter.
    fn extract_frame(&mut self) -> Option<Bytes> {
        match self.framing {
            Framing::Ndjson => {
                let pos = self.buf.iter().position(|&b| b == b'\n')?;
                let frame = self.buf.split_to(pos + 1);
                Some(trim_delimiters(frame.freeze()))
            }
            Framing::Sse => {
                // A frame ends at the first blank line ("\n\n" or "\r\n\r\n").
                let window = self.buf.windows(2).position(|w| w == b"\n\n");
                let window_crlf = self.buf.windows(4).position(|w| w == b"\r\n\r\n");
                match (window, window_crlf) {
                    (Some(lf), Some(crlf)) if crlf < lf => {
                        let frame = self.buf.split_to(crlf + 4);
                        Some(trim_delimiters(frame.freeze()))
                    }
                    (Some(lf), _) => {
                        let frame = self.buf.split_to(lf + 2);
                        Some(trim_delimiters(frame.freeze()))
                    }
                    (None, Some(crlf)) => {
                        let frame = self.buf.split_to(crlf + 4);
                        Some(trim_delimiters(frame.freeze()))
                    }
                    (None, None) => None,
                }
            }
        }
    }
}

fn trim_delimiters(frame: Bytes) -> Bytes {
    let end = frame
        .iter()
        .rposition(|&b| b != b'\n' && b != b'\r')
        .map(|i| i + 1)
        .unwrap_or(0);
    frame.slice(..end)
}

impl<S, E> Stream for FrameSource<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(frame) = self.extract_frame() {
                if !frame.is_empty() {
                    return Poll::Ready(Some(Ok(frame)));
                }
                continue;
            }
            if self.done {
                if self.buf.is_empty() {
                    return Poll::Ready(None);
                }
                // Trailing bytes without a final delimiter form a last frame.
                let rest = trim_delimiters(self.buf.split().freeze());
                if rest.is_empty() {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(Ok(rest)));
            }
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    self.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Extract the `data:` payload of an SSE frame, joining multi-line data.
/// Returns `None` for comment-only or dataless frames.
pub fn sse_data(frame: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(frame).ok()?;
    let mut data_lines = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// The OpenAI SSE terminator payload.
pub const SSE_DONE: &str = "[DONE]";

// ── Sink framings ─────────────────────────────────────────────────────────────

/// OpenAI-style SSE frame: `data: <payload>\n\n`.
pub fn sse_frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Anthropic-style SSE frame with an explicit event name.
pub fn sse_event_frame(event: &str, payload: &str) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {payload}\n\n"))
}

/// Ollama-style NDJSON line.
pub fn ndjson_frame(value: &serde_json::Value) -> Bytes {
    Bytes::from(format!("{value}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::convert::Infallible;

    async fn frames(framing: Framing, chunks: Vec<&'static [u8]>) -> Vec<String> {
        let stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, Infallible>(Bytes::from_static(c))),
        );
        FrameSource::new(stream, framing)
            .map(|f| String::from_utf8(f.expect("frame").to_vec()).expect("utf8"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn sse_frames_split_on_blank_lines() {
        let out = frames(
            Framing::Sse,
            vec![b"data: one\n\ndata: two\n\n" as &[u8]],
        )
        .await;
        assert_eq!(out, vec!["data: one", "data: two"]);
    }

    #[tokio::test]
    async fn sse_frame_split_across_chunks_is_reassembled() {
        let out = frames(
            Framing::Sse,
            vec![b"data: {\"id\":" as &[u8], b"1}\n", b"\ndata: x\n\n"],
        )
        .await;
        assert_eq!(out, vec!["data: {\"id\":1}", "data: x"]);
    }

    #[tokio::test]
    async fn sse_crlf_delimiters_are_accepted() {
        let out = frames(Framing::Sse, vec![b"data: a\r\n\r\ndata: b\r\n\r\n" as &[u8]]).await;
        assert_eq!(out, vec!["data: a", "data: b"]);
    }

    #[tokio::test]
    async fn ndjson_yields_one_frame_per_line() {
        let out = frames(
            Framing::Ndjson,
            vec![b"{\"a\":1}\n{\"b\":" as &[u8], b"2}\n"],
        )
        .await;
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn trailing_bytes_without_delimiter_become_a_final_frame() {
        let out = frames(Framing::Ndjson, vec![b"{\"a\":1}\n{\"partial\":true}" as &[u8]]).await;
        assert_eq!(out, vec!["{\"a\":1}", "{\"partial\":true}"]);
    }

    #[tokio::test]
    async fn each_frame_is_available_before_the_next_chunk_arrives() {
        // A frame whose delimiter has arrived must be yielded even though
        // the source has more pending input.
        let stream = futures::stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from_static(b"data: first\n\n")),
            Ok(Bytes::from_static(b"data: second\n\n")),
        ]);
        let mut source = FrameSource::new(stream, Framing::Sse);
        let first = source.next().await.expect("some").expect("ok");
        assert_eq!(&first[..], b"data: first");
    }

    #[test]
    fn sse_data_joins_multi_line_payloads() {
        assert_eq!(
            sse_data(b"data: {\"a\":\ndata: 1}").as_deref(),
            Some("{\"a\":\n1}")
        );
        assert_eq!(sse_data(b": comment"), None);
        assert_eq!(sse_data(b"data: [DONE]").as_deref(), Some(SSE_DONE));
    }

    #[test]
    fn sink_framings_are_well_formed() {
        assert_eq!(&sse_frame("x")[..], b"data: x\n\n");
        assert_eq!(
            &sse_event_frame("message_stop", "{}")[..],
            b"event: message_stop\ndata: {}\n\n"
        );
        assert_eq!(
            &ndjson_frame(&serde_json::json!({"done": true}))[..],
            b"{\"done\":true}\n"
        );
    }
}
