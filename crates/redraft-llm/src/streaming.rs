use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use redraft_core::error::{RedraftError, Result};

/// Parse a raw SSE byte stream into individual events.
/// SSE format: `event: <type>\ndata: <json>\n\n`
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// OpenAI-style end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        // Some servers frame with CRLF
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();

            let mut event_type = None;
            let mut data_lines = Vec::new();

            for line in block.lines() {
                if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

/// A stream of SSE events from raw bytes. Transport errors end the stream
/// with an `LlmStream` error item.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: Vec<SseEvent>,
    utf8_carry: Vec<u8>,
    finished: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: Vec::new(),
            utf8_carry: Vec::new(),
            finished: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                return Poll::Ready(Some(Ok(this.pending.remove(0))));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    // A multi-byte character may straddle two chunks
                    this.utf8_carry.extend_from_slice(&bytes);
                    let valid_up_to = match std::str::from_utf8(&this.utf8_carry) {
                        Ok(_) => this.utf8_carry.len(),
                        Err(e) => e.valid_up_to(),
                    };
                    let text: Vec<u8> = this.utf8_carry.drain(..valid_up_to).collect();
                    let text = String::from_utf8_lossy(&text);
                    this.pending = this.parser.feed(&text);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(RedraftError::LlmStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_basic() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message\ndata: {\"id\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"id\":1}");
    }

    #[test]
    fn test_sse_parser_chunked_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"x\":").is_empty());
        let events = parser.feed("1}\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"x\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_sse_parser_skips_comment_blocks() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keep-alive\n\ndata:{\"y\":2}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"y\":2}");
    }
}
