//! Server-sent-events connector: streaming GET + incremental line parser.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header;

use super::{DEFAULT_CATEGORY, EventStream, EventStreamConnector, StreamEvent};
use crate::error::TransportError;

/// Production event-stream connector over HTTP.
#[derive(Clone, Default)]
pub struct SseConnector {
    client: reqwest::Client,
}

impl EventStreamConnector for SseConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<EventStream, TransportError>> {
        let client = self.client.clone();
        let url = url.to_string();
        Box::pin(async move {
            let response = client
                .get(&url)
                .header(header::ACCEPT, "text/event-stream")
                .send()
                .await?
                .error_for_status()?;

            let body = response.bytes_stream();
            let state = (body, SseParser::default(), VecDeque::new());
            let stream = futures::stream::unfold(state, |(mut body, mut parser, mut ready)| async move {
                loop {
                    if let Some(event) = ready.pop_front() {
                        return Some((Ok(event), (body, parser, ready)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => ready.extend(parser.push(&chunk)),
                        Some(Err(e)) => {
                            return Some((Err(TransportError::from(e)), (body, parser, ready)));
                        }
                        None => return None,
                    }
                }
            });
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

/// Incremental `text/event-stream` parser.
///
/// Handles the subset this portal's server emits: `event:` and `data:`
/// fields, comment lines, multi-line data, CRLF or LF line endings. `id:`
/// and `retry:` fields are accepted and ignored.
#[derive(Default)]
struct SseParser {
    buf: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed a chunk of bytes; returns every event completed by it.
    fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(newline) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.take_line(line) {
                out.push(event);
            }
        }
        out
    }

    fn take_line(&mut self, line: &str) -> Option<StreamEvent> {
        if line.is_empty() {
            // Blank line dispatches. An event name with no data is discarded,
            // matching EventSource semantics.
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            let category = self
                .event
                .take()
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(StreamEvent { category, data });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut SseParser, text: &str) -> Vec<StreamEvent> {
        parser.push(text.as_bytes())
    }

    #[test]
    fn named_event_with_data() {
        let mut p = SseParser::default();
        let events = feed(&mut p, "event: vitals\ndata: {\"bpm\":70}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, "vitals");
        assert_eq!(events[0].data, "{\"bpm\":70}");
    }

    #[test]
    fn unnamed_event_gets_default_category() {
        let mut p = SseParser::default();
        let events = feed(&mut p, "data: hello\n\n");
        assert_eq!(events[0].category, DEFAULT_CATEGORY);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut p = SseParser::default();
        let events = feed(&mut p, "data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn split_across_chunks() {
        let mut p = SseParser::default();
        assert!(feed(&mut p, "event: wal").is_empty());
        assert!(feed(&mut p, "let\ndata: {}").is_empty());
        let events = feed(&mut p, "\n\n");
        assert_eq!(events[0].category, "wallet");
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn comments_and_unknown_fields_ignored() {
        let mut p = SseParser::default();
        let events = feed(&mut p, ": keepalive\nid: 42\nretry: 5000\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn event_without_data_is_discarded() {
        let mut p = SseParser::default();
        let events = feed(&mut p, "event: vitals\n\ndata: later\n\n");
        assert_eq!(events.len(), 1);
        // The dangling name did not leak onto the next event.
        assert_eq!(events[0].category, DEFAULT_CATEGORY);
    }

    #[test]
    fn crlf_line_endings() {
        let mut p = SseParser::default();
        let events = feed(&mut p, "event: vitals\r\ndata: 1\r\n\r\n");
        assert_eq!(events[0].category, "vitals");
        assert_eq!(events[0].data, "1");
    }

    #[test]
    fn two_events_in_one_chunk() {
        let mut p = SseParser::default();
        let events = feed(&mut p, "data: a\n\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
    }
}
